//! Upgrade request authorization
//!
//! An [`Authorizer`] inspects the HTTP upgrade request and names the agent
//! that is connecting. Errors map to `400 Bad Request`, an
//! [`AuthDecision::Unauthorized`] to `401 Unauthorized`.

use backhaul_proto::AGENT_HEADER;
use http::request::Parts;
use std::collections::HashMap;
use thiserror::Error;

const AUTHORIZATION_HEADER: &str = "authorization";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Accept the upgrade for this agent key
    Authorized(String),
    Unauthorized,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Malformed header: {0}")]
    MalformedHeader(&'static str),
}

/// Decides who is connecting
pub trait Authorizer: Send + Sync {
    fn authorize(&self, parts: &Parts) -> Result<AuthDecision, AuthError>;
}

impl<F> Authorizer for F
where
    F: Fn(&Parts) -> Result<AuthDecision, AuthError> + Send + Sync,
{
    fn authorize(&self, parts: &Parts) -> Result<AuthDecision, AuthError> {
        self(parts)
    }
}

/// Agent key from `X-Backhaul-Agent`, checked against a bearer token
#[derive(Debug, Clone, Default)]
pub struct TokenAuthorizer {
    tokens: HashMap<String, String>,
}

impl TokenAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, key: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(key.into(), token.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, token: impl Into<String>) {
        self.tokens.insert(key.into(), token.into());
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authorizer for TokenAuthorizer {
    fn authorize(&self, parts: &Parts) -> Result<AuthDecision, AuthError> {
        let key = header_str(parts, AGENT_HEADER)?.ok_or(AuthError::MissingHeader(AGENT_HEADER))?;
        if key.is_empty() {
            return Err(AuthError::MalformedHeader(AGENT_HEADER));
        }

        let Some(authorization) = header_str(parts, AUTHORIZATION_HEADER)? else {
            return Ok(AuthDecision::Unauthorized);
        };
        let Some(token) = authorization.strip_prefix("Bearer ") else {
            return Err(AuthError::MalformedHeader(AUTHORIZATION_HEADER));
        };

        match self.tokens.get(key) {
            Some(expected) if expected == token.trim() => {
                Ok(AuthDecision::Authorized(key.to_string()))
            }
            _ => {
                tracing::warn!(agent_id = %key, "Rejected agent with invalid token");
                Ok(AuthDecision::Unauthorized)
            }
        }
    }
}

fn header_str<'a>(parts: &'a Parts, name: &'static str) -> Result<Option<&'a str>, AuthError> {
    parts
        .headers
        .get(name)
        .map(|value| value.to_str().map_err(|_| AuthError::MalformedHeader(name)))
        .transpose()
}
