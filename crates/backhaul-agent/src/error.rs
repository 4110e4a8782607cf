//! Agent errors

use backhaul_mux::MuxError;
use http::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid server URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid header value: {0}")]
    InvalidHeader(String),

    #[error("Server rejected registration with status {0}")]
    Rejected(StatusCode),

    #[error("WebSocket handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("WebSocket error: {0}")]
    WebSocket(#[source] Box<tungstenite::Error>),

    #[error("Session failed: {0}")]
    Session(#[from] MuxError),

    #[error("Connect hook failed: {0}")]
    OnConnect(String),

    #[error("Invalid CIDR notation '{network}': {reason}")]
    InvalidNetwork { network: String, reason: String },
}

impl AgentError {
    /// Whether retrying the same registration can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            // 409 clears once the server drops the previous session
            AgentError::Rejected(status) => {
                *status != StatusCode::UNAUTHORIZED && *status != StatusCode::BAD_REQUEST
            }
            AgentError::InvalidUrl { .. }
            | AgentError::InvalidHeader(_)
            | AgentError::InvalidNetwork { .. } => false,
            AgentError::Session(MuxError::InvalidConfig(_)) => false,
            _ => true,
        }
    }
}

impl From<tungstenite::Error> for AgentError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => AgentError::Rejected(response.status()),
            other => AgentError::WebSocket(Box::new(other)),
        }
    }
}
