//! Agent side of a backhaul deployment
//!
//! [`register_agent`] dials the server's upgrade endpoint, builds an
//! agent-role session over the WebSocket and serves it until the socket
//! fails or the caller shuts it down. Reconnecting is the caller's job; the
//! `backhaul-agent` binary does it with [`ReconnectManager`].

pub mod allowlist;
pub mod error;
pub mod reconnect;

pub use allowlist::Allowlist;
pub use error::AgentError;
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};

use backhaul_mux::{ConnectAuthorizer, ControlSocket, Session, SessionConfig};
use futures_util::future::BoxFuture;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use http::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Runs once the session exists, concurrently with serving it.
/// Returning an error ends the registration.
pub type OnConnect = Box<dyn FnOnce(Session) -> BoxFuture<'static, Result<(), AgentError>> + Send>;

/// How to reach the server and run the session
#[derive(Debug, Clone)]
pub struct RegisterOptions {
    /// Extra headers on the upgrade request
    pub headers: HeaderMap,

    pub config: SessionConfig,

    /// Bound on TCP connect plus WebSocket handshake
    pub handshake_timeout: Duration,

    /// Cancelling ends the registration cleanly
    pub shutdown: CancellationToken,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            headers: HeaderMap::new(),
            config: SessionConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            shutdown: CancellationToken::new(),
        }
    }
}

impl RegisterOptions {
    /// Identify as `agent_id` via the agent header
    pub fn with_agent_id(mut self, agent_id: &str) -> Result<Self, AgentError> {
        let value = header_value(agent_id)?;
        self.headers
            .insert(HeaderName::from_static(backhaul_proto::AGENT_HEADER), value);
        Ok(self)
    }

    pub fn with_bearer_token(mut self, token: &str) -> Result<Self, AgentError> {
        let value = header_value(&format!("Bearer {token}"))?;
        self.headers.insert(AUTHORIZATION, value);
        Ok(self)
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

fn header_value(value: &str) -> Result<HeaderValue, AgentError> {
    HeaderValue::from_str(value).map_err(|e| AgentError::InvalidHeader(e.to_string()))
}

/// Check that `url` is a ws:// or wss:// URL
pub fn parse_server_url(url: &str) -> Result<Url, AgentError> {
    let parsed = Url::parse(url).map_err(|e| AgentError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(AgentError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {other:?}, expected ws or wss"),
        }),
    }
}

/// Register with the server and serve until the session ends.
///
/// `authorizer` decides which targets the server may have this agent dial.
/// Returns `Ok(())` only when `options.shutdown` was cancelled; otherwise the
/// error that ended the session. The session is closed before returning.
pub async fn register_agent(
    url: &str,
    options: RegisterOptions,
    authorizer: Arc<dyn ConnectAuthorizer>,
    on_connect: Option<OnConnect>,
) -> Result<(), AgentError> {
    let url = parse_server_url(url)?;
    options.config.validate()?;

    let mut request = url.as_str().into_client_request()?;
    request.headers_mut().extend(options.headers.clone());

    debug!(url = %url, "Connecting to server");
    let handshake = tokio::time::timeout(
        options.handshake_timeout,
        tokio_tungstenite::connect_async(request),
    );
    let (ws, _response) = tokio::select! {
        _ = options.shutdown.cancelled() => return Ok(()),
        result = handshake => result
            .map_err(|_| AgentError::HandshakeTimeout(options.handshake_timeout))??,
    };

    let session = Session::agent(ControlSocket::from_tungstenite(ws), authorizer, options.config);
    info!(url = %url, "Registered with server");

    let hook_session = session.clone();
    let hook = async move {
        if let Some(on_connect) = on_connect {
            on_connect(hook_session).await?;
        }
        std::future::pending::<Result<(), AgentError>>().await
    };

    let result = tokio::select! {
        _ = options.shutdown.cancelled() => Ok(()),
        result = session.serve() => result.map_err(AgentError::from),
        result = hook => result,
    };

    session.close().await;

    match &result {
        Ok(()) => info!(url = %url, "Agent shut down"),
        Err(e) => warn!(url = %url, error = %e, "Agent session ended"),
    }
    result
}
