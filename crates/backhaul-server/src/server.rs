//! HTTP upgrade endpoint that turns agent WebSockets into sessions

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use backhaul_mux::{ControlSocket, Dialer, SessionConfig, WireMessage};
use futures_util::{future, SinkExt, StreamExt};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::{AuthDecision, Authorizer};
use crate::error::ServerError;
use crate::manager::{ManagerError, SessionManager};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Route serving the upgrade
    pub path: String,

    /// Applied to every agent session
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            path: "/connect".to_string(),
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }
}

struct ServerInner {
    config: ServerConfig,
    manager: SessionManager,
    authorizer: Arc<dyn Authorizer>,
}

/// Accepts agent control connections and hands out dialers to them
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.inner.config)
            .field("manager", &self.inner.manager)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(config: ServerConfig, authorizer: Arc<dyn Authorizer>) -> Result<Self, ServerError> {
        config.session.validate()?;
        if !config.path.starts_with('/') {
            return Err(ServerError::InvalidPath(config.path));
        }

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                manager: SessionManager::new(),
                authorizer,
            }),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &SessionManager {
        &self.inner.manager
    }

    /// Router serving the upgrade endpoint
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.inner.config.path, get(handle_upgrade))
            .with_state(self.clone())
    }

    /// The primary product surface: a dialer reaching through `agent_key`
    pub fn get_agent_dialer(&self, agent_key: &str, deadline: Duration) -> Result<Dialer, ManagerError> {
        self.inner.manager.get_agent_dialer(agent_key, deadline)
    }

    /// Register and serve an agent's control socket until it ends.
    ///
    /// The agent is unregistered on any exit.
    pub async fn serve_agent(&self, agent_key: &str, socket: ControlSocket) -> Result<(), ServerError> {
        let session = self
            .inner
            .manager
            .add_agent(agent_key, socket, self.inner.config.session.clone())?;

        info!(agent_id = %agent_key, "Agent connected");
        let result = session.serve().await;
        self.inner.manager.remove_session(agent_key, &session);

        match &result {
            Ok(()) => info!(agent_id = %agent_key, "Agent session closed"),
            Err(e) => warn!(agent_id = %agent_key, error = %e, "Agent session failed"),
        }

        result.map_err(ServerError::from)
    }
}

async fn handle_upgrade(State(server): State<Server>, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();

    let agent_key = match server.inner.authorizer.authorize(&parts) {
        Ok(AuthDecision::Authorized(key)) => key,
        Ok(AuthDecision::Unauthorized) => {
            debug!(uri = %parts.uri, "Unauthorized agent upgrade");
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
        Err(e) => {
            debug!(uri = %parts.uri, error = %e, "Failed to authorize agent upgrade");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    if server.inner.manager.has_agent(&agent_key) {
        warn!(agent_id = %agent_key, "Agent is already connected");
        return (
            StatusCode::CONFLICT,
            ManagerError::DuplicateAgent(agent_key).to_string(),
        )
            .into_response();
    }

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &server).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!(agent_id = %agent_key, error = %rejection, "WebSocket upgrade failed");
            return (StatusCode::BAD_REQUEST, rejection.to_string()).into_response();
        }
    };

    upgrade.on_upgrade(move |ws| async move {
        // the outcome is already logged by serve_agent
        let _ = server.serve_agent(&agent_key, socket_from_axum(ws)).await;
    })
}

/// Adapt an axum WebSocket into a control socket
pub fn socket_from_axum(ws: WebSocket) -> ControlSocket {
    let (sink, stream) = ws.split();

    let sink = sink
        .sink_map_err(io::Error::other)
        .with(|msg: WireMessage| future::ready(Ok::<_, io::Error>(into_axum(msg))));
    let stream = stream.map(|result| result.map(from_axum).map_err(io::Error::other));

    ControlSocket::new(sink, stream)
}

fn from_axum(msg: Message) -> WireMessage {
    match msg {
        Message::Binary(data) => WireMessage::Binary(data),
        Message::Text(text) => WireMessage::Text(text.to_string()),
        Message::Ping(data) => WireMessage::Ping(data),
        Message::Pong(data) => WireMessage::Pong(data),
        Message::Close(_) => WireMessage::Close,
    }
}

fn into_axum(msg: WireMessage) -> Message {
    match msg {
        WireMessage::Binary(data) => Message::Binary(data),
        WireMessage::Text(text) => Message::Text(text.into()),
        WireMessage::Ping(data) => Message::Ping(data),
        WireMessage::Pong(data) => Message::Pong(data),
        WireMessage::Close => Message::Close(None),
    }
}
