//! Server side of a backhaul deployment
//!
//! Agents open a WebSocket to the upgrade route served by [`Server::router`].
//! Each authorized agent gets one peer-role session, registered in the
//! [`SessionManager`] under its agent key. The rest of the application reaches
//! the agent's network through [`Server::get_agent_dialer`].

pub mod auth;
pub mod error;
pub mod manager;
pub mod server;

pub use auth::{AuthDecision, AuthError, Authorizer, TokenAuthorizer};
pub use backhaul_proto::AGENT_HEADER;
pub use error::ServerError;
pub use manager::{ManagerError, SessionManager};
pub use server::{socket_from_axum, Server, ServerConfig};

use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Bind `addr` and serve the upgrade route until the listener fails
pub async fn listen(server: Server, addr: SocketAddr) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        path = %server.config().path,
        "Accepting agent connections"
    );

    axum::serve(listener, server.router()).await?;
    Ok(())
}
