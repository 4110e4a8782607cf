//! Shared fixtures for session integration tests

#![allow(dead_code)]

use backhaul_mux::{AllowAll, ConnectAuthorizer, ControlSocket, Session, SessionConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("backhaul_mux=debug")
        .with_test_writer()
        .try_init();
}

/// A connected peer/agent pair with both readers running
pub struct SessionPair {
    pub peer: Session,
    pub agent: Session,
    pub peer_task: JoinHandle<backhaul_mux::MuxResult<()>>,
    pub agent_task: JoinHandle<backhaul_mux::MuxResult<()>>,
}

pub async fn session_pair() -> SessionPair {
    session_pair_with(Arc::new(AllowAll), SessionConfig::default()).await
}

pub async fn session_pair_with(
    authorizer: Arc<dyn ConnectAuthorizer>,
    config: SessionConfig,
) -> SessionPair {
    init_tracing();

    let (server_socket, client_socket) = ControlSocket::duplex_pair(1024 * 1024).await;
    let peer = Session::peer(server_socket, config.clone());
    let agent = Session::agent(client_socket, authorizer, config);

    let peer_task = tokio::spawn({
        let peer = peer.clone();
        async move { peer.serve().await }
    });
    let agent_task = tokio::spawn({
        let agent = agent.clone();
        async move { agent.serve().await }
    });

    SessionPair {
        peer,
        agent,
        peer_task,
        agent_task,
    }
}

/// TCP echo server on loopback
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// TCP server that records everything each client sends until EOF
pub async fn capture_server() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut received = Vec::new();
                let _ = socket.read_to_end(&mut received).await;
                let _ = tx.send(received);
            });
        }
    });

    (addr, rx)
}

/// TCP server that answers "PING\n" with "PONG\n" and then hangs up
pub async fn ping_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut line = [0u8; 5];
                if socket.read_exact(&mut line).await.is_ok() && &line == b"PING\n" {
                    let _ = socket.write_all(b"PONG\n").await;
                }
            });
        }
    });

    addr
}

/// An address nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
