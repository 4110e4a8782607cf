//! Session - the multiplexing engine for one control socket
//!
//! A single reader task decodes frames strictly in order and dispatches them:
//!
//! - **Connect**: authorize, register a connection under the sender's id and
//!   dial the real target in a background task
//! - **Data**: queue the payload on the matching connection
//! - **Error**: fail (or cleanly end) the matching connection
//!
//! Failures tied to one connection never end the session. Socket errors,
//! malformed frames and keepalive expiry end it, taking every live connection
//! down with the same error.

use backhaul_proto::{ConnId, Frame, EOF_MESSAGE};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionInner, DeliverError, PeerAddr};
use crate::dialer::{ConnectAuthorizer, Dialer};
use crate::error::{MuxError, MuxResult};
use crate::keepalive::{KeepAlive, Pinger};
use crate::lock;
use crate::pipe;
use crate::socket::{ControlSocket, WireStream};

/// Which end of the control socket this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Holds the outbound control connection and performs real dials
    Agent,
    /// Accepted the control connection; dials through the agent
    Peer,
}

impl Role {
    /// Peers originate odd ids, agents even ids, so both sides can open
    /// connections without colliding
    fn first_conn_id(self) -> ConnId {
        match self {
            Role::Peer => 1,
            Role::Agent => 2,
        }
    }
}

pub(crate) struct SessionInner {
    role: Role,
    config: SessionConfig,
    keepalive: Arc<KeepAlive>,
    stream: Mutex<Option<WireStream>>,
    connections: Mutex<HashMap<ConnId, Arc<ConnectionInner>>>,
    next_conn_id: AtomicU64,
    authorizer: Option<Arc<dyn ConnectAuthorizer>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    pinger: Mutex<Option<Pinger>>,
}

impl SessionInner {
    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) async fn send_frame(&self, frame: &Frame) -> MuxResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::SessionClosed);
        }
        self.keepalive.send_frame(frame).await
    }

    fn get(&self, id: ConnId) -> Option<Arc<ConnectionInner>> {
        lock(&self.connections).get(&id).cloned()
    }

    /// Returns `false` if the id is already live
    fn register(&self, conn: &Arc<ConnectionInner>) -> bool {
        let mut connections = lock(&self.connections);
        if connections.contains_key(&conn.id()) {
            return false;
        }
        connections.insert(conn.id(), Arc::clone(conn));
        true
    }

    /// Remove `conn` if it is still the registered entry for its id
    pub(crate) fn unregister(&self, conn: &ConnectionInner) {
        let mut connections = lock(&self.connections);
        let is_same = connections
            .get(&conn.id())
            .is_some_and(|existing| std::ptr::eq(Arc::as_ptr(existing), conn));
        if is_same {
            connections.remove(&conn.id());
        }
    }
}

/// One control socket and the virtual connections carried over it.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.inner.role)
            .field("connections", &self.connection_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Server-side session. Inbound Connect frames are always rejected.
    pub fn peer(socket: ControlSocket, config: SessionConfig) -> Self {
        Self::new(socket, Role::Peer, None, config)
    }

    /// Agent-side session. Inbound Connect frames are dialed when `authorizer` allows them.
    pub fn agent(
        socket: ControlSocket,
        authorizer: Arc<dyn ConnectAuthorizer>,
        config: SessionConfig,
    ) -> Self {
        Self::new(socket, Role::Agent, Some(authorizer), config)
    }

    fn new(
        socket: ControlSocket,
        role: Role,
        authorizer: Option<Arc<dyn ConnectAuthorizer>>,
        config: SessionConfig,
    ) -> Self {
        let (sink, stream) = socket.into_parts();
        let keepalive = Arc::new(KeepAlive::new(sink, config.keepalive.clone()));

        Self {
            inner: Arc::new(SessionInner {
                role,
                keepalive,
                stream: Mutex::new(Some(stream)),
                connections: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(role.first_conn_id()),
                authorizer,
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                pinger: Mutex::new(None),
                config,
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same session
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Completes once the session has started closing
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// A dialer opening connections through this session
    pub fn dialer(&self, deadline: Duration) -> Dialer {
        Dialer::new(self.clone(), deadline)
    }

    /// Run the frame reader until the socket fails or the session is closed.
    ///
    /// Returns `Ok(())` after a local [`close`](Self::close); otherwise the
    /// session-fatal error. The session is closed on return either way.
    pub async fn serve(&self) -> MuxResult<()> {
        let mut stream = lock(&self.inner.stream)
            .take()
            .ok_or(MuxError::AlreadyServing)?;

        if self.inner.shutdown.is_cancelled() {
            return Ok(());
        }

        if self.inner.role == Role::Agent {
            *lock(&self.inner.pinger) = Some(self.inner.keepalive.start_pinger());
        }

        debug!(role = ?self.inner.role, "Session reader started");

        let result = loop {
            let payload = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break Ok(()),
                next = self.inner.keepalive.next_frame(&mut stream) => match next {
                    Ok(payload) => payload,
                    Err(e) => break Err(e),
                },
            };

            match Frame::decode(payload) {
                Ok(frame) => self.dispatch(frame).await,
                Err(e) => break Err(MuxError::Frame(e)),
            }
        };

        if let Err(e) = &result {
            warn!(role = ?self.inner.role, error = %e, "Session reader failed");
        }

        self.close_with(result.as_ref().err().map(|e| e.to_string()))
            .await;

        // serve may have raced a concurrent close that ran before the pinger existed
        let pinger = lock(&self.inner.pinger).take();
        if let Some(pinger) = pinger {
            pinger.stop().await;
        }

        result
    }

    async fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Connect {
                conn_id,
                proto,
                address,
                deadline_millis,
            } => {
                self.handle_connect(conn_id, PeerAddr::new(proto, address), deadline_millis)
                    .await
            }
            Frame::Data { conn_id, payload } => self.handle_data(conn_id, payload).await,
            Frame::Error { conn_id, message } => self.handle_error(conn_id, message),
        }
    }

    async fn handle_connect(&self, conn_id: ConnId, peer: PeerAddr, deadline_millis: i64) {
        let allowed = self
            .inner
            .authorizer
            .as_ref()
            .is_some_and(|authorizer| authorizer.authorize(peer.proto(), peer.address()));

        if !allowed {
            warn!(conn_id, peer = %peer, "Rejected connect request");
            self.reject(
                conn_id,
                format!("connect not allowed: {} {}", peer.proto(), peer.address()),
            )
            .await;
            return;
        }

        let (inner, rx) = ConnectionInner::new(conn_id, peer, Arc::clone(&self.inner));
        if !self.inner.register(&inner) {
            warn!(conn_id, "Connect reused a live connection id");
            // the existing connection is left alone
            inner.shutdown(None);
            drop(rx);
            self.reject(conn_id, "connection id already in use").await;
            return;
        }

        let timeout = u64::try_from(deadline_millis)
            .ok()
            .filter(|millis| *millis > 0)
            .map(Duration::from_millis);

        debug!(conn_id, peer = %inner.peer(), ?timeout, "Accepted connect request");

        let conn = Connection::new(Arc::clone(&inner), rx);
        inner.spawn(pipe::dial_and_pipe(conn, timeout, self.inner.config.linger));
    }

    async fn handle_data(&self, conn_id: ConnId, payload: Bytes) {
        let Some(conn) = self.inner.get(conn_id) else {
            debug!(conn_id, "Data for unknown connection");
            self.reject(conn_id, "connection not found").await;
            return;
        };

        // the socket is not read while delivery waits, so keep the remote
        // side's read deadline fresh ourselves
        let delivery = conn.deliver(payload, self.inner.config.deliver_timeout);
        match self.inner.keepalive.ping_while(delivery).await {
            Ok(()) => {}
            Err(DeliverError::BufferFull) => {
                warn!(conn_id, "Inbound buffer full, closing connection");
                conn.close_and_notify(Some("buffer full".to_string()))
                    .await;
            }
            Err(DeliverError::Closed) => {
                debug!(conn_id, "Data for a connection that is closing");
            }
        }
    }

    fn handle_error(&self, conn_id: ConnId, message: String) {
        let Some(conn) = self.inner.get(conn_id) else {
            return;
        };

        let error = (message != EOF_MESSAGE).then_some(message);
        debug!(conn_id, error = ?error, "Peer closed connection");
        conn.shutdown(error);
    }

    /// Best-effort Error frame for a connection this side does not hold
    async fn reject(&self, conn_id: ConnId, message: impl Into<String>) {
        if let Err(e) = self.inner.send_frame(&Frame::error(conn_id, message)).await {
            debug!(conn_id, error = %e, "Failed to send error frame");
        }
    }

    /// Open a connection to `(proto, address)` through the remote side.
    ///
    /// The connection is registered before the Connect frame is sent, so a
    /// fast reply cannot be missed. If sending fails the connection is
    /// discarded and the error returned.
    pub async fn connect(
        &self,
        proto: &str,
        address: &str,
        deadline: Duration,
    ) -> MuxResult<Connection> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }

        let (inner, rx) = loop {
            let id = self.inner.next_conn_id.fetch_add(2, Ordering::Relaxed);
            let (inner, rx) =
                ConnectionInner::new(id, PeerAddr::new(proto, address), Arc::clone(&self.inner));
            if self.inner.register(&inner) {
                break (inner, rx);
            }
        };

        let deadline_millis = i64::try_from(deadline.as_millis()).unwrap_or(i64::MAX);
        let frame = Frame::connect(inner.id(), proto, address, deadline_millis);

        let conn = Connection::new(Arc::clone(&inner), rx);
        if let Err(e) = self.inner.send_frame(&frame).await {
            warn!(conn_id = inner.id(), error = %e, "Failed to send connect request");
            inner.shutdown(Some(e.to_string()));
            return Err(e);
        }

        debug!(conn_id = inner.id(), proto, address, "Opened connection");
        Ok(conn)
    }

    /// Close every connection (they read EOF), stop keepalive and wait for
    /// all pipe tasks. Idempotent.
    pub async fn close(&self) {
        self.close_with(None).await
    }

    async fn close_with(&self, error: Option<String>) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();

        let connections: Vec<_> = lock(&self.inner.connections)
            .drain()
            .map(|(_, conn)| conn)
            .collect();

        for conn in &connections {
            conn.shutdown(error.clone());
        }

        let pinger = lock(&self.inner.pinger).take();
        if let Some(pinger) = pinger {
            pinger.stop().await;
        }

        self.inner.keepalive.close().await;

        for conn in &connections {
            conn.wait_tasks().await;
        }

        info!(
            role = ?self.inner.role,
            connections = connections.len(),
            "Session closed"
        );
    }
}
