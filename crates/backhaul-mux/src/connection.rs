//! Virtual connection multiplexed over a session's control socket
//!
//! Inbound Data frames are queued by the session reader into a bounded
//! channel and consumed through [`AsyncRead`]. Each [`AsyncWrite::poll_write`]
//! becomes exactly one Data frame.

use backhaul_proto::{ConnId, Frame, EOF_MESSAGE};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::lock;
use crate::session::SessionInner;

/// The `(proto, address)` a connection was dialed to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    proto: String,
    address: String,
}

impl PeerAddr {
    pub fn new(proto: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            proto: proto.into(),
            address: address.into(),
        }
    }

    pub fn proto(&self) -> &str {
        &self.proto
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.proto, self.address)
    }
}

/// Why an inbound payload could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliverError {
    BufferFull,
    Closed,
}

/// State shared between a [`Connection`] handle, its session's registry and
/// any pipe tasks bound to it
pub(crate) struct ConnectionInner {
    id: ConnId,
    peer: PeerAddr,
    session: Arc<SessionInner>,
    max_data_size: usize,
    inbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    error: Mutex<Option<String>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
}

impl ConnectionInner {
    pub(crate) fn new(
        id: ConnId,
        peer: PeerAddr,
        session: Arc<SessionInner>,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (queue_capacity, max_data_size) = {
            let config = session.config();
            (config.queue_capacity, config.max_data_size)
        };
        let (tx, rx) = mpsc::channel(queue_capacity);

        let inner = Arc::new(Self {
            id,
            peer,
            session,
            max_data_size,
            inbound: Mutex::new(Some(tx)),
            error: Mutex::new(None),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
        });

        (inner, rx)
    }

    pub(crate) fn id(&self) -> ConnId {
        self.id
    }

    pub(crate) fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    pub(crate) fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Wait for every task bound to this connection. Only completes once the
    /// connection has been shut down.
    pub(crate) async fn wait_tasks(&self) {
        self.tasks.wait().await
    }

    /// Queue a payload from the peer, waiting at most `timeout` for room
    pub(crate) async fn deliver(&self, payload: Bytes, timeout: Duration) -> Result<(), DeliverError> {
        if payload.is_empty() {
            return Ok(());
        }

        let Some(tx) = lock(&self.inbound).clone() else {
            return Err(DeliverError::Closed);
        };

        tokio::select! {
            result = tx.send_timeout(payload, timeout) => result.map_err(|e| match e {
                SendTimeoutError::Timeout(_) => DeliverError::BufferFull,
                SendTimeoutError::Closed(_) => DeliverError::Closed,
            }),
            _ = self.cancel.cancelled() => Err(DeliverError::Closed),
        }
    }

    /// Send one Data frame, honoring the write deadline
    pub(crate) async fn write_data(&self, payload: Bytes) -> io::Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let frame = Frame::data(self.id, payload);
        let deadline = *lock(&self.write_deadline);
        let send = self.session.send_frame(&frame);

        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, send).await.map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded")
            })?,
            None => send.await,
        };

        result.map_err(io::Error::from)
    }

    /// Tear down local state without telling the peer.
    ///
    /// Returns `false` if the connection was already closed. `error`, when set,
    /// is what pending and future reads fail with; otherwise they see EOF.
    pub(crate) fn shutdown(&self, error: Option<String>) -> bool {
        if !self.mark_closed(error) {
            return false;
        }
        self.session.unregister(self);
        true
    }

    /// Close local state but stay registered, so late Data frames for this id
    /// are dropped quietly instead of answered with `connection not found`
    fn mark_closed(&self, error: Option<String>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Some(error) = error {
            *lock(&self.error) = Some(error);
        }
        lock(&self.inbound).take();
        self.cancel.cancel();
        self.tasks.close();

        debug!(conn_id = self.id, peer = %self.peer, "Connection closed");
        true
    }

    /// Tear down and tell the peer with an Error frame (`EOF` for a clean close).
    /// The id is released only once the peer has been told.
    pub(crate) async fn close_and_notify(&self, error: Option<String>) {
        if !self.mark_closed(error.clone()) {
            return;
        }
        self.notify_peer(error).await;
        self.session.unregister(self);
    }

    async fn notify_peer(&self, error: Option<String>) {
        let message = error.unwrap_or_else(|| EOF_MESSAGE.to_string());
        if let Err(e) = self.session.send_frame(&Frame::error(self.id, message)).await {
            debug!(conn_id = self.id, error = %e, "Failed to notify peer of close");
        }
    }

    /// Close, notify the peer and wait for bound tasks
    pub(crate) async fn close_and_wait(&self) {
        self.close_and_notify(None).await;
        self.wait_tasks().await;
    }

    fn read_result(&self) -> io::Result<()> {
        match lock(&self.error).as_ref() {
            Some(message) => Err(io::Error::new(io::ErrorKind::ConnectionAborted, message.clone())),
            None => Ok(()),
        }
    }

    fn closed_error(&self) -> io::Error {
        match lock(&self.error).as_ref() {
            Some(message) => io::Error::new(io::ErrorKind::BrokenPipe, message.clone()),
            None => io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"),
        }
    }
}

/// A virtual byte stream to a remote `(proto, address)`.
///
/// Reading yields bytes sent by the remote side in order. EOF means the remote
/// side closed cleanly; an error carries the reason the connection failed.
/// Dropping the handle closes the connection without waiting.
pub struct Connection {
    inner: Arc<ConnectionInner>,
    rx: mpsc::Receiver<Bytes>,
    buffered: Bytes,
    read_timer: Option<(Instant, Pin<Box<Sleep>>)>,
    pending_write: Option<BoxFuture<'static, io::Result<usize>>>,
    pending_close: Option<BoxFuture<'static, ()>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(inner: Arc<ConnectionInner>, rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            inner,
            rx,
            buffered: Bytes::new(),
            read_timer: None,
            pending_write: None,
            pending_close: None,
        }
    }

    pub(crate) fn shared(&self) -> Arc<ConnectionInner> {
        Arc::clone(&self.inner)
    }

    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    pub fn proto(&self) -> &str {
        self.inner.peer.proto()
    }

    pub fn remote_addr(&self) -> &PeerAddr {
        &self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Set both the read and write deadline
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Reads pending past `deadline` fail with `TimedOut`; the connection stays open
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *lock(&self.inner.read_deadline) = deadline;
    }

    /// Writes pending past `deadline` fail with `TimedOut`; the connection stays open
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *lock(&self.inner.write_deadline) = deadline;
    }

    /// Close the connection, notify the peer and wait for any pipe task bound to it
    pub async fn close(&mut self) {
        self.inner.close_and_wait().await;
    }

    fn poll_read_deadline(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(deadline) = *lock(&self.inner.read_deadline) else {
            self.read_timer = None;
            return Poll::Pending;
        };

        let stale = !matches!(&self.read_timer, Some((at, _)) if *at == deadline);
        if stale {
            self.read_timer = Some((deadline, Box::pin(tokio::time::sleep_until(deadline))));
        }

        let Some((_, timer)) = self.read_timer.as_mut() else {
            return Poll::Pending;
        };
        ready!(timer.as_mut().poll(cx));
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "read deadline exceeded",
        )))
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.buffered.is_empty() {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.buffered = chunk,
                Poll::Ready(None) => {
                    this.read_timer = None;
                    return Poll::Ready(this.inner.read_result());
                }
                Poll::Pending => return this.poll_read_deadline(cx),
            }
        }

        let n = buf.remaining().min(this.buffered.len());
        buf.put_slice(&this.buffered.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        if this.pending_write.is_none() {
            if this.inner.is_closed() {
                return Poll::Ready(Err(this.inner.closed_error()));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }

            let n = buf.len().min(this.inner.max_data_size);
            let payload = Bytes::copy_from_slice(&buf[..n]);
            let inner = Arc::clone(&this.inner);
            this.pending_write = Some(Box::pin(async move {
                inner.write_data(payload).await.map(|_| n)
            }));
        }

        let Some(write) = this.pending_write.as_mut() else {
            return Poll::Ready(Ok(0));
        };
        let result = ready!(write.as_mut().poll(cx));
        this.pending_write = None;
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.pending_close.is_none() {
            let inner = Arc::clone(&this.inner);
            this.pending_close = Some(Box::pin(async move { inner.close_and_wait().await }));
        }

        let Some(close) = this.pending_close.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        ready!(close.as_mut().poll(cx));
        this.pending_close = None;
        Poll::Ready(Ok(()))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.inner.mark_closed(None) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                handle.spawn(async move {
                    inner.notify_peer(None).await;
                    inner.session.unregister(&inner);
                });
            }
            Err(_) => self.inner.session.unregister(&self.inner),
        }
    }
}
