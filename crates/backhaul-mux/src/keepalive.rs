//! Serialized writes and liveness tracking for the control socket

use backhaul_proto::Frame;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::KeepAliveConfig;
use crate::error::{MuxError, MuxResult};
use crate::socket::{WireMessage, WireSink, WireStream};

/// Owns the write half of the control socket.
///
/// Every write goes through one lock: WebSocket sinks do not support
/// concurrent writers.
pub struct KeepAlive {
    sink: Mutex<WireSink>,
    config: KeepAliveConfig,
    closed: CancellationToken,
}

impl std::fmt::Debug for KeepAlive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAlive")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl KeepAlive {
    pub fn new(sink: WireSink, config: KeepAliveConfig) -> Self {
        Self {
            sink: Mutex::new(sink),
            config,
            closed: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &KeepAliveConfig {
        &self.config
    }

    /// Write one protocol frame.
    ///
    /// Fails with `SessionClosed` once [`close`](Self::close) has run, even if
    /// the write was already stalled on a peer that stopped reading.
    pub async fn send_frame(&self, frame: &Frame) -> MuxResult<()> {
        let encoded = frame.encode()?;
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(WireMessage::Binary(encoded)).await
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(MuxError::SessionClosed),
            result = write => Ok(result?),
        }
    }

    /// Write a ping, pong or close, bounded by the control write timeout
    pub async fn send_control(&self, msg: WireMessage) -> MuxResult<()> {
        let timeout = self.config.write_timeout;
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(msg).await
        };

        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| MuxError::WriteTimeout(timeout))??;
        Ok(())
    }

    /// Read until the next binary message.
    ///
    /// Any received message refreshes the read deadline. Pings are answered
    /// immediately; pongs are swallowed.
    pub async fn next_frame(&self, stream: &mut WireStream) -> MuxResult<Bytes> {
        let read_timeout = self.config.read_timeout;

        loop {
            let msg = match tokio::time::timeout(read_timeout, stream.next()).await {
                Err(_) => return Err(MuxError::KeepAliveTimeout(read_timeout)),
                Ok(None) => return Err(MuxError::TransportClosed),
                Ok(Some(Err(e))) => return Err(MuxError::Transport(e)),
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                WireMessage::Binary(data) => return Ok(data),
                WireMessage::Ping(data) => {
                    trace!("Received ping, answering with pong");
                    if let Err(e) = self.send_control(WireMessage::Pong(data)).await {
                        debug!(error = %e, "Failed to send pong");
                    }
                }
                WireMessage::Pong(_) => trace!("Received pong"),
                WireMessage::Text(_) => return Err(MuxError::NonBinaryMessage),
                WireMessage::Close => return Err(MuxError::TransportClosed),
            }
        }
    }

    /// Drive `fut` to completion, pinging every `ping_interval` meanwhile.
    ///
    /// Used when the reader blocks on something other than the socket, so the
    /// remote read deadline stays fresh.
    pub async fn ping_while<F: Future>(&self, fut: F) -> F::Output {
        let interval = self.config.ping_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(fut);

        loop {
            tokio::select! {
                output = &mut fut => return output,
                _ = ticker.tick() => {
                    trace!("Reader blocked, sending keepalive ping");
                    if let Err(e) = self.send_control(WireMessage::Ping(Bytes::new())).await {
                        debug!(error = %e, "Keepalive ping failed");
                    }
                }
            }
        }
    }

    /// Spawn the periodic ping task
    pub fn start_pinger(self: &Arc<Self>) -> Pinger {
        let keepalive = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keepalive.config.ping_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        trace!("Sending keepalive ping");
                        if let Err(e) = keepalive.send_control(WireMessage::Ping(Bytes::new())).await {
                            warn!(error = %e, "Keepalive ping failed");
                        }
                    }
                }
            }

            debug!("Keepalive pinger stopped");
        });

        Pinger { cancel, handle }
    }

    /// Refuse further frames and send a best-effort WebSocket close
    pub async fn close(&self) {
        self.closed.cancel();
        if let Err(e) = self.send_control(WireMessage::Close).await {
            debug!(error = %e, "Failed to send close message");
        }
    }
}

/// Handle to the ping task
#[derive(Debug)]
pub struct Pinger {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Pinger {
    /// Stop the task and wait until it has exited
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Keepalive pinger task failed");
        }
    }
}
