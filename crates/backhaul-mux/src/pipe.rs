//! Agent-side dial and byte pumping between a connection and its real target

use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionInner};

trait TargetStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TargetStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

type BoxedTarget = Box<dyn TargetStream>;

/// Dial `(proto, address)`, honoring `timeout` when one was requested
async fn dial_target(
    proto: &str,
    address: &str,
    timeout: Option<Duration>,
) -> io::Result<BoxedTarget> {
    let dial = open_target(proto, address);
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, dial).await.map_err(|_| {
            io::Error::new(io::ErrorKind::TimedOut, format!("timed out after {timeout:?}"))
        })?,
        None => dial.await,
    }
}

async fn open_target(proto: &str, address: &str) -> io::Result<BoxedTarget> {
    match proto {
        "tcp" | "tcp4" | "tcp6" => {
            let stream = connect_tcp(proto, address).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        "unix" => Ok(Box::new(tokio::net::UnixStream::connect(address).await?)),
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported protocol {other:?}"),
        )),
    }
}

async fn connect_tcp(proto: &str, address: &str) -> io::Result<TcpStream> {
    let mut last_err = None;

    for addr in lookup_host(address).await? {
        let family_ok = match proto {
            "tcp4" => addr.is_ipv4(),
            "tcp6" => addr.is_ipv6(),
            _ => true,
        };
        if !family_ok {
            continue;
        }

        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no {proto} address for {address}"),
        )
    }))
}

/// Dial the target for an accepted Connect and pump bytes both ways until
/// either side finishes. Runs on the connection's own task tracker.
pub(crate) async fn dial_and_pipe(conn: Connection, timeout: Option<Duration>, linger: Duration) {
    let inner = conn.shared();
    let peer = inner.peer().clone();

    // a close racing the dial still gets its queued bytes delivered
    let target = tokio::select! {
        _ = linger_after_close(&inner, linger) => {
            debug!(conn_id = inner.id(), "Connection closed before dial finished");
            return;
        }
        result = dial_target(peer.proto(), peer.address(), timeout) => result,
    };

    let target = match target {
        Ok(target) => target,
        Err(e) => {
            debug!(conn_id = inner.id(), peer = %peer, error = %e, "Dial failed");
            inner
                .close_and_notify(Some(format!(
                    "dial {} {}: {}",
                    peer.proto(),
                    peer.address(),
                    e
                )))
                .await;
            return;
        }
    };

    debug!(conn_id = inner.id(), peer = %peer, "Dialed target");

    let (read_half, write_half) = tokio::io::split(target);
    inner.spawn(copy_to_target(conn, write_half, linger));
    inner.spawn(copy_from_target(Arc::clone(&inner), read_half));
}

/// Peer -> target. Once the connection closes, queued bytes get `linger` to drain.
async fn copy_to_target(mut conn: Connection, mut target: WriteHalf<BoxedTarget>, linger: Duration) {
    let inner = conn.shared();

    let result = tokio::select! {
        result = tokio::io::copy(&mut conn, &mut target) => result.map(Some),
        _ = linger_after_close(&inner, linger) => Ok(None),
    };

    match &result {
        Ok(Some(bytes)) => trace!(conn_id = inner.id(), bytes, "Peer stream finished"),
        Ok(None) => debug!(conn_id = inner.id(), "Dropped undelivered bytes after linger"),
        Err(e) => debug!(conn_id = inner.id(), error = %e, "Write to target failed"),
    }

    if let Err(e) = target.shutdown().await {
        trace!(conn_id = inner.id(), error = %e, "Target shutdown failed");
    }

    inner
        .close_and_notify(result.err().map(|e| e.to_string()))
        .await;
}

async fn linger_after_close(inner: &ConnectionInner, linger: Duration) {
    inner.cancelled().await;
    tokio::time::sleep(linger).await;
}

/// Target -> peer, one Data frame per read
async fn copy_from_target(inner: Arc<ConnectionInner>, mut target: ReadHalf<BoxedTarget>) {
    let mut buf = vec![0u8; inner.max_data_size()];

    let result: io::Result<()> = async {
        loop {
            let n = tokio::select! {
                _ = inner.cancelled() => return Ok(()),
                n = target.read(&mut buf) => n?,
            };
            if n == 0 {
                return Ok(());
            }

            tokio::select! {
                _ = inner.cancelled() => return Ok(()),
                sent = inner.write_data(Bytes::copy_from_slice(&buf[..n])) => sent?,
            }
        }
    }
    .await;

    if let Err(e) = &result {
        debug!(conn_id = inner.id(), error = %e, "Read from target failed");
    }

    inner
        .close_and_notify(result.err().map(|e| e.to_string()))
        .await;
}
