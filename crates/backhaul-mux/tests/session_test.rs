//! End-to-end tests for a peer/agent session pair over an in-memory socket

mod common;

use backhaul_mux::{
    ControlSocket, Frame, KeepAliveConfig, MuxError, Session, SessionConfig, WireMessage,
    WireStream,
};
use bytes::Bytes;
use common::*;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Instant};

const DEADLINE: Duration = Duration::from_secs(5);

async fn next_frame(stream: &mut WireStream) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("stream failed");
        if let WireMessage::Binary(data) = msg {
            return Frame::decode(data).unwrap();
        }
    }
}

#[tokio::test]
async fn test_ping_pong_through_agent() {
    let target = ping_server().await;
    let address = target.to_string();

    let allowed = address.clone();
    let authorizer = move |proto: &str, addr: &str| proto == "tcp" && addr == allowed;
    let pair = session_pair_with(Arc::new(authorizer), SessionConfig::default()).await;

    let mut conn = pair.peer.dialer(DEADLINE).dial("tcp", &address).await.unwrap();
    conn.write_all(b"PING\n").await.unwrap();

    let mut reply = Vec::new();
    timeout(Duration::from_secs(5), conn.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"PONG\n");
}

#[tokio::test]
async fn test_concurrent_dials_get_distinct_ids() {
    let target = echo_server().await;
    let pair = session_pair().await;
    let dialer = pair.peer.dialer(DEADLINE);

    let mut handles = Vec::new();
    for i in 0..16u8 {
        let dialer = dialer.clone();
        let address = target.to_string();
        handles.push(tokio::spawn(async move {
            let mut conn = dialer.dial("tcp", &address).await.unwrap();
            let msg = [b'a' + i; 64];
            conn.write_all(&msg).await.unwrap();
            let mut echoed = [0u8; 64];
            conn.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, msg);
            conn.id()
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        let id = handle.await.unwrap();
        assert_eq!(id % 2, 1, "peer-side ids are odd");
        assert!(ids.insert(id), "id {id} allocated twice");
    }
}

#[tokio::test]
async fn test_large_transfer_round_trip() {
    let target = echo_server().await;
    let pair = session_pair().await;

    let conn = pair
        .peer
        .dialer(DEADLINE)
        .dial("tcp", &target.to_string())
        .await
        .unwrap();
    let (mut reader, mut writer) = tokio::io::split(conn);

    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let write = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer
    });

    let mut received = vec![0u8; expected.len()];
    timeout(Duration::from_secs(10), reader.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert!(received == expected, "echoed bytes differ");

    let _writer = write.await.unwrap();
}

#[tokio::test]
async fn test_close_is_eof_for_target_and_spares_siblings() {
    let (capture, mut captured) = capture_server().await;
    let echo = echo_server().await;
    let pair = session_pair().await;
    let dialer = pair.peer.dialer(DEADLINE);

    let mut sibling = dialer.dial("tcp", &echo.to_string()).await.unwrap();
    let mut conn = dialer.dial("tcp", &capture.to_string()).await.unwrap();

    conn.write_all(b"hello").await.unwrap();
    conn.close().await;
    assert!(conn.is_closed());

    let received = timeout(Duration::from_secs(5), captured.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"hello");

    sibling.write_all(b"still here").await.unwrap();
    let mut echoed = [0u8; 10];
    sibling.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"still here");
}

#[tokio::test]
async fn test_target_hangup_is_clean_eof() {
    let target = ping_server().await;
    let pair = session_pair().await;

    let mut conn = pair
        .peer
        .dialer(DEADLINE)
        .dial("tcp", &target.to_string())
        .await
        .unwrap();
    conn.write_all(b"PING\n").await.unwrap();

    let mut reply = Vec::new();
    conn.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"PONG\n");

    // a clean EOF keeps returning zero
    let mut buf = [0u8; 8];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_agent_loss_fails_peer_reads() {
    let target = echo_server().await;
    let pair = session_pair().await;

    let mut conn = pair
        .peer
        .dialer(DEADLINE)
        .dial("tcp", &target.to_string())
        .await
        .unwrap();
    conn.write_all(b"x").await.unwrap();
    let mut one = [0u8; 1];
    conn.read_exact(&mut one).await.unwrap();

    pair.agent.close().await;

    let result = timeout(Duration::from_secs(5), pair.peer_task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(MuxError::TransportClosed)));

    let err = conn.read(&mut one).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    assert_eq!(pair.peer.connection_count(), 0);

    let err = pair.peer.dialer(DEADLINE).dial("tcp", "127.0.0.1:1").await.unwrap_err();
    assert!(matches!(err, MuxError::SessionClosed));
}

#[tokio::test]
async fn test_rejected_connect_is_connection_scoped() {
    let target = echo_server().await;
    let allowed = target.to_string();
    let authorizer = move |_: &str, addr: &str| addr == allowed;
    let pair = session_pair_with(Arc::new(authorizer), SessionConfig::default()).await;
    let dialer = pair.peer.dialer(DEADLINE);

    let mut denied = dialer.dial("tcp", "127.0.0.1:9").await.unwrap();
    let mut buf = [0u8; 4];
    let err = denied.read(&mut buf).await.unwrap_err();
    assert!(err.to_string().contains("connect not allowed"), "{err}");

    let mut conn = dialer.dial("tcp", &target.to_string()).await.unwrap();
    conn.write_all(b"ok").await.unwrap();
    let mut echoed = [0u8; 2];
    conn.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ok");
    assert!(!pair.peer.is_closed());
}

#[tokio::test]
async fn test_dial_failure_surfaces_on_read() {
    let target = closed_port().await;
    let pair = session_pair().await;

    let mut conn = pair
        .peer
        .dialer(DEADLINE)
        .dial("tcp", &target.to_string())
        .await
        .unwrap();

    let mut buf = [0u8; 4];
    let err = timeout(Duration::from_secs(5), conn.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.to_string().starts_with("dial tcp "), "{err}");
}

#[tokio::test]
async fn test_unsupported_proto_is_rejected_by_agent() {
    let pair = session_pair().await;

    let mut conn = pair
        .peer
        .dialer(DEADLINE)
        .dial("sctp", "127.0.0.1:1")
        .await
        .unwrap();
    let mut buf = [0u8; 4];
    let err = conn.read(&mut buf).await.unwrap_err();
    assert!(err.to_string().contains("unsupported protocol"), "{err}");
}

#[tokio::test]
async fn test_read_deadline_times_out_without_closing() {
    let (target, _captured) = capture_server().await;
    let pair = session_pair().await;

    let mut conn = pair
        .peer
        .dialer(DEADLINE)
        .dial("tcp", &target.to_string())
        .await
        .unwrap();

    conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));
    let mut buf = [0u8; 4];
    let err = conn.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    assert!(!conn.is_closed());

    conn.set_read_deadline(None);
    conn.write_all(b"after").await.unwrap();
}

#[tokio::test]
async fn test_session_close_drains_registry() {
    let target = echo_server().await;
    let pair = session_pair().await;
    let dialer = pair.peer.dialer(DEADLINE);

    let mut conns = Vec::new();
    for _ in 0..4 {
        conns.push(dialer.dial("tcp", &target.to_string()).await.unwrap());
    }
    assert_eq!(pair.peer.connection_count(), 4);

    pair.peer.close().await;
    assert!(pair.peer.is_closed());
    assert_eq!(pair.peer.connection_count(), 0);

    // local close reads as EOF
    let mut buf = [0u8; 4];
    for conn in &mut conns {
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    let result = pair.peer_task.await.unwrap();
    assert!(result.is_ok());

    // closing twice is harmless
    pair.peer.close().await;
}

#[tokio::test]
async fn test_unknown_connection_data_is_answered_with_error() {
    init_tracing();
    let (server_socket, client_socket) = ControlSocket::duplex_pair(64 * 1024).await;
    let agent = Session::agent(
        client_socket,
        Arc::new(backhaul_mux::AllowAll),
        SessionConfig::default(),
    );
    tokio::spawn({
        let agent = agent.clone();
        async move { agent.serve().await }
    });

    let (mut sink, mut stream) = server_socket.into_parts();
    let data = Frame::data(99, Bytes::from_static(b"stray")).encode().unwrap();
    sink.send(WireMessage::Binary(data)).await.unwrap();

    assert_eq!(
        next_frame(&mut stream).await,
        Frame::error(99, "connection not found")
    );
    assert!(!agent.is_closed());
}

#[tokio::test]
async fn test_peer_rejects_inbound_connect() {
    init_tracing();
    let (server_socket, client_socket) = ControlSocket::duplex_pair(64 * 1024).await;
    let peer = Session::peer(server_socket, SessionConfig::default());
    tokio::spawn({
        let peer = peer.clone();
        async move { peer.serve().await }
    });

    let (mut sink, mut stream) = client_socket.into_parts();
    let connect = Frame::connect(2, "tcp", "127.0.0.1:22", 0).encode().unwrap();
    sink.send(WireMessage::Binary(connect)).await.unwrap();

    assert_eq!(
        next_frame(&mut stream).await,
        Frame::error(2, "connect not allowed: tcp 127.0.0.1:22")
    );
    assert_eq!(peer.connection_count(), 0);
}

#[tokio::test]
async fn test_malformed_frame_ends_session() {
    init_tracing();
    let (server_socket, client_socket) = ControlSocket::duplex_pair(64 * 1024).await;
    let peer = Session::peer(server_socket, SessionConfig::default());
    let serve = tokio::spawn({
        let peer = peer.clone();
        async move { peer.serve().await }
    });

    let (mut sink, _stream) = client_socket.into_parts();
    sink.send(WireMessage::Binary(Bytes::from_static(&[7, 0, 0])))
        .await
        .unwrap();

    let result = timeout(Duration::from_secs(5), serve).await.unwrap().unwrap();
    assert!(matches!(result, Err(MuxError::Frame(_))));
    assert!(peer.is_closed());
}

#[tokio::test]
async fn test_silent_peer_trips_keepalive() {
    init_tracing();
    let config = SessionConfig::default().with_keepalive(KeepAliveConfig {
        ping_interval: Duration::from_millis(20),
        read_timeout: Duration::from_millis(150),
        write_timeout: Duration::from_millis(100),
    });

    let (server_socket, client_socket) = ControlSocket::duplex_pair(64 * 1024).await;
    let agent = Session::agent(client_socket, Arc::new(backhaul_mux::AllowAll), config);

    // never read, so no pong ever comes back
    let _silent = server_socket;

    let result = timeout(Duration::from_secs(5), agent.serve()).await.unwrap();
    assert!(matches!(result, Err(MuxError::KeepAliveTimeout(_))));
    assert!(agent.is_closed());
}

#[tokio::test]
async fn test_serve_twice_is_refused() {
    let pair = session_pair().await;
    tokio::task::yield_now().await;

    let second = tokio::spawn({
        let peer = pair.peer.clone();
        async move { peer.serve().await }
    });
    // exactly one of the two serve calls owns the reader
    pair.peer.close().await;
    let (first, second) = (pair.peer_task.await.unwrap(), second.await.unwrap());
    assert!(
        matches!(first, Err(MuxError::AlreadyServing)) ^ matches!(second, Err(MuxError::AlreadyServing))
    );
}

fn backpressure_config() -> SessionConfig {
    // same ratios as the defaults: delivery outlasts the read timeout
    SessionConfig::default()
        .with_keepalive(KeepAliveConfig {
            ping_interval: Duration::from_millis(20),
            read_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_millis(100),
        })
        .with_queue_capacity(1)
        .with_deliver_timeout(Duration::from_millis(600))
        .with_max_data_size(1024)
}

#[tokio::test]
async fn test_stalled_reader_closes_only_its_connection() {
    let echo = echo_server().await;
    let pong = ping_server().await;
    let pair = session_pair_with(Arc::new(backhaul_mux::AllowAll), backpressure_config()).await;
    let dialer = pair.peer.dialer(DEADLINE);

    let mut stalled = dialer.dial("tcp", &echo.to_string()).await.unwrap();
    for _ in 0..8 {
        stalled.write_all(&[7u8; 1024]).await.unwrap();
    }

    // the echoes pile up unread until delivery gives up
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(stalled.is_closed());
    assert!(!pair.peer.is_closed());
    assert!(!pair.agent.is_closed());

    let mut sibling = dialer.dial("tcp", &pong.to_string()).await.unwrap();
    sibling.write_all(b"PING\n").await.unwrap();
    let mut reply = Vec::new();
    timeout(Duration::from_secs(5), sibling.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"PONG\n");

    // what was queued is still readable, then the failure shows
    let mut drained = Vec::new();
    let err = timeout(Duration::from_secs(5), stalled.read_to_end(&mut drained))
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.to_string().contains("buffer full"), "{err}");
    assert!(!drained.is_empty());
}

#[tokio::test]
async fn test_write_after_close_fails_on_both_ends() {
    init_tracing();
    let (server_socket, client_socket) = ControlSocket::duplex_pair(64 * 1024).await;
    let peer = Session::peer(server_socket, SessionConfig::default());
    tokio::spawn({
        let peer = peer.clone();
        async move { peer.serve().await }
    });
    let (mut sink, mut stream) = client_socket.into_parts();

    let mut conn = peer.dialer(DEADLINE).dial("tcp", "10.0.0.5:22").await.unwrap();
    let id = conn.id();
    assert!(matches!(next_frame(&mut stream).await, Frame::Connect { conn_id, .. } if conn_id == id));

    conn.close().await;
    let err = conn.write_all(b"late").await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

    assert_eq!(next_frame(&mut stream).await, Frame::error(id, "EOF"));

    // the far end writing into the closed connection is refused
    let data = Frame::data(id, Bytes::from_static(b"late")).encode().unwrap();
    sink.send(WireMessage::Binary(data)).await.unwrap();
    assert_eq!(
        next_frame(&mut stream).await,
        Frame::error(id, "connection not found")
    );
    assert!(!peer.is_closed());
}

#[tokio::test]
async fn test_dropped_connection_sends_eof_first() {
    init_tracing();
    let (server_socket, client_socket) = ControlSocket::duplex_pair(64 * 1024).await;
    let peer = Session::peer(server_socket, SessionConfig::default());
    tokio::spawn({
        let peer = peer.clone();
        async move { peer.serve().await }
    });
    let (mut sink, mut stream) = client_socket.into_parts();

    let conn = peer.dialer(DEADLINE).dial("tcp", "10.0.0.5:22").await.unwrap();
    let id = conn.id();
    next_frame(&mut stream).await;

    drop(conn);
    let data = Frame::data(id, Bytes::from_static(b"racing")).encode().unwrap();
    sink.send(WireMessage::Binary(data)).await.unwrap();

    assert_eq!(next_frame(&mut stream).await, Frame::error(id, "EOF"));
}

#[tokio::test]
async fn test_empty_round_trip() {
    let (capture, mut captured) = capture_server().await;
    let pair = session_pair().await;

    let mut conn = pair
        .peer
        .dialer(DEADLINE)
        .dial("tcp", &capture.to_string())
        .await
        .unwrap();
    assert_eq!(conn.write(&[]).await.unwrap(), 0);
    conn.write_all(b"").await.unwrap();
    conn.close().await;

    let received = timeout(Duration::from_secs(5), captured.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(received.is_empty());
}

#[tokio::test]
async fn test_session_close_releases_stalled_writer() {
    init_tracing();
    let config = SessionConfig::default().with_keepalive(KeepAliveConfig {
        write_timeout: Duration::from_millis(100),
        ..Default::default()
    });
    // a small pipe whose far end never reads
    let (server_socket, _client_socket) = ControlSocket::duplex_pair(4096).await;
    let peer = Session::peer(server_socket, config);

    let mut conn = peer.dialer(DEADLINE).dial("tcp", "10.0.0.5:22").await.unwrap();
    let writer = tokio::spawn(async move { conn.write_all(&vec![1u8; 256 * 1024]).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished());

    timeout(Duration::from_secs(2), peer.close()).await.unwrap();
    let result = timeout(Duration::from_secs(2), writer).await.unwrap().unwrap();
    assert!(result.is_err());
}
