//! Transport-neutral view of the WebSocket control socket
//!
//! The agent side speaks tokio-tungstenite while the server side receives an
//! axum `WebSocket`; both are adapted into a boxed sink/stream pair of
//! [`WireMessage`]s so the session engine never sees either type.

use bytes::Bytes;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use std::io;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// One WebSocket message as seen by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Binary(Bytes),
    Text(String),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

pub type WireSink = Pin<Box<dyn Sink<WireMessage, Error = io::Error> + Send>>;
pub type WireStream = Pin<Box<dyn Stream<Item = io::Result<WireMessage>> + Send>>;

/// Write and read halves of one control socket
pub struct ControlSocket {
    sink: WireSink,
    stream: WireStream,
}

impl std::fmt::Debug for ControlSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSocket").finish_non_exhaustive()
    }
}

impl ControlSocket {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<WireMessage, Error = io::Error> + Send + 'static,
        St: Stream<Item = io::Result<WireMessage>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Adapt a tokio-tungstenite WebSocket
    pub fn from_tungstenite<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();

        let sink = sink
            .sink_map_err(io::Error::other)
            .with(|msg: WireMessage| future::ready(Ok::<_, io::Error>(into_tungstenite(msg))));
        let stream = stream.map(|result| result.map(WireMessage::from).map_err(io::Error::other));

        Self::new(sink, stream)
    }

    /// Two connected in-memory sockets (server end, client end)
    pub async fn duplex_pair(max_buf_size: usize) -> (Self, Self) {
        let (server_io, client_io) = tokio::io::duplex(max_buf_size);

        let (server, client) = tokio::join!(
            WebSocketStream::from_raw_socket(server_io, Role::Server, None),
            WebSocketStream::from_raw_socket(client_io, Role::Client, None),
        );

        (Self::from_tungstenite(server), Self::from_tungstenite(client))
    }

    pub fn into_parts(self) -> (WireSink, WireStream) {
        (self.sink, self.stream)
    }
}

impl From<Message> for WireMessage {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Binary(data) => WireMessage::Binary(Bytes::from(data)),
            Message::Text(text) => WireMessage::Text(text),
            Message::Ping(data) => WireMessage::Ping(Bytes::from(data)),
            Message::Pong(data) => WireMessage::Pong(Bytes::from(data)),
            Message::Close(_) => WireMessage::Close,
            Message::Frame(frame) => WireMessage::Binary(Bytes::copy_from_slice(frame.payload())),
        }
    }
}

fn into_tungstenite(msg: WireMessage) -> Message {
    match msg {
        WireMessage::Binary(data) => Message::Binary(data.to_vec()),
        WireMessage::Text(text) => Message::Text(text),
        WireMessage::Ping(data) => Message::Ping(data.to_vec()),
        WireMessage::Pong(data) => Message::Pong(data.to_vec()),
        WireMessage::Close => Message::Close(None),
    }
}
