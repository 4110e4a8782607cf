//! Connection multiplexing over a single control socket
//!
//! A [`Session`] owns one WebSocket control socket and carries any number of
//! virtual [`Connection`]s over it. The side holding a [`Dialer`] asks the
//! remote side to dial a real `(proto, address)` target; bytes then flow as
//! Data frames tagged with the connection id.
//!
//! # Roles
//!
//! - **Peer** (server side): dials through the agent, rejects inbound Connects.
//! - **Agent**: performs the real dials, gated by a [`ConnectAuthorizer`],
//!   and drives keepalive pings.

pub mod config;
pub mod connection;
pub mod dialer;
pub mod error;
pub mod keepalive;
mod pipe;
pub mod session;
pub mod socket;

pub use config::{KeepAliveConfig, SessionConfig};
pub use connection::{Connection, PeerAddr};
pub use dialer::{AllowAll, ConnectAuthorizer, Dialer};
pub use error::{MuxError, MuxResult};
pub use keepalive::{KeepAlive, Pinger};
pub use session::{Role, Session};
pub use socket::{ControlSocket, WireMessage, WireSink, WireStream};

pub use backhaul_proto::{ConnId, Frame, FrameError};

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
