//! Backhaul Protocol Definitions
//!
//! This crate defines the wire frames exchanged over a backhaul control socket.
//! Every binary WebSocket message carries exactly one [`Frame`].

pub mod frame;

pub use frame::{ConnId, Frame, FrameError, FrameType};

/// Maximum encoded frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum length of the proto and address fields of a Connect frame
pub const MAX_FIELD_LEN: usize = 4096;

/// Error text that signals a clean end of stream rather than a failure
pub const EOF_MESSAGE: &str = "EOF";

/// Upgrade request header naming the connecting agent
pub const AGENT_HEADER: &str = "x-backhaul-agent";
