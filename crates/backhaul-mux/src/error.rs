//! Session-level errors

use backhaul_proto::FrameError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a session. Everything surfaced from `Session::serve` is fatal
/// to the whole session.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Malformed frame: {0}")]
    Frame(#[from] FrameError),

    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Non-binary message on control socket")]
    NonBinaryMessage,

    #[error("No message received within {0:?}")]
    KeepAliveTimeout(Duration),

    #[error("Control write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("Control socket closed by peer")]
    TransportClosed,

    #[error("Session closed")]
    SessionClosed,

    #[error("Session is already being served")]
    AlreadyServing,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type MuxResult<T> = Result<T, MuxError>;

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::Transport(e) => e,
            MuxError::WriteTimeout(_) | MuxError::KeepAliveTimeout(_) => {
                io::Error::new(io::ErrorKind::TimedOut, err.to_string())
            }
            MuxError::SessionClosed | MuxError::TransportClosed => {
                io::Error::new(io::ErrorKind::NotConnected, err.to_string())
            }
            MuxError::Frame(_) => io::Error::new(io::ErrorKind::InvalidInput, err.to_string()),
            other => io::Error::other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kinds() {
        let err: io::Error = MuxError::SessionClosed.into();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let err: io::Error = MuxError::WriteTimeout(Duration::from_secs(1)).into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let err: io::Error = MuxError::Frame(FrameError::UnknownType(9)).into();
        assert!(err.to_string().contains("Unknown frame type"));
    }
}
