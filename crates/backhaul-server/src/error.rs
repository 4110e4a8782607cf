//! Server errors

use backhaul_mux::MuxError;
use thiserror::Error;

use crate::manager::ManagerError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("Session error: {0}")]
    Session(#[from] MuxError),

    #[error("Upgrade path must start with '/': {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
