//! Dialing seams: who may be dialed, and how callers dial through a session

use std::fmt;
use std::time::Duration;

use crate::connection::Connection;
use crate::error::MuxResult;
use crate::session::Session;

/// Decides whether an inbound Connect request may be dialed
pub trait ConnectAuthorizer: Send + Sync {
    fn authorize(&self, proto: &str, address: &str) -> bool;
}

impl<F> ConnectAuthorizer for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn authorize(&self, proto: &str, address: &str) -> bool {
        self(proto, address)
    }
}

/// Permits every request
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ConnectAuthorizer for AllowAll {
    fn authorize(&self, _proto: &str, _address: &str) -> bool {
        true
    }
}

/// Opens connections through one session with a fixed connect deadline
#[derive(Clone)]
pub struct Dialer {
    session: Session,
    deadline: Duration,
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl Dialer {
    pub(crate) fn new(session: Session, deadline: Duration) -> Self {
        Self { session, deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Ask the remote side to dial `(proto, address)`.
    ///
    /// Returns as soon as the request is sent; a failed remote dial surfaces
    /// as an error on the first read.
    pub async fn dial(&self, proto: &str, address: &str) -> MuxResult<Connection> {
        self.session.connect(proto, address, self.deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_authorizer() {
        let only_ssh = |proto: &str, address: &str| proto == "tcp" && address.ends_with(":22");
        assert!(only_ssh.authorize("tcp", "10.0.0.1:22"));
        assert!(!only_ssh.authorize("tcp", "10.0.0.1:80"));
        assert!(!only_ssh.authorize("udp", "10.0.0.1:22"));
    }

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.authorize("unix", "/tmp/x.sock"));
    }
}
