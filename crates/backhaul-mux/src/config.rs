//! Session configuration

use crate::error::{MuxError, MuxResult};
use backhaul_proto::{Frame, MAX_FRAME_SIZE};
use std::time::Duration;

/// Keepalive timings for the control socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Interval between pings (agent role only)
    pub ping_interval: Duration,

    /// Session is torn down if nothing arrives within this window
    pub read_timeout: Duration,

    /// Deadline for control writes (ping, pong, close)
    pub write_timeout: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(1),
        }
    }
}

/// Per-session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub keepalive: KeepAliveConfig,

    /// Capacity of each connection's inbound queue, in Data frames
    pub queue_capacity: usize,

    /// How long the reader waits on a full inbound queue before failing the connection
    pub deliver_timeout: Duration,

    /// Largest payload carried by one Data frame
    pub max_data_size: usize,

    /// Time a closing connection gets to flush queued bytes to its dialed target
    pub linger: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive: KeepAliveConfig::default(),
            queue_capacity: 1024,
            deliver_timeout: Duration::from_secs(15),
            max_data_size: 32 * 1024,
            linger: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    pub fn with_keepalive(mut self, keepalive: KeepAliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_deliver_timeout(mut self, timeout: Duration) -> Self {
        self.deliver_timeout = timeout;
        self
    }

    pub fn with_max_data_size(mut self, size: usize) -> Self {
        self.max_data_size = size;
        self
    }

    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    pub fn validate(&self) -> MuxResult<()> {
        if self.queue_capacity == 0 {
            return Err(MuxError::InvalidConfig(
                "queue capacity must be positive".to_string(),
            ));
        }
        if self.max_data_size == 0 || self.max_data_size > MAX_FRAME_SIZE - Frame::HEADER_SIZE {
            return Err(MuxError::InvalidConfig(format!(
                "max data size must be between 1 and {} bytes",
                MAX_FRAME_SIZE - Frame::HEADER_SIZE
            )));
        }
        if self.keepalive.ping_interval >= self.keepalive.read_timeout {
            return Err(MuxError::InvalidConfig(
                "ping interval must be shorter than the read timeout".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.deliver_timeout, Duration::from_secs(15));
        assert_eq!(config.keepalive.ping_interval, Duration::from_secs(5));
        assert_eq!(config.keepalive.read_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ping_must_beat_read_timeout() {
        let config = SessionConfig::default().with_keepalive(KeepAliveConfig {
            ping_interval: Duration::from_secs(10),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(SessionConfig::default()
            .with_queue_capacity(0)
            .validate()
            .is_err());
        assert!(SessionConfig::default()
            .with_max_data_size(MAX_FRAME_SIZE)
            .validate()
            .is_err());
    }
}
