//! Exponential backoff between registration attempts

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Consecutive failed attempts tolerated (None = unlimited)
    pub max_attempts: Option<usize>,
    /// A session that stayed up this long resets the backoff
    pub stable_after: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
            stable_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Gave up after {0} reconnection attempts")]
    MaxAttemptsReached(usize),
}

/// Tracks consecutive failures and sleeps between attempts
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Sleep before the next attempt, or give up once attempts are exhausted
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached(max_attempts));
            }
        }

        debug!(
            attempt = self.attempt,
            backoff_ms = self.current_backoff.as_millis() as u64,
            "Waiting before reconnecting"
        );
        sleep(self.current_backoff).await;

        let next = self.current_backoff.mul_f64(self.config.multiplier);
        self.current_backoff = next.min(self.config.max_backoff);

        Ok(())
    }

    /// Account for a session that ran for `uptime` before ending
    pub fn session_ended(&mut self, uptime: Duration) {
        if uptime >= self.config.stable_after {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
