//! Reconnect backoff for the client side of the protocol.
//!
//! An explicit state machine rather than an ad hoc retry loop: failures
//! grow the delay exponentially up to a ceiling, and a connection that
//! stays up for the configured stable period resets the counter. The
//! clock is injected so the schedule is testable without sleeping.

use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::BackoffConfig;

/// Exponential backoff with a sustained-success reset.
#[derive(Debug)]
pub struct Backoff {
    cfg: BackoffConfig,
    /// Consecutive failed or short-lived connection attempts.
    attempt: u32,
    connected_since: Option<Instant>,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self { cfg, attempt: 0, connected_since: None }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay to wait before the next connection attempt, growing the
    /// schedule. The first failure waits the base delay.
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.cfg.multiplier.max(1.0).powi(self.attempt as i32);
        let delay_ms = (self.cfg.base_ms as f64 * factor).min(self.cfg.max_ms as f64);
        self.attempt = self.attempt.saturating_add(1);
        let delay = Duration::from_millis(delay_ms as u64);
        debug!(attempt = self.attempt, ?delay, "backoff scheduled");
        delay
    }

    /// A connection was established.
    pub fn on_established(&mut self, now: Instant) {
        self.connected_since = Some(now);
    }

    /// The connection closed. If it had been up for the stable period the
    /// failure counter resets, so a long-lived session followed by a blip
    /// retries quickly.
    pub fn on_closed(&mut self, now: Instant) {
        if let Some(since) = self.connected_since.take() {
            if now.duration_since(since) >= self.cfg.reset_after() {
                debug!("connection was stable; resetting backoff");
                self.attempt = 0;
            }
        }
    }
}
