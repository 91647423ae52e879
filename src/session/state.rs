//! Session lifecycle state machine.
//!
//! `Connecting -> Open -> Streaming <-> Degraded -> Closing -> Closed`.
//!
//! The Streaming/Degraded edge is driven by the failure rate over the
//! trailing processed frames, with a hysteresis band: the session degrades
//! when the rate exceeds the upper threshold and recovers only once it
//! falls below the lower one. The machine is synchronous and owns its own
//! compact failure ring, so the hysteresis behavior is testable in
//! isolation from any transport or task.

use std::collections::VecDeque;
use tracing::info;

use crate::config::DegradationConfig;

/// Lifecycle state of one connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport accepted, handshake not complete.
    Connecting,
    /// Ready to receive control or frame messages.
    Open,
    /// Actively processing frames.
    Streaming,
    /// Failure rate exceeded the threshold; frames are still accepted but
    /// results are marked accordingly.
    Degraded,
    /// Termination requested or idle timeout fired.
    Closing,
    /// Terminal; all resources released.
    Closed,
}

/// A state change that observers may need to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Driver for one session's lifecycle.
#[derive(Debug)]
pub struct StateMachine {
    state: SessionState,
    cfg: DegradationConfig,
    /// Success/failure of the trailing processed frames.
    recent: VecDeque<bool>,
}

impl StateMachine {
    pub fn new(cfg: DegradationConfig) -> Self {
        let capacity = cfg.window_frames.max(1);
        Self { state: SessionState::Connecting, cfg, recent: VecDeque::with_capacity(capacity) }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether inbound frames are currently admitted.
    pub fn accepts_frames(&self) -> bool {
        matches!(
            self.state,
            SessionState::Open | SessionState::Streaming | SessionState::Degraded
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Handshake finished: `Connecting -> Open`.
    pub fn handshake_complete(&mut self) -> Option<Transition> {
        self.shift(SessionState::Connecting, SessionState::Open)
    }

    /// Explicit start control message or first valid frame:
    /// `Open -> Streaming`.
    pub fn streaming_started(&mut self) -> Option<Transition> {
        self.shift(SessionState::Open, SessionState::Streaming)
    }

    /// Record one processed frame's outcome and evaluate the hysteresis
    /// band.
    ///
    /// The rate is taken over the trailing `window_frames` outcomes, or all
    /// outcomes seen so far while the window is still filling. A burst of
    /// failures right after start therefore degrades promptly instead of
    /// waiting for a full window.
    pub fn record_outcome(&mut self, success: bool) -> Option<Transition> {
        if self.recent.len() == self.cfg.window_frames.max(1) {
            self.recent.pop_front();
        }
        self.recent.push_back(success);

        let rate = self.failure_rate();
        match self.state {
            SessionState::Streaming if rate > self.cfg.enter_failure_rate => {
                self.shift(SessionState::Streaming, SessionState::Degraded)
            }
            SessionState::Degraded if rate < self.cfg.exit_failure_rate => {
                self.shift(SessionState::Degraded, SessionState::Streaming)
            }
            _ => None,
        }
    }

    /// Any non-terminal state moves to `Closing` on transport error,
    /// explicit stop, or idle timeout.
    pub fn begin_close(&mut self) -> Option<Transition> {
        match self.state {
            SessionState::Closing | SessionState::Closed => None,
            from => {
                self.state = SessionState::Closing;
                info!(?from, "session closing");
                Some(Transition { from, to: SessionState::Closing })
            }
        }
    }

    /// Outstanding work finished or the grace period elapsed:
    /// `Closing -> Closed`.
    pub fn finish_close(&mut self) -> Option<Transition> {
        self.shift(SessionState::Closing, SessionState::Closed)
    }

    /// Failure fraction over the trailing window.
    pub fn failure_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let failed = self.recent.iter().filter(|ok| !**ok).count();
        failed as f64 / self.recent.len() as f64
    }

    fn shift(&mut self, from: SessionState, to: SessionState) -> Option<Transition> {
        if self.state != from {
            return None;
        }
        self.state = to;
        Some(Transition { from, to })
    }
}
