//! Per-connection session state.
//!
//! One [`Session`] exists per active transport connection, owned
//! exclusively by its session task. It bundles the lifecycle state
//! machine, the monotonic sequence counters, the rolling performance
//! window and the adaptive quality controller. Nothing here is shared
//! across sessions; a slow or misbehaving client cannot stall another
//! client's pipeline.

mod state;

pub use state::{SessionState, StateMachine, Transition};

use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::processor::ProcessingResult;
use crate::protocol::SessionSummaryPayload;
use crate::quality::{PerfSample, PerfWindow, QualityAdjustment, QualityController, QualityState};

/// Opaque unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What recording one processing result triggered.
#[derive(Debug, Default)]
pub struct RecordOutcome {
    /// Streaming/Degraded edge, when crossed.
    pub transition: Option<Transition>,
    /// Quality adjustment, when the controller stepped.
    pub adjustment: Option<QualityAdjustment>,
}

/// Server-side state for one client's persistent connection.
pub struct Session {
    id: SessionId,
    machine: StateMachine,
    window: PerfWindow,
    controller: QualityController,
    /// Next outbound server frame number; never reused.
    next_server_frame: u64,
    /// Highest client frame number admitted so far.
    highest_client_frame: Option<u64>,
    frames_received: u64,
    frames_processed: u64,
    frames_dropped: u64,
    confidence_sum: f64,
    confidence_count: u64,
    current_step: u32,
    started_at: Instant,
    last_activity: Instant,
}

impl Session {
    pub fn new(cfg: &RelayConfig, now: Instant) -> Self {
        Self {
            id: SessionId::generate(),
            machine: StateMachine::new(cfg.degradation.clone()),
            window: PerfWindow::new(cfg.quality.window_samples),
            controller: QualityController::new(cfg.quality.clone()),
            next_server_frame: 0,
            highest_client_frame: None,
            frames_received: 0,
            frames_processed: 0,
            frames_dropped: 0,
            confidence_sum: 0.0,
            confidence_count: 0,
            current_step: 0,
            started_at: now,
            last_activity: now,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn quality(&self) -> QualityState {
        self.controller.state()
    }

    pub fn accepts_frames(&self) -> bool {
        self.machine.accepts_frames()
    }

    pub fn current_step(&self) -> u32 {
        self.current_step
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Record inbound traffic for idle tracking.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_activity) >= timeout
    }

    pub fn handshake_complete(&mut self) -> Option<Transition> {
        self.machine.handshake_complete()
    }

    pub fn start_streaming(&mut self) -> Option<Transition> {
        self.machine.streaming_started()
    }

    pub fn begin_close(&mut self) -> Option<Transition> {
        self.machine.begin_close()
    }

    pub fn finish_close(&mut self) -> Option<Transition> {
        self.machine.finish_close()
    }

    /// Advance the interactive exercise step.
    pub fn advance_step(&mut self) -> u32 {
        self.current_step += 1;
        self.current_step
    }

    /// Admit one inbound frame and assign its server sequence number.
    ///
    /// Gaps in client numbering are tolerated (frames may be dropped in
    /// flight); duplicates and regressions are refused so a sequence
    /// number is never processed twice, and count as drops to keep the
    /// frame accounting exact. Admission does not start streaming: the
    /// payload has not been decoded yet, and only a valid frame moves the
    /// lifecycle forward.
    pub fn admit_frame(&mut self, client_number: u64, now: Instant) -> Option<u64> {
        self.touch(now);
        self.frames_received += 1;
        if let Some(highest) = self.highest_client_frame {
            if client_number <= highest {
                debug!(
                    session = %self.id,
                    client_number,
                    highest,
                    "refusing duplicate or regressed frame number"
                );
                self.frames_dropped += 1;
                return None;
            }
        }
        self.highest_client_frame = Some(client_number);
        let server_number = self.next_server_frame;
        self.next_server_frame += 1;
        Some(server_number)
    }

    /// Record one processing result for a decoded frame: feeds the
    /// performance window, the degradation hysteresis, and the quality
    /// controller. The first decoded frame starts streaming.
    pub fn record_result(
        &mut self,
        result: &ProcessingResult,
        end_to_end_latency: Duration,
        now: Instant,
    ) -> RecordOutcome {
        self.machine.streaming_started();
        self.frames_processed += 1;
        if let Some(confidence) = result.confidence {
            self.confidence_sum += confidence;
            self.confidence_count += 1;
        }
        self.window.record(PerfSample {
            latency_ms: end_to_end_latency.as_secs_f64() * 1000.0,
            success: result.success,
            dropped: false,
            at: now,
        });
        RecordOutcome {
            transition: self.machine.record_outcome(result.success),
            adjustment: self.controller.evaluate(&self.window, now),
        }
    }

    /// Count a frame that produced no `processed_frame` message: the
    /// payload failed to decode, or its re-encode failed.
    pub fn count_skipped(&mut self) {
        self.frames_dropped += 1;
    }

    /// Record a frame abandoned past the processing ceiling or evicted
    /// from the outbound queue.
    pub fn record_drop(&mut self, now: Instant) {
        self.frames_dropped += 1;
        self.window.record(PerfSample {
            latency_ms: 0.0,
            success: false,
            dropped: true,
            at: now,
        });
    }

    /// Aggregate summary for `session_complete` and the analytics sink.
    pub fn summary(&self, now: Instant) -> SessionSummaryPayload {
        let score = if self.confidence_count == 0 {
            0.0
        } else {
            self.confidence_sum / self.confidence_count as f64
        };
        SessionSummaryPayload {
            message: format!(
                "processed {} frames ({} dropped) across {} steps",
                self.frames_processed,
                self.frames_dropped,
                self.current_step + 1
            ),
            score,
            elapsed_ms: now.duration_since(self.started_at).as_millis() as u64,
        }
    }
}
