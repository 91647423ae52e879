//! Adaptive quality control.
//!
//! Each session carries a rolling window of per-frame performance samples.
//! After every recorded [`ProcessingResult`](crate::processor::ProcessingResult)
//! the [`QualityController`] looks at trailing latency and decides whether to
//! step the [`QualityProfile`] and target frame rate up or down. The policy
//! is a function of the window plus the current state — the clock is passed
//! in, so the whole thing is testable without sleeping.
//!
//! Hysteresis against thrashing comes from three places: a rate limit
//! between adjustments, a sustain requirement before upgrading, and the gap
//! between the upgrade and downgrade latency ratios.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::debug;

use crate::config::QualityConfig;

/// Enumerated quality tier, ordered from cheapest to best-looking.
///
/// Each tier maps to a concrete JPEG quality and a resolution ceiling, so
/// encoded output size stays predictable per tier and the controller's
/// compression-ratio assumptions hold across encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityProfile {
    UltraPerformance,
    HighPerformance,
    Balanced,
    HighQuality,
}

impl QualityProfile {
    /// JPEG quality (1-100) used when encoding at this tier.
    pub fn jpeg_quality(self) -> u8 {
        match self {
            QualityProfile::UltraPerformance => 35,
            QualityProfile::HighPerformance => 55,
            QualityProfile::Balanced => 75,
            QualityProfile::HighQuality => 90,
        }
    }

    /// Longest edge, in pixels, an encoded frame may have at this tier.
    pub fn max_dimension(self) -> u32 {
        match self {
            QualityProfile::UltraPerformance => 320,
            QualityProfile::HighPerformance => 480,
            QualityProfile::Balanced => 640,
            QualityProfile::HighQuality => 960,
        }
    }

    /// One tier cheaper, saturating at the floor.
    pub fn step_down(self) -> Self {
        match self {
            QualityProfile::HighQuality => QualityProfile::Balanced,
            QualityProfile::Balanced => QualityProfile::HighPerformance,
            QualityProfile::HighPerformance | QualityProfile::UltraPerformance => {
                QualityProfile::UltraPerformance
            }
        }
    }

    /// One tier better, saturating at the ceiling.
    pub fn step_up(self) -> Self {
        match self {
            QualityProfile::UltraPerformance => QualityProfile::HighPerformance,
            QualityProfile::HighPerformance => QualityProfile::Balanced,
            QualityProfile::Balanced | QualityProfile::HighQuality => QualityProfile::HighQuality,
        }
    }
}

impl Default for QualityProfile {
    fn default() -> Self {
        QualityProfile::Balanced
    }
}

/// One completed (or abandoned) frame's worth of telemetry.
#[derive(Debug, Clone, Copy)]
pub struct PerfSample {
    /// End-to-end latency for this frame in milliseconds.
    pub latency_ms: f64,
    /// Whether processing produced a successful result.
    pub success: bool,
    /// Whether the frame was abandoned (processing ceiling or queue eviction).
    pub dropped: bool,
    /// Completion time, used to derive the observed frame rate.
    pub at: Instant,
}

/// Fixed-capacity ring buffer of recent [`PerfSample`]s.
#[derive(Debug)]
pub struct PerfWindow {
    samples: VecDeque<PerfSample>,
    capacity: usize,
}

impl PerfWindow {
    pub fn new(capacity: usize) -> Self {
        Self { samples: VecDeque::with_capacity(capacity), capacity: capacity.max(1) }
    }

    pub fn record(&mut self, sample: PerfSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    /// Mean latency over the window, `None` while empty.
    pub fn avg_latency_ms(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().map(|s| s.latency_ms).sum::<f64>() / self.samples.len() as f64)
    }

    /// Fraction of failed results over the trailing `n` samples.
    pub fn failure_rate(&self, n: usize) -> f64 {
        let tail = self.samples.iter().rev().take(n.max(1));
        let (mut total, mut failed) = (0usize, 0usize);
        for s in tail {
            total += 1;
            if !s.success {
                failed += 1;
            }
        }
        if total == 0 { 0.0 } else { failed as f64 / total as f64 }
    }

    /// Fraction of dropped frames over the whole window.
    pub fn drop_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let dropped = self.samples.iter().filter(|s| s.dropped).count();
        dropped as f64 / self.samples.len() as f64
    }

    /// Observed frame rate derived from sample spacing, `None` until at
    /// least two samples exist.
    pub fn observed_fps(&self) -> Option<f64> {
        let first = self.samples.front()?;
        let last = self.samples.back()?;
        let span = last.at.duration_since(first.at).as_secs_f64();
        if span <= f64::EPSILON || self.samples.len() < 2 {
            return None;
        }
        Some((self.samples.len() - 1) as f64 / span)
    }
}

/// A profile/frame-rate pair pushed to the codec and the client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityState {
    pub profile: QualityProfile,
    pub target_fps: u32,
}

/// Direction of an adjustment, for logging and the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentDirection {
    Down,
    Up,
}

/// An adjustment decided by the controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityAdjustment {
    pub state: QualityState,
    pub direction: AdjustmentDirection,
}

/// Latency-driven quality policy. One per session.
#[derive(Debug)]
pub struct QualityController {
    cfg: QualityConfig,
    state: QualityState,
    /// Consecutive below-upgrade-threshold evaluations.
    sustain: usize,
    last_adjust: Option<Instant>,
}

impl QualityController {
    pub fn new(cfg: QualityConfig) -> Self {
        let state = QualityState {
            profile: QualityProfile::default(),
            target_fps: cfg.initial_fps.clamp(cfg.min_fps, cfg.max_fps),
        };
        Self { cfg, state, sustain: 0, last_adjust: None }
    }

    pub fn state(&self) -> QualityState {
        self.state
    }

    /// Evaluate the window after a result was recorded.
    ///
    /// Returns the new state when an adjustment fired. The window must be
    /// full before any adaptation happens, so short bursts never move the
    /// tier.
    pub fn evaluate(&mut self, window: &PerfWindow, now: Instant) -> Option<QualityAdjustment> {
        if !window.is_full() {
            return None;
        }
        let avg = window.avg_latency_ms()?;
        let target = self.cfg.target_latency_ms as f64;

        // Abandoned frames are a stronger pressure signal than latency:
        // their latency never even made it into the average.
        if window.drop_rate() > self.cfg.max_drop_rate {
            self.sustain = 0;
            if self.rate_limited(now) {
                return None;
            }
            debug!(
                drop_rate = window.drop_rate(),
                observed_fps = ?window.observed_fps(),
                "drop rate over limit; stepping quality down"
            );
            return self.apply(AdjustmentDirection::Down, now);
        }

        if avg > target * self.cfg.downgrade_ratio {
            self.sustain = 0;
            if self.rate_limited(now) {
                return None;
            }
            return self.apply(AdjustmentDirection::Down, now);
        }

        if avg < target * self.cfg.upgrade_ratio {
            self.sustain += 1;
            if self.sustain < self.cfg.sustain_samples || self.rate_limited(now) {
                return None;
            }
            self.sustain = 0;
            return self.apply(AdjustmentDirection::Up, now);
        }

        self.sustain = 0;
        None
    }

    fn rate_limited(&self, now: Instant) -> bool {
        match self.last_adjust {
            Some(t) => now.duration_since(t) < self.cfg.min_adjust_interval(),
            None => false,
        }
    }

    fn apply(&mut self, direction: AdjustmentDirection, now: Instant) -> Option<QualityAdjustment> {
        let next = match direction {
            AdjustmentDirection::Down => QualityState {
                profile: self.state.profile.step_down(),
                target_fps: self
                    .state
                    .target_fps
                    .saturating_sub(self.cfg.fps_step)
                    .max(self.cfg.min_fps),
            },
            AdjustmentDirection::Up => QualityState {
                profile: self.state.profile.step_up(),
                target_fps: (self.state.target_fps + self.cfg.fps_step).min(self.cfg.max_fps),
            },
        };
        if next == self.state {
            // Already pinned at the floor or ceiling.
            return None;
        }
        self.state = next;
        self.last_adjust = Some(now);
        Some(QualityAdjustment { state: next, direction })
    }
}
