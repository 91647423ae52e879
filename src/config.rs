//! Pipeline configuration.
//!
//! Every tuning knob the relay consults lives here: session limits, frame
//! size caps, timeouts, degradation thresholds, quality-controller policy
//! and client reconnect backoff. All structs deserialize with serde and
//! carry usable defaults, so embedders can load a partial config file and
//! only override what they care about.
//!
//! Durations are expressed as integer milliseconds in the serialized form
//! (`*_ms` fields) with [`std::time::Duration`] accessors.

use serde::Deserialize;
use std::time::Duration;

/// Top-level configuration for a relay server or client.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub limits: LimitsConfig,
    pub timing: TimingConfig,
    pub dispatch: DispatchConfig,
    pub degradation: DegradationConfig,
    pub quality: QualityConfig,
    pub backoff: BackoffConfig,
}

/// Hard caps that protect the process from hostile or buggy clients.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent sessions; connections beyond this are rejected
    /// with a capacity error, never silently queued.
    pub max_sessions: usize,
    /// Maximum accepted encoded frame payload in bytes. Oversized payloads
    /// are rejected at decode, before any allocation proportional to the
    /// claimed size.
    pub max_frame_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { max_sessions: 64, max_frame_bytes: 4 * 1024 * 1024 }
    }
}

/// Session timing knobs.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// A session with no inbound traffic for this long is force-closed.
    pub idle_timeout_ms: u64,
    /// Hard ceiling on total per-frame processing time; a frame exceeding
    /// it is abandoned and recorded as a drop.
    pub processing_ceiling_ms: u64,
    /// Grace period for outstanding work when a session enters Closing.
    pub close_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self { idle_timeout_ms: 30_000, processing_ceiling_ms: 2_000, close_grace_ms: 1_000 }
    }
}

impl TimingConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn processing_ceiling(&self) -> Duration {
        Duration::from_millis(self.processing_ceiling_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Outbound queue sizing.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Bounded depth of the per-session outbound queue. Overflow evicts the
    /// oldest processed-frame message and bumps the drop counter.
    pub outbound_queue_depth: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { outbound_queue_depth: 32 }
    }
}

/// Streaming/Degraded hysteresis band.
///
/// A session enters Degraded when the failure rate over the trailing
/// `window_frames` processed frames exceeds `enter_failure_rate`, and
/// returns to Streaming only once it drops below `exit_failure_rate`.
/// `exit_failure_rate` must be strictly below `enter_failure_rate` or the
/// band collapses and the state oscillates.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DegradationConfig {
    pub window_frames: usize,
    pub enter_failure_rate: f64,
    pub exit_failure_rate: f64,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self { window_frames: 10, enter_failure_rate: 0.5, exit_failure_rate: 0.2 }
    }
}

/// Adaptive quality controller policy.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct QualityConfig {
    /// End-to-end latency the controller steers toward, in milliseconds.
    pub target_latency_ms: u64,
    /// Trailing latency above `downgrade_ratio * target` steps quality down.
    pub downgrade_ratio: f64,
    /// Trailing latency below `upgrade_ratio * target`, sustained for
    /// `sustain_samples` consecutive evaluations, steps quality up.
    pub upgrade_ratio: f64,
    pub sustain_samples: usize,
    /// Fraction of dropped frames over the window that forces a downgrade
    /// regardless of latency.
    pub max_drop_rate: f64,
    /// Frame-rate step applied alongside each tier change.
    pub fps_step: u32,
    pub min_fps: u32,
    pub max_fps: u32,
    /// Target frame rate a fresh session starts at.
    pub initial_fps: u32,
    /// Minimum interval between successive adjustments.
    pub min_adjust_interval_ms: u64,
    /// Samples retained in the rolling performance window.
    pub window_samples: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            target_latency_ms: 150,
            downgrade_ratio: 1.5,
            upgrade_ratio: 0.6,
            sustain_samples: 5,
            max_drop_rate: 0.1,
            fps_step: 5,
            min_fps: 5,
            max_fps: 30,
            initial_fps: 20,
            min_adjust_interval_ms: 2_000,
            window_samples: 30,
        }
    }
}

impl QualityConfig {
    pub fn target_latency(&self) -> Duration {
        Duration::from_millis(self.target_latency_ms)
    }

    pub fn min_adjust_interval(&self) -> Duration {
        Duration::from_millis(self.min_adjust_interval_ms)
    }
}

/// Client-side reconnect backoff.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub base_ms: u64,
    /// Multiplier applied per consecutive failure.
    pub multiplier: f64,
    /// Ceiling on the computed delay.
    pub max_ms: u64,
    /// A connection that stays up this long resets the failure counter.
    pub reset_after_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base_ms: 500, multiplier: 2.0, max_ms: 30_000, reset_after_ms: 60_000 }
    }
}

impl BackoffConfig {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    pub fn reset_after(&self) -> Duration {
        Duration::from_millis(self.reset_after_ms)
    }
}
