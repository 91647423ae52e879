//! Per-frame processing pipeline: decode, analyze, encode.
//!
//! One processor instance is owned by exactly one session; processor state
//! is never shared across clients. `process` never raises past its
//! boundary: every internal failure is absorbed into a
//! [`ProcessingResult`] so the client always receives deterministic
//! feedback, degraded or not.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::analyzer::{LandmarkAnalyzer, run_isolated};
use crate::codec::FrameCodec;
use crate::error::RelayError;
use crate::protocol::Frame;
use crate::quality::QualityProfile;

/// Structured outcome of one frame processor invocation. Never null: on
/// any internal failure a degraded result is still produced.
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub success: bool,
    /// Encoded annotated frame; absent when decode or encode failed.
    pub annotated: Option<Vec<u8>>,
    pub detections: BTreeMap<String, bool>,
    /// Confidence in [0, 1]; `None` when no detection was attempted.
    pub confidence: Option<f64>,
    pub decode_ms: u64,
    pub analysis_ms: u64,
    pub encode_ms: u64,
    /// Wire error code when `success` is false.
    pub error_code: Option<&'static str>,
    pub client_frame_number: u64,
    pub captured_at_ms: u64,
}

impl ProcessingResult {
    pub fn total_ms(&self) -> u64 {
        self.decode_ms + self.analysis_ms + self.encode_ms
    }

    /// Whether the frame payload itself was readable. False only for
    /// decode and size-cap failures; analysis and encode failures happen
    /// on a valid frame.
    pub fn decoded(&self) -> bool {
        !matches!(self.error_code, Some("decode_error" | "frame_too_large"))
    }

    fn failed(frame: &Frame, err: &RelayError) -> Self {
        Self {
            success: false,
            annotated: None,
            detections: BTreeMap::new(),
            confidence: None,
            decode_ms: 0,
            analysis_ms: 0,
            encode_ms: 0,
            error_code: Some(err.code()),
            client_frame_number: frame.client_number,
            captured_at_ms: frame.captured_at_ms,
        }
    }
}

/// Orchestrates decode -> analyze -> encode for one session's frames.
pub struct FrameProcessor {
    codec: FrameCodec,
    analyzer: Arc<dyn LandmarkAnalyzer>,
}

impl FrameProcessor {
    pub fn new(codec: FrameCodec, analyzer: Arc<dyn LandmarkAnalyzer>) -> Self {
        Self { codec, analyzer }
    }

    /// Run one frame through the pipeline at the given quality tier.
    ///
    /// CPU-bound; callers on an async runtime should run it on a blocking
    /// thread. The analyzer call is measured but never timed out here.
    pub fn process(&self, frame: &Frame, profile: QualityProfile) -> ProcessingResult {
        let decode_start = Instant::now();
        let image = match self.codec.decode(&frame.data) {
            Ok(image) => image,
            Err(err) => {
                debug!(frame = frame.client_number, %err, "decode failed");
                let mut result = ProcessingResult::failed(frame, &err);
                result.decode_ms = decode_start.elapsed().as_millis() as u64;
                return result;
            }
        };
        let decode_ms = decode_start.elapsed().as_millis() as u64;

        let analysis_start = Instant::now();
        let analysis = run_isolated(self.analyzer.as_ref(), &image);
        let analysis_ms = analysis_start.elapsed().as_millis() as u64;

        // On analyzer failure the client still gets its frame back,
        // un-annotated, with success=false and zeroed confidence.
        let (detections, confidence, to_encode, analyzer_error) = match analysis {
            Ok(analysis) => {
                let annotated = analysis.annotated.unwrap_or_else(|| image.clone());
                (analysis.detections, Some(analysis.confidence.clamp(0.0, 1.0)), annotated, None)
            }
            Err(err) => {
                debug!(frame = frame.client_number, %err, "analysis failed");
                (BTreeMap::new(), Some(0.0), image, Some(err.code()))
            }
        };

        let encode_start = Instant::now();
        let (annotated, encode_error) = match self.codec.encode(&to_encode, profile) {
            Ok(bytes) => (Some(bytes), None),
            Err(err) => {
                debug!(frame = frame.client_number, %err, "encode failed");
                (None, Some(err.code()))
            }
        };
        let encode_ms = encode_start.elapsed().as_millis() as u64;

        let error_code = analyzer_error.or(encode_error);
        ProcessingResult {
            success: error_code.is_none(),
            annotated,
            detections,
            confidence,
            decode_ms,
            analysis_ms,
            encode_ms,
            error_code,
            client_frame_number: frame.client_number,
            captured_at_ms: frame.captured_at_ms,
        }
    }
}
