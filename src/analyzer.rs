//! Landmark analyzer capability seam.
//!
//! The detection algorithm itself lives outside this crate. It is consumed
//! through one narrow, function-shaped interface: image in, detections and
//! an annotated image out, or a typed error. Alternate detectors can be
//! substituted without touching session or dispatcher logic.
//!
//! Adapters are assumed CPU-bound and potentially slow (tens of
//! milliseconds). The caller measures wall-clock duration for telemetry but
//! applies no timeout here; backpressure is handled a layer up by the
//! quality controller lowering the incoming frame rate.

use image::DynamicImage;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::warn;

use crate::error::{RelayError, Result};

/// Output of one successful analyzer invocation.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// Named detection categories, e.g. `"hands" -> true`.
    pub detections: BTreeMap<String, bool>,
    /// Overall confidence in [0, 1].
    pub confidence: f64,
    /// The input image with landmark overlays drawn on it. `None` when the
    /// detector produced flags only.
    pub annotated: Option<DynamicImage>,
}

/// The external detection capability.
///
/// `analyze` runs synchronously relative to the calling frame processor
/// invocation. Implementations may fail with any error; they must not
/// assume they can abort the session.
pub trait LandmarkAnalyzer: Send + Sync {
    fn analyze(&self, image: &DynamicImage) -> Result<Analysis>;
}

/// Invoke an analyzer with panic isolation.
///
/// A panic inside the adapter is caught and converted into an analysis
/// error, never propagated as a fatal fault.
pub fn run_isolated(analyzer: &dyn LandmarkAnalyzer, image: &DynamicImage) -> Result<Analysis> {
    match catch_unwind(AssertUnwindSafe(|| analyzer.analyze(image))) {
        Ok(result) => result,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            warn!(detail, "analyzer panicked; converting to analysis error");
            Err(RelayError::analysis(format!("analyzer panicked: {detail}")))
        }
    }
}
