//! Error types for the streaming pipeline.
//!
//! All errors implement the `std::error::Error` trait and carry structured
//! context. The taxonomy mirrors where an error is absorbed:
//!
//! - **Decode / Analysis / Encode**: per-frame failures. Absorbed at the
//!   frame processor boundary and surfaced as data (a degraded
//!   [`ProcessingResult`](crate::processor::ProcessingResult) or an `error`
//!   wire message). They never terminate a session.
//! - **Capacity**: connection rejected at accept time. Fatal for that
//!   connection attempt only.
//! - **Transport / Protocol**: socket-level or framing-level failures.
//!   These are the only errors that terminate a session.
//!
//! Nothing in this crate is permitted to crash the host process: a session
//! with repeated per-frame failures degrades, it does not close.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Main error type for the frame relay.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RelayError {
    #[error("frame decode failed: {reason}")]
    Decode { reason: String },

    #[error("frame payload of {actual} bytes exceeds limit of {limit} bytes")]
    OversizedFrame { actual: usize, limit: usize },

    #[error("landmark analysis failed: {reason}")]
    Analysis { reason: String },

    #[error("frame encode failed: {reason}")]
    Encode {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("server at capacity: {active} of {limit} sessions in use")]
    Capacity { active: usize, limit: usize },

    #[error("transport failure: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("protocol violation: {details}")]
    Protocol { details: String },

    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },
}

impl RelayError {
    /// Whether this error terminates the session it occurred on.
    ///
    /// Per-frame errors are absorbed and reported as data; only transport
    /// and protocol failures tear a session down.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            RelayError::Decode { .. } => false,
            RelayError::OversizedFrame { .. } => false,
            RelayError::Analysis { .. } => false,
            RelayError::Encode { .. } => false,
            RelayError::Timeout { .. } => false,
            RelayError::Capacity { .. } => true,
            RelayError::Transport { .. } => true,
            RelayError::Protocol { .. } => true,
        }
    }

    /// Stable machine-readable code for the wire `error` message.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Decode { .. } => "decode_error",
            RelayError::OversizedFrame { .. } => "frame_too_large",
            RelayError::Analysis { .. } => "analysis_error",
            RelayError::Encode { .. } => "encode_error",
            RelayError::Capacity { .. } => "capacity",
            RelayError::Transport { .. } => "transport_error",
            RelayError::Protocol { .. } => "protocol_error",
            RelayError::Timeout { .. } => "timeout",
        }
    }

    /// Helper constructor for decode failures.
    pub fn decode(reason: impl Into<String>) -> Self {
        RelayError::Decode { reason: reason.into() }
    }

    /// Helper constructor for analyzer failures.
    pub fn analysis(reason: impl Into<String>) -> Self {
        RelayError::Analysis { reason: reason.into() }
    }

    /// Helper constructor for encode failures.
    pub fn encode(reason: impl Into<String>) -> Self {
        RelayError::Encode { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport failures without a source.
    pub fn transport(reason: impl Into<String>) -> Self {
        RelayError::Transport { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport failures with a source.
    pub fn transport_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        RelayError::Transport { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for protocol violations.
    pub fn protocol(details: impl Into<String>) -> Self {
        RelayError::Protocol { details: details.into() }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Transport { reason: err.to_string(), source: Some(Box::new(err)) }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Protocol { details: err.to_string() }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::Transport { reason: err.to_string(), source: Some(Box::new(err)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn messages_contain_their_context(
                reason in ".*",
                actual in 1usize..0x1000000,
                limit in 1usize..0x1000000
            ) {
                let decode = RelayError::decode(reason.clone());
                prop_assert!(decode.to_string().contains(&reason));

                let oversized = RelayError::OversizedFrame { actual, limit };
                let msg = oversized.to_string();
                prop_assert!(msg.contains(&actual.to_string()));
                prop_assert!(msg.contains(&limit.to_string()));
            }

            #[test]
            fn fatality_matches_taxonomy(reason in "\\PC*") {
                // Per-frame errors never tear a session down; transport and
                // protocol errors always do.
                prop_assert!(!RelayError::decode(reason.clone()).is_session_fatal());
                prop_assert!(!RelayError::analysis(reason.clone()).is_session_fatal());
                prop_assert!(!RelayError::encode(reason.clone()).is_session_fatal());
                prop_assert!(RelayError::transport(reason.clone()).is_session_fatal());
                prop_assert!(RelayError::protocol(reason).is_session_fatal());
            }

            #[test]
            fn codes_are_stable_and_nonempty(reason in ".*") {
                let all = [
                    RelayError::decode(reason.clone()),
                    RelayError::analysis(reason.clone()),
                    RelayError::encode(reason.clone()),
                    RelayError::transport(reason.clone()),
                    RelayError::protocol(reason),
                ];
                for err in &all {
                    prop_assert!(!err.code().is_empty());
                    prop_assert!(err.code().chars().all(|c| c.is_ascii_lowercase() || c == '_'));
                }
            }
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<RelayError>();

        let error = RelayError::transport("test");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn io_conversion_preserves_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer gone");
        let err: RelayError = io_err.into();
        assert!(matches!(err, RelayError::Transport { .. }));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn capacity_error_reports_limits() {
        let err = RelayError::Capacity { active: 64, limit: 64 };
        assert!(err.is_session_fatal());
        assert_eq!(err.code(), "capacity");
        assert!(err.to_string().contains("64"));
    }
}
