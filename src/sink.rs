//! Fire-and-forget analytics sink.
//!
//! On session completion the pipeline hands an aggregate summary to a
//! [`SessionSink`]. Persistence is a collaborator, not a dependency:
//! recording happens off the session task and a failing sink never
//! affects streaming.

use tracing::debug;

use crate::protocol::SessionSummaryPayload;
use crate::session::SessionId;

/// Receiver for completed-session summaries.
pub trait SessionSink: Send + Sync {
    fn record(&self, session: SessionId, summary: &SessionSummaryPayload);
}

/// Default sink: logs the summary and discards it.
#[derive(Debug, Default)]
pub struct LogSink;

impl SessionSink for LogSink {
    fn record(&self, session: SessionId, summary: &SessionSummaryPayload) {
        debug!(
            %session,
            score = summary.score,
            elapsed_ms = summary.elapsed_ms,
            "session summary: {}",
            summary.message
        );
    }
}
