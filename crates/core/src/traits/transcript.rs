//! Transcript collaborator trait

use crate::session::SessionSummary;
use crate::transcript::TranscriptEvent;

/// Consumer of transcript events and session summaries
///
/// Calls are fire-and-forget. Implementations must not block the caller;
/// anything slow belongs behind a channel.
pub trait TranscriptSink: Send + Sync + 'static {
    /// Deliver one event, in session order
    fn publish(&self, event: TranscriptEvent);

    /// Deliver the final summary; called exactly once per session
    fn finalize(&self, summary: SessionSummary);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTranscriptSink;

impl TranscriptSink for NullTranscriptSink {
    fn publish(&self, _event: TranscriptEvent) {}

    fn finalize(&self, _summary: SessionSummary) {}
}
