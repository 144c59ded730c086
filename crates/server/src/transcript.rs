//! Transcript sinks

use tokio::sync::mpsc;

use voice_relay_core::{SessionSummary, TranscriptEvent, TranscriptSink};

/// Writes finished utterances and summaries as structured log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTranscriptSink;

impl TranscriptSink for TracingTranscriptSink {
    fn publish(&self, event: TranscriptEvent) {
        if event.terminal {
            tracing::info!(
                target: "voice_relay::transcript",
                session_id = %event.session_id,
                role = %event.role,
                sequence = event.sequence,
                text = %event.text,
                "Utterance"
            );
        } else {
            tracing::trace!(
                target: "voice_relay::transcript",
                session_id = %event.session_id,
                role = %event.role,
                sequence = event.sequence,
                "Transcript fragment"
            );
        }
    }

    fn finalize(&self, summary: SessionSummary) {
        tracing::info!(
            target: "voice_relay::transcript",
            session_id = %summary.session_id,
            tenant_id = %summary.tenant_id,
            state = %summary.final_state,
            cause = summary.cause.code(),
            duration_ms = summary.duration.as_millis() as u64,
            frames_to_backend = summary.frames.to_backend,
            frames_to_telephony = summary.frames.to_telephony,
            keepalives = summary.keepalives_sent,
            reconnects = summary.backend_reconnects,
            "Session summary"
        );
    }
}

/// Item delivered by [`ChannelTranscriptSink`]
#[derive(Debug, Clone)]
pub enum TranscriptRecord {
    Event(TranscriptEvent),
    Summary(SessionSummary),
}

/// Forwards everything to an unbounded channel for an external consumer
#[derive(Debug, Clone)]
pub struct ChannelTranscriptSink {
    tx: mpsc::UnboundedSender<TranscriptRecord>,
}

impl ChannelTranscriptSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TranscriptRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TranscriptSink for ChannelTranscriptSink {
    fn publish(&self, event: TranscriptEvent) {
        let _ = self.tx.send(TranscriptRecord::Event(event));
    }

    fn finalize(&self, summary: SessionSummary) {
        let _ = self.tx.send(TranscriptRecord::Summary(summary));
    }
}
