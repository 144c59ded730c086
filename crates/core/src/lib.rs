//! Core types and traits for the voice relay
//!
//! This crate provides foundational types used across all other crates:
//! - Audio frame and format types
//! - Telephony message model
//! - Transcript events and session summaries
//! - Tenant configuration value
//! - Collaborator traits (telephony transport, tenant lookup, transcript sink)
//! - Error types

pub mod audio;
pub mod error;
pub mod session;
pub mod telephony;
pub mod tenant;
pub mod traits;
pub mod transcript;

pub use audio::{
    AudioFormat, AudioFrame, Leg, BACKEND_INPUT_SAMPLE_RATE, BACKEND_OUTPUT_SAMPLE_RATE,
    TELEPHONY_SAMPLE_RATE,
};
pub use error::{Error, Result};
pub use session::{FrameCounts, SessionState, SessionSummary, TerminationCause, TokenUsage};
pub use telephony::{CallStart, InboundAudio, InboundMessage, OutboundMessage};
pub use tenant::{AudioFormatHints, ExitMessages, TenantConfig};
pub use traits::{
    NullTranscriptSink, TelephonySink, TelephonySource, TenantConfigProvider, TranscriptSink,
};
pub use transcript::{Role, TranscriptEvent};
