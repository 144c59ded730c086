//! Audio pipeline for the voice relay
//!
//! Per-session building blocks between the two legs:
//! - [`codec`]: PCM16 sample-rate conversion with continuous resampler state
//! - [`chunker`]: re-chunking into destination-sized frames
//! - [`turn_detection`]: turn-taking state machine and caller gate
//! - [`transcript`]: transcript fragment numbering and utterance merging

pub mod chunker;
pub mod codec;
pub mod transcript;
pub mod turn_detection;

pub use chunker::Chunker;
pub use codec::{AudioCodec, CodecDirection, LinearResampler};
pub use transcript::TranscriptAssembler;
pub use turn_detection::{GateDecision, TurnController, TurnState, TurnTakingConfig};

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid chunk size: {0} bytes")]
    InvalidChunkSize(usize),

    #[error("Upstream channel closed")]
    ChannelClosed,
}

impl From<PipelineError> for voice_relay_core::Error {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::UnsupportedFormat(m) => voice_relay_core::Error::UnsupportedFormat(m),
            PipelineError::InvalidChunkSize(n) => {
                voice_relay_core::Error::UnsupportedFormat(format!("chunk size {}", n))
            }
            PipelineError::ChannelClosed => voice_relay_core::Error::Closed,
        }
    }
}
