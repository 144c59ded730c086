//! Telephony leg message model
//!
//! Provider wire formats are decoded once at the transport boundary into
//! [`InboundMessage`]; everything past that point matches on variants.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::audio::{AudioFormat, AudioFrame};

/// Call metadata announced by the provider when the media stream starts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStart {
    pub stream_id: Option<String>,
    pub call_id: Option<String>,
    pub account_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
    /// Media format the provider declared, if any
    pub media_format: Option<AudioFormat>,
}

/// Raw caller audio as received, before any conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAudio {
    pub payload: Vec<u8>,
    pub format: AudioFormat,
}

/// Decoded inbound telephony message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Provider handshake acknowledgement
    Connected,
    /// Media stream started
    Start(CallStart),
    /// Caller audio
    Audio(InboundAudio),
    /// Provider-side voice activity signal
    SpeechStarted,
    /// Playback mark echoed back by the provider
    Mark { name: String },
    /// Keypad digit
    Dtmf { digit: String },
    /// Provider asked to clear queued playback
    Clear,
    /// Media stream stopped (caller hung up)
    Stop { reason: Option<String> },
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Connected => "connected",
            InboundMessage::Start(_) => "start",
            InboundMessage::Audio(_) => "audio",
            InboundMessage::SpeechStarted => "speech_started",
            InboundMessage::Mark { .. } => "mark",
            InboundMessage::Dtmf { .. } => "dtmf",
            InboundMessage::Clear => "clear",
            InboundMessage::Stop { .. } => "stop",
        }
    }
}

/// Message written to the telephony leg
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Assistant audio in telephony format
    Audio(AudioFrame),
    /// Idle keep-alive
    KeepAlive,
    /// Informational status (e.g. backend connected)
    Status { state: String },
    /// Final notice before the socket closes
    Terminal { code: String, message: String },
}
