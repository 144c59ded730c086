//! Session lifecycle vocabulary shared by the server and collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of one relayed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Transport accepted, tenant resolved
    #[default]
    Init,
    /// Backend connection being established and configured
    Handshake,
    /// Tenant greeting is being produced
    Greeting,
    /// Bidirectional relay
    Active,
    /// A leg requested close; flushing in-flight audio
    Closing,
    /// Terminal, clean
    Closed,
    /// Terminal, failed
    Error,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::Handshake => "handshake",
            SessionState::Greeting => "greeting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum TerminationCause {
    /// Telephony leg closed or the caller hung up
    TelephonyDisconnect,
    /// Backend handshake or tenant resolution failed
    SetupFailed(String),
    /// Audio could not be converted
    UnsupportedFormat(String),
    /// Backend lost and the reconnect budget is spent
    BackendUnavailable(String),
    /// Keep-alive write failed on an idle telephony leg
    IdleTimeout,
    /// Call ran past the configured maximum duration
    MaxDurationExceeded,
    /// Caller sent no audio for too long
    CallerInactive,
    /// Process shutdown
    Shutdown,
    Internal(String),
}

impl TerminationCause {
    /// Stable code for logs, metric labels and terminal notices
    pub fn code(&self) -> &'static str {
        match self {
            TerminationCause::TelephonyDisconnect => "telephony_disconnect",
            TerminationCause::SetupFailed(_) => "setup_failed",
            TerminationCause::UnsupportedFormat(_) => "unsupported_format",
            TerminationCause::BackendUnavailable(_) => "backend_unavailable",
            TerminationCause::IdleTimeout => "idle_timeout",
            TerminationCause::MaxDurationExceeded => "max_duration_exceeded",
            TerminationCause::CallerInactive => "caller_inactive",
            TerminationCause::Shutdown => "shutdown",
            TerminationCause::Internal(_) => "internal",
        }
    }

    /// Terminal state this cause leads to
    pub fn final_state(&self) -> SessionState {
        match self {
            TerminationCause::SetupFailed(_)
            | TerminationCause::UnsupportedFormat(_)
            | TerminationCause::Internal(_) => SessionState::Error,
            _ => SessionState::Closed,
        }
    }

    /// Whether the caller should be told before the socket closes
    pub fn notifies_caller(&self) -> bool {
        !matches!(self, TerminationCause::TelephonyDisconnect)
    }

    /// Human readable description for terminal notices
    pub fn message(&self) -> String {
        match self {
            TerminationCause::TelephonyDisconnect => "telephony leg closed".to_string(),
            TerminationCause::SetupFailed(m) => format!("session setup failed: {}", m),
            TerminationCause::UnsupportedFormat(m) => format!("unsupported audio format: {}", m),
            TerminationCause::BackendUnavailable(m) => format!("backend unavailable: {}", m),
            TerminationCause::IdleTimeout => "telephony leg idle timeout".to_string(),
            TerminationCause::MaxDurationExceeded => "maximum call duration reached".to_string(),
            TerminationCause::CallerInactive => "caller inactive".to_string(),
            TerminationCause::Shutdown => "server shutting down".to_string(),
            TerminationCause::Internal(m) => format!("internal error: {}", m),
        }
    }
}

impl std::fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Per-direction frame counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameCounts {
    /// Caller frames delivered to the backend
    pub to_backend: u64,
    /// Assistant frames written to telephony
    pub to_telephony: u64,
}

/// Backend token accounting for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub response_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.response_tokens += other.response_tokens;
        self.total_tokens += other.total_tokens;
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.prompt_tokens == 0 && self.response_tokens == 0
    }
}

/// Final record of a session, emitted once at CLOSED or ERROR
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub tenant_id: String,
    pub call_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub final_state: SessionState,
    pub cause: TerminationCause,
    pub frames: FrameCounts,
    pub keepalives_sent: u64,
    pub backend_reconnects: u32,
    pub transcript_events: u64,
    #[serde(default)]
    pub usage: TokenUsage,
    /// The session was aborted at shutdown instead of finishing on its own
    #[serde(default)]
    pub forced: bool,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
