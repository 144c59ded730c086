//! Upstream conversational backend
//!
//! The backend is treated as an opaque capability: it accepts caller audio
//! and answers with assistant audio plus transcription, organized in turns.
//!
//! - [`BackendConnector`] opens a configured connection for a tenant
//! - [`BackendSender`] / [`BackendReceiver`] are the two halves of that
//!   connection, so one task can send while another waits for events
//! - [`UpstreamLink`] owns the halves for a session and enforces the
//!   single-reconnect policy
//! - [`GeminiLiveConnector`] speaks the Gemini Live bidirectional protocol

pub mod gemini;
pub mod link;
pub mod mock;

pub use gemini::{GeminiLiveConfig, GeminiLiveConnector};
pub use link::UpstreamLink;
pub use mock::{MockBackend, ScriptedConnector, Upstream};

use async_trait::async_trait;
use thiserror::Error;

use voice_relay_core::{AudioFrame, Role, TenantConfig, TokenUsage};

/// Backend errors
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Setup handshake failed: {0}")]
    Handshake(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Protocol(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BackendError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => BackendError::Closed,
            other => BackendError::Connect(other.to_string()),
        }
    }
}

/// Structured event from the backend
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// Assistant audio in the backend's output format
    Audio(AudioFrame),
    /// Transcription fragment for either speaker
    Transcript { role: Role, text: String },
    /// The assistant finished its turn
    TurnBoundary,
    /// The backend stopped generating because the caller barged in
    Interrupted,
    /// The backend will close this connection soon
    GoAway { time_left: Option<String> },
    /// Non-fatal error reported in-band
    Error { message: String },
    /// Token accounting for the work done so far
    Usage(TokenUsage),
}

impl BackendEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendEvent::Audio(_) => "audio",
            BackendEvent::Transcript { .. } => "transcript",
            BackendEvent::TurnBoundary => "turn_boundary",
            BackendEvent::Interrupted => "interrupted",
            BackendEvent::GoAway { .. } => "go_away",
            BackendEvent::Error { .. } => "error",
            BackendEvent::Usage(_) => "usage",
        }
    }
}

/// Sending half of a backend connection
#[async_trait]
pub trait BackendSender: Send + 'static {
    /// Stream one caller frame
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<(), BackendError>;

    /// Send a complete text turn (greeting and exit message)
    async fn send_text_turn(&mut self, text: &str) -> Result<(), BackendError>;

    /// Signal end of audio and close the connection
    async fn close(&mut self) -> Result<(), BackendError>;
}

/// Receiving half of a backend connection
#[async_trait]
pub trait BackendReceiver: Send + 'static {
    /// Next event; `Ok(None)` once the backend closed the connection
    ///
    /// Must be cancel-safe so it can sit in a `select!`.
    async fn next_event(&mut self) -> Result<Option<BackendEvent>, BackendError>;
}

/// A configured backend connection
pub struct BackendConnection {
    pub sender: Box<dyn BackendSender>,
    pub receiver: Box<dyn BackendReceiver>,
}

/// Opens backend connections
///
/// `connect` performs the complete setup handshake with the tenant's
/// configuration; a returned connection is ready for audio.
#[async_trait]
pub trait BackendConnector: Send + Sync + 'static {
    async fn connect(&self, tenant: &TenantConfig) -> Result<BackendConnection, BackendError>;

    /// Short name for logs
    fn name(&self) -> &str;
}
