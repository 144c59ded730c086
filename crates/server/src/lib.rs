//! Voice Relay Server
//!
//! Accepts telephony media WebSockets, runs one relay session per call
//! against the conversational backend, and exposes HTTP introspection.

mod farewell;
pub mod http;
pub mod liveness;
pub mod manager;
pub mod metrics;
mod relay;
pub mod session;
pub mod state;
pub mod transcript;
pub mod websocket;

pub use http::create_router;
pub use liveness::{KeepAlive, KeepAliveTimer, TelephonyWriter};
pub use manager::{SessionInfo, SessionManager};
pub use metrics::init_metrics;
pub use session::{CloseSignal, Session, SessionDeps};
pub use state::AppState;
pub use transcript::{ChannelTranscriptSink, TracingTranscriptSink, TranscriptRecord};
pub use websocket::{ExotelSink, ExotelSource};

use thiserror::Error;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid tenant id: {0}")]
    InvalidTenant(String),

    #[error("Missing tenant id")]
    MissingTenant,

    #[error("Session capacity reached ({0} active)")]
    AtCapacity(usize),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl ServerError {
    /// Label for rejection metrics
    pub fn reason(&self) -> &'static str {
        match self {
            ServerError::SessionNotFound(_) => "not_found",
            ServerError::InvalidTenant(_) => "invalid_tenant",
            ServerError::MissingTenant => "missing_tenant",
            ServerError::AtCapacity(_) => "capacity",
            ServerError::WebSocket(_) => "websocket",
        }
    }
}

impl From<ServerError> for axum::http::StatusCode {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::SessionNotFound(_) => axum::http::StatusCode::NOT_FOUND,
            ServerError::InvalidTenant(_) | ServerError::MissingTenant => {
                axum::http::StatusCode::BAD_REQUEST
            }
            ServerError::AtCapacity(_) => axum::http::StatusCode::SERVICE_UNAVAILABLE,
            ServerError::WebSocket(_) => axum::http::StatusCode::BAD_REQUEST,
        }
    }
}

impl axum::response::IntoResponse for ServerError {
    fn into_response(self) -> axum::response::Response {
        let message = self.to_string();
        let status: axum::http::StatusCode = self.into();
        (status, axum::Json(serde_json::json!({ "error": message }))).into_response()
    }
}
