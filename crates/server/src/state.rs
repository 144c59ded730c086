//! Application State
//!
//! Shared state across all handlers.

use std::sync::Arc;

use voice_relay_backend::BackendConnector;
use voice_relay_config::Settings;
use voice_relay_core::{TenantConfigProvider, TranscriptSink};

use crate::manager::SessionManager;
use crate::session::SessionDeps;

/// Application state
#[derive(Clone)]
pub struct AppState {
    /// Process settings, fixed for the lifetime of the server
    pub config: Arc<Settings>,
    pub sessions: Arc<SessionManager>,
    pub tenants: Arc<dyn TenantConfigProvider>,
    pub connector: Arc<dyn BackendConnector>,
    pub transcripts: Arc<dyn TranscriptSink>,
}

impl AppState {
    pub fn new(
        config: Settings,
        tenants: Arc<dyn TenantConfigProvider>,
        connector: Arc<dyn BackendConnector>,
        transcripts: Arc<dyn TranscriptSink>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(
            config.server.max_sessions,
            transcripts.clone(),
        ));
        Self {
            config: Arc::new(config),
            sessions,
            tenants,
            connector,
            transcripts,
        }
    }

    /// Collaborators handed to each new session
    pub fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            settings: self.config.clone(),
            tenants: self.tenants.clone(),
            connector: self.connector.clone(),
            transcripts: self.transcripts.clone(),
        }
    }
}
