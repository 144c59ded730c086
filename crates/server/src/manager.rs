//! Session registry
//!
//! Every live call has one entry keyed by session id. The entry holds what
//! introspection and shutdown need; the session itself runs in its own task.
//! A session aborted at shutdown never reaches its own cleanup, so the
//! manager reports its summary instead.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};

use voice_relay_core::{
    FrameCounts, SessionState, SessionSummary, TerminationCause, TokenUsage, TranscriptSink,
};

use crate::liveness::TelephonyWriter;
use crate::session::{CloseSignal, Session};
use crate::ServerError;

/// Snapshot of one registered session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub tenant_id: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}

struct Entry {
    tenant_id: String,
    started_at: DateTime<Utc>,
    state: watch::Receiver<SessionState>,
    close: CloseSignal,
    writer: Arc<TelephonyWriter>,
    task: Option<AbortHandle>,
}

impl Entry {
    /// Summary for a session that was aborted before it could emit one
    fn forced_summary(&self, session_id: &str) -> SessionSummary {
        let duration = (Utc::now() - self.started_at).to_std().unwrap_or_default();
        SessionSummary {
            session_id: session_id.to_string(),
            tenant_id: self.tenant_id.clone(),
            call_id: None,
            started_at: self.started_at,
            duration,
            final_state: SessionState::Closed,
            cause: TerminationCause::Shutdown,
            frames: FrameCounts {
                to_backend: 0,
                to_telephony: self.writer.audio_frames_sent(),
            },
            keepalives_sent: self.writer.keepalives_sent(),
            backend_reconnects: 0,
            transcript_events: 0,
            usage: TokenUsage::default(),
            forced: true,
        }
    }

    fn info(&self, session_id: &str) -> SessionInfo {
        SessionInfo {
            session_id: session_id.to_string(),
            tenant_id: self.tenant_id.clone(),
            state: *self.state.borrow(),
            started_at: self.started_at,
        }
    }
}

/// Session manager
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Entry>>,
    max_sessions: usize,
    drained: Notify,
    transcripts: Arc<dyn TranscriptSink>,
}

impl SessionManager {
    pub fn new(max_sessions: usize, transcripts: Arc<dyn TranscriptSink>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            drained: Notify::new(),
            transcripts,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Whether another call would be admitted right now
    pub fn has_capacity(&self) -> bool {
        self.sessions.read().len() < self.max_sessions
    }

    /// Add a session to the registry
    pub fn register(&self, session: &Session) -> Result<(), ServerError> {
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.max_sessions {
            return Err(ServerError::AtCapacity(sessions.len()));
        }
        sessions.insert(
            session.id().to_string(),
            Entry {
                tenant_id: session.tenant_id().to_string(),
                started_at: session.started_at(),
                state: session.state(),
                close: session.close_signal(),
                writer: session.writer(),
                task: None,
            },
        );
        crate::metrics::set_active_sessions(sessions.len());
        Ok(())
    }

    fn attach_task(&self, id: &str, task: AbortHandle) {
        if let Some(entry) = self.sessions.write().get_mut(id) {
            entry.task = Some(task);
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.write();
            let removed = sessions.remove(id).is_some();
            crate::metrics::set_active_sessions(sessions.len());
            removed
        };
        if removed {
            self.drained.notify_waiters();
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.read().get(id).map(|entry| entry.info(id))
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .iter()
            .map(|(id, entry)| entry.info(id))
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Register a session and run it on its own task
    ///
    /// The entry is removed when the session finishes, whatever the cause.
    pub fn spawn(self: &Arc<Self>, session: Session) -> Result<JoinHandle<SessionSummary>, ServerError> {
        self.register(&session)?;
        let id = session.id().to_string();

        let manager = Arc::clone(self);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let summary = session.run().await;
            manager.remove(&task_id);
            summary
        });
        self.attach_task(&id, handle.abort_handle());
        Ok(handle)
    }

    /// Close every session and wait up to `timeout` for them to finish
    ///
    /// Sessions still running afterwards are aborted and dropped from the
    /// registry, and their summary is emitted on their behalf. Returns how
    /// many had to be forced.
    pub async fn shutdown_all(&self, timeout: Duration) -> usize {
        let closing: Vec<CloseSignal> = self
            .sessions
            .read()
            .values()
            .map(|entry| entry.close.clone())
            .collect();
        if closing.is_empty() {
            return 0;
        }

        tracing::info!(sessions = closing.len(), "Closing active sessions");
        for close in &closing {
            close.close(TerminationCause::Shutdown);
        }

        let drained = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.drained.notified();
                if self.count() == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await;
        if drained.is_ok() {
            return 0;
        }

        let forced: Vec<(String, Entry)> = self.sessions.write().drain().collect();
        crate::metrics::set_active_sessions(0);
        for (id, entry) in &forced {
            tracing::warn!(session_id = %id, "Forcing session closure");
            if let Some(task) = &entry.task {
                task.abort();
            }
            crate::metrics::record_termination(&TerminationCause::Shutdown);
            self.transcripts.finalize(entry.forced_summary(id));
        }
        forced.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use voice_relay_backend::ScriptedConnector;
    use voice_relay_config::{Settings, StaticTenantStore};
    use voice_relay_core::{
        InboundMessage, NullTranscriptSink, OutboundMessage, Result, TelephonySink,
        TelephonySource,
    };

    use crate::session::SessionDeps;
    use crate::transcript::{ChannelTranscriptSink, TranscriptRecord};

    /// Telephony leg that never says anything
    struct Silent;

    #[async_trait]
    impl TelephonySource for Silent {
        async fn recv(&mut self) -> Option<Result<InboundMessage>> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl TelephonySink for Silent {
        async fn send(&mut self, _message: OutboundMessage) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Telephony sink that never completes a write
    struct Stuck;

    #[async_trait]
    impl TelephonySink for Stuck {
        async fn send(&mut self, _message: OutboundMessage) -> Result<()> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<()> {
            std::future::pending().await
        }
    }

    fn manager(max_sessions: usize) -> SessionManager {
        SessionManager::new(max_sessions, Arc::new(NullTranscriptSink))
    }

    fn deps() -> SessionDeps {
        let mut settings = Settings::default();
        settings.session.start_timeout_ms = 60_000;
        SessionDeps {
            settings: Arc::new(settings),
            tenants: Arc::new(StaticTenantStore::new()),
            connector: Arc::new(ScriptedConnector::new()),
            transcripts: Arc::new(NullTranscriptSink),
        }
    }

    fn session(tenant: &str) -> Session {
        Session::new(tenant, deps(), Box::new(Silent), Box::new(Silent))
    }

    #[test]
    fn test_register_and_lookup() {
        let manager = manager(10);
        let session = session("acme");
        let id = session.id().to_string();

        manager.register(&session).unwrap();
        let info = manager.get(&id).unwrap();
        assert_eq!(info.tenant_id, "acme");
        assert_eq!(info.state, SessionState::Init);
        assert_eq!(manager.list().len(), 1);

        assert!(manager.remove(&id));
        assert!(manager.get(&id).is_none());
        assert!(!manager.remove(&id));
    }

    #[test]
    fn test_capacity_enforced() {
        let manager = manager(1);
        manager.register(&session("a")).unwrap();
        assert!(!manager.has_capacity());

        let err = manager.register(&session("b")).unwrap_err();
        assert!(matches!(err, ServerError::AtCapacity(1)));
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_waiting_sessions() {
        let manager = Arc::new(manager(10));
        let handle = manager.spawn(session("acme")).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(manager.count(), 1);

        let forced = manager.shutdown_all(Duration::from_secs(5)).await;
        assert_eq!(forced, 0);
        assert_eq!(manager.count(), 0);

        let summary = handle.await.unwrap();
        assert_eq!(summary.cause, TerminationCause::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_with_no_sessions() {
        let manager = manager(10);
        assert_eq!(manager.shutdown_all(Duration::from_millis(10)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_session_still_reports_summary() {
        let (sink, mut records) = ChannelTranscriptSink::new();
        let manager = Arc::new(SessionManager::new(10, Arc::new(sink.clone())));
        let mut deps = deps();
        deps.transcripts = Arc::new(sink);
        let session = Session::new("acme", deps, Box::new(Silent), Box::new(Stuck));
        let id = session.id().to_string();

        let handle = manager.spawn(session).unwrap();
        tokio::task::yield_now().await;

        // The terminal notice never gets written, so the session cannot finish
        let forced = manager.shutdown_all(Duration::from_millis(100)).await;
        assert_eq!(forced, 1);
        assert_eq!(manager.count(), 0);
        assert!(handle.await.unwrap_err().is_cancelled());

        match records.try_recv() {
            Ok(TranscriptRecord::Summary(summary)) => {
                assert_eq!(summary.session_id, id);
                assert_eq!(summary.cause, TerminationCause::Shutdown);
                assert_eq!(summary.final_state, SessionState::Closed);
                assert!(summary.forced);
            }
            other => panic!("expected a summary, got {:?}", other),
        }
        assert!(records.try_recv().is_err());
    }
}
