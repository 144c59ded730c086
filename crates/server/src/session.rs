//! Per-call relay session
//!
//! A session walks `INIT → HANDSHAKE → GREETING → ACTIVE → CLOSING → CLOSED`,
//! with `ERROR` as the terminal state for setup and format failures. The
//! tenant is resolved while still in `INIT`, so an unknown or inactive
//! tenant never reaches `HANDSHAKE`. All fatal paths end in
//! [`Session::run`]'s single cleanup, so both legs are released exactly
//! once and exactly one summary is emitted.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::Instrument;

use voice_relay_backend::{BackendConnector, UpstreamLink};
use voice_relay_config::Settings;
use voice_relay_core::{
    AudioFormat, CallStart, Error, FrameCounts, InboundMessage, Leg, SessionState,
    SessionSummary, TelephonySink, TelephonySource, TenantConfig, TenantConfigProvider,
    TerminationCause, TokenUsage, TranscriptSink,
};
use voice_relay_pipeline::{AudioCodec, Chunker, TranscriptAssembler, TurnController};

use crate::farewell::{ExitReason, ExitScript, Farewell};
use crate::liveness::{KeepAliveTimer, TelephonyWriter};
use crate::relay::{AssistantFlow, CallerFlow};

/// Close request shared by the session, its flows and the manager
///
/// The first recorded cause wins; later requests only observe.
#[derive(Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
    cause: Arc<Mutex<Option<TerminationCause>>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            cause: Arc::new(Mutex::new(None)),
        }
    }

    /// Request close; returns false if a cause was already recorded
    pub fn close(&self, cause: TerminationCause) -> bool {
        {
            let mut slot = self.cause.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(cause);
        }
        self.tx.send_replace(true);
        true
    }

    pub fn is_closing(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn cause(&self) -> Option<TerminationCause> {
        self.cause.lock().clone()
    }

    /// Resolves once close was requested; cancel-safe
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closing| *closing).await;
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Published session state
#[derive(Clone)]
pub(crate) struct StateHandle {
    tx: Arc<watch::Sender<SessionState>>,
}

impl StateHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Init);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub(crate) fn set(&self, next: SessionState) {
        let previous = self.tx.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Session state changed");
        }
    }

    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}

/// Last time the caller showed signs of life
#[derive(Clone)]
pub(crate) struct CallerActivity(Arc<Mutex<Instant>>);

impl CallerActivity {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub(crate) fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.0.lock()
    }
}

/// Process-wide collaborators a session needs
#[derive(Clone)]
pub struct SessionDeps {
    pub settings: Arc<Settings>,
    pub tenants: Arc<dyn TenantConfigProvider>,
    pub connector: Arc<dyn BackendConnector>,
    pub transcripts: Arc<dyn TranscriptSink>,
}

#[derive(Default)]
struct RunStats {
    frames_to_backend: u64,
    backend_reconnects: u32,
    transcript_events: u64,
    usage: TokenUsage,
}

/// One relayed call
pub struct Session {
    id: String,
    tenant_id: String,
    deps: SessionDeps,
    source: Box<dyn TelephonySource>,
    writer: Arc<TelephonyWriter>,
    state: StateHandle,
    close: CloseSignal,
    started_at: DateTime<Utc>,
    started: Instant,
    call: Option<CallStart>,
}

impl Session {
    pub fn new(
        tenant_id: impl Into<String>,
        deps: SessionDeps,
        source: Box<dyn TelephonySource>,
        sink: Box<dyn TelephonySink>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            deps,
            source,
            writer: Arc::new(TelephonyWriter::new(sink)),
            state: StateHandle::new(),
            close: CloseSignal::new(),
            started_at: Utc::now(),
            started: Instant::now(),
            call: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Live view of the lifecycle state
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.close.clone()
    }

    pub(crate) fn writer(&self) -> Arc<TelephonyWriter> {
        self.writer.clone()
    }

    /// Drive the call to completion and return its summary
    pub async fn run(mut self) -> SessionSummary {
        let span = tracing::info_span!(
            "session",
            session_id = %self.id,
            tenant_id = %self.tenant_id
        );
        async move {
            crate::metrics::record_session_started();
            tracing::info!("Session accepted");

            let mut stats = RunStats::default();
            let cause = self.drive(&mut stats).await;
            self.finish(cause, stats).await
        }
        .instrument(span)
        .await
    }

    fn cause_or(&self, fallback: TerminationCause) -> TerminationCause {
        self.close.cause().unwrap_or(fallback)
    }

    async fn drive(&mut self, stats: &mut RunStats) -> TerminationCause {
        if let Err(cause) = self.await_start().await {
            return cause;
        }

        let tenant = tokio::select! {
            _ = self.close.closed() => return self.cause_or(TerminationCause::Shutdown),
            loaded = self.deps.tenants.load(&self.tenant_id) => match loaded {
                Ok(tenant) => Arc::new(tenant),
                Err(e) => {
                    tracing::warn!(error = %e, "Tenant rejected");
                    return TerminationCause::SetupFailed(e.to_string());
                }
            },
        };

        // HANDSHAKE
        self.state.set(SessionState::Handshake);
        let mut link = UpstreamLink::new(self.deps.connector.clone(), tenant.clone());
        let opened = tokio::select! {
            _ = self.close.closed() => return self.cause_or(TerminationCause::Shutdown),
            opened = link.open() => opened,
        };
        if let Err(e) = opened {
            tracing::warn!(error = %e, "Backend handshake failed");
            return TerminationCause::SetupFailed(e.to_string());
        }
        if let Err(e) = self.writer.send_status("connected").await {
            tracing::debug!(error = %e, "Failed to send connected status");
        }

        let cause = self.relay(&tenant, &mut link, stats).await;
        stats.backend_reconnects = link.reconnects();
        link.close().await;
        cause
    }

    /// INIT: wait for the provider's start message
    ///
    /// Proceeds without stream metadata when the start message does not
    /// arrive in time.
    async fn await_start(&mut self) -> Result<(), TerminationCause> {
        let deadline = Instant::now() + self.deps.settings.session.start_timeout();

        loop {
            tokio::select! {
                _ = self.close.closed() => {
                    return Err(self.cause_or(TerminationCause::Shutdown));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("No start message received, continuing without stream id");
                    return Ok(());
                }
                message = self.source.recv() => match message {
                    None => return Err(TerminationCause::TelephonyDisconnect),
                    Some(Err(Error::Malformed(m))) => {
                        tracing::warn!(error = %m, "Ignoring malformed telephony message");
                    }
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Telephony transport failed before start");
                        return Err(TerminationCause::TelephonyDisconnect);
                    }
                    Some(Ok(InboundMessage::Start(call))) => {
                        tracing::info!(
                            stream_id = call.stream_id.as_deref().unwrap_or("-"),
                            call_id = call.call_id.as_deref().unwrap_or("-"),
                            "Call started"
                        );
                        self.writer.bind_call(&call).await;
                        self.call = Some(call);
                        return Ok(());
                    }
                    Some(Ok(InboundMessage::Stop { reason })) => {
                        tracing::info!(reason = reason.as_deref().unwrap_or("-"), "Call stopped before start");
                        return Err(TerminationCause::TelephonyDisconnect);
                    }
                    Some(Ok(other)) => {
                        tracing::debug!(kind = other.kind(), "Discarding message before start");
                    }
                },
            }
        }
    }

    /// GREETING and ACTIVE, until a close is requested
    async fn relay(
        &mut self,
        tenant: &Arc<TenantConfig>,
        link: &mut UpstreamLink,
        stats: &mut RunStats,
    ) -> TerminationCause {
        let settings = self.deps.settings.clone();

        let telephony_rate = tenant
            .audio
            .telephony_sample_rate
            .or_else(|| {
                self.call
                    .as_ref()
                    .and_then(|c| c.media_format)
                    .map(|f| f.sample_rate)
            })
            .unwrap_or(settings.audio.telephony_sample_rate);
        let backend_rate = tenant
            .audio
            .backend_input_sample_rate
            .unwrap_or(settings.audio.backend_input_sample_rate);

        let chunkers = Chunker::new(
            settings.audio.backend_chunk_bytes,
            AudioFormat::pcm16_mono(backend_rate),
            Leg::Telephony,
        )
        .and_then(|caller| {
            Chunker::new(
                settings.audio.telephony_chunk_bytes,
                AudioFormat::pcm16_mono(telephony_rate),
                Leg::Backend,
            )
            .map(|assistant| (caller, assistant))
        });
        let (caller_chunker, assistant_chunker) = match chunkers {
            Ok(pair) => pair,
            Err(e) => return TerminationCause::Internal(e.to_string()),
        };

        let (to_backend, to_telephony) = AudioCodec::new(telephony_rate, backend_rate).split();
        let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
        let turn = Arc::new(TurnController::new((&settings.turn).into(), upstream_tx));
        let activity = CallerActivity::new();
        let (farewell_tx, farewell_rx) = mpsc::channel(1);

        if tenant.has_greeting() {
            self.state.set(SessionState::Greeting);
            turn.begin_ai_turn();
            let sent = tokio::select! {
                _ = self.close.closed() => return self.cause_or(TerminationCause::Shutdown),
                sent = link.send_text_turn(&tenant.greeting_text) => sent,
            };
            if let Err(e) = sent {
                return TerminationCause::BackendUnavailable(e.to_string());
            }
            tracing::debug!("Greeting requested");
        } else {
            self.state.set(SessionState::Active);
        }

        let mut caller = CallerFlow {
            source: &mut *self.source,
            encoder: to_backend,
            chunker: caller_chunker,
            floor: turn.subscribe(),
            turn: turn.clone(),
            activity: activity.clone(),
            last_audio: Instant::now(),
        };
        let mut assistant = AssistantFlow {
            link,
            upstream: upstream_rx,
            decoder: to_telephony,
            chunker: assistant_chunker,
            turn: turn.clone(),
            writer: self.writer.clone(),
            assembler: TranscriptAssembler::new(self.id.clone()),
            transcripts: self.deps.transcripts.clone(),
            activity: activity.clone(),
            state: self.state.clone(),
            farewells: farewell_rx,
            exit: ExitScript::new(
                tenant.exit_messages.clone(),
                settings.session.max_call_duration(),
                settings.session.caller_inactivity(),
            ),
            frames_to_backend: 0,
            usage: TokenUsage::default(),
            farewell: None,
        };
        let keepalive = KeepAliveTimer::from(&settings.liveness);
        let close = &self.close;
        let writer = &self.writer;
        let state = &self.state;

        {
            let flows = async {
                tokio::join!(
                    async {
                        if let Some(cause) = caller.run(close).await {
                            close.close(cause);
                        }
                    },
                    async {
                        if let Some(cause) = assistant.run(close).await {
                            close.close(cause);
                        }
                    },
                    async {
                        if let Some(cause) = keepalive.run(writer, close).await {
                            close.close(cause);
                        }
                    },
                    async {
                        let limits = (
                            settings.session.max_call_duration(),
                            settings.session.caller_inactivity(),
                        );
                        if let Some(cause) = watchdog(close, &activity, limits).await {
                            if let Some(reason) = ExitReason::for_cause(&cause) {
                                let grace = settings.session.exit_grace();
                                say_goodbye(&farewell_tx, reason, grace, close).await;
                            }
                            close.close(cause);
                        }
                    },
                )
            };
            tokio::pin!(flows);

            tokio::select! {
                _ = &mut flows => {}
                _ = close.closed() => {
                    state.set(SessionState::Closing);
                    let grace = settings.session.close_grace();
                    if tokio::time::timeout(grace, &mut flows).await.is_err() {
                        tracing::warn!(
                            grace_ms = grace.as_millis() as u64,
                            "Relay flows did not stop in time, forcing close"
                        );
                    }
                }
            }
        }

        // Caller audio the relay already accepted still goes upstream
        caller.flush_tail();
        match tokio::time::timeout(settings.session.close_grace(), assistant.forward_pending()).await {
            Ok(0) => {}
            Ok(forwarded) => tracing::debug!(frames = forwarded, "Forwarded caller audio queued at close"),
            Err(_) => tracing::debug!("Forwarding queued caller audio timed out"),
        }

        stats.frames_to_backend = assistant.frames_to_backend;
        stats.transcript_events = assistant.assembler.emitted();
        stats.usage = assistant.usage;
        close
            .cause()
            .unwrap_or_else(|| TerminationCause::Internal("relay stopped without a cause".to_string()))
    }

    /// CLOSING → CLOSED / ERROR
    async fn finish(self, cause: TerminationCause, stats: RunStats) -> SessionSummary {
        let grace = self.deps.settings.session.close_grace();
        self.close.close(cause.clone());

        if !matches!(cause, TerminationCause::SetupFailed(_)) {
            self.state.set(SessionState::Closing);
        }

        if cause.notifies_caller() {
            match tokio::time::timeout(grace, self.writer.send_terminal(&cause)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "Terminal notice not delivered"),
                Err(_) => tracing::debug!("Terminal notice timed out"),
            }
        }
        if let Ok(Err(e)) = tokio::time::timeout(grace, self.writer.close()).await {
            tracing::debug!(error = %e, "Telephony close failed");
        }

        let final_state = cause.final_state();
        self.state.set(final_state);
        crate::metrics::record_termination(&cause);

        let frames = FrameCounts {
            to_backend: stats.frames_to_backend,
            to_telephony: self.writer.audio_frames_sent(),
        };
        crate::metrics::record_frames(Leg::Backend, frames.to_backend);
        crate::metrics::record_frames(Leg::Telephony, frames.to_telephony);

        let summary = SessionSummary {
            session_id: self.id.clone(),
            tenant_id: self.tenant_id.clone(),
            call_id: self.call.as_ref().and_then(|c| c.call_id.clone()),
            started_at: self.started_at,
            duration: self.started.elapsed(),
            final_state,
            cause: cause.clone(),
            frames,
            keepalives_sent: self.writer.keepalives_sent(),
            backend_reconnects: stats.backend_reconnects,
            transcript_events: stats.transcript_events,
            usage: stats.usage,
            forced: false,
        };

        if final_state == SessionState::Error {
            tracing::warn!(cause = cause.code(), detail = %cause.message(), "Session failed");
        } else {
            tracing::info!(
                cause = cause.code(),
                duration_ms = summary.duration.as_millis() as u64,
                "Session closed"
            );
        }

        self.deps.transcripts.finalize(summary.clone());
        summary
    }
}

/// Ask the assistant to speak an exit message and wait for it, up to `grace`
///
/// Returns early if the session closes for another reason meanwhile.
async fn say_goodbye(
    farewells: &mpsc::Sender<Farewell>,
    reason: ExitReason,
    grace: Duration,
    close: &CloseSignal,
) {
    if grace.is_zero() {
        return;
    }
    let (done_tx, done_rx) = oneshot::channel();
    let request = Farewell {
        reason,
        done: done_tx,
    };
    if farewells.send(request).await.is_err() {
        return;
    }
    tokio::select! {
        _ = close.closed() => {}
        played = tokio::time::timeout(grace, done_rx) => match played {
            Ok(Ok(())) => tracing::debug!("Exit message played"),
            Ok(Err(_)) => tracing::debug!("Exit message dropped"),
            Err(_) => tracing::info!(
                grace_ms = grace.as_millis() as u64,
                "Exit message not finished in time, hanging up"
            ),
        },
    }
}

/// Call-level limits: maximum duration and caller inactivity
async fn watchdog(
    close: &CloseSignal,
    activity: &CallerActivity,
    (max_duration, inactivity): (Duration, Duration),
) -> Option<TerminationCause> {
    let hard_stop = Instant::now() + max_duration;

    loop {
        let inactive_at = activity.last() + inactivity;
        tokio::select! {
            _ = close.closed() => return None,
            _ = tokio::time::sleep_until(hard_stop) => {
                tracing::info!(limit_secs = max_duration.as_secs(), "Maximum call duration reached");
                return Some(TerminationCause::MaxDurationExceeded);
            }
            _ = tokio::time::sleep_until(inactive_at) => {
                if activity.last() + inactivity <= Instant::now() {
                    tracing::info!(limit_secs = inactivity.as_secs(), "Caller inactive");
                    return Some(TerminationCause::CallerInactive);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_signal_first_cause_wins() {
        let close = CloseSignal::new();
        assert!(!close.is_closing());

        assert!(close.close(TerminationCause::IdleTimeout));
        assert!(!close.close(TerminationCause::Shutdown));

        close.closed().await;
        assert!(close.is_closing());
        assert_eq!(close.cause(), Some(TerminationCause::IdleTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_caller_inactive() {
        let close = CloseSignal::new();
        let activity = CallerActivity::new();
        let limits = (Duration::from_secs(600), Duration::from_secs(120));

        let cause = watchdog(&close, &activity, limits).await;
        assert_eq!(cause, Some(TerminationCause::CallerInactive));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_activity_postpones_inactivity() {
        let close = CloseSignal::new();
        let activity = CallerActivity::new();
        let limits = (Duration::from_secs(200), Duration::from_secs(120));

        let toucher = {
            let activity = activity.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(100)).await;
                activity.touch();
                std::future::pending::<()>().await;
            }
        };

        let cause = tokio::select! {
            cause = watchdog(&close, &activity, limits) => cause,
            _ = toucher => None,
        };
        assert_eq!(cause, Some(TerminationCause::MaxDurationExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_goodbye_waits_for_played_turn() {
        let close = CloseSignal::new();
        let (tx, mut rx) = mpsc::channel(1);
        let assistant = async {
            let request: Farewell = rx.recv().await.unwrap();
            assert_eq!(request.reason, ExitReason::Inactivity);
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = request.done.send(());
        };

        let started = Instant::now();
        tokio::join!(
            say_goodbye(&tx, ExitReason::Inactivity, Duration::from_secs(3), &close),
            assistant
        );
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_goodbye_is_bounded_by_grace() {
        let close = CloseSignal::new();
        let (tx, mut rx) = mpsc::channel(1);

        let started = Instant::now();
        say_goodbye(&tx, ExitReason::MaxDuration, Duration::from_secs(3), &close).await;
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        // The request was delivered, just never answered
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_goodbye_disabled_with_zero_grace() {
        let close = CloseSignal::new();
        let (tx, mut rx) = mpsc::channel(1);
        say_goodbye(&tx, ExitReason::MaxDuration, Duration::ZERO, &close).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_stops_on_close() {
        let close = CloseSignal::new();
        close.close(TerminationCause::Shutdown);
        let activity = CallerActivity::new();
        let limits = (Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(watchdog(&close, &activity, limits).await, None);
    }
}
