//! In-memory telephony leg and session wiring for scenario tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use voice_relay_backend::ScriptedConnector;
use voice_relay_config::{Settings, StaticTenantStore};
use voice_relay_core::{
    AudioFormat, CallStart, Error, InboundAudio, InboundMessage, OutboundMessage, Result,
    SessionState, SessionSummary, TelephonySink, TelephonySource, TenantConfig,
    TenantConfigProvider,
};
use voice_relay_server::{ChannelTranscriptSink, Session, SessionDeps, TranscriptRecord};

/// What the relay wrote to the telephony leg
#[derive(Debug)]
pub enum Written {
    Message(OutboundMessage),
    Closed,
}

pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

#[async_trait]
impl TelephonySource for ChannelSource {
    async fn recv(&mut self) -> Option<Result<InboundMessage>> {
        self.rx.recv().await.map(Ok)
    }
}

pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Written>,
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl TelephonySink for ChannelSink {
    async fn send(&mut self, message: OutboundMessage) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let _ = self.tx.send(Written::Message(message));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.tx.send(Written::Closed);
        Ok(())
    }
}

/// Test side of the telephony leg
pub struct Phone {
    tx: Option<mpsc::UnboundedSender<InboundMessage>>,
    rx: mpsc::UnboundedReceiver<Written>,
    fail: Arc<AtomicBool>,
}

impl Phone {
    pub fn send(&self, message: InboundMessage) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(message);
        }
    }

    pub fn start(&self) {
        self.send(InboundMessage::Start(CallStart {
            stream_id: Some("stream-1".to_string()),
            call_id: Some("call-1".to_string()),
            ..Default::default()
        }));
    }

    /// One 40ms frame of 8kHz caller audio
    pub fn audio(&self) {
        self.send(InboundMessage::Audio(InboundAudio {
            payload: vec![0x10; 640],
            format: AudioFormat::telephony(),
        }));
    }

    pub fn hang_up(&mut self) {
        self.tx = None;
    }

    /// Make every further write fail
    pub fn break_writes(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub async fn next(&mut self) -> Option<Written> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Written> {
        self.rx.try_recv().ok()
    }

    /// Next write that is not a keep-alive
    pub async fn next_non_keepalive(&mut self) -> Option<Written> {
        loop {
            match self.rx.recv().await? {
                Written::Message(OutboundMessage::KeepAlive) => continue,
                other => return Some(other),
            }
        }
    }

    /// Everything written so far, without waiting
    pub fn drain(&mut self) -> Vec<Written> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    /// Wait for the `connected` status sent after the handshake
    pub async fn expect_connected(&mut self) {
        match self.next_non_keepalive().await {
            Some(Written::Message(OutboundMessage::Status { state })) => {
                assert_eq!(state, "connected")
            }
            other => panic!("expected connected status, got {:?}", other),
        }
    }
}

pub fn phone() -> (Phone, ChannelSource, ChannelSink) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let fail = Arc::new(AtomicBool::new(false));
    (
        Phone {
            tx: Some(in_tx),
            rx: out_rx,
            fail: fail.clone(),
        },
        ChannelSource { rx: in_rx },
        ChannelSink { tx: out_tx, fail },
    )
}

/// Tenant lookup that waits until the test lets it through
pub struct GatedTenants {
    inner: Arc<StaticTenantStore>,
    gate: Semaphore,
}

impl GatedTenants {
    pub fn new(inner: Arc<StaticTenantStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gate: Semaphore::new(0),
        })
    }

    /// Let one pending lookup complete
    pub fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl TenantConfigProvider for GatedTenants {
    async fn load(&self, tenant_id: &str) -> Result<TenantConfig> {
        let _permit = self.gate.acquire().await.map_err(|_| Error::Closed)?;
        self.inner.load(tenant_id).await
    }
}

/// Process-side collaborators for one test
pub struct Harness {
    pub settings: Settings,
    pub connector: Arc<ScriptedConnector>,
    pub tenants: Arc<StaticTenantStore>,
    pub transcripts: mpsc::UnboundedReceiver<TranscriptRecord>,
    sink: ChannelTranscriptSink,
}

impl Harness {
    pub fn new() -> Self {
        let (sink, transcripts) = ChannelTranscriptSink::new();
        let tenants = StaticTenantStore::new()
            .with(TenantConfig::new("acme", "You are a helpful assistant."))
            .with(
                TenantConfig::new("greeter", "You are a helpful assistant.")
                    .with_greeting("Say hello to the caller."),
            );
        Self {
            settings: Settings::default(),
            connector: Arc::new(ScriptedConnector::new()),
            tenants: Arc::new(tenants),
            transcripts,
            sink,
        }
    }

    pub fn deps(&self) -> SessionDeps {
        SessionDeps {
            settings: Arc::new(self.settings.clone()),
            tenants: self.tenants.clone(),
            connector: self.connector.clone(),
            transcripts: Arc::new(self.sink.clone()),
        }
    }

    /// Start a session for `tenant` on its own task
    pub fn call(&self, tenant: &str) -> Call {
        self.call_with_tenants(tenant, self.tenants.clone())
    }

    /// Like [`Harness::call`] with a different tenant lookup
    pub fn call_with_tenants(&self, tenant: &str, tenants: Arc<dyn TenantConfigProvider>) -> Call {
        let (phone, source, sink) = phone();
        let mut deps = self.deps();
        deps.tenants = tenants;
        let session = Session::new(tenant, deps, Box::new(source), Box::new(sink));
        let state = session.state();
        let handle = tokio::spawn(session.run());
        Call {
            phone,
            state,
            handle,
        }
    }

    /// Summary delivered to the transcript collaborator, skipping utterances
    pub async fn summary(&mut self) -> SessionSummary {
        loop {
            match self.transcripts.recv().await {
                Some(TranscriptRecord::Summary(summary)) => return summary,
                Some(TranscriptRecord::Event(_)) => continue,
                None => panic!("transcript channel closed before the summary"),
            }
        }
    }
}

pub struct Call {
    pub phone: Phone,
    pub state: watch::Receiver<SessionState>,
    pub handle: JoinHandle<SessionSummary>,
}

impl Call {
    pub async fn wait_for_state(&mut self, target: SessionState) {
        let reached = tokio::time::timeout(
            Duration::from_secs(5),
            self.state.wait_for(|s| *s == target),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
        assert!(
            reached,
            "session never reached {:?} (now {:?})",
            target,
            *self.state.borrow()
        );
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }
}

/// Let spawned tasks run without moving the clock
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
