//! Scripted in-process backend
//!
//! Used by tests and local runs without credentials. Each `connect` takes
//! the next scripted outcome: either a connection driven by a
//! [`MockBackend`] handle, or a refusal.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use voice_relay_core::{AudioFormat, AudioFrame, Leg, Role, TenantConfig, TokenUsage};

use crate::{
    BackendConnection, BackendConnector, BackendError, BackendEvent, BackendReceiver,
    BackendSender,
};

/// What the relay sent upstream
#[derive(Debug, Clone)]
pub enum Upstream {
    Audio(AudioFrame),
    Text(String),
    Closed,
}

enum Plan {
    Accept {
        events: mpsc::UnboundedReceiver<BackendEvent>,
        sent: mpsc::UnboundedSender<Upstream>,
        dropped: Arc<AtomicBool>,
    },
    Refuse(String),
}

/// Connector that replays a script of connection outcomes
#[derive(Default)]
pub struct ScriptedConnector {
    plans: Mutex<VecDeque<Plan>>,
    connects: AtomicU32,
    tenants: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a successful connection and return its driver
    pub fn accept_next(&self) -> MockBackend {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let dropped = Arc::new(AtomicBool::new(false));

        self.plans.lock().push_back(Plan::Accept {
            events: events_rx,
            sent: sent_tx,
            dropped: dropped.clone(),
        });

        MockBackend {
            events: Some(events_tx),
            sent: sent_rx,
            dropped,
            audio_sequence: 0,
        }
    }

    /// Script a refused connection
    pub fn refuse_next(&self, reason: impl Into<String>) {
        self.plans.lock().push_back(Plan::Refuse(reason.into()));
    }

    /// Connection attempts so far
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Tenant ids seen by `connect`, in order
    pub fn tenants(&self) -> Vec<String> {
        self.tenants.lock().clone()
    }
}

#[async_trait]
impl BackendConnector for ScriptedConnector {
    async fn connect(&self, tenant: &TenantConfig) -> Result<BackendConnection, BackendError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.tenants.lock().push(tenant.tenant_id.clone());

        let plan = self.plans.lock().pop_front();
        match plan {
            Some(Plan::Accept {
                events,
                sent,
                dropped,
            }) => Ok(BackendConnection {
                sender: Box::new(MockSender {
                    sent,
                    dropped: dropped.clone(),
                }),
                receiver: Box::new(MockReceiver { events }),
            }),
            Some(Plan::Refuse(reason)) => Err(BackendError::Connect(reason)),
            None => Err(BackendError::Connect("no scripted connection left".to_string())),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Test-side handle of one scripted connection
pub struct MockBackend {
    events: Option<mpsc::UnboundedSender<BackendEvent>>,
    sent: mpsc::UnboundedReceiver<Upstream>,
    dropped: Arc<AtomicBool>,
    audio_sequence: u64,
}

impl MockBackend {
    pub fn send(&self, event: BackendEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Emit one assistant audio frame
    pub fn audio(&mut self, payload: Vec<u8>, sample_rate: u32) {
        let frame = AudioFrame::new(
            payload,
            AudioFormat::pcm16_mono(sample_rate),
            self.audio_sequence,
            Leg::Backend,
        );
        self.audio_sequence += 1;
        self.send(BackendEvent::Audio(frame));
    }

    pub fn transcript(&self, role: Role, text: impl Into<String>) {
        self.send(BackendEvent::Transcript {
            role,
            text: text.into(),
        });
    }

    pub fn turn_complete(&self) {
        self.send(BackendEvent::TurnBoundary);
    }

    /// Report token usage for the work so far
    pub fn usage(&self, prompt_tokens: u64, response_tokens: u64) {
        self.send(BackendEvent::Usage(TokenUsage {
            prompt_tokens,
            response_tokens,
            total_tokens: prompt_tokens + response_tokens,
        }));
    }

    /// Drop the connection from the backend side
    pub fn disconnect(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
        self.events = None;
    }

    /// Next message the relay sent upstream
    pub async fn next_sent(&mut self) -> Option<Upstream> {
        self.sent.recv().await
    }

    pub fn try_sent(&mut self) -> Option<Upstream> {
        self.sent.try_recv().ok()
    }

    /// Drain everything sent so far
    pub fn drain_sent(&mut self) -> Vec<Upstream> {
        std::iter::from_fn(|| self.try_sent()).collect()
    }
}

struct MockSender {
    sent: mpsc::UnboundedSender<Upstream>,
    dropped: Arc<AtomicBool>,
}

impl MockSender {
    fn push(&self, message: Upstream) -> Result<(), BackendError> {
        if self.dropped.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }
        self.sent.send(message).map_err(|_| BackendError::Closed)
    }
}

#[async_trait]
impl BackendSender for MockSender {
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<(), BackendError> {
        self.push(Upstream::Audio(frame.clone()))
    }

    async fn send_text_turn(&mut self, text: &str) -> Result<(), BackendError> {
        self.push(Upstream::Text(text.to_string()))
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        let _ = self.sent.send(Upstream::Closed);
        Ok(())
    }
}

struct MockReceiver {
    events: mpsc::UnboundedReceiver<BackendEvent>,
}

#[async_trait]
impl BackendReceiver for MockReceiver {
    async fn next_event(&mut self) -> Result<Option<BackendEvent>, BackendError> {
        Ok(self.events.recv().await)
    }
}
