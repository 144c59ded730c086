//! Telephony write path and keep-alive
//!
//! Every write to the telephony leg goes through [`TelephonyWriter`]. A turn
//! flush holds the writer lock for the whole turn; the keep-alive timer only
//! uses `try_lock`, so it can never interleave with a flush.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use voice_relay_config::LivenessConfig;
use voice_relay_core::{
    AudioFrame, CallStart, OutboundMessage, Result, TelephonySink, TerminationCause,
};

use crate::session::CloseSignal;

struct IdleClock {
    last_audio: Instant,
    keepalive_sent: bool,
}

/// Serialized access to the telephony sink
pub struct TelephonyWriter {
    sink: tokio::sync::Mutex<Box<dyn TelephonySink>>,
    idle: Mutex<IdleClock>,
    audio_frames: AtomicU64,
    keepalives: AtomicU64,
}

/// Result of one keep-alive check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    /// Audio went out recently, or a keep-alive already covers this idle period
    NotDue,
    /// A flush holds the write path
    Suppressed,
    Sent,
}

impl TelephonyWriter {
    pub fn new(sink: Box<dyn TelephonySink>) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(sink),
            idle: Mutex::new(IdleClock {
                last_audio: Instant::now(),
                keepalive_sent: false,
            }),
            audio_frames: AtomicU64::new(0),
            keepalives: AtomicU64::new(0),
        }
    }

    pub async fn bind_call(&self, call: &CallStart) {
        self.sink.lock().await.bind_call(call);
    }

    /// Write one assistant turn as a unit
    ///
    /// Holds the write path until the last frame is out. Each frame resets
    /// the idle clock.
    pub async fn write_turn(&self, frames: Vec<AudioFrame>) -> Result<usize> {
        let mut sink = self.sink.lock().await;
        let mut written = 0;
        for frame in frames {
            sink.send(OutboundMessage::Audio(frame)).await?;
            self.mark_audio(Instant::now());
            written += 1;
        }
        self.audio_frames.fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    pub async fn send_status(&self, state: &str) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(OutboundMessage::Status {
                state: state.to_string(),
            })
            .await
    }

    /// Final notice before the socket closes
    pub async fn send_terminal(&self, cause: &TerminationCause) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(OutboundMessage::Terminal {
                code: cause.code().to_string(),
                message: cause.message(),
            })
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.sink.lock().await.close().await
    }

    /// Time since the last audio frame went out
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.idle.lock().last_audio)
    }

    /// Send a keep-alive if the leg has been idle past `threshold`
    ///
    /// Fires at most once per idle period; the next audio write re-arms it.
    pub async fn try_keep_alive(&self, now: Instant, threshold: Duration) -> Result<KeepAlive> {
        {
            let idle = self.idle.lock();
            if idle.keepalive_sent || now.saturating_duration_since(idle.last_audio) <= threshold {
                return Ok(KeepAlive::NotDue);
            }
        }

        let Ok(mut sink) = self.sink.try_lock() else {
            return Ok(KeepAlive::Suppressed);
        };
        sink.send(OutboundMessage::KeepAlive).await?;
        self.idle.lock().keepalive_sent = true;
        self.keepalives.fetch_add(1, Ordering::Relaxed);
        Ok(KeepAlive::Sent)
    }

    pub fn audio_frames_sent(&self) -> u64 {
        self.audio_frames.load(Ordering::Relaxed)
    }

    pub fn keepalives_sent(&self) -> u64 {
        self.keepalives.load(Ordering::Relaxed)
    }

    fn mark_audio(&self, now: Instant) {
        let mut idle = self.idle.lock();
        idle.last_audio = now;
        idle.keepalive_sent = false;
    }
}

/// Periodic idle check on the telephony leg
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveTimer {
    pub idle_threshold: Duration,
    pub check_interval: Duration,
}

impl From<&LivenessConfig> for KeepAliveTimer {
    fn from(config: &LivenessConfig) -> Self {
        Self {
            idle_threshold: config.idle_threshold(),
            check_interval: config.check_interval(),
        }
    }
}

impl KeepAliveTimer {
    /// Run until the session closes or a keep-alive write fails
    pub async fn run(&self, writer: &TelephonyWriter, close: &CloseSignal) -> Option<TerminationCause> {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = close.closed() => return None,
                _ = ticker.tick() => {
                    match writer.try_keep_alive(Instant::now(), self.idle_threshold).await {
                        Ok(KeepAlive::Sent) => {
                            crate::metrics::record_keepalive();
                            tracing::debug!(
                                idle_ms = writer.idle_for(Instant::now()).as_millis() as u64,
                                "Sent keep-alive"
                            );
                        }
                        Ok(KeepAlive::Suppressed) => {
                            tracing::trace!("Keep-alive suppressed during flush");
                        }
                        Ok(KeepAlive::NotDue) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "Keep-alive write failed");
                            return Some(TerminationCause::IdleTimeout);
                        }
                    }
                }
            }
        }
    }
}
