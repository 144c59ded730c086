//! Turn-Taking Controller
//!
//! Tracks who holds the floor and gates audio in both directions:
//! - caller frames are forwarded upstream unless the assistant holds the
//!   floor, in which case they are held and released in order afterwards
//! - assistant frames are buffered for the whole turn and handed out as one
//!   unit when the backend signals the end of the turn
//!
//! Time is injected by the caller so every transition can be driven from
//! tests without sockets. The current floor is also published on a watch
//! channel so a flow blocked on I/O can react to a handoff it did not cause.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use voice_relay_core::AudioFrame;

use crate::PipelineError;

/// Who holds the floor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TurnState {
    /// Nobody is talking
    #[default]
    Idle,
    /// Caller audio is arriving
    CallerSpeaking,
    /// Assistant turn is being buffered or flushed
    AiResponding,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::CallerSpeaking => "caller_speaking",
            TurnState::AiResponding => "ai_responding",
        }
    }
}

/// What the gate did with a caller frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Sent upstream immediately
    Forwarded,
    /// Queued behind the assistant turn
    Held,
}

/// Configuration for turn-taking
#[derive(Debug, Clone)]
pub struct TurnTakingConfig {
    /// Caller silence that returns the floor to idle
    pub silence: Duration,
}

impl Default for TurnTakingConfig {
    fn default() -> Self {
        use voice_relay_config::constants::turn::SILENCE_MS;

        Self {
            silence: Duration::from_millis(SILENCE_MS),
        }
    }
}

impl From<&voice_relay_config::TurnConfig> for TurnTakingConfig {
    fn from(config: &voice_relay_config::TurnConfig) -> Self {
        Self {
            silence: config.silence(),
        }
    }
}

/// Internal state for tracking
struct InternalState {
    state: TurnState,
    last_caller_audio: Option<Instant>,
    ai_turn: Vec<AudioFrame>,
    held: VecDeque<AudioFrame>,
    transitions: u64,
    floor: watch::Sender<TurnState>,
}

impl InternalState {
    fn transition(&mut self, to: TurnState) {
        if self.state != to {
            tracing::debug!(from = self.state.as_str(), to = to.as_str(), "Turn state change");
            self.state = to;
            self.transitions += 1;
            self.floor.send_replace(to);
        }
    }
}

/// Turn-taking state machine and caller gate
///
/// Caller frames admitted by the gate go straight into the upstream
/// channel while the internal lock is held, so a frame admitted after
/// [`TurnController::finish_turn`] can never overtake frames released by it.
pub struct TurnController {
    config: TurnTakingConfig,
    upstream: mpsc::UnboundedSender<AudioFrame>,
    internal: Mutex<InternalState>,
}

impl TurnController {
    pub fn new(config: TurnTakingConfig, upstream: mpsc::UnboundedSender<AudioFrame>) -> Self {
        Self {
            config,
            upstream,
            internal: Mutex::new(InternalState {
                state: TurnState::Idle,
                last_caller_audio: None,
                ai_turn: Vec::new(),
                held: VecDeque::new(),
                transitions: 0,
                floor: watch::channel(TurnState::Idle).0,
            }),
        }
    }

    pub fn state(&self) -> TurnState {
        self.internal.lock().state
    }

    /// Follow floor changes
    pub fn subscribe(&self) -> watch::Receiver<TurnState> {
        self.internal.lock().floor.subscribe()
    }

    /// Number of state changes so far
    pub fn transitions(&self) -> u64 {
        self.internal.lock().transitions
    }

    /// Caller frames waiting behind the assistant turn
    pub fn held_frames(&self) -> usize {
        self.internal.lock().held.len()
    }

    /// Assistant frames buffered for the current turn
    pub fn buffered_ai_frames(&self) -> usize {
        self.internal.lock().ai_turn.len()
    }

    /// Gate one caller frame
    pub fn on_caller_frame(
        &self,
        frame: AudioFrame,
        now: Instant,
    ) -> Result<GateDecision, PipelineError> {
        let mut internal = self.internal.lock();
        internal.last_caller_audio = Some(now);

        match internal.state {
            TurnState::AiResponding => {
                internal.held.push_back(frame);
                Ok(GateDecision::Held)
            }
            TurnState::Idle | TurnState::CallerSpeaking => {
                internal.transition(TurnState::CallerSpeaking);
                self.upstream
                    .send(frame)
                    .map_err(|_| PipelineError::ChannelClosed)?;
                Ok(GateDecision::Forwarded)
            }
        }
    }

    /// Explicit speech-start signal from the telephony provider
    pub fn speech_started(&self, now: Instant) {
        let mut internal = self.internal.lock();
        if internal.state == TurnState::Idle {
            internal.last_caller_audio = Some(now);
            internal.transition(TurnState::CallerSpeaking);
        }
    }

    /// Caller silence that ends an utterance
    pub fn silence_window(&self) -> Duration {
        self.config.silence
    }

    /// When the caller will count as silent, if currently speaking
    pub fn silence_deadline(&self) -> Option<Instant> {
        let internal = self.internal.lock();
        match (internal.state, internal.last_caller_audio) {
            (TurnState::CallerSpeaking, Some(last)) => Some(last + self.config.silence),
            _ => None,
        }
    }

    /// Apply the silence rule; returns true if the caller lost the floor
    pub fn poll_silence(&self, now: Instant) -> bool {
        let mut internal = self.internal.lock();
        if internal.state != TurnState::CallerSpeaking {
            return false;
        }
        let silent = internal
            .last_caller_audio
            .map_or(true, |last| now.saturating_duration_since(last) >= self.config.silence);
        if silent {
            internal.transition(TurnState::Idle);
        }
        silent
    }

    /// Give the floor to the assistant
    ///
    /// Called for a greeting or exit message before any audio exists, and
    /// for every backend audio frame however short.
    pub fn begin_ai_turn(&self) {
        self.internal.lock().transition(TurnState::AiResponding);
    }

    /// Buffer one assistant frame for the current turn
    pub fn on_ai_frame(&self, frame: AudioFrame) {
        let mut internal = self.internal.lock();
        internal.transition(TurnState::AiResponding);
        internal.ai_turn.push(frame);
    }

    /// Take the buffered assistant turn for flushing
    ///
    /// The floor stays with the assistant until [`Self::finish_turn`], so
    /// the flush happens while no caller frame can be forwarded.
    pub fn take_ai_turn(&self) -> Vec<AudioFrame> {
        std::mem::take(&mut self.internal.lock().ai_turn)
    }

    /// Close the assistant turn after its flush completed
    ///
    /// Releases held caller frames upstream in arrival order and returns
    /// how many were released. Released audio hands the floor straight to
    /// the caller, so the silence rule applies to it like to live audio.
    pub fn finish_turn(&self) -> Result<usize, PipelineError> {
        let mut internal = self.internal.lock();
        let released = internal.held.len();
        if internal.state == TurnState::AiResponding {
            let next = if released > 0 {
                TurnState::CallerSpeaking
            } else {
                TurnState::Idle
            };
            internal.transition(next);
        }
        while let Some(frame) = internal.held.pop_front() {
            self.upstream
                .send(frame)
                .map_err(|_| PipelineError::ChannelClosed)?;
        }
        if released > 0 {
            tracing::debug!(released, "Released held caller frames");
        }
        Ok(released)
    }
}
