//! The two relay flows of an active session
//!
//! - [`CallerFlow`]: telephony → codec → chunker → turn gate
//! - [`AssistantFlow`]: gate queue → backend, and backend → codec →
//!   chunker → whole-turn buffer → telephony
//!
//! The flows share only the [`TurnController`]; neither touches the other's
//! transport. Both stop at their next suspension point once the session's
//! [`CloseSignal`] fires. Caller audio still inside the flows at that point
//! is pushed upstream by [`CallerFlow::flush_tail`] and
//! [`AssistantFlow::forward_pending`].

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use voice_relay_backend::{BackendEvent, UpstreamLink};
use voice_relay_core::{
    AudioFrame, Error, InboundMessage, Leg, Role, SessionState, TelephonySource,
    TerminationCause, TokenUsage, TranscriptSink,
};
use voice_relay_pipeline::{Chunker, CodecDirection, TranscriptAssembler, TurnController, TurnState};

use crate::farewell::{ExitScript, Farewell};
use crate::liveness::TelephonyWriter;
use crate::session::{CallerActivity, CloseSignal, StateHandle};

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Telephony → backend
pub(crate) struct CallerFlow<'a> {
    pub source: &'a mut dyn TelephonySource,
    pub encoder: CodecDirection,
    pub chunker: Chunker,
    pub turn: Arc<TurnController>,
    /// Wakes the flow when the assistant hands the floor back
    pub floor: watch::Receiver<TurnState>,
    pub activity: CallerActivity,
    /// Arrival time of the latest caller audio
    pub last_audio: Instant,
}

impl CallerFlow<'_> {
    pub async fn run(&mut self, close: &CloseSignal) -> Option<TerminationCause> {
        loop {
            let silence_at = self
                .turn
                .silence_deadline()
                .or_else(|| self.idle_tail_deadline());
            tokio::select! {
                _ = close.closed() => return None,
                _ = sleep_until_opt(silence_at) => self.on_silence(),
                Ok(()) = self.floor.changed() => self.on_floor_change(),
                message = self.source.recv() => match message {
                    None => {
                        tracing::info!("Telephony leg closed");
                        return Some(TerminationCause::TelephonyDisconnect);
                    }
                    Some(Err(Error::Malformed(m))) => {
                        tracing::warn!(error = %m, "Ignoring malformed telephony message");
                    }
                    Some(Err(e)) => {
                        tracing::info!(error = %e, "Telephony transport failed");
                        return Some(TerminationCause::TelephonyDisconnect);
                    }
                    Some(Ok(message)) => {
                        if let Some(cause) = self.handle(message) {
                            return Some(cause);
                        }
                    }
                },
            }
        }
    }

    fn handle(&mut self, message: InboundMessage) -> Option<TerminationCause> {
        match message {
            InboundMessage::Audio(audio) => {
                let frame = match self.encoder.encode(&audio.payload, audio.format) {
                    Ok(frame) => frame,
                    Err(e) => return Some(TerminationCause::UnsupportedFormat(e.to_string())),
                };
                let now = Instant::now();
                self.last_audio = now;
                self.chunker.push(frame.payload());
                for chunk in self.chunker.drain() {
                    if self.turn.on_caller_frame(chunk, now).is_err() {
                        return Some(TerminationCause::Internal("upstream queue closed".to_string()));
                    }
                }
            }
            InboundMessage::SpeechStarted => {
                let now = Instant::now();
                self.last_audio = now;
                self.activity.touch();
                self.turn.speech_started(now);
            }
            InboundMessage::Stop { reason } => {
                tracing::info!(reason = reason.as_deref().unwrap_or("-"), "Caller hung up");
                return Some(TerminationCause::TelephonyDisconnect);
            }
            InboundMessage::Dtmf { digit } => {
                tracing::info!(digit = %digit, "DTMF received");
            }
            InboundMessage::Mark { name } => {
                tracing::trace!(mark = %name, "Playback mark acknowledged");
            }
            InboundMessage::Clear => {
                tracing::debug!("Provider cleared playback");
            }
            InboundMessage::Connected | InboundMessage::Start(_) => {
                tracing::debug!(kind = message.kind(), "Ignoring repeated handshake message");
            }
        }
        None
    }

    fn on_silence(&mut self) {
        if !self.flush_tail() {
            return;
        }
        if self.turn.poll_silence(Instant::now()) {
            tracing::debug!("Caller went silent");
        }
    }

    /// Audio too short for one chunk never took the floor, yet it still goes
    /// up once the caller has been quiet for the silence window
    fn idle_tail_deadline(&self) -> Option<Instant> {
        (!self.chunker.is_empty() && self.turn.state() == TurnState::Idle)
            .then(|| self.last_audio + self.turn.silence_window())
    }

    /// A tail that waited out an assistant turn goes up once the floor is free
    fn on_floor_change(&mut self) {
        if self.turn.state() == TurnState::Idle && !self.chunker.is_empty() {
            tracing::trace!(bytes = self.chunker.buffered(), "Releasing caller tail after handoff");
            self.flush_tail();
        }
    }

    /// Push buffered caller audio shorter than a chunk through the gate
    ///
    /// The tail keeps its original arrival time so it does not extend the
    /// utterance. Returns false once the upstream queue is gone.
    pub fn flush_tail(&mut self) -> bool {
        match self.chunker.flush() {
            Some(tail) => self.turn.on_caller_frame(tail, self.last_audio).is_ok(),
            None => true,
        }
    }
}

/// Backend ↔ telephony
pub(crate) struct AssistantFlow<'a> {
    pub link: &'a mut UpstreamLink,
    pub upstream: mpsc::UnboundedReceiver<AudioFrame>,
    pub decoder: CodecDirection,
    pub chunker: Chunker,
    pub turn: Arc<TurnController>,
    pub writer: Arc<TelephonyWriter>,
    pub assembler: TranscriptAssembler,
    pub transcripts: Arc<dyn TranscriptSink>,
    pub activity: CallerActivity,
    pub state: StateHandle,
    pub farewells: mpsc::Receiver<Farewell>,
    pub exit: ExitScript,
    pub frames_to_backend: u64,
    pub usage: TokenUsage,
    /// Assistant turns left until the exit message has been played
    pub farewell: Option<(u8, oneshot::Sender<()>)>,
}

impl AssistantFlow<'_> {
    pub async fn run(&mut self, close: &CloseSignal) -> Option<TerminationCause> {
        loop {
            tokio::select! {
                _ = close.closed() => {
                    if !matches!(close.cause(), Some(TerminationCause::TelephonyDisconnect)) {
                        self.drain_on_close().await;
                    }
                    return None;
                }
                frame = self.upstream.recv() => {
                    let Some(frame) = frame else {
                        return Some(TerminationCause::Internal("caller gate dropped".to_string()));
                    };
                    if let Some(cause) = self.forward(frame).await {
                        return Some(cause);
                    }
                }
                Some(request) = self.farewells.recv() => self.on_farewell(request).await,
                event = self.link.next_event() => {
                    let outcome = match event {
                        Ok(Some(event)) => self.on_event(event).await,
                        Ok(None) => self.recover("backend closed the connection").await,
                        Err(e) => self.recover(&e.to_string()).await,
                    };
                    if let Some(cause) = outcome {
                        return Some(cause);
                    }
                }
            }
        }
    }

    async fn forward(&mut self, frame: AudioFrame) -> Option<TerminationCause> {
        let reconnects = self.link.reconnects();
        if let Err(e) = self.link.send_audio(&frame).await {
            tracing::warn!(error = %e, "Backend unavailable");
            return Some(TerminationCause::BackendUnavailable(e.to_string()));
        }
        self.frames_to_backend += 1;
        if self.link.reconnects() > reconnects {
            return self.on_reconnected().await;
        }
        None
    }

    /// Deliver caller frames still queued when the session closes
    ///
    /// Uses the current connection only and stops at the first failure.
    pub async fn forward_pending(&mut self) -> usize {
        let mut forwarded = 0;
        while let Ok(frame) = self.upstream.try_recv() {
            if let Err(e) = self.link.try_send_audio(&frame).await {
                tracing::debug!(error = %e, "Dropping caller audio queued at close");
                break;
            }
            forwarded += 1;
        }
        self.frames_to_backend += forwarded as u64;
        forwarded
    }

    async fn recover(&mut self, reason: &str) -> Option<TerminationCause> {
        match self.link.recover(reason).await {
            Ok(()) => self.on_reconnected().await,
            Err(e) => {
                tracing::warn!(error = %e, "Backend unavailable");
                Some(TerminationCause::BackendUnavailable(e.to_string()))
            }
        }
    }

    /// Close out a turn cut short by the drop
    async fn on_reconnected(&mut self) -> Option<TerminationCause> {
        crate::metrics::record_backend_reconnect();
        if self.turn.state() == TurnState::AiResponding {
            tracing::debug!(
                buffered = self.turn.buffered_ai_frames(),
                "Flushing assistant turn interrupted by reconnect"
            );
            return self.flush_turn().await;
        }
        None
    }

    async fn on_event(&mut self, event: BackendEvent) -> Option<TerminationCause> {
        match event {
            BackendEvent::Audio(frame) => {
                // Any assistant audio, however short, takes the floor.
                self.turn.begin_ai_turn();
                let converted = match self.decoder.encode(frame.payload(), frame.format()) {
                    Ok(converted) => converted,
                    Err(e) => return Some(TerminationCause::UnsupportedFormat(e.to_string())),
                };
                self.chunker.push(converted.payload());
                for chunk in self.chunker.drain() {
                    self.turn.on_ai_frame(chunk);
                }
            }
            BackendEvent::Transcript { role, text } => {
                if role == Role::Caller {
                    self.activity.touch();
                    self.exit.observe_caller(&text);
                }
                for event in self.assembler.push(role, &text) {
                    self.transcripts.publish(event);
                }
            }
            BackendEvent::TurnBoundary => return self.flush_turn().await,
            BackendEvent::Interrupted => {
                tracing::debug!("Backend interrupted its turn");
                return self.flush_turn().await;
            }
            BackendEvent::GoAway { time_left } => {
                tracing::warn!(
                    time_left = time_left.as_deref().unwrap_or("-"),
                    "Backend announced disconnect"
                );
            }
            BackendEvent::Error { message } => {
                tracing::warn!(error = %message, "Backend reported an error");
            }
            BackendEvent::Usage(usage) => {
                crate::metrics::record_token_usage(&usage);
                self.usage.add(usage);
            }
        }
        None
    }

    /// Have the assistant speak the exit message of a timed-out call
    ///
    /// A turn already in progress is played first, so the exit message is
    /// done after two turn boundaries in that case.
    async fn on_farewell(&mut self, request: Farewell) {
        let turns = if self.turn.state() == TurnState::AiResponding {
            2
        } else {
            1
        };
        self.turn.begin_ai_turn();
        let prompt = self.exit.prompt(request.reason);
        match self.link.send_text_turn(&prompt).await {
            Ok(()) => {
                tracing::info!(
                    reason = ?request.reason,
                    language = self.exit.language().as_str(),
                    "Exit message requested"
                );
                self.farewell = Some((turns, request.done));
            }
            // Dropping `done` lets the session hang up right away
            Err(e) => tracing::warn!(error = %e, "Exit message not sent"),
        }
    }

    /// Write the buffered assistant turn to telephony as one unit
    ///
    /// The turn controller stays in `AiResponding` until the last frame is
    /// written, so no caller audio is forwarded mid-flush.
    async fn flush_turn(&mut self) -> Option<TerminationCause> {
        if let Some(tail) = self.chunker.flush() {
            self.turn.on_ai_frame(tail);
        }
        let frames = self.turn.take_ai_turn();
        if !frames.is_empty() {
            let started = Instant::now();
            match self.writer.write_turn(frames).await {
                Ok(written) => {
                    crate::metrics::record_turn_flush(started.elapsed());
                    tracing::debug!(frames = written, "Flushed assistant turn");
                }
                Err(e) => {
                    tracing::info!(error = %e, "Telephony write failed");
                    return Some(TerminationCause::TelephonyDisconnect);
                }
            }
        }

        if self.turn.finish_turn().is_err() {
            return Some(TerminationCause::Internal("upstream queue closed".to_string()));
        }
        if let Some(event) = self.assembler.end_turn() {
            self.transcripts.publish(event);
        }
        if self.state.get() == SessionState::Greeting {
            self.state.set(SessionState::Active);
        }
        if let Some((turns, done)) = self.farewell.take() {
            if turns > 1 {
                self.farewell = Some((turns - 1, done));
            } else {
                let _ = done.send(());
            }
        }
        None
    }

    /// Flush whatever the assistant already produced before the legs close
    async fn drain_on_close(&mut self) {
        if self.turn.buffered_ai_frames() > 0 || !self.chunker.is_empty() {
            if let Some(cause) = self.flush_turn().await {
                tracing::debug!(cause = cause.code(), "Final flush failed");
            }
        }
    }
}
