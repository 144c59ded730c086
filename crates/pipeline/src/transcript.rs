//! Transcript assembly
//!
//! The backend streams transcription as small fragments per speaker. The
//! assembler numbers them, and closes an utterance with a terminal event
//! carrying the merged text whenever the speaker changes or a turn ends.

use voice_relay_core::{Role, TranscriptEvent};

#[derive(Debug)]
pub struct TranscriptAssembler {
    session_id: String,
    next_sequence: u64,
    open: Option<(Role, String)>,
}

impl TranscriptAssembler {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            next_sequence: 0,
            open: None,
        }
    }

    /// Events emitted so far
    pub fn emitted(&self) -> u64 {
        self.next_sequence
    }

    fn event(&mut self, role: Role, text: String, terminal: bool) -> TranscriptEvent {
        let event = TranscriptEvent {
            session_id: self.session_id.clone(),
            role,
            text,
            sequence: self.next_sequence,
            terminal,
        };
        self.next_sequence += 1;
        event
    }

    /// Add a fragment; may first close the other speaker's utterance
    pub fn push(&mut self, role: Role, fragment: &str) -> Vec<TranscriptEvent> {
        if fragment.trim().is_empty() {
            return Vec::new();
        }

        let mut events = Vec::with_capacity(2);
        if matches!(&self.open, Some((open_role, _)) if *open_role != role) {
            events.extend(self.close());
        }

        match &mut self.open {
            Some((_, text)) => text.push_str(fragment),
            None => self.open = Some((role, fragment.to_string())),
        }
        events.push(self.event(role, fragment.to_string(), false));
        events
    }

    /// Close the open utterance at a turn boundary
    pub fn end_turn(&mut self) -> Option<TranscriptEvent> {
        self.close()
    }

    fn close(&mut self) -> Option<TranscriptEvent> {
        let (role, text) = self.open.take()?;
        let text = text.trim().to_string();
        Some(self.event(role, text, true))
    }
}
