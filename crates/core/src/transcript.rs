//! Transcript events emitted while a call is relayed

use serde::{Deserialize, Serialize};

/// Who spoke a transcript fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Caller,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Caller => "caller",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transcript fragment
///
/// Fragments of an utterance share a role and arrive with increasing
/// sequence numbers. The last event of an utterance has `terminal` set and
/// carries the whole utterance text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub session_id: String,
    pub role: Role,
    pub text: String,
    pub sequence: u64,
    pub terminal: bool,
}
