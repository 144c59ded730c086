//! Turn detection
//!
//! Wall-clock turn-taking between the caller and the assistant. There is no
//! voice activity detection here: the caller holds the floor while frames
//! keep arriving, the assistant holds it from its first frame until the
//! backend ends the turn.

mod controller;

pub use controller::{GateDecision, TurnController, TurnState, TurnTakingConfig};
