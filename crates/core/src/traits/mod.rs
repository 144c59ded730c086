//! Collaborator traits
//!
//! The relay talks to everything outside a session through these seams:
//!
//! ```text
//! Telephony:
//!   - TelephonySource: decoded inbound messages from the provider socket
//!   - TelephonySink: outbound audio, keep-alives and notices
//!
//! Tenants:
//!   - TenantConfigProvider: immutable per-tenant configuration lookup
//!
//! Transcripts:
//!   - TranscriptSink: ordered transcript events plus one final summary
//! ```

mod telephony;
mod tenant;
mod transcript;

pub use telephony::{TelephonySink, TelephonySource};
pub use tenant::TenantConfigProvider;
pub use transcript::{NullTranscriptSink, TranscriptSink};
