//! Centralized constants for the voice relay
//!
//! Single source of truth for default values used across crates. Settings
//! defaults and component defaults both read from here.

/// Server defaults
pub mod server {
    pub const DEFAULT_HOST: &str = "0.0.0.0";
    pub const DEFAULT_PORT: u16 = 8765;
    /// Telephony media route; tenant id is appended as a path segment
    pub const DEFAULT_WS_PATH: &str = "/media";
    pub const DEFAULT_MAX_SESSIONS: usize = 100;
    pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;
}

/// Audio formats and chunk sizes
pub mod audio {
    pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;
    pub const BACKEND_INPUT_SAMPLE_RATE: u32 = 16000;
    pub const BACKEND_OUTPUT_SAMPLE_RATE: u32 = 24000;

    /// 40ms of 8kHz PCM16
    pub const TELEPHONY_CHUNK_BYTES: usize = 640;

    /// 40ms of 16kHz PCM16
    pub const BACKEND_CHUNK_BYTES: usize = 1280;
}

/// Turn-taking
pub mod turn {
    /// Wall-clock gap after which the caller is considered silent
    pub const SILENCE_MS: u64 = 500;

    /// Smallest silence window accepted by validation
    pub const MIN_SILENCE_MS: u64 = 50;
}

/// Telephony keep-alive
pub mod liveness {
    pub const IDLE_THRESHOLD_MS: u64 = 3000;
    pub const CHECK_INTERVAL_MS: u64 = 250;
    /// Mark name used for keep-alive messages
    pub const KEEPALIVE_MARK: &str = "keepalive";
}

/// Session lifecycle timers
pub mod session {
    /// How long to wait for the provider's start message
    pub const START_TIMEOUT_MS: u64 = 10_000;
    /// Grace period for flushing in-flight audio during close
    pub const CLOSE_GRACE_MS: u64 = 2_000;
    pub const MAX_CALL_DURATION_SECS: u64 = 600;
    pub const CALLER_INACTIVITY_SECS: u64 = 120;
    /// Time the assistant gets to speak an exit message before a timed-out
    /// call is hung up; 0 hangs up at once
    pub const EXIT_GRACE_MS: u64 = 3_000;
    /// Reconnect attempts allowed after an unexpected backend drop
    pub const MAX_BACKEND_RECONNECTS: u32 = 1;
}

/// Upstream backend defaults
pub mod backend {
    pub const ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
    pub const MODEL: &str = "models/gemini-2.5-flash-preview-native-audio-dialog";
    pub const VOICE: &str = "Zephyr";
    pub const API_KEY_ENV: &str = "GEMINI_API_KEY";
    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;
    pub const SETUP_TIMEOUT_MS: u64 = 10_000;
    /// Context window compression trigger (tokens)
    pub const COMPRESSION_TRIGGER_TOKENS: u64 = 25_600;
    /// Sliding window target after compression (tokens)
    pub const COMPRESSION_TARGET_TOKENS: u64 = 12_800;
}

/// Tenant repository layout
pub mod tenants {
    pub const REPOSITORY_PATH: &str = "tenant_repository";
    pub const MANIFEST_FILE: &str = "tenant.yaml";
    pub const PROMPT_FILE: &str = "prompts/assistant.txt";
    pub const GREETING_FILE: &str = "prompts/greeting.txt";
    /// Allowed tenant id shape
    pub const ID_PATTERN: &str = r"^[a-z0-9_-]{1,64}$";
}
