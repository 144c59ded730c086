//! Per-tenant configuration value

use serde::{Deserialize, Serialize};

/// Audio format hints a tenant may set to override process defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormatHints {
    /// Sample rate the telephony provider uses for this tenant
    #[serde(default)]
    pub telephony_sample_rate: Option<u32>,
    /// Sample rate to feed the backend
    #[serde(default)]
    pub backend_input_sample_rate: Option<u32>,
}

/// Exit messages a tenant may set instead of the built-in ones
///
/// `{minutes}` is replaced with the configured limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitMessages {
    /// Spoken when the call reaches its maximum duration
    #[serde(default)]
    pub max_duration: Option<String>,
    /// Spoken when the caller stopped responding
    #[serde(default)]
    pub inactivity: Option<String>,
}

/// Tenant configuration, fetched once per session and never mutated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Instructions sent to the backend during the handshake
    pub system_prompt: String,
    /// First assistant turn; empty skips the greeting
    #[serde(default)]
    pub greeting_text: String,
    #[serde(default)]
    pub audio: AudioFormatHints,
    /// Backend voice override
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub exit_messages: ExitMessages,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl TenantConfig {
    pub fn new(tenant_id: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            display_name: None,
            system_prompt: system_prompt.into(),
            greeting_text: String::new(),
            audio: AudioFormatHints::default(),
            voice: None,
            exit_messages: ExitMessages::default(),
            active: true,
        }
    }

    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting_text = greeting.into();
        self
    }

    pub fn has_greeting(&self) -> bool {
        !self.greeting_text.trim().is_empty()
    }
}
