//! Configuration management for the voice relay
//!
//! Supports loading configuration from:
//! - YAML/TOML files (config/default, config/{env})
//! - Environment variables (VOICE_RELAY__ prefix, `__` separator)
//!
//! Tenant configuration is separate from process settings: it is looked up
//! per call through a [`voice_relay_core::TenantConfigProvider`], backed by
//! [`FileTenantStore`] in production.

pub mod constants;
pub mod settings;
pub mod tenant;

pub use settings::{
    load_settings, AudioConfig, BackendConfig, LivenessConfig, ObservabilityConfig,
    RuntimeEnvironment, ServerConfig, SessionConfig, Settings, TenantStoreConfig, TurnConfig,
};
pub use tenant::{FileTenantStore, StaticTenantStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Environment error: {0}")]
    Environment(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
