//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{audio, backend, liveness, server, session, tenants, turn};
use crate::ConfigError;

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    /// Development mode - relaxed validation
    #[default]
    Development,
    Staging,
    /// Production mode - all validations enforced
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub turn: TurnConfig,

    #[serde(default)]
    pub liveness: LivenessConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub tenants: TenantStoreConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_server()?;
        self.validate_audio()?;
        self.validate_timers()?;
        self.validate_backend()?;
        Ok(())
    }

    fn validate_server(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(invalid("server.port", "Port cannot be 0"));
        }
        if !self.server.ws_path.starts_with('/') || self.server.ws_path.len() < 2 {
            return Err(invalid(
                "server.ws_path",
                format!("Must be an absolute path, got '{}'", self.server.ws_path),
            ));
        }
        if self.server.ws_path.ends_with('/') {
            return Err(invalid("server.ws_path", "Must not end with '/'"));
        }
        if self.server.max_sessions == 0 {
            return Err(invalid("server.max_sessions", "Must allow at least one session"));
        }
        Ok(())
    }

    fn validate_audio(&self) -> Result<(), ConfigError> {
        let rates = [
            ("audio.telephony_sample_rate", self.audio.telephony_sample_rate),
            ("audio.backend_input_sample_rate", self.audio.backend_input_sample_rate),
            ("backend.output_sample_rate", self.backend.output_sample_rate),
        ];
        for (field, rate) in rates {
            if rate == 0 {
                return Err(invalid(field, "Sample rate cannot be 0"));
            }
        }

        let chunks = [
            ("audio.telephony_chunk_bytes", self.audio.telephony_chunk_bytes),
            ("audio.backend_chunk_bytes", self.audio.backend_chunk_bytes),
        ];
        for (field, size) in chunks {
            if size == 0 {
                return Err(invalid(field, "Chunk size cannot be 0"));
            }
            if size % 2 != 0 {
                return Err(invalid(
                    field,
                    format!("Must be a whole number of 16-bit samples, got {}", size),
                ));
            }
        }
        Ok(())
    }

    fn validate_timers(&self) -> Result<(), ConfigError> {
        if self.turn.silence_ms < turn::MIN_SILENCE_MS {
            return Err(invalid(
                "turn.silence_ms",
                format!(
                    "Silence window too short (minimum {}ms), got {}",
                    turn::MIN_SILENCE_MS,
                    self.turn.silence_ms
                ),
            ));
        }
        if self.liveness.check_interval_ms == 0 {
            return Err(invalid("liveness.check_interval_ms", "Cannot be 0"));
        }
        if self.liveness.check_interval_ms >= self.liveness.idle_threshold_ms {
            return Err(invalid(
                "liveness.check_interval_ms",
                "Must be shorter than liveness.idle_threshold_ms",
            ));
        }
        if self.session.max_call_duration_secs == 0 {
            return Err(invalid("session.max_call_duration_secs", "Cannot be 0"));
        }
        if self.session.caller_inactivity_secs == 0 {
            return Err(invalid("session.caller_inactivity_secs", "Cannot be 0"));
        }
        Ok(())
    }

    fn validate_backend(&self) -> Result<(), ConfigError> {
        if !self.backend.endpoint.starts_with("ws://") && !self.backend.endpoint.starts_with("wss://") {
            return Err(invalid(
                "backend.endpoint",
                format!("Must be a ws:// or wss:// URL, got '{}'", self.backend.endpoint),
            ));
        }
        if self.environment.is_production() && self.backend.api_key.is_none() {
            return Err(ConfigError::MissingField(format!(
                "backend.api_key (or {})",
                backend::API_KEY_ENV
            )));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

fn default_true() -> bool {
    true
}

/// HTTP / WebSocket server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Telephony media route prefix; the tenant id is the next path segment
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Maximum concurrent calls
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Bound on graceful shutdown before sessions are aborted
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub cors_enabled: bool,
}

fn default_host() -> String {
    server::DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    server::DEFAULT_PORT
}
fn default_ws_path() -> String {
    server::DEFAULT_WS_PATH.to_string()
}
fn default_max_sessions() -> usize {
    server::DEFAULT_MAX_SESSIONS
}
fn default_shutdown_timeout() -> u64 {
    server::DEFAULT_SHUTDOWN_TIMEOUT_SECS
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_path: default_ws_path(),
            max_sessions: default_max_sessions(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            cors_enabled: true,
        }
    }
}

/// Audio formats and re-chunking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_telephony_rate")]
    pub telephony_sample_rate: u32,

    #[serde(default = "default_backend_input_rate")]
    pub backend_input_sample_rate: u32,

    /// Frame size written to the telephony leg
    #[serde(default = "default_telephony_chunk")]
    pub telephony_chunk_bytes: usize,

    /// Frame size sent to the backend
    #[serde(default = "default_backend_chunk")]
    pub backend_chunk_bytes: usize,
}

fn default_telephony_rate() -> u32 {
    audio::TELEPHONY_SAMPLE_RATE
}
fn default_backend_input_rate() -> u32 {
    audio::BACKEND_INPUT_SAMPLE_RATE
}
fn default_telephony_chunk() -> usize {
    audio::TELEPHONY_CHUNK_BYTES
}
fn default_backend_chunk() -> usize {
    audio::BACKEND_CHUNK_BYTES
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            telephony_sample_rate: default_telephony_rate(),
            backend_input_sample_rate: default_backend_input_rate(),
            telephony_chunk_bytes: default_telephony_chunk(),
            backend_chunk_bytes: default_backend_chunk(),
        }
    }
}

/// Turn-taking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Caller silence that ends CALLER_SPEAKING
    #[serde(default = "default_silence_ms")]
    pub silence_ms: u64,
}

fn default_silence_ms() -> u64 {
    turn::SILENCE_MS
}

impl TurnConfig {
    pub fn silence(&self) -> Duration {
        Duration::from_millis(self.silence_ms)
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            silence_ms: default_silence_ms(),
        }
    }
}

/// Telephony keep-alive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// No outbound audio for this long triggers a keep-alive
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_ms: u64,

    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,
}

fn default_idle_threshold() -> u64 {
    liveness::IDLE_THRESHOLD_MS
}
fn default_check_interval() -> u64 {
    liveness::CHECK_INTERVAL_MS
}

impl LivenessConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: default_idle_threshold(),
            check_interval_ms: default_check_interval(),
        }
    }
}

/// Session lifecycle timers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_start_timeout")]
    pub start_timeout_ms: u64,

    #[serde(default = "default_close_grace")]
    pub close_grace_ms: u64,

    #[serde(default = "default_max_call_duration")]
    pub max_call_duration_secs: u64,

    #[serde(default = "default_caller_inactivity")]
    pub caller_inactivity_secs: u64,

    #[serde(default = "default_exit_grace")]
    pub exit_grace_ms: u64,
}

fn default_start_timeout() -> u64 {
    session::START_TIMEOUT_MS
}
fn default_close_grace() -> u64 {
    session::CLOSE_GRACE_MS
}
fn default_max_call_duration() -> u64 {
    session::MAX_CALL_DURATION_SECS
}
fn default_caller_inactivity() -> u64 {
    session::CALLER_INACTIVITY_SECS
}
fn default_exit_grace() -> u64 {
    session::EXIT_GRACE_MS
}

impl SessionConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn max_call_duration(&self) -> Duration {
        Duration::from_secs(self.max_call_duration_secs)
    }

    pub fn caller_inactivity(&self) -> Duration {
        Duration::from_secs(self.caller_inactivity_secs)
    }

    /// Bound on the spoken exit message of a timed-out call
    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: default_start_timeout(),
            close_grace_ms: default_close_grace(),
            max_call_duration_secs: default_max_call_duration(),
            caller_inactivity_secs: default_caller_inactivity(),
            exit_grace_ms: default_exit_grace(),
        }
    }
}

/// Upstream conversational backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// API key (should be set via GEMINI_API_KEY or VOICE_RELAY__BACKEND__API_KEY)
    #[serde(default = "default_api_key")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    /// Default prebuilt voice; tenants may override
    #[serde(default = "default_voice")]
    pub voice: String,

    /// Rate assumed for backend audio when the stream does not declare one
    #[serde(default = "default_output_rate")]
    pub output_sample_rate: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_setup_timeout")]
    pub setup_timeout_ms: u64,

    /// Enable sliding-window context compression for long calls
    #[serde(default = "default_true")]
    pub context_compression: bool,
}

fn default_endpoint() -> String {
    backend::ENDPOINT.to_string()
}
fn default_api_key() -> Option<String> {
    std::env::var(backend::API_KEY_ENV).ok().filter(|k| !k.is_empty())
}
fn default_model() -> String {
    backend::MODEL.to_string()
}
fn default_voice() -> String {
    backend::VOICE.to_string()
}
fn default_output_rate() -> u32 {
    audio::BACKEND_OUTPUT_SAMPLE_RATE
}
fn default_connect_timeout() -> u64 {
    backend::CONNECT_TIMEOUT_MS
}
fn default_setup_timeout() -> u64 {
    backend::SETUP_TIMEOUT_MS
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: default_api_key(),
            model: default_model(),
            voice: default_voice(),
            output_sample_rate: default_output_rate(),
            connect_timeout_ms: default_connect_timeout(),
            setup_timeout_ms: default_setup_timeout(),
            context_compression: true,
        }
    }
}

/// File-backed tenant store location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantStoreConfig {
    #[serde(default = "default_repository_path")]
    pub repository_path: String,
}

fn default_repository_path() -> String {
    tenants::REPOSITORY_PATH.to_string()
}

impl Default for TenantStoreConfig {
    fn default() -> Self {
        Self {
            repository_path: default_repository_path(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: true,
        }
    }
}

/// Load settings from files and environment
///
/// Priority: env vars > config/{env}.yaml > config/default.yaml > defaults.
/// `PORT` overrides `server.port` for hosting platforms that assign one.
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("VOICE_RELAY")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let mut settings: Settings = config.try_deserialize()?;

    if let Ok(port) = std::env::var("PORT") {
        settings.server.port = port.parse().map_err(|_| {
            ConfigError::Environment(format!("PORT must be a port number, got '{}'", port))
        })?;
    }

    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8765);
        assert_eq!(settings.server.ws_path, "/media");
        assert_eq!(settings.audio.telephony_sample_rate, 8000);
        assert_eq!(settings.audio.backend_input_sample_rate, 16000);
        assert_eq!(settings.backend.output_sample_rate, 24000);
        assert_eq!(settings.turn.silence(), Duration::from_millis(500));
        assert_eq!(settings.session.max_call_duration(), Duration::from_secs(600));
        assert_eq!(settings.session.exit_grace(), Duration::from_secs(3));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_chunk_validation() {
        let mut settings = Settings::default();
        settings.audio.backend_chunk_bytes = 0;
        assert!(settings.validate().is_err());

        settings.audio.backend_chunk_bytes = 641;
        assert!(settings.validate().is_err());

        settings.audio.backend_chunk_bytes = 640;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_liveness_validation() {
        let mut settings = Settings::default();
        settings.liveness.check_interval_ms = settings.liveness.idle_threshold_ms;
        match settings.validate() {
            Err(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "liveness.check_interval_ms")
            }
            other => panic!("expected liveness error, got {:?}", other),
        }
    }

    #[test]
    fn test_silence_window_validation() {
        let mut settings = Settings::default();
        settings.turn.silence_ms = 10;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_ws_path_validation() {
        let mut settings = Settings::default();
        settings.server.ws_path = "media".to_string();
        assert!(settings.validate().is_err());

        settings.server.ws_path = "/media/".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_production_requires_api_key() {
        let mut settings = Settings::default();
        settings.environment = RuntimeEnvironment::Production;
        settings.backend.api_key = None;
        assert!(matches!(settings.validate(), Err(ConfigError::MissingField(_))));

        settings.backend.api_key = Some("key".to_string());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_backend_endpoint_scheme() {
        let mut settings = Settings::default();
        settings.backend.endpoint = "https://example.com".to_string();
        assert!(settings.validate().is_err());
    }
}
