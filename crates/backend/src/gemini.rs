//! Gemini Live connector
//!
//! Bidirectional WebSocket protocol:
//! - client sends `setup` once, waits for `setupComplete`
//! - caller audio goes out as `realtimeInput.audio` (base64 PCM16)
//! - text turns (the greeting) go out as `clientContent`
//! - `serverContent` carries assistant audio (`modelTurn.parts[].inlineData`),
//!   input/output transcription, `interrupted` and `turnComplete`
//! - `usageMetadata` reports token counts, surfaced as [`BackendEvent::Usage`]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use voice_relay_config::constants::backend as defaults;
use voice_relay_config::{AudioConfig, BackendConfig};
use voice_relay_core::{AudioFormat, AudioFrame, Leg, Role, TenantConfig, TokenUsage};

use crate::{
    BackendConnection, BackendConnector, BackendError, BackendEvent, BackendReceiver,
    BackendSender,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Gemini Live connection settings
#[derive(Debug, Clone)]
pub struct GeminiLiveConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    /// Rate declared for caller audio when frames do not say otherwise
    pub input_sample_rate: u32,
    /// Rate assumed for assistant audio without a `rate=` mime parameter
    pub output_sample_rate: u32,
    pub connect_timeout: Duration,
    pub setup_timeout: Duration,
    pub context_compression: bool,
}

impl GeminiLiveConfig {
    pub fn from_settings(backend: &BackendConfig, audio: &AudioConfig) -> Self {
        Self {
            endpoint: backend.endpoint.clone(),
            api_key: backend.api_key.clone(),
            model: backend.model.clone(),
            voice: backend.voice.clone(),
            input_sample_rate: audio.backend_input_sample_rate,
            output_sample_rate: backend.output_sample_rate,
            connect_timeout: backend.connect_timeout(),
            setup_timeout: backend.setup_timeout(),
            context_compression: backend.context_compression,
        }
    }

    fn url(&self) -> String {
        match &self.api_key {
            Some(key) => format!("{}?key={}", self.endpoint, key),
            None => self.endpoint.clone(),
        }
    }
}

impl Default for GeminiLiveConfig {
    fn default() -> Self {
        Self::from_settings(&BackendConfig::default(), &AudioConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
    input_audio_transcription: Empty,
    output_audio_transcription: Empty,
    #[serde(skip_serializing_if = "Option::is_none")]
    context_window_compression: Option<ContextWindowCompression>,
}

#[derive(Debug, Serialize, Default)]
struct Empty {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContextWindowCompression {
    trigger_tokens: u64,
    sliding_window: SlidingWindow,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SlidingWindow {
    target_tokens: u64,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_stream_end: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContent {
    turns: Vec<Content>,
    turn_complete: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    go_away: Option<GoAway>,
    #[serde(default)]
    error: Option<ServerErrorBody>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    input_transcription: Option<Transcription>,
    #[serde(default)]
    output_transcription: Option<Transcription>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Deserialize, Default)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    #[serde(default)]
    time_left: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default, alias = "inputTokenCount")]
    prompt_token_count: u64,
    #[serde(default, alias = "outputTokenCount", alias = "candidatesTokenCount")]
    response_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}

impl From<UsageMetadata> for TokenUsage {
    fn from(meta: UsageMetadata) -> Self {
        let total = if meta.total_token_count > 0 {
            meta.total_token_count
        } else {
            meta.prompt_token_count + meta.response_token_count
        };
        TokenUsage {
            prompt_tokens: meta.prompt_token_count,
            response_tokens: meta.response_token_count,
            total_tokens: total,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServerErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Sample rate from a mime type such as `audio/pcm;rate=24000`
fn rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

/// Decode one server message into relay events
///
/// `sequence` numbers assistant audio frames across the connection.
fn parse_server_message(
    raw: &str,
    default_rate: u32,
    sequence: &mut u64,
) -> Result<Vec<BackendEvent>, BackendError> {
    let message: ServerMessage = serde_json::from_str(raw)?;
    let mut events = Vec::new();

    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            for data in turn.parts.into_iter().filter_map(|p| p.inline_data) {
                let rate = data
                    .mime_type
                    .as_deref()
                    .and_then(rate_from_mime)
                    .unwrap_or(default_rate);
                let bytes = BASE64
                    .decode(data.data.as_bytes())
                    .map_err(|e| BackendError::Protocol(format!("audio payload: {}", e)))?;
                if bytes.is_empty() {
                    continue;
                }
                events.push(BackendEvent::Audio(AudioFrame::new(
                    bytes,
                    AudioFormat::pcm16_mono(rate),
                    *sequence,
                    Leg::Backend,
                )));
                *sequence += 1;
            }
        }

        let transcripts = [
            (Role::Caller, content.input_transcription),
            (Role::Assistant, content.output_transcription),
        ];
        for (role, transcription) in transcripts {
            if let Some(text) = transcription.and_then(|t| t.text).filter(|t| !t.is_empty()) {
                events.push(BackendEvent::Transcript { role, text });
            }
        }

        if content.interrupted {
            events.push(BackendEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(BackendEvent::TurnBoundary);
        }
    }

    if let Some(usage) = message.usage_metadata.map(TokenUsage::from) {
        if !usage.is_empty() {
            events.push(BackendEvent::Usage(usage));
        }
    }

    if let Some(go_away) = message.go_away {
        events.push(BackendEvent::GoAway {
            time_left: go_away.time_left,
        });
    }

    if let Some(error) = message.error {
        events.push(BackendEvent::Error {
            message: error.message.unwrap_or_else(|| "unspecified backend error".to_string()),
        });
    }

    Ok(events)
}

fn message_text(message: &Message) -> Option<std::borrow::Cow<'_, str>> {
    match message {
        Message::Text(text) => Some(std::borrow::Cow::Borrowed(text.as_str())),
        Message::Binary(bytes) => Some(String::from_utf8_lossy(bytes)),
        _ => None,
    }
}

/// Gemini Live connector
pub struct GeminiLiveConnector {
    config: GeminiLiveConfig,
}

impl GeminiLiveConnector {
    pub fn new(config: GeminiLiveConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GeminiLiveConfig {
        &self.config
    }

    fn setup_message(&self, tenant: &TenantConfig) -> ClientMessage {
        let voice = tenant
            .voice
            .clone()
            .unwrap_or_else(|| self.config.voice.clone());

        ClientMessage::Setup(Setup {
            model: self.config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO"],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig { voice_name: voice },
                    },
                },
            },
            system_instruction: Content {
                role: None,
                parts: vec![TextPart {
                    text: tenant.system_prompt.clone(),
                }],
            },
            input_audio_transcription: Empty::default(),
            output_audio_transcription: Empty::default(),
            context_window_compression: self.config.context_compression.then(|| {
                ContextWindowCompression {
                    trigger_tokens: defaults::COMPRESSION_TRIGGER_TOKENS,
                    sliding_window: SlidingWindow {
                        target_tokens: defaults::COMPRESSION_TARGET_TOKENS,
                    },
                }
            }),
        })
    }

    async fn await_setup_complete(stream: &mut SplitStream<WsStream>) -> Result<(), BackendError> {
        while let Some(message) = stream.next().await {
            let message = message?;
            if let Message::Close(frame) = &message {
                return Err(BackendError::Handshake(format!(
                    "closed during setup: {}",
                    frame
                        .as_ref()
                        .map(|f| f.reason.to_string())
                        .unwrap_or_default()
                )));
            }
            let Some(text) = message_text(&message) else {
                continue;
            };
            let parsed: ServerMessage = serde_json::from_str(&text)?;
            if parsed.setup_complete.is_some() {
                return Ok(());
            }
            if let Some(error) = parsed.error {
                return Err(BackendError::Handshake(
                    error.message.unwrap_or_else(|| "setup rejected".to_string()),
                ));
            }
        }
        Err(BackendError::Handshake("connection closed before setupComplete".to_string()))
    }
}

#[async_trait]
impl BackendConnector for GeminiLiveConnector {
    async fn connect(&self, tenant: &TenantConfig) -> Result<BackendConnection, BackendError> {
        let (ws, _response) = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(self.config.url()),
        )
        .await
        .map_err(|_| BackendError::Timeout("connect".to_string()))??;

        let (mut sink, mut stream) = ws.split();

        let setup = serde_json::to_string(&self.setup_message(tenant))?;
        sink.send(Message::Text(setup))
            .await
            .map_err(|e| BackendError::Handshake(e.to_string()))?;

        tokio::time::timeout(self.config.setup_timeout, Self::await_setup_complete(&mut stream))
            .await
            .map_err(|_| BackendError::Timeout("setupComplete".to_string()))??;

        tracing::info!(
            tenant_id = %tenant.tenant_id,
            model = %self.config.model,
            "Backend session configured"
        );

        Ok(BackendConnection {
            sender: Box::new(GeminiSender {
                sink,
                closed: false,
            }),
            receiver: Box::new(GeminiReceiver {
                stream,
                pending: VecDeque::new(),
                output_rate: self.config.output_sample_rate,
                sequence: 0,
            }),
        })
    }

    fn name(&self) -> &str {
        "gemini-live"
    }
}

struct GeminiSender {
    sink: SplitSink<WsStream, Message>,
    closed: bool,
}

impl GeminiSender {
    async fn send_json(&mut self, message: &ClientMessage) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        let text = serde_json::to_string(message)?;
        self.sink.send(Message::Text(text)).await?;
        Ok(())
    }
}

#[async_trait]
impl BackendSender for GeminiSender {
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<(), BackendError> {
        let message = ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(Blob {
                mime_type: format!("audio/pcm;rate={}", frame.sample_rate()),
                data: BASE64.encode(frame.payload()),
            }),
            audio_stream_end: None,
        });
        self.send_json(&message).await
    }

    async fn send_text_turn(&mut self, text: &str) -> Result<(), BackendError> {
        let message = ClientMessage::ClientContent(ClientContent {
            turns: vec![Content {
                role: Some("user"),
                parts: vec![TextPart {
                    text: text.to_string(),
                }],
            }],
            turn_complete: true,
        });
        self.send_json(&message).await
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        if self.closed {
            return Ok(());
        }
        let end = ClientMessage::RealtimeInput(RealtimeInput {
            audio: None,
            audio_stream_end: Some(true),
        });
        if let Err(e) = self.send_json(&end).await {
            tracing::debug!(error = %e, "Failed to signal end of audio stream");
        }
        self.closed = true;
        self.sink.close().await?;
        Ok(())
    }
}

struct GeminiReceiver {
    stream: SplitStream<WsStream>,
    pending: VecDeque<BackendEvent>,
    output_rate: u32,
    sequence: u64,
}

#[async_trait]
impl BackendReceiver for GeminiReceiver {
    async fn next_event(&mut self) -> Result<Option<BackendEvent>, BackendError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            let message = match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(e.into()),
            };

            if let Message::Close(frame) = &message {
                tracing::debug!(
                    reason = ?frame.as_ref().map(|f| f.reason.to_string()),
                    "Backend closed connection"
                );
                return Ok(None);
            }

            let Some(text) = message_text(&message) else {
                continue;
            };
            match parse_server_message(&text, self.output_rate, &mut self.sequence) {
                Ok(events) => self.pending.extend(events),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed backend message"),
            }
        }
    }
}
