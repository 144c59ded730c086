//! Telephony WebSocket boundary
//!
//! Exotel-style JSON event stream. Provider events are decoded exactly once
//! here into [`InboundMessage`]; outbound messages are encoded here as well.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

use voice_relay_config::constants::{liveness::KEEPALIVE_MARK, tenants::ID_PATTERN};
use voice_relay_core::{
    AudioFormat, CallStart, Error, InboundAudio, InboundMessage, OutboundMessage, Result,
    TelephonySink, TelephonySource,
};

use crate::session::Session;
use crate::state::AppState;
use crate::ServerError;

static TENANT_ID: Lazy<std::result::Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(ID_PATTERN));

/// Whether `id` is an acceptable tenant path segment
pub fn is_valid_tenant_id(id: &str) -> bool {
    matches!(&*TENANT_ID, Ok(re) if re.is_match(id))
}

// ---- inbound wire format ----

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ExotelEvent {
    Connected {},
    Start {
        start: StartPayload,
    },
    Media {
        media: MediaPayload,
    },
    Dtmf {
        dtmf: DtmfPayload,
    },
    Mark {
        #[serde(default)]
        mark: Option<MarkPayload>,
    },
    Clear {},
    Stop {
        #[serde(default)]
        stop: Option<StopPayload>,
    },
    SpeechStarted {},
}

#[derive(Debug, Deserialize)]
struct StartPayload {
    #[serde(default)]
    stream_sid: Option<String>,
    #[serde(default)]
    call_sid: Option<String>,
    #[serde(default)]
    account_sid: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    custom_parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    media_format: Option<MediaFormat>,
}

#[derive(Debug, Deserialize)]
struct MediaFormat {
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default, deserialize_with = "lenient_u32")]
    sample_rate: Option<u32>,
    #[serde(default, deserialize_with = "lenient_u32")]
    channels: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
    #[serde(default, deserialize_with = "lenient_u32")]
    rate: Option<u32>,
    #[serde(default, deserialize_with = "lenient_u32")]
    sample_rate: Option<u32>,
    #[serde(default, deserialize_with = "lenient_u32")]
    channels: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct DtmfPayload {
    digit: String,
}

#[derive(Debug, Deserialize)]
struct MarkPayload {
    name: String,
}

#[derive(Debug, Deserialize)]
struct StopPayload {
    #[serde(default)]
    reason: Option<String>,
}

/// Providers send numeric fields either as numbers or as strings
fn lenient_u32<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Number(u32),
        Text(String),
    }

    match Option::<Lenient>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Lenient::Number(n)) => Ok(Some(n)),
        Some(Lenient::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("expected a number, got '{}'", s))),
    }
}

fn channels(value: Option<u32>, current: u16) -> u16 {
    value.and_then(|c| u16::try_from(c).ok()).unwrap_or(current)
}

/// Decode one text frame; `format` tracks the caller audio format announced
/// by the provider so far
fn decode_event(text: &str, format: &mut AudioFormat) -> Result<InboundMessage> {
    let event: ExotelEvent =
        serde_json::from_str(text).map_err(|e| Error::Malformed(e.to_string()))?;

    let message = match event {
        ExotelEvent::Connected {} => InboundMessage::Connected,
        ExotelEvent::Start { start } => {
            let media_format = start.media_format.and_then(|mf| {
                if let Some(encoding) = mf.encoding.as_deref() {
                    tracing::debug!(encoding, "Provider media encoding");
                }
                mf.sample_rate.map(|rate| AudioFormat {
                    sample_rate: rate,
                    channels: channels(mf.channels, 1),
                    bit_depth: 16,
                })
            });
            if let Some(announced) = media_format {
                *format = announced;
            }
            InboundMessage::Start(CallStart {
                stream_id: start.stream_sid,
                call_id: start.call_sid,
                account_id: start.account_sid,
                from: start.from,
                to: start.to,
                custom_parameters: start
                    .custom_parameters
                    .into_iter()
                    .map(|(k, v)| match v {
                        serde_json::Value::String(s) => (k, s),
                        other => (k, other.to_string()),
                    })
                    .collect(),
                media_format,
            })
        }
        ExotelEvent::Media { media } => {
            let payload = BASE64
                .decode(media.payload.as_bytes())
                .map_err(|e| Error::Malformed(format!("media payload: {}", e)))?;
            if let Some(rate) = media.rate.or(media.sample_rate) {
                format.sample_rate = rate;
            }
            format.channels = channels(media.channels, format.channels);
            InboundMessage::Audio(InboundAudio {
                payload,
                format: *format,
            })
        }
        ExotelEvent::Dtmf { dtmf } => InboundMessage::Dtmf { digit: dtmf.digit },
        ExotelEvent::Mark { mark } => InboundMessage::Mark {
            name: mark.map(|m| m.name).unwrap_or_default(),
        },
        ExotelEvent::Clear {} => InboundMessage::Clear,
        ExotelEvent::Stop { stop } => InboundMessage::Stop {
            reason: stop.and_then(|s| s.reason),
        },
        ExotelEvent::SpeechStarted {} => InboundMessage::SpeechStarted,
    };
    Ok(message)
}

// ---- outbound wire format ----

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum OutboundEvent {
    Media {
        sequence_number: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
        media: OutboundMedia,
    },
    Mark {
        sequence_number: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
        mark: OutboundMark,
    },
    Status {
        sequence_number: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
        status: OutboundStatus,
    },
    Error {
        sequence_number: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
        error: OutboundError,
    },
}

#[derive(Debug, Serialize)]
struct OutboundMedia {
    payload: String,
}

#[derive(Debug, Serialize)]
struct OutboundMark {
    name: String,
}

#[derive(Debug, Serialize)]
struct OutboundStatus {
    state: String,
}

#[derive(Debug, Serialize)]
struct OutboundError {
    code: String,
    message: String,
}

/// Outbound numbering for one telephony stream
#[derive(Debug, Default)]
struct ExotelEncoder {
    stream_sid: Option<String>,
    sequence_number: u64,
    audio_chunks: u64,
}

impl ExotelEncoder {
    fn next_sequence(&mut self) -> u64 {
        self.sequence_number += 1;
        self.sequence_number
    }

    /// Encode one message into the text frames to write, in order
    fn encode(&mut self, message: OutboundMessage) -> Result<Vec<String>> {
        let mut events = Vec::with_capacity(2);
        match message {
            OutboundMessage::Audio(frame) => {
                self.audio_chunks += 1;
                events.push(self.render(|seq, sid| OutboundEvent::Media {
                    sequence_number: seq,
                    stream_sid: sid,
                    media: OutboundMedia {
                        payload: BASE64.encode(frame.payload()),
                    },
                })?);
                let name = format!("audio_chunk_{}", self.audio_chunks);
                events.push(self.render(|seq, sid| OutboundEvent::Mark {
                    sequence_number: seq,
                    stream_sid: sid,
                    mark: OutboundMark { name },
                })?);
            }
            OutboundMessage::KeepAlive => {
                events.push(self.render(|seq, sid| OutboundEvent::Mark {
                    sequence_number: seq,
                    stream_sid: sid,
                    mark: OutboundMark {
                        name: KEEPALIVE_MARK.to_string(),
                    },
                })?);
            }
            OutboundMessage::Status { state } => {
                events.push(self.render(|seq, sid| OutboundEvent::Status {
                    sequence_number: seq,
                    stream_sid: sid,
                    status: OutboundStatus { state },
                })?);
            }
            OutboundMessage::Terminal { code, message } => {
                events.push(self.render(|seq, sid| OutboundEvent::Error {
                    sequence_number: seq,
                    stream_sid: sid,
                    error: OutboundError { code, message },
                })?);
            }
        }
        Ok(events)
    }

    fn render<F>(&mut self, build: F) -> Result<String>
    where
        F: FnOnce(u64, Option<String>) -> OutboundEvent,
    {
        let sequence = self.next_sequence();
        let event = build(sequence, self.stream_sid.clone());
        Ok(serde_json::to_string(&event)?)
    }
}

// ---- transport halves ----

/// Read half of a telephony WebSocket
pub struct ExotelSource {
    stream: SplitStream<WebSocket>,
    format: AudioFormat,
}

impl ExotelSource {
    pub fn new(stream: SplitStream<WebSocket>, sample_rate: u32) -> Self {
        Self {
            stream,
            format: AudioFormat::pcm16_mono(sample_rate),
        }
    }
}

#[async_trait]
impl TelephonySource for ExotelSource {
    async fn recv(&mut self) -> Option<Result<InboundMessage>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(Error::Transport(e.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(decode_event(&text, &mut self.format)),
                Message::Binary(payload) => {
                    return Some(Ok(InboundMessage::Audio(InboundAudio {
                        payload,
                        format: self.format,
                    })))
                }
                Message::Close(frame) => {
                    tracing::debug!(?frame, "Telephony socket closed by peer");
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }
}

/// Write half of a telephony WebSocket
pub struct ExotelSink {
    sender: SplitSink<WebSocket, Message>,
    encoder: ExotelEncoder,
}

impl ExotelSink {
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sender,
            encoder: ExotelEncoder::default(),
        }
    }
}

#[async_trait]
impl TelephonySink for ExotelSink {
    async fn send(&mut self, message: OutboundMessage) -> Result<()> {
        for text in self.encoder.encode(message)? {
            self.sender
                .send(Message::Text(text))
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.sender
            .close()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    fn bind_call(&mut self, call: &CallStart) {
        if call.stream_id.is_none() {
            tracing::warn!("Start message carried no stream id; audio is sent without one");
        }
        self.encoder.stream_sid = call.stream_id.clone();
    }
}

// ---- handlers ----

/// `GET {ws_path}/:tenant_id`
///
/// Tenant and capacity checks run before the upgrade, so a rejected call
/// never gets a session or a backend connection.
pub async fn media_handler(
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Response {
    if !is_valid_tenant_id(&tenant_id) {
        return reject(ServerError::InvalidTenant(tenant_id));
    }
    if !state.sessions.has_capacity() {
        return reject(ServerError::AtCapacity(state.sessions.count()));
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return reject(ServerError::WebSocket(rejection.to_string())),
    };

    ws.on_upgrade(move |socket| run_socket(socket, state, tenant_id))
}

/// `GET {ws_path}` without a tenant segment
pub async fn missing_tenant_handler() -> Response {
    reject(ServerError::MissingTenant)
}

fn reject(err: ServerError) -> Response {
    tracing::info!(error = %err, "Rejected telephony connection");
    crate::metrics::record_rejection(err.reason());
    err.into_response()
}

async fn run_socket(socket: WebSocket, state: AppState, tenant_id: String) {
    let (sender, receiver) = socket.split();
    let source = ExotelSource::new(receiver, state.config.audio.telephony_sample_rate);
    let sink = ExotelSink::new(sender);

    let session = Session::new(tenant_id, state.session_deps(), Box::new(source), Box::new(sink));
    let session_id = session.id().to_string();

    let handle = match state.sessions.spawn(session) {
        Ok(handle) => handle,
        Err(e) => {
            // Capacity was taken between the check and the upgrade
            tracing::warn!(error = %e, "Dropping upgraded connection");
            crate::metrics::record_rejection(e.reason());
            return;
        }
    };

    if let Err(e) = handle.await {
        if e.is_panic() {
            tracing::error!(session_id = %session_id, "Session task panicked");
            state.sessions.remove(&session_id);
        }
    }
}
