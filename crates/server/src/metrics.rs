//! Prometheus metrics
//!
//! Recording goes through the `metrics` facade; without an installed
//! recorder every call is a no-op, which is what tests rely on.

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;

use voice_relay_core::{Leg, TerminationCause, TokenUsage};

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder; safe to call more than once
pub fn init_metrics() -> Option<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS.get() {
        return Some(handle.clone());
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = PROMETHEUS.set(handle.clone());
            Some(handle)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install Prometheus recorder");
            None
        }
    }
}

/// `GET /metrics`
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS.get() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics disabled").into_response(),
    }
}

pub fn set_active_sessions(count: usize) {
    metrics::gauge!("voice_relay_sessions_active").set(count as f64);
}

pub fn record_session_started() {
    metrics::counter!("voice_relay_sessions_total").increment(1);
}

pub fn record_rejection(reason: &'static str) {
    metrics::counter!("voice_relay_sessions_rejected_total", "reason" => reason).increment(1);
}

/// Frames relayed, labelled by the leg they were written to
pub fn record_frames(destination: Leg, count: u64) {
    if count > 0 {
        metrics::counter!("voice_relay_frames_total", "direction" => destination.as_str())
            .increment(count);
    }
}

pub fn record_keepalive() {
    metrics::counter!("voice_relay_keepalives_total").increment(1);
}

pub fn record_backend_reconnect() {
    metrics::counter!("voice_relay_backend_reconnects_total").increment(1);
}

pub fn record_termination(cause: &TerminationCause) {
    metrics::counter!("voice_relay_session_terminations_total", "cause" => cause.code())
        .increment(1);
}

/// Backend tokens as reported in-band
pub fn record_token_usage(usage: &TokenUsage) {
    let kinds = [
        ("prompt", usage.prompt_tokens),
        ("response", usage.response_tokens),
        ("total", usage.total_tokens),
    ];
    for (kind, count) in kinds {
        if count > 0 {
            metrics::counter!("voice_relay_backend_tokens_total", "kind" => kind).increment(count);
        }
    }
}

pub fn record_turn_flush(elapsed: Duration) {
    metrics::histogram!("voice_relay_turn_flush_ms").record(elapsed.as_secs_f64() * 1000.0);
}
