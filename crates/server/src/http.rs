//! HTTP Endpoints
//!
//! Telephony media route plus read-only introspection.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::metrics::metrics_handler;
use crate::state::AppState;
use crate::websocket::{media_handler, missing_tenant_handler};
use crate::{ServerError, SessionInfo};

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let ws_path = state.config.server.ws_path.trim_end_matches('/').to_string();
    let cors_layer = if state.config.server.cors_enabled {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };

    Router::new()
        // Telephony media
        .route(&format!("{}/:tenant_id", ws_path), get(media_handler))
        .route(&ws_path, get(missing_tenant_handler))

        // Introspection
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(get_session))

        // Health check
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))

        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

/// Get session info
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ServerError> {
    state
        .sessions
        .get(&id)
        .map(Json)
        .ok_or(ServerError::SessionNotFound(id))
}

/// List sessions
async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.sessions.list();
    Json(serde_json::json!({
        "sessions": sessions,
        "count": sessions.len(),
    }))
}

/// Health check
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness check; not ready while at capacity
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.sessions.count();
    let max_sessions = state.sessions.max_sessions();
    let status = if sessions < max_sessions {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if status.is_success() { "ready" } else { "at_capacity" },
            "sessions": sessions,
            "max_sessions": max_sessions,
        })),
    )
}
