//! Voice Relay Server Entry Point

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use voice_relay_backend::{GeminiLiveConfig, GeminiLiveConnector};
use voice_relay_config::{load_settings, FileTenantStore, Settings};
use voice_relay_server::{create_router, init_metrics, AppState, SessionManager, TracingTranscriptSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Priority: env vars > config/{env}.yaml > config/default.yaml > defaults
    let env = std::env::var("VOICE_RELAY_ENV").ok();
    let config = match load_settings(env.as_deref()) {
        Ok(settings) => {
            // Tracing not yet initialized
            eprintln!(
                "Loaded configuration from files (env: {})",
                env.as_deref().unwrap_or("default")
            );
            settings
        }
        Err(e) => {
            eprintln!("Warning: Failed to load config: {}. Using defaults.", e);
            Settings::default()
        }
    };

    init_tracing(&config);

    tracing::info!("Starting Voice Relay Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        environment = ?config.environment,
        config_path = env.as_deref().unwrap_or("default"),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled && init_metrics().is_some() {
        tracing::info!("Initialized Prometheus metrics at /metrics");
    }

    let tenants = Arc::new(FileTenantStore::new(&config.tenants.repository_path));
    tracing::info!(repository = %config.tenants.repository_path, "Using file tenant store");

    let backend = GeminiLiveConfig::from_settings(&config.backend, &config.audio);
    if backend.api_key.is_none() {
        tracing::warn!("No backend API key configured; upstream connections will likely be refused");
    }
    tracing::info!(model = %backend.model, voice = %backend.voice, "Backend configured");
    let connector = Arc::new(GeminiLiveConnector::new(backend));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;
    let shutdown_timeout = config.server.shutdown_timeout();

    let state = AppState::new(config, tenants, connector, Arc::new(TracingTranscriptSink));
    let sessions = state.sessions.clone();
    let app = create_router(state);

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(sessions, shutdown_timeout))
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal, then close every live call
async fn shutdown(sessions: Arc<SessionManager>, timeout: std::time::Duration) {
    shutdown_signal().await;

    let active = sessions.count();
    let forced = sessions.shutdown_all(timeout).await;
    tracing::info!(active, forced, "Sessions closed");
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

/// Initialize tracing
fn init_tracing(config: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.observability.log_level;
        format!("voice_relay={},tower_http=info", level).into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if config.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    subscriber.with(fmt_layer).init();
}
