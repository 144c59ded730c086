//! Session-scoped upstream link
//!
//! Owns the backend connection of one call. After an unexpected drop the
//! link may reconnect once with the same tenant configuration; a second
//! failure is final and surfaces as [`BackendError::Unavailable`].

use std::sync::Arc;

use voice_relay_config::constants::session::MAX_BACKEND_RECONNECTS;
use voice_relay_core::{AudioFrame, TenantConfig};

use crate::{BackendConnection, BackendConnector, BackendError, BackendEvent};

pub struct UpstreamLink {
    connector: Arc<dyn BackendConnector>,
    tenant: Arc<TenantConfig>,
    connection: Option<BackendConnection>,
    max_reconnects: u32,
    reconnects: u32,
}

impl UpstreamLink {
    pub fn new(connector: Arc<dyn BackendConnector>, tenant: Arc<TenantConfig>) -> Self {
        Self {
            connector,
            tenant,
            connection: None,
            max_reconnects: MAX_BACKEND_RECONNECTS,
            reconnects: 0,
        }
    }

    pub fn tenant(&self) -> &TenantConfig {
        &self.tenant
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// Reconnects performed so far
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// Open the initial connection, including the setup handshake
    pub async fn open(&mut self) -> Result<(), BackendError> {
        let connection = self.connector.connect(&self.tenant).await?;
        tracing::debug!(
            tenant_id = %self.tenant.tenant_id,
            connector = self.connector.name(),
            "Upstream link open"
        );
        self.connection = Some(connection);
        Ok(())
    }

    /// Replace a dropped connection, if the reconnect budget allows
    ///
    /// The fresh connection is configured exactly like the first one. No
    /// greeting is replayed.
    pub async fn recover(&mut self, reason: &str) -> Result<(), BackendError> {
        if let Some(mut stale) = self.connection.take() {
            let _ = stale.sender.close().await;
        }

        if self.reconnects >= self.max_reconnects {
            return Err(BackendError::Unavailable(format!(
                "{} (reconnect budget of {} spent)",
                reason, self.max_reconnects
            )));
        }
        self.reconnects += 1;

        tracing::warn!(
            tenant_id = %self.tenant.tenant_id,
            attempt = self.reconnects,
            reason,
            "Backend connection lost, reconnecting"
        );

        match self.connector.connect(&self.tenant).await {
            Ok(connection) => {
                self.connection = Some(connection);
                tracing::info!(tenant_id = %self.tenant.tenant_id, "Backend reconnected");
                Ok(())
            }
            Err(e) => Err(BackendError::Unavailable(format!("reconnect failed: {}", e))),
        }
    }

    /// Stream one caller frame, recovering once on failure
    pub async fn send_audio(&mut self, frame: &AudioFrame) -> Result<(), BackendError> {
        let first = match self.connection.as_mut() {
            Some(conn) => conn.sender.send_audio(frame).await,
            None => Err(BackendError::Closed),
        };
        match first {
            Ok(()) => Ok(()),
            Err(e) => {
                self.recover(&e.to_string()).await?;
                self.sender_mut()?.send_audio(frame).await.map_err(unavailable)
            }
        }
    }

    /// Stream one caller frame on the current connection only
    ///
    /// Used while the session is closing, when a reconnect would be wasted.
    pub async fn try_send_audio(&mut self, frame: &AudioFrame) -> Result<(), BackendError> {
        self.sender_mut()?.send_audio(frame).await
    }

    /// Send a complete text turn, recovering once on failure
    pub async fn send_text_turn(&mut self, text: &str) -> Result<(), BackendError> {
        let first = match self.connection.as_mut() {
            Some(conn) => conn.sender.send_text_turn(text).await,
            None => Err(BackendError::Closed),
        };
        match first {
            Ok(()) => Ok(()),
            Err(e) => {
                self.recover(&e.to_string()).await?;
                self.sender_mut()?.send_text_turn(text).await.map_err(unavailable)
            }
        }
    }

    /// Next backend event
    ///
    /// Cancel-safe. Does not recover by itself: `Ok(None)` or an error means
    /// the connection is gone and the caller decides whether to [`recover`].
    ///
    /// [`recover`]: UpstreamLink::recover
    pub async fn next_event(&mut self) -> Result<Option<BackendEvent>, BackendError> {
        match self.connection.as_mut() {
            Some(conn) => conn.receiver.next_event().await,
            None => Err(BackendError::Closed),
        }
    }

    /// Close the connection; idempotent
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            if let Err(e) = conn.sender.close().await {
                tracing::debug!(error = %e, "Backend close failed");
            }
        }
    }

    fn sender_mut(&mut self) -> Result<&mut Box<dyn crate::BackendSender>, BackendError> {
        self.connection
            .as_mut()
            .map(|conn| &mut conn.sender)
            .ok_or(BackendError::Closed)
    }
}

fn unavailable(err: BackendError) -> BackendError {
    match err {
        BackendError::Unavailable(_) => err,
        other => BackendError::Unavailable(other.to_string()),
    }
}
