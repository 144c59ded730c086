//! Tenant configuration stores
//!
//! A tenant lives in its own directory under the repository root:
//!
//! ```text
//! tenant_repository/
//!   joy_invite/
//!     tenant.yaml           # optional manifest (display name, voice, exit messages, is_active, ...)
//!     prompts/assistant.txt # required system prompt
//!     prompts/greeting.txt  # optional, overrides greeting_text from the manifest
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use voice_relay_core::{
    AudioFormatHints, Error, ExitMessages, Result, TenantConfig, TenantConfigProvider,
};

use crate::constants::tenants;

/// On-disk manifest, every field optional
#[derive(Debug, Default, Deserialize)]
struct TenantManifest {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    greeting_text: Option<String>,
    #[serde(default)]
    voice: Option<String>,
    #[serde(default)]
    audio: AudioFormatHints,
    #[serde(default)]
    exit_messages: ExitMessages,
    #[serde(default = "default_active", alias = "is_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

/// Reads tenant configuration from a directory tree
#[derive(Debug, Clone)]
pub struct FileTenantStore {
    root: PathBuf,
}

impl FileTenantStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tenant_dir(&self, tenant_id: &str) -> Result<PathBuf> {
        // Ids become path segments; anything that could escape the root is unknown.
        if tenant_id.is_empty()
            || tenant_id.starts_with('.')
            || tenant_id.contains(|c: char| c == '/' || c == '\\')
        {
            return Err(Error::TenantNotFound(tenant_id.to_string()));
        }
        Ok(self.root.join(tenant_id))
    }

    async fn read_optional(path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[async_trait]
impl TenantConfigProvider for FileTenantStore {
    async fn load(&self, tenant_id: &str) -> Result<TenantConfig> {
        let dir = self.tenant_dir(tenant_id)?;
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(Error::TenantNotFound(tenant_id.to_string()));
        }

        let manifest = match Self::read_optional(&dir.join(tenants::MANIFEST_FILE)).await? {
            Some(raw) => serde_yaml::from_str::<TenantManifest>(&raw).map_err(|e| {
                Error::Malformed(format!("{}/{}: {}", tenant_id, tenants::MANIFEST_FILE, e))
            })?,
            None => TenantManifest {
                active: true,
                ..Default::default()
            },
        };

        if !manifest.active {
            return Err(Error::TenantInactive(tenant_id.to_string()));
        }

        let system_prompt = Self::read_optional(&dir.join(tenants::PROMPT_FILE))
            .await?
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    "Tenant directory has no {}",
                    tenants::PROMPT_FILE
                );
                Error::TenantNotFound(tenant_id.to_string())
            })?;

        let greeting_text = match Self::read_optional(&dir.join(tenants::GREETING_FILE)).await? {
            Some(g) => g.trim().to_string(),
            None => manifest.greeting_text.unwrap_or_default(),
        };

        tracing::debug!(
            tenant_id = %tenant_id,
            prompt_len = system_prompt.len(),
            has_greeting = !greeting_text.is_empty(),
            "Loaded tenant configuration"
        );

        Ok(TenantConfig {
            tenant_id: tenant_id.to_string(),
            display_name: manifest.display_name,
            system_prompt,
            greeting_text,
            audio: manifest.audio,
            voice: manifest.voice,
            exit_messages: manifest.exit_messages,
            active: true,
        })
    }
}

/// In-memory tenant table
#[derive(Debug, Default)]
pub struct StaticTenantStore {
    tenants: RwLock<HashMap<String, TenantConfig>>,
}

impl StaticTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, config: TenantConfig) {
        self.tenants.write().insert(config.tenant_id.clone(), config);
    }

    pub fn with(self, config: TenantConfig) -> Self {
        self.insert(config);
        self
    }
}

impl FromIterator<TenantConfig> for StaticTenantStore {
    fn from_iter<I: IntoIterator<Item = TenantConfig>>(iter: I) -> Self {
        let store = Self::new();
        for config in iter {
            store.insert(config);
        }
        store
    }
}

#[async_trait]
impl TenantConfigProvider for StaticTenantStore {
    async fn load(&self, tenant_id: &str) -> Result<TenantConfig> {
        let config = self
            .tenants
            .read()
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| Error::TenantNotFound(tenant_id.to_string()))?;
        if !config.active {
            return Err(Error::TenantInactive(tenant_id.to_string()));
        }
        Ok(config)
    }
}
