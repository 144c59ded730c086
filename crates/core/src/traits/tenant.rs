use async_trait::async_trait;

use crate::tenant::TenantConfig;
use crate::Result;

/// Tenant configuration lookup
///
/// Returns [`crate::Error::TenantNotFound`] for unknown tenants and
/// [`crate::Error::TenantInactive`] for tenants that exist but must not be
/// served.
#[async_trait]
pub trait TenantConfigProvider: Send + Sync + 'static {
    async fn load(&self, tenant_id: &str) -> Result<TenantConfig>;
}
