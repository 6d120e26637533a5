//! Runtime feature flags consulted per tenant before publishing.
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashSet;
use tracing::debug;

use crate::config::{ConsumerMode, RelayConfig};
use crate::error::{RelayError, Result};
use crate::models::TenantContext;

#[async_trait]
pub trait FeatureFlags: Send + Sync {
    /// Whether `flag` is switched on for `tenant`. Unset flags are on.
    async fn is_enabled(&self, flag: &str, tenant: &TenantContext) -> Result<bool>;
}

/// Flag names gating publication for each consumer mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishFlags {
    pub snapshot: String,
    pub streaming: String,
}

impl PublishFlags {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            snapshot: config.snapshot_publish_flag.clone(),
            streaming: config.streaming_publish_flag.clone(),
        }
    }

    pub fn for_mode(&self, mode: ConsumerMode) -> &str {
        match mode {
            ConsumerMode::Snapshot => &self.snapshot,
            ConsumerMode::Streaming => &self.streaming,
        }
    }
}

/// Flags fixed at startup from `DISABLED_FLAGS`.
#[derive(Debug, Clone, Default)]
pub struct StaticFeatureFlags {
    disabled: HashSet<(String, String)>,
}

impl StaticFeatureFlags {
    pub fn new(disabled: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            disabled: disabled.into_iter().collect(),
        }
    }

    pub fn all_enabled() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeatureFlags for StaticFeatureFlags {
    async fn is_enabled(&self, flag: &str, tenant: &TenantContext) -> Result<bool> {
        Ok(!self
            .disabled
            .contains(&(flag.to_string(), tenant.tenant_id.clone())))
    }
}

/// Flags stored in Redis as `{prefix}{flag}:{tenant}`.
///
/// A missing key means enabled; `false`, `0`, `off` and `disabled` switch the
/// flag off. Static overrides win over Redis.
pub struct RedisFeatureFlags {
    conn: ConnectionManager,
    key_prefix: String,
    overrides: StaticFeatureFlags,
}

impl RedisFeatureFlags {
    pub fn new(conn: ConnectionManager, key_prefix: String, overrides: StaticFeatureFlags) -> Self {
        Self {
            conn,
            key_prefix,
            overrides,
        }
    }

    fn flag_key(&self, flag: &str, tenant: &TenantContext) -> String {
        format!("{}{}:{}", self.key_prefix, flag, tenant.tenant_id)
    }
}

fn parse_flag_value(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "false" | "0" | "off" | "disabled"
    )
}

#[async_trait]
impl FeatureFlags for RedisFeatureFlags {
    async fn is_enabled(&self, flag: &str, tenant: &TenantContext) -> Result<bool> {
        if !self.overrides.is_enabled(flag, tenant).await? {
            return Ok(false);
        }

        let key = self.flag_key(flag, tenant);
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&key).await.map_err(RelayError::Redis)?;
        let enabled = raw.as_deref().map(parse_flag_value).unwrap_or(true);

        debug!(flag = %flag, tenant = %tenant.tenant_id, enabled, "Evaluated feature flag");
        Ok(enabled)
    }
}
