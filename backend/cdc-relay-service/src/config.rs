//! Configuration for the CDC relay service, loaded once from the environment.
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::models::TenantContext;

/// How a collection's stream is consumed.
///
/// `Snapshot` starts from the earliest position on a checkpoint miss (full
/// initial load); `Streaming` starts from the live end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerMode {
    Snapshot,
    Streaming,
}

impl ConsumerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerMode::Snapshot => "snapshot",
            ConsumerMode::Streaming => "streaming",
        }
    }
}

impl fmt::Display for ConsumerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsumerMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snapshot" => Ok(ConsumerMode::Snapshot),
            "streaming" => Ok(ConsumerMode::Streaming),
            other => Err(RelayError::Configuration(format!(
                "unknown consumer mode '{}'",
                other
            ))),
        }
    }
}

/// Replication-stream engines the relay knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Kafka,
}

impl FromStr for EngineKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kafka" => Ok(EngineKind::Kafka),
            other => Err(RelayError::Configuration(format!(
                "unknown connector type '{}'",
                other
            ))),
        }
    }
}

/// Per-collection overrides, supplied as a JSON object keyed by collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CollectionOverride {
    pub consumer_mode: Option<String>,
    pub batch_size: Option<usize>,
    pub bus_capacity: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub tenant_id: Option<String>,
}

/// Process-wide configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Logical connector name; half of every lock and checkpoint key
    pub connector_name: String,

    /// Comma separated list of collections to relay
    #[serde(default)]
    pub monitored_collections: String,

    #[serde(default = "default_consumer_mode")]
    pub consumer_mode: String,

    #[serde(default = "default_engine_kind")]
    pub engine_kind: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batch size used while a collection is in snapshot mode
    #[serde(default = "default_snapshot_fetch_size")]
    pub snapshot_fetch_size: usize,

    /// Bounded producer queue size per destination topic
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_connect_retry_attempts")]
    pub connect_retry_attempts: u32,

    #[serde(default = "default_connect_retry_min_backoff_ms")]
    pub connect_retry_min_backoff_ms: u64,

    #[serde(default = "default_connect_retry_max_backoff_ms")]
    pub connect_retry_max_backoff_ms: u64,

    #[serde(default = "default_lease_refresh_interval_ms")]
    pub lease_refresh_interval_ms: u64,

    /// Delay between attempts while another instance holds the lease
    #[serde(default = "default_lease_retry_interval_ms")]
    pub lease_retry_interval_ms: u64,

    #[serde(default = "default_lock_prefix")]
    pub lock_prefix: String,

    #[serde(default = "default_offset_key_prefix")]
    pub offset_key_prefix: String,

    /// Prepended to the source topic to form the destination topic
    #[serde(default)]
    pub destination_topic_prefix: String,

    /// Prepended to a collection name to form its change-stream topic
    #[serde(default = "default_source_topic_prefix")]
    pub source_topic_prefix: String,

    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,

    #[serde(default = "default_snapshot_publish_flag")]
    pub snapshot_publish_flag: String,

    #[serde(default = "default_streaming_publish_flag")]
    pub streaming_publish_flag: String,

    #[serde(default = "default_flag_key_prefix")]
    pub flag_key_prefix: String,

    /// Comma separated `flag:tenant` pairs switched off without Redis
    #[serde(default)]
    pub disabled_flags: String,

    #[serde(default = "default_kafka_brokers")]
    pub kafka_brokers: String,

    /// Brokers carrying the change streams; defaults to `kafka_brokers`
    #[serde(default)]
    pub source_kafka_brokers: Option<String>,

    #[serde(default = "default_kafka_send_timeout_ms")]
    pub kafka_send_timeout_ms: u64,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// When set, offsets are stored in Postgres instead of Redis
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_max_consecutive_batch_failures")]
    pub max_consecutive_batch_failures: u32,

    #[serde(default = "default_restart_min_backoff_ms")]
    pub restart_min_backoff_ms: u64,

    #[serde(default = "default_restart_max_backoff_ms")]
    pub restart_max_backoff_ms: u64,

    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// JSON object: `{"orders": {"consumer_mode": "snapshot"}}`
    #[serde(default)]
    pub collection_overrides: Option<String>,
}

fn default_consumer_mode() -> String {
    "streaming".to_string()
}

fn default_engine_kind() -> String {
    "kafka".to_string()
}

fn default_batch_size() -> usize {
    500
}

fn default_snapshot_fetch_size() -> usize {
    2000
}

fn default_bus_capacity() -> usize {
    100_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_connect_retry_attempts() -> u32 {
    5
}

fn default_connect_retry_min_backoff_ms() -> u64 {
    1_000
}

fn default_connect_retry_max_backoff_ms() -> u64 {
    30_000
}

fn default_lease_refresh_interval_ms() -> u64 {
    10_000
}

fn default_lease_retry_interval_ms() -> u64 {
    5_000
}

fn default_lock_prefix() -> String {
    "cdc:lock:".to_string()
}

fn default_offset_key_prefix() -> String {
    "cdc:offset:".to_string()
}

fn default_source_topic_prefix() -> String {
    "cdc.".to_string()
}

fn default_tenant_id() -> String {
    "default".to_string()
}

fn default_snapshot_publish_flag() -> String {
    "cdc-snapshot-publish".to_string()
}

fn default_streaming_publish_flag() -> String {
    "cdc-streaming-publish".to_string()
}

fn default_flag_key_prefix() -> String {
    "feature:".to_string()
}

fn default_kafka_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_kafka_send_timeout_ms() -> u64 {
    30_000
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_max_consecutive_batch_failures() -> u32 {
    10
}

fn default_restart_min_backoff_ms() -> u64 {
    1_000
}

fn default_restart_max_backoff_ms() -> u64 {
    60_000
}

fn default_shutdown_grace_ms() -> u64 {
    30_000
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> std::result::Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn collections(&self) -> Vec<String> {
        self.monitored_collections
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn engine_kind(&self) -> Result<EngineKind> {
        self.engine_kind.parse()
    }

    pub fn source_brokers(&self) -> &str {
        self.source_kafka_brokers
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.kafka_brokers)
    }

    pub fn lease_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.lease_refresh_interval_ms)
    }

    pub fn lease_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lease_retry_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn kafka_send_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_send_timeout_ms)
    }

    /// `(flag, tenant)` pairs disabled by static configuration
    pub fn disabled_flag_pairs(&self) -> Vec<(String, String)> {
        self.disabled_flags
            .split(',')
            .filter_map(|pair| {
                let (flag, tenant) = pair.trim().split_once(':')?;
                Some((flag.trim().to_string(), tenant.trim().to_string()))
            })
            .filter(|(flag, tenant)| !flag.is_empty() && !tenant.is_empty())
            .collect()
    }

    fn overrides(&self) -> Result<HashMap<String, CollectionOverride>> {
        match self.collection_overrides.as_deref().map(str::trim) {
            None | Some("") => Ok(HashMap::new()),
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                RelayError::Configuration(format!("invalid COLLECTION_OVERRIDES: {}", e))
            }),
        }
    }

    /// Merge global settings with per-collection overrides and validate.
    ///
    /// Any error here is surfaced before a single worker is scheduled.
    pub fn collection_configs(&self) -> Result<Vec<CollectionConfig>> {
        if self.connector_name.trim().is_empty() {
            return Err(RelayError::Configuration(
                "CONNECTOR_NAME must not be empty".to_string(),
            ));
        }
        self.engine_kind()?;

        if self.lease_refresh_interval_ms == 0 {
            return Err(RelayError::Configuration(
                "LEASE_REFRESH_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }
        if self.lease_retry_interval_ms == 0 {
            return Err(RelayError::Configuration(
                "LEASE_RETRY_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }

        let mut overrides = self.overrides()?;
        let collections = self.collections();

        let mut seen = HashSet::new();
        if let Some(duplicate) = collections.iter().find(|name| !seen.insert(name.as_str())) {
            return Err(RelayError::Configuration(format!(
                "collection '{}' is listed more than once",
                duplicate
            )));
        }

        if let Some(unknown) = overrides.keys().find(|name| !collections.contains(name)) {
            return Err(RelayError::Configuration(format!(
                "override given for unmonitored collection '{}'",
                unknown
            )));
        }

        collections
            .into_iter()
            .map(|collection| {
                let over = overrides.remove(&collection).unwrap_or_default();
                self.build_collection_config(collection, over)
            })
            .collect()
    }

    fn build_collection_config(
        &self,
        collection: String,
        over: CollectionOverride,
    ) -> Result<CollectionConfig> {
        let consumer_mode: ConsumerMode = over
            .consumer_mode
            .as_deref()
            .unwrap_or(&self.consumer_mode)
            .parse()?;

        let default_batch = match consumer_mode {
            ConsumerMode::Snapshot => self.snapshot_fetch_size,
            ConsumerMode::Streaming => self.batch_size,
        };
        let batch_size = over.batch_size.unwrap_or(default_batch);
        let bus_capacity = over.bus_capacity.unwrap_or(self.bus_capacity);

        if batch_size == 0 {
            return Err(RelayError::Configuration(format!(
                "batch size for '{}' must be greater than zero",
                collection
            )));
        }
        if bus_capacity == 0 {
            return Err(RelayError::Configuration(format!(
                "bus capacity for '{}' must be greater than zero",
                collection
            )));
        }
        let poll_interval_ms = over.poll_interval_ms.unwrap_or(self.poll_interval_ms);
        if poll_interval_ms == 0 {
            return Err(RelayError::Configuration(format!(
                "poll interval for '{}' must be greater than zero",
                collection
            )));
        }

        Ok(CollectionConfig {
            connector_name: self.connector_name.clone(),
            source_topic: format!("{}{}", self.source_topic_prefix, collection),
            monitored_collection: collection,
            consumer_mode,
            batch_size,
            bus_capacity,
            poll_interval_ms,
            tenant: TenantContext::new(over.tenant_id.unwrap_or_else(|| self.tenant_id.clone())),
            max_consecutive_batch_failures: self.max_consecutive_batch_failures,
        })
    }
}

/// Settings for one monitored collection.
///
/// `connector_name` + `monitored_collection` is the identity both the lock
/// name and the checkpoint key derive from; it must not change across
/// restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionConfig {
    pub connector_name: String,
    pub monitored_collection: String,
    pub consumer_mode: ConsumerMode,
    pub batch_size: usize,
    pub bus_capacity: usize,
    pub poll_interval_ms: u64,
    pub source_topic: String,
    pub tenant: TenantContext,
    pub max_consecutive_batch_failures: u32,
}

impl CollectionConfig {
    /// `connectorName-monitoredCollection`
    pub fn identity(&self) -> String {
        format!("{}-{}", self.connector_name, self.monitored_collection)
    }

    pub fn lock_name(&self, lock_prefix: &str) -> String {
        format!("{}{}", lock_prefix, self.identity())
    }
}
