/// Replication-stream engine boundary
///
/// The engine tails a collection's change stream, hands batches to a
/// `ChangeConsumer`, and persists its position through the per-collection
/// `CheckpointStore` when a batch is finished.
///
/// # Guarantees
/// - At-least-once: unacknowledged records are redelivered first on the next poll
/// - In-order: records of one collection reach the consumer in source order
/// - Checkpoint advances only on `mark_batch_finished`
pub mod kafka;

pub use kafka::{KafkaChangeSource, KafkaEngineFactory};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointStore, OffsetStorageConfig, OFFSET_STORAGE_PROPERTY};
use crate::config::{CollectionConfig, ConsumerMode};
use crate::consumer::{ChangeConsumer, Committer};
use crate::error::{RelayError, Result};
use crate::models::ChangeRecord;

/// Next offset to read, per source partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    next_offsets: BTreeMap<i32, i64>,
}

impl SourcePosition {
    pub fn next_offset(&self, partition: i32) -> Option<i64> {
        self.next_offsets.get(&partition).copied()
    }

    pub fn partitions(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.next_offsets.iter().map(|(p, o)| (*p, *o))
    }

    /// Record that `offset` in `partition` was processed. Never moves back.
    pub fn advance(&mut self, partition: i32, offset: i64) {
        let next = offset.saturating_add(1);
        let entry = self.next_offsets.entry(partition).or_insert(next);
        if *entry < next {
            *entry = next;
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            RelayError::Checkpoint(format!("stored position is not readable: {}", e))
        })
    }
}

/// Source of raw change records for one collection.
#[async_trait]
pub trait ChangeSource: Send {
    /// Connect and position the source. `None` means no checkpoint: snapshot
    /// mode starts at the earliest record, streaming mode at the live end.
    async fn start_from(
        &mut self,
        position: Option<&SourcePosition>,
        mode: ConsumerMode,
    ) -> Result<()>;

    /// Up to `max` records, waiting at most `wait` for the first one.
    async fn poll(&mut self, max: usize, wait: Duration) -> Result<Vec<ChangeRecord>>;
}

#[async_trait]
pub trait ReplicationEngine: Send {
    /// Run until `stop` turns true (returns `Ok`) or a fatal error occurs.
    async fn run(
        &mut self,
        consumer: Arc<dyn ChangeConsumer>,
        stop: watch::Receiver<bool>,
    ) -> Result<()>;
}

/// Builds an engine from its property blob.
pub trait EngineFactory: Send + Sync {
    fn create(&self, properties: &EngineProperties) -> Result<Box<dyn ReplicationEngine>>;
}

const PROP_COLLECTION: &str = "collection";
const PROP_SOURCE_TOPIC: &str = "source.topic";
const PROP_CONSUMER_MODE: &str = "consumer.mode";
const PROP_BATCH_SIZE: &str = "batch.size";
const PROP_POLL_INTERVAL_MS: &str = "poll.interval.ms";
const PROP_MAX_BATCH_FAILURES: &str = "max.consecutive.batch.failures";

/// String properties handed to an engine factory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineProperties {
    values: BTreeMap<String, String>,
}

impl EngineProperties {
    pub fn for_collection(collection: &CollectionConfig, offset_key_prefix: &str) -> Result<Self> {
        let storage = OffsetStorageConfig {
            key_prefix: offset_key_prefix.to_string(),
            connector_name: collection.connector_name.clone(),
            monitored_collection: collection.monitored_collection.clone(),
        };

        let mut properties = Self::default();
        properties.set(OFFSET_STORAGE_PROPERTY, serde_json::to_string(&storage)?);
        properties.set(PROP_COLLECTION, &collection.monitored_collection);
        properties.set(PROP_SOURCE_TOPIC, &collection.source_topic);
        properties.set(PROP_CONSUMER_MODE, collection.consumer_mode.as_str());
        properties.set(PROP_BATCH_SIZE, collection.batch_size.to_string());
        properties.set(PROP_POLL_INTERVAL_MS, collection.poll_interval_ms.to_string());
        properties.set(
            PROP_MAX_BATCH_FAILURES,
            collection.max_consecutive_batch_failures.to_string(),
        );
        Ok(properties)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            RelayError::Configuration(format!("engine property '{}' is missing", key))
        })
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<T> {
        let raw = self.require(key)?;
        raw.parse().map_err(|_| {
            RelayError::Configuration(format!("engine property '{}' has invalid value '{}'", key, raw))
        })
    }

    pub fn offset_storage_config(&self) -> Result<OffsetStorageConfig> {
        let raw = self.require(OFFSET_STORAGE_PROPERTY)?;
        serde_json::from_str(raw).map_err(|e| {
            RelayError::Configuration(format!("invalid {}: {}", OFFSET_STORAGE_PROPERTY, e))
        })
    }

    pub fn settings(&self) -> Result<EngineSettings> {
        let settings = EngineSettings {
            collection: self.require(PROP_COLLECTION)?.to_string(),
            source_topic: self.require(PROP_SOURCE_TOPIC)?.to_string(),
            mode: self.require(PROP_CONSUMER_MODE)?.parse()?,
            batch_size: self.parse(PROP_BATCH_SIZE)?,
            poll_interval: Duration::from_millis(self.parse(PROP_POLL_INTERVAL_MS)?),
            max_consecutive_batch_failures: self.parse(PROP_MAX_BATCH_FAILURES)?,
        };
        if settings.batch_size == 0 {
            return Err(RelayError::Configuration(
                "engine batch size must be greater than zero".to_string(),
            ));
        }
        Ok(settings)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub collection: String,
    pub source_topic: String,
    pub mode: ConsumerMode,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_consecutive_batch_failures: u32,
}

/// Bounds for retrying source connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRetry {
    pub attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl ConnectRetry {
    /// Exponential backoff: min * 2^attempt, capped at max
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.min_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 >= self.attempts.max(1) => {
                    error!(attempts = attempt + 1, "{} failed, giving up: {}", what, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.attempts,
                        backoff_ms = delay.as_millis() as u64,
                        "{} failed, retrying: {}",
                        what,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Committer handed to the consumer for one batch.
pub struct EngineCommitter<'a> {
    checkpoint: &'a CheckpointStore,
    position: &'a mut SourcePosition,
    acknowledged: usize,
}

impl<'a> EngineCommitter<'a> {
    pub fn new(checkpoint: &'a CheckpointStore, position: &'a mut SourcePosition) -> Self {
        Self {
            checkpoint,
            position,
            acknowledged: 0,
        }
    }

    pub fn acknowledged(&self) -> usize {
        self.acknowledged
    }
}

#[async_trait]
impl Committer for EngineCommitter<'_> {
    async fn mark_processed(&mut self, record: &ChangeRecord) -> Result<()> {
        if let Some((partition, offset)) = record.position() {
            self.position.advance(partition, offset);
        }
        self.acknowledged += 1;
        Ok(())
    }

    async fn mark_batch_finished(&mut self) -> Result<()> {
        self.checkpoint.save(self.position.to_bytes()?).await;
        self.checkpoint.flush().await
    }
}

/// Generic engine loop over any `ChangeSource`.
pub struct StreamEngine<S: ChangeSource> {
    source: S,
    checkpoint: CheckpointStore,
    settings: EngineSettings,
}

impl<S: ChangeSource> StreamEngine<S> {
    pub fn new(source: S, checkpoint: CheckpointStore, settings: EngineSettings) -> Self {
        Self {
            source,
            checkpoint,
            settings,
        }
    }

    async fn restore_position(&mut self) -> Result<Option<SourcePosition>> {
        match self.checkpoint.load().await? {
            Some(bytes) => {
                let position = SourcePosition::from_bytes(&bytes)?;
                info!(
                    collection = %self.settings.collection,
                    key = %self.checkpoint.key(),
                    partitions = position.partitions().count(),
                    "Resuming from stored checkpoint"
                );
                Ok(Some(position))
            }
            None => {
                info!(
                    collection = %self.settings.collection,
                    mode = %self.settings.mode,
                    "No checkpoint stored, starting from the mode's default position"
                );
                Ok(None)
            }
        }
    }
}

/// True once a stop was requested or the stop sender is gone.
fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

#[async_trait]
impl<S: ChangeSource> ReplicationEngine for StreamEngine<S> {
    async fn run(
        &mut self,
        consumer: Arc<dyn ChangeConsumer>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        let restored = self.restore_position().await?;
        self.source
            .start_from(restored.as_ref(), self.settings.mode)
            .await?;

        let mut position = restored.unwrap_or_default();
        let mut pending: VecDeque<ChangeRecord> = VecDeque::new();
        let mut consecutive_failures: u32 = 0;
        let batch_size = self.settings.batch_size;

        info!(
            collection = %self.settings.collection,
            topic = %self.settings.source_topic,
            batch_size,
            "Replication engine started"
        );

        loop {
            if stop_requested(&stop) {
                info!(collection = %self.settings.collection, "Replication engine stopping");
                return Ok(());
            }

            if pending.len() < batch_size {
                // Redeliver the unacknowledged tail right away
                let wait = if pending.is_empty() {
                    self.settings.poll_interval
                } else {
                    Duration::ZERO
                };
                let polled = tokio::select! {
                    polled = self.source.poll(batch_size - pending.len(), wait) => polled?,
                    _ = stop.changed() => continue,
                };
                pending.extend(polled);
            }

            if pending.is_empty() {
                continue;
            }

            let batch: Vec<ChangeRecord> = pending.iter().take(batch_size).cloned().collect();
            let mut committer = EngineCommitter::new(&self.checkpoint, &mut position);
            let result = consumer.handle_batch(&batch, &mut committer).await;
            let acknowledged = committer.acknowledged().min(batch.len());
            pending.drain(..acknowledged);

            match result {
                Ok(()) => {
                    consecutive_failures = 0;
                    debug!(
                        collection = %self.settings.collection,
                        records = batch.len(),
                        "Batch committed"
                    );
                }
                Err(e) if !e.is_retryable() => {
                    error!(
                        collection = %self.settings.collection,
                        fatal = e.is_fatal_for_controller(),
                        "Batch failed with a non-retryable error: {}",
                        e
                    );
                    return Err(e);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.settings.max_consecutive_batch_failures {
                        error!(
                            collection = %self.settings.collection,
                            consecutive_failures,
                            "Batches keep failing, giving up: {}",
                            e
                        );
                        return Err(RelayError::Publish(format!(
                            "{} consecutive failed batches for {}: {}",
                            consecutive_failures, self.settings.collection, e
                        )));
                    }

                    warn!(
                        collection = %self.settings.collection,
                        consecutive_failures,
                        redeliver = pending.len(),
                        "Batch failed, redelivering unacknowledged records: {}",
                        e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                        _ = stop.changed() => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection() -> CollectionConfig {
        CollectionConfig {
            connector_name: "conn1".into(),
            monitored_collection: "coll1".into(),
            consumer_mode: ConsumerMode::Streaming,
            batch_size: 3,
            bus_capacity: 16,
            poll_interval_ms: 5,
            source_topic: "cdc.coll1".into(),
            tenant: crate::models::TenantContext::new("acme"),
            max_consecutive_batch_failures: 4,
        }
    }

    #[test]
    fn test_position_advances_monotonically() {
        let mut position = SourcePosition::default();
        position.advance(0, 10);
        position.advance(0, 4);
        position.advance(2, 0);

        assert_eq!(position.next_offset(0), Some(11));
        assert_eq!(position.next_offset(2), Some(1));
        assert_eq!(position.next_offset(1), None);

        let restored = SourcePosition::from_bytes(&position.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, position);
        assert!(SourcePosition::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_properties_carry_offset_storage_config() {
        let properties = EngineProperties::for_collection(&collection(), "cdc:offset:").unwrap();

        let storage = properties.offset_storage_config().unwrap();
        assert_eq!(storage.offset_key(), "cdc:offset:conn1-coll1");

        let settings = properties.settings().unwrap();
        assert_eq!(settings.collection, "coll1");
        assert_eq!(settings.source_topic, "cdc.coll1");
        assert_eq!(settings.mode, ConsumerMode::Streaming);
        assert_eq!(settings.batch_size, 3);
        assert_eq!(settings.poll_interval, Duration::from_millis(5));
        assert_eq!(settings.max_consecutive_batch_failures, 4);
    }

    #[test]
    fn test_invalid_properties_are_configuration_errors() {
        let mut properties = EngineProperties::for_collection(&collection(), "p:").unwrap();
        properties.set(PROP_CONSUMER_MODE, "bulk");
        assert!(matches!(
            properties.settings(),
            Err(RelayError::Configuration(_))
        ));

        let mut properties = EngineProperties::for_collection(&collection(), "p:").unwrap();
        properties.set(PROP_BATCH_SIZE, "many");
        assert!(matches!(
            properties.settings(),
            Err(RelayError::Configuration(_))
        ));

        assert!(EngineProperties::default().offset_storage_config().is_err());
    }

    #[test]
    fn test_connect_backoff_is_capped() {
        let retry = ConnectRetry {
            attempts: 5,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        assert_eq!(retry.backoff(3), Duration::from_millis(500));
        assert_eq!(retry.backoff(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_connect_retry_gives_up_after_attempts() {
        let retry = ConnectRetry {
            attempts: 3,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        let mut calls = 0;
        let result: Result<()> = retry
            .run("connect", || {
                calls += 1;
                async { Err(RelayError::Engine("refused".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls, 3);

        let mut calls = 0;
        let value = retry
            .run("connect", || {
                calls += 1;
                let ok = calls == 2;
                async move {
                    if ok {
                        Ok(7)
                    } else {
                        Err(RelayError::Engine("refused".into()))
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
