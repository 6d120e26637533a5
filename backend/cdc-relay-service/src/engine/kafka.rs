use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    ChangeSource, ConnectRetry, EngineFactory, EngineProperties, ReplicationEngine, SourcePosition,
    StreamEngine,
};
use crate::checkpoint::{CheckpointStore, KvStore};
use crate::config::ConsumerMode;
use crate::error::{RelayError, Result};
use crate::models::{ChangeRecord, SourceMetadata};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads one collection's change topic with manual partition assignment.
///
/// Positions come from the checkpoint store, never from Kafka group
/// offsets, so auto-commit stays off.
pub struct KafkaChangeSource {
    brokers: String,
    group_id: String,
    topic: String,
    retry: ConnectRetry,
    consumer: Option<StreamConsumer>,
}

impl KafkaChangeSource {
    pub fn new(brokers: String, group_id: String, topic: String, retry: ConnectRetry) -> Self {
        Self {
            brokers,
            group_id,
            topic,
            retry,
            consumer: None,
        }
    }

    fn create_consumer(&self, mode: ConsumerMode) -> Result<StreamConsumer> {
        Ok(ClientConfig::new()
            .set("group.id", &self.group_id)
            .set("bootstrap.servers", &self.brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", default_reset(mode))
            .set("session.timeout.ms", "30000")
            .set("enable.partition.eof", "false")
            .create()?)
    }
}

/// Discover the topic's partitions and assign them. Blocks on a metadata
/// round trip, so callers run it on the blocking pool.
fn assign_partitions(
    consumer: StreamConsumer,
    topic: &str,
    position: Option<&SourcePosition>,
    mode: ConsumerMode,
) -> Result<StreamConsumer> {
    let metadata = consumer.fetch_metadata(Some(topic), METADATA_TIMEOUT)?;
    let partitions: Vec<i32> = metadata
        .topics()
        .iter()
        .filter(|t| t.name() == topic && t.error().is_none())
        .flat_map(|t| t.partitions().iter().map(|p| p.id()))
        .collect();

    if partitions.is_empty() {
        return Err(RelayError::Engine(format!(
            "source topic {} has no partitions",
            topic
        )));
    }

    let assignment = assignment_for(topic, &partitions, position, mode)?;
    consumer.assign(&assignment)?;

    info!(
        topic = %topic,
        partitions = partitions.len(),
        resumed = position.is_some(),
        mode = %mode,
        "Kafka change source assigned"
    );
    Ok(consumer)
}

fn default_reset(mode: ConsumerMode) -> &'static str {
    match mode {
        ConsumerMode::Snapshot => "earliest",
        ConsumerMode::Streaming => "latest",
    }
}

/// Stored next offsets where known, the mode's default elsewhere.
fn assignment_for(
    topic: &str,
    partitions: &[i32],
    position: Option<&SourcePosition>,
    mode: ConsumerMode,
) -> Result<TopicPartitionList> {
    let mut assignment = TopicPartitionList::new();
    for &partition in partitions {
        let offset = match position.and_then(|p| p.next_offset(partition)) {
            Some(next) => Offset::Offset(next),
            None => match mode {
                ConsumerMode::Snapshot => Offset::Beginning,
                ConsumerMode::Streaming => Offset::End,
            },
        };
        assignment.add_partition_offset(topic, partition, offset)?;
    }
    Ok(assignment)
}

fn to_change_record<M: Message>(message: &M) -> ChangeRecord {
    let mut headers = HashMap::new();
    if let Some(raw) = message.headers() {
        for header in raw.iter() {
            if let Some(value) = header.value {
                headers.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }

    ChangeRecord {
        key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned()),
        value: message
            .payload()
            .map(|v| String::from_utf8_lossy(v).into_owned()),
        source_metadata: Some(SourceMetadata {
            topic: Some(message.topic().to_string()),
            partition: message.partition(),
            offset: message.offset(),
            headers,
        }),
    }
}

#[async_trait]
impl ChangeSource for KafkaChangeSource {
    async fn start_from(
        &mut self,
        position: Option<&SourcePosition>,
        mode: ConsumerMode,
    ) -> Result<()> {
        let this = &*self;
        let position = position.cloned();
        let consumer = self
            .retry
            .run("Kafka change source connect", || {
                let position = position.clone();
                async move {
                    let consumer = this.create_consumer(mode)?;
                    let topic = this.topic.clone();
                    tokio::task::spawn_blocking(move || {
                        assign_partitions(consumer, &topic, position.as_ref(), mode)
                    })
                    .await
                    .map_err(|e| RelayError::Engine(format!("partition assignment task failed: {}", e)))?
                }
            })
            .await?;
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn poll(&mut self, max: usize, wait: Duration) -> Result<Vec<ChangeRecord>> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| RelayError::Engine("Kafka change source not started".to_string()))?;

        let deadline = Instant::now() + wait;
        let mut records = Vec::new();

        while records.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, consumer.recv()).await {
                Ok(Ok(message)) => records.push(to_change_record(&message)),
                Ok(Err(e)) if records.is_empty() => return Err(RelayError::Kafka(e)),
                Ok(Err(e)) => {
                    warn!(topic = %self.topic, "Kafka receive error after partial poll: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }

        if !records.is_empty() {
            debug!(topic = %self.topic, records = records.len(), "Polled change records");
        }
        Ok(records)
    }
}

/// Builds Kafka-backed engines that checkpoint into a shared key-value store.
pub struct KafkaEngineFactory {
    brokers: String,
    store: Arc<dyn KvStore>,
    retry: ConnectRetry,
}

impl KafkaEngineFactory {
    pub fn new(brokers: String, store: Arc<dyn KvStore>, retry: ConnectRetry) -> Self {
        Self {
            brokers,
            store,
            retry,
        }
    }
}

impl EngineFactory for KafkaEngineFactory {
    fn create(&self, properties: &EngineProperties) -> Result<Box<dyn ReplicationEngine>> {
        let storage = properties.offset_storage_config()?;
        let settings = properties.settings()?;
        let checkpoint = CheckpointStore::new(&storage, self.store.clone());

        let source = KafkaChangeSource::new(
            self.brokers.clone(),
            format!("{}-{}", storage.connector_name, storage.monitored_collection),
            settings.source_topic.clone(),
            self.retry,
        );

        Ok(Box::new(StreamEngine::new(source, checkpoint, settings)))
    }
}
