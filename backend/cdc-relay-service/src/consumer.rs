//! Batch handlers invoked by the replication-stream engine.
//!
//! Records are converted, published and acknowledged strictly in order. A
//! record is marked processed only after its publish succeeded (or it was
//! skipped by flag); the batch is finished only when every record was.
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::codec;
use crate::config::{CollectionConfig, ConsumerMode};
use crate::error::Result;
use crate::flags::{FeatureFlags, PublishFlags};
use crate::metrics::RelayMetrics;
use crate::models::ChangeRecord;
use crate::publisher::PublisherFactory;

/// Acknowledgement capability handed to a consumer with every batch.
#[async_trait]
pub trait Committer: Send {
    async fn mark_processed(&mut self, record: &ChangeRecord) -> Result<()>;

    /// Called once per fully processed batch; persists the checkpoint.
    async fn mark_batch_finished(&mut self) -> Result<()>;
}

#[async_trait]
pub trait ChangeConsumer: Send + Sync {
    fn mode(&self) -> ConsumerMode;

    async fn handle_batch(
        &self,
        records: &[ChangeRecord],
        committer: &mut dyn Committer,
    ) -> Result<()>;
}

/// Everything a consumer needs besides its mode
#[derive(Clone)]
pub struct ConsumerContext {
    pub collection: CollectionConfig,
    pub publishers: Arc<PublisherFactory>,
    pub flags: Arc<dyn FeatureFlags>,
    pub publish_flags: PublishFlags,
    pub destination_topic_prefix: String,
    pub metrics: RelayMetrics,
}

impl ConsumerContext {
    /// Destination topic for a record: prefix + source topic, falling back to
    /// the collection's own stream when the record carries no topic.
    fn destination_topic(&self, record: &ChangeRecord) -> String {
        let source = record
            .topic()
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.collection.source_topic);
        format!("{}{}", self.destination_topic_prefix, source)
    }

    /// Flag state is read once per batch and applies to all of its records.
    async fn publishing_enabled(&self, mode: ConsumerMode) -> bool {
        let flag = self.publish_flags.for_mode(mode);
        match self.flags.is_enabled(flag, &self.collection.tenant).await {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!(
                    collection = %self.collection.monitored_collection,
                    flag = %flag,
                    "Feature flag lookup failed, publishing anyway: {}",
                    e
                );
                true
            }
        }
    }

    async fn relay_batch(
        &self,
        mode: ConsumerMode,
        records: &[ChangeRecord],
        committer: &mut dyn Committer,
    ) -> Result<()> {
        let collection = self.collection.monitored_collection.as_str();
        let publishing_enabled = self.publishing_enabled(mode).await;

        for record in records {
            let topic = self.destination_topic(record);

            if !publishing_enabled {
                debug!(collection = %collection, topic = %topic, "Publishing disabled by flag, skipping record");
                self.metrics
                    .records_skipped
                    .with_label_values(&[collection])
                    .inc();
                committer.mark_processed(record).await?;
                continue;
            }

            let envelope = codec::to_envelope(record);
            let publisher = self
                .publishers
                .get(
                    &topic,
                    self.collection.bus_capacity,
                    mode,
                    &self.collection.tenant,
                )
                .await?;

            if let Err(e) = publisher.publish(&envelope).await {
                warn!(
                    collection = %collection,
                    topic = %topic,
                    position = ?record.position(),
                    "Publish failed, batch will be redelivered from this record: {}",
                    e
                );
                self.metrics
                    .publish_failures
                    .with_label_values(&[collection])
                    .inc();
                return Err(e);
            }

            self.metrics
                .records_published
                .with_label_values(&[collection])
                .inc();
            committer.mark_processed(record).await?;
        }

        committer.mark_batch_finished().await?;
        self.metrics
            .batches_committed
            .with_label_values(&[collection])
            .inc();
        debug!(collection = %collection, records = records.len(), "Batch relayed");
        Ok(())
    }
}

/// Relays the initial full load; envelopes are tagged `snapshot`.
pub struct SnapshotConsumer {
    context: ConsumerContext,
}

impl SnapshotConsumer {
    pub fn new(context: ConsumerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl ChangeConsumer for SnapshotConsumer {
    fn mode(&self) -> ConsumerMode {
        ConsumerMode::Snapshot
    }

    async fn handle_batch(
        &self,
        records: &[ChangeRecord],
        committer: &mut dyn Committer,
    ) -> Result<()> {
        self.context
            .relay_batch(ConsumerMode::Snapshot, records, committer)
            .await
    }
}

/// Relays live changes; envelopes are tagged `streaming`.
pub struct StreamingConsumer {
    context: ConsumerContext,
}

impl StreamingConsumer {
    pub fn new(context: ConsumerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl ChangeConsumer for StreamingConsumer {
    fn mode(&self) -> ConsumerMode {
        ConsumerMode::Streaming
    }

    async fn handle_batch(
        &self,
        records: &[ChangeRecord],
        committer: &mut dyn Committer,
    ) -> Result<()> {
        self.context
            .relay_batch(ConsumerMode::Streaming, records, committer)
            .await
    }
}

/// Select the consumer variant for the collection's configured mode.
pub fn build_consumer(context: ConsumerContext) -> Arc<dyn ChangeConsumer> {
    match context.collection.consumer_mode {
        ConsumerMode::Snapshot => Arc::new(SnapshotConsumer::new(context)),
        ConsumerMode::Streaming => Arc::new(StreamingConsumer::new(context)),
    }
}
