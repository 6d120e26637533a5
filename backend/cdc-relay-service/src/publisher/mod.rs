/// Destination-topic publishers
///
/// One `Publisher` per topic for the life of the process. Bus clients are
/// expensive, so construction happens once per topic behind a per-topic
/// `OnceCell`; unrelated topics never wait on each other.
pub mod kafka;

pub use kafka::{KafkaProducer, KafkaProducerBuilder};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::ConsumerMode;
use crate::error::{RelayError, Result};
use crate::models::{ChangeEnvelope, TenantContext};

/// A serialized envelope on its way to the bus
#[derive(Debug, Clone, Copy)]
pub struct OutgoingMessage<'a> {
    pub topic: &'a str,
    pub key: &'a str,
    pub payload: &'a [u8],
    pub mode: ConsumerMode,
    pub tenant: &'a TenantContext,
}

/// Client able to send bytes to a named topic.
///
/// Implementations must apply backpressure (wait) when their bounded queue is
/// full rather than drop the message; an `Err` means the message was not
/// accepted.
#[async_trait]
pub trait BusProducer: Send + Sync {
    async fn send(&self, message: OutgoingMessage<'_>) -> Result<()>;
}

/// Constructs bus clients sized to a queue capacity.
pub trait ProducerBuilder: Send + Sync {
    fn build(&self, topic: &str, capacity: usize) -> Result<Arc<dyn BusProducer>>;
}

/// Tenant-agnostic publisher for one destination topic.
pub struct Publisher {
    topic: String,
    capacity: usize,
    producer: Arc<dyn BusProducer>,
}

impl Publisher {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    async fn send_envelope(
        &self,
        envelope: &ChangeEnvelope,
        mode: ConsumerMode,
        tenant: &TenantContext,
    ) -> Result<()> {
        let payload = envelope.to_bytes()?;
        self.producer
            .send(OutgoingMessage {
                topic: &self.topic,
                key: envelope.key(),
                payload: &payload,
                mode,
                tenant,
            })
            .await
    }
}

/// A cached publisher paired with the caller's mode and tenant.
#[derive(Clone)]
pub struct BoundPublisher {
    shared: Arc<Publisher>,
    mode: ConsumerMode,
    tenant: TenantContext,
}

impl BoundPublisher {
    pub async fn publish(&self, envelope: &ChangeEnvelope) -> Result<()> {
        self.shared
            .send_envelope(envelope, self.mode, &self.tenant)
            .await
    }

    /// The cached, topic-wide publisher behind this handle
    pub fn shared(&self) -> &Arc<Publisher> {
        &self.shared
    }

    pub fn mode(&self) -> ConsumerMode {
        self.mode
    }
}

pub struct PublisherFactory {
    builder: Arc<dyn ProducerBuilder>,
    publishers: DashMap<String, Arc<OnceCell<Arc<Publisher>>>>,
}

impl PublisherFactory {
    pub fn new(builder: Arc<dyn ProducerBuilder>) -> Self {
        Self {
            builder,
            publishers: DashMap::new(),
        }
    }

    /// Get (or construct once) the publisher for `topic`.
    ///
    /// The cache key is the topic alone; `capacity` only applies to the first
    /// construction, `mode` and `tenant` are bound to the returned handle.
    pub async fn get(
        &self,
        topic: &str,
        capacity: usize,
        mode: ConsumerMode,
        tenant: &TenantContext,
    ) -> Result<BoundPublisher> {
        if topic.is_empty() {
            return Err(RelayError::Publish(
                "cannot publish to an empty topic name".to_string(),
            ));
        }

        // Clone the cell out so the map shard lock is not held while building.
        let cell = self
            .publishers
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let shared = cell
            .get_or_try_init(|| async {
                info!(topic = %topic, capacity, "Creating bus publisher");
                let producer = self.builder.build(topic, capacity)?;
                Ok::<_, RelayError>(Arc::new(Publisher {
                    topic: topic.to_string(),
                    capacity,
                    producer,
                }))
            })
            .await?
            .clone();

        if shared.capacity != capacity {
            debug!(
                topic = %topic,
                cached_capacity = shared.capacity,
                requested_capacity = capacity,
                "Reusing publisher created with a different capacity"
            );
        }

        Ok(BoundPublisher {
            shared,
            mode,
            tenant: tenant.clone(),
        })
    }

    pub fn cached_topics(&self) -> usize {
        self.publishers
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }
}
