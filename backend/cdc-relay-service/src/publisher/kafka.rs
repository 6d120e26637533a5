use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{BusProducer, OutgoingMessage, ProducerBuilder};
use crate::error::{RelayError, Result};

/// Builds one idempotent rdkafka producer per destination topic.
///
/// The topic capacity becomes `queue.buffering.max.messages`; once the local
/// queue is full `send` waits up to `send_timeout` for space instead of
/// dropping.
#[derive(Debug, Clone)]
pub struct KafkaProducerBuilder {
    brokers: String,
    client_id: String,
    send_timeout: Duration,
}

impl KafkaProducerBuilder {
    pub fn new(brokers: String, client_id: String, send_timeout: Duration) -> Self {
        Self {
            brokers,
            client_id,
            send_timeout,
        }
    }
}

impl ProducerBuilder for KafkaProducerBuilder {
    fn build(&self, topic: &str, capacity: usize) -> Result<Arc<dyn BusProducer>> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("client.id", format!("{}-{}", self.client_id, topic))
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set("queue.buffering.max.messages", capacity.to_string())
            .set("message.timeout.ms", self.send_timeout.as_millis().to_string())
            .set("compression.type", "lz4")
            .create()
            .map_err(|e| {
                warn!(topic = %topic, "Failed to create Kafka producer: {}", e);
                RelayError::Kafka(e)
            })?;

        Ok(Arc::new(KafkaProducer {
            producer,
            send_timeout: self.send_timeout,
        }))
    }
}

pub struct KafkaProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

#[async_trait]
impl BusProducer for KafkaProducer {
    async fn send(&self, message: OutgoingMessage<'_>) -> Result<()> {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "mode",
                value: Some(message.mode.as_str()),
            })
            .insert(Header {
                key: "tenant_id",
                value: Some(message.tenant.tenant_id.as_str()),
            });

        let record = FutureRecord::to(message.topic)
            .key(message.key)
            .payload(message.payload)
            .headers(headers);

        // Queue-full waits here: backpressure shows up as publish latency.
        self.producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(err, _)| {
                RelayError::Publish(format!(
                    "Kafka publish to {} failed: {}",
                    message.topic, err
                ))
            })?;

        debug!(topic = %message.topic, key = %message.key, "Envelope published");
        Ok(())
    }
}
