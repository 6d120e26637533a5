use prometheus::{IntCounterVec, IntGaugeVec, Opts};
use tracing::warn;

/// Prometheus metrics for the relay, labelled by collection.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Envelopes successfully handed to the bus
    pub records_published: IntCounterVec,
    /// Records acknowledged without publishing (feature flag off)
    pub records_skipped: IntCounterVec,
    /// Failed publish attempts; the record is redelivered
    pub publish_failures: IntCounterVec,
    /// Batches whose checkpoint was persisted
    pub batches_committed: IntCounterVec,
    /// 1 while the collection's controller is RUNNING
    pub controller_up: IntGaugeVec,
    /// Controller restarts performed by the supervisor
    pub controller_restarts: IntCounterVec,
}

impl RelayMetrics {
    pub fn new() -> Self {
        let registry = prometheus::default_registry();

        let records_published = IntCounterVec::new(
            Opts::new(
                "cdc_relay_records_published_total",
                "Total number of change envelopes published to the event bus",
            ),
            &["collection"],
        )
        .expect("valid metric for cdc_relay_records_published_total");

        let records_skipped = IntCounterVec::new(
            Opts::new(
                "cdc_relay_records_skipped_total",
                "Total number of change records acknowledged without publishing",
            ),
            &["collection"],
        )
        .expect("valid metric for cdc_relay_records_skipped_total");

        let publish_failures = IntCounterVec::new(
            Opts::new(
                "cdc_relay_publish_failures_total",
                "Total number of failed publish attempts",
            ),
            &["collection"],
        )
        .expect("valid metric for cdc_relay_publish_failures_total");

        let batches_committed = IntCounterVec::new(
            Opts::new(
                "cdc_relay_batches_committed_total",
                "Total number of batches whose checkpoint was persisted",
            ),
            &["collection"],
        )
        .expect("valid metric for cdc_relay_batches_committed_total");

        let controller_up = IntGaugeVec::new(
            Opts::new(
                "cdc_relay_controller_up",
                "Controller running status per collection (1 = running, 0 = down)",
            ),
            &["collection"],
        )
        .expect("valid metric for cdc_relay_controller_up");

        let controller_restarts = IntCounterVec::new(
            Opts::new(
                "cdc_relay_controller_restarts_total",
                "Total number of controller restarts after failure",
            ),
            &["collection"],
        )
        .expect("valid metric for cdc_relay_controller_restarts_total");

        for metric in [
            Box::new(records_published.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(records_skipped.clone()),
            Box::new(publish_failures.clone()),
            Box::new(batches_committed.clone()),
            Box::new(controller_up.clone()),
            Box::new(controller_restarts.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register relay metric: {}", e);
            }
        }

        Self {
            records_published,
            records_skipped,
            publish_failures,
            batches_committed,
            controller_up,
            controller_restarts,
        }
    }

    pub fn set_controller_up(&self, collection: &str, up: bool) {
        self.controller_up
            .with_label_values(&[collection])
            .set(if up { 1 } else { 0 });
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the default registry in the Prometheus text format.
pub fn gather_text() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
