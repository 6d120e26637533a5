//! End-to-end tests for the relay pipeline with in-memory collaborators
//!
//! These tests verify:
//! 1. A two-record streaming batch becomes two ordered envelopes and one commit
//! 2. The checkpoint key is stable across independent runs, which resume from it
//! 3. A failed publish is redelivered from the failing record (at-least-once)
//! 4. Persistent publish failures escalate out of the engine
//! 5. Only one controller runs per collection lease
//! 6. The supervisor submits nothing for an empty collection list
//! 7. The supervisor restarts failed controllers with fresh instances
//!
//! Run tests:
//! ```bash
//! cargo test --package cdc-relay-service --test relay_pipeline
//! ```

use async_trait::async_trait;
use cdc_relay_service::checkpoint::{CheckpointStore, KvStore, MemoryKvStore};
use cdc_relay_service::config::{CollectionConfig, ConsumerMode, RelayConfig};
use cdc_relay_service::consumer::{build_consumer, ChangeConsumer, ConsumerContext};
use cdc_relay_service::controller::{Controller, ControllerOptions, ControllerState};
use cdc_relay_service::engine::{
    ChangeSource, EngineFactory, EngineProperties, ReplicationEngine, SourcePosition, StreamEngine,
};
use cdc_relay_service::flags::{PublishFlags, StaticFeatureFlags};
use cdc_relay_service::lock::{DistributedLockService, MemoryLockBackend};
use cdc_relay_service::metrics::RelayMetrics;
use cdc_relay_service::models::{ChangeRecord, SourceMetadata, TenantContext};
use cdc_relay_service::publisher::{BusProducer, OutgoingMessage, ProducerBuilder, PublisherFactory};
use cdc_relay_service::supervisor::{RelayDependencies, Supervisor, TaskExecutor, TokioExecutor};
use cdc_relay_service::RelayError;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const OFFSET_PREFIX: &str = "cdc:offset:";

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct Published {
    topic: String,
    key: String,
    value: String,
    operation: String,
    mode: ConsumerMode,
}

/// Bus that records every accepted message and can refuse chosen keys.
#[derive(Default)]
struct RecordingBus {
    published: Mutex<Vec<Published>>,
    attempts: AtomicUsize,
    fail_once: Mutex<HashSet<String>>,
    fail_always: Mutex<bool>,
}

impl RecordingBus {
    fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    fn keys(&self) -> Vec<String> {
        self.published().into_iter().map(|p| p.key).collect()
    }
}

#[async_trait]
impl BusProducer for RecordingBus {
    async fn send(&self, message: OutgoingMessage<'_>) -> cdc_relay_service::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if *self.fail_always.lock().unwrap() || self.fail_once.lock().unwrap().remove(message.key) {
            return Err(RelayError::Publish(format!("bus refused {}", message.key)));
        }

        let json: serde_json::Value = serde_json::from_slice(message.payload).unwrap();
        self.published.lock().unwrap().push(Published {
            topic: message.topic.to_string(),
            key: json["key"].as_str().unwrap().to_string(),
            value: json["value"].as_str().unwrap().to_string(),
            operation: json["operationType"].as_str().unwrap().to_string(),
            mode: message.mode,
        });
        Ok(())
    }
}

struct RecordingBuilder {
    bus: Arc<RecordingBus>,
    built: AtomicUsize,
}

impl ProducerBuilder for RecordingBuilder {
    fn build(&self, _topic: &str, _capacity: usize) -> cdc_relay_service::Result<Arc<dyn BusProducer>> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(self.bus.clone())
    }
}

/// Partition-0 change source over a fixed list of records.
#[derive(Clone)]
struct VecSource {
    records: Arc<Vec<ChangeRecord>>,
    cursor: Arc<Mutex<usize>>,
    started_from: Arc<Mutex<Option<SourcePosition>>>,
}

impl VecSource {
    fn new(records: Vec<ChangeRecord>) -> Self {
        Self {
            records: Arc::new(records),
            cursor: Arc::new(Mutex::new(0)),
            started_from: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl ChangeSource for VecSource {
    async fn start_from(
        &mut self,
        position: Option<&SourcePosition>,
        _mode: ConsumerMode,
    ) -> cdc_relay_service::Result<()> {
        let next = position.and_then(|p| p.next_offset(0)).unwrap_or(0);
        *self.cursor.lock().unwrap() = next as usize;
        *self.started_from.lock().unwrap() = position.cloned();
        Ok(())
    }

    async fn poll(&mut self, max: usize, wait: Duration) -> cdc_relay_service::Result<Vec<ChangeRecord>> {
        let batch: Vec<ChangeRecord> = {
            let mut cursor = self.cursor.lock().unwrap();
            let end = (*cursor + max).min(self.records.len());
            let batch = self.records[*cursor..end].to_vec();
            *cursor = end;
            batch
        };
        if batch.is_empty() {
            tokio::time::sleep(wait.min(Duration::from_millis(5))).await;
        }
        Ok(batch)
    }
}

fn record(key: &str, value: &str, op: &str, offset: i64) -> ChangeRecord {
    let mut headers = HashMap::new();
    headers.insert("__op".to_string(), op.to_string());
    ChangeRecord {
        key: Some(key.to_string()),
        value: Some(value.to_string()),
        source_metadata: Some(SourceMetadata {
            topic: Some("dbserver.inventory.coll1".to_string()),
            partition: 0,
            offset,
            headers,
        }),
    }
}

fn collection(batch_size: usize) -> CollectionConfig {
    CollectionConfig {
        connector_name: "conn1".into(),
        monitored_collection: "coll1".into(),
        consumer_mode: ConsumerMode::Streaming,
        batch_size,
        bus_capacity: 64,
        poll_interval_ms: 5,
        source_topic: "cdc.coll1".into(),
        tenant: TenantContext::new("acme"),
        max_consecutive_batch_failures: 3,
    }
}

fn consumer_for(collection: &CollectionConfig, bus: &Arc<RecordingBus>) -> Arc<dyn ChangeConsumer> {
    let builder = Arc::new(RecordingBuilder {
        bus: bus.clone(),
        built: AtomicUsize::new(0),
    });
    build_consumer(ConsumerContext {
        collection: collection.clone(),
        publishers: Arc::new(PublisherFactory::new(builder)),
        flags: Arc::new(StaticFeatureFlags::all_enabled()),
        publish_flags: PublishFlags {
            snapshot: "cdc-snapshot-publish".into(),
            streaming: "cdc-streaming-publish".into(),
        },
        destination_topic_prefix: "relay.".into(),
        metrics: RelayMetrics::new(),
    })
}

fn engine_for(
    collection: &CollectionConfig,
    source: VecSource,
    store: &Arc<MemoryKvStore>,
) -> StreamEngine<VecSource> {
    let properties = EngineProperties::for_collection(collection, OFFSET_PREFIX).unwrap();
    let store: Arc<dyn KvStore> = store.clone();
    let checkpoint = CheckpointStore::new(&properties.offset_storage_config().unwrap(), store);
    StreamEngine::new(source, checkpoint, properties.settings().unwrap())
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

/// Run `engine` until `done`, then stop it and return its result.
async fn run_until(
    mut engine: StreamEngine<VecSource>,
    consumer: Arc<dyn ChangeConsumer>,
    done: impl FnMut() -> bool,
) -> cdc_relay_service::Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move { engine.run(consumer, stop_rx).await });
    wait_until(done).await;
    stop_tx.send(true).unwrap();
    task.await.unwrap()
}

async fn stored_position(store: &MemoryKvStore) -> SourcePosition {
    let bytes = store
        .get("cdc:offset:conn1-coll1")
        .await
        .unwrap()
        .expect("checkpoint persisted");
    SourcePosition::from_bytes(&bytes).unwrap()
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_two_record_batch_publishes_ordered_envelopes() {
    let bus = Arc::new(RecordingBus::default());
    let store = Arc::new(MemoryKvStore::new());
    let collection = collection(10);
    let source = VecSource::new(vec![record("k1", "v1", "c", 0), record("k2", "v2", "u", 1)]);

    let engine = engine_for(&collection, source, &store);
    let consumer = consumer_for(&collection, &bus);
    let watched = bus.clone();
    run_until(engine, consumer, move || watched.published().len() == 2)
        .await
        .unwrap();

    let published = bus.published();
    assert_eq!(
        published,
        vec![
            Published {
                topic: "relay.dbserver.inventory.coll1".into(),
                key: "k1".into(),
                value: "v1".into(),
                operation: "CREATE".into(),
                mode: ConsumerMode::Streaming,
            },
            Published {
                topic: "relay.dbserver.inventory.coll1".into(),
                key: "k2".into(),
                value: "v2".into(),
                operation: "UPDATE".into(),
                mode: ConsumerMode::Streaming,
            },
        ]
    );
    assert_eq!(stored_position(&store).await.next_offset(0), Some(2));
}

#[tokio::test]
async fn test_checkpoint_key_is_stable_and_runs_resume() {
    let bus = Arc::new(RecordingBus::default());
    let store = Arc::new(MemoryKvStore::new());
    let collection = collection(10);
    let records = vec![
        record("k1", "v1", "c", 0),
        record("k2", "v2", "u", 1),
        record("k3", "v3", "d", 2),
    ];

    // First run only sees two records
    let first = VecSource::new(records[..2].to_vec());
    let watched = bus.clone();
    run_until(
        engine_for(&collection, first.clone(), &store),
        consumer_for(&collection, &bus),
        move || watched.published().len() == 2,
    )
    .await
    .unwrap();
    assert!(first.started_from.lock().unwrap().is_none());

    // Second, independent run over the full stream resumes after k2
    let second = VecSource::new(records);
    let watched = bus.clone();
    run_until(
        engine_for(&collection, second.clone(), &store),
        consumer_for(&collection, &bus),
        move || watched.published().len() == 3,
    )
    .await
    .unwrap();

    let resumed = second.started_from.lock().unwrap().clone().unwrap();
    assert_eq!(resumed.next_offset(0), Some(2));
    assert_eq!(bus.keys(), vec!["k1", "k2", "k3"]);
    assert_eq!(store.keys().await, vec!["cdc:offset:conn1-coll1".to_string()]);
    assert_eq!(stored_position(&store).await.next_offset(0), Some(3));
}

#[tokio::test]
async fn test_failed_publish_redelivers_from_failing_record() {
    let bus = Arc::new(RecordingBus::default());
    bus.fail_once.lock().unwrap().insert("k2".to_string());
    let store = Arc::new(MemoryKvStore::new());
    let collection = collection(10);
    let source = VecSource::new(vec![
        record("k1", "v1", "c", 0),
        record("k2", "v2", "u", 1),
        record("k3", "v3", "u", 2),
    ]);

    let watched = bus.clone();
    run_until(
        engine_for(&collection, source, &store),
        consumer_for(&collection, &bus),
        move || watched.published().len() == 3,
    )
    .await
    .unwrap();

    // k1 is not published twice; k2 is retried and k3 follows it
    assert_eq!(bus.keys(), vec!["k1", "k2", "k3"]);
    assert_eq!(bus.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(stored_position(&store).await.next_offset(0), Some(3));
}

#[tokio::test]
async fn test_persistent_publish_failures_escalate() {
    let bus = Arc::new(RecordingBus::default());
    *bus.fail_always.lock().unwrap() = true;
    let store = Arc::new(MemoryKvStore::new());
    let collection = collection(10);
    let source = VecSource::new(vec![record("k1", "v1", "c", 0)]);

    let mut engine = engine_for(&collection, source, &store);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        engine.run(consumer_for(&collection, &bus), stop_rx),
    )
    .await
    .expect("engine gives up in time");

    assert!(matches!(result, Err(RelayError::Publish(_))));
    assert_eq!(bus.attempts.load(Ordering::SeqCst), 3);
    assert!(store.keys().await.is_empty());
}

#[tokio::test]
async fn test_failed_checkpoint_write_is_fatal() {
    let bus = Arc::new(RecordingBus::default());
    let store = Arc::new(MemoryKvStore::new());
    store.set_fail_writes(true);
    let collection = collection(10);
    let source = VecSource::new(vec![record("k1", "v1", "c", 0)]);

    let mut engine = engine_for(&collection, source, &store);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        engine.run(consumer_for(&collection, &bus), stop_rx),
    )
    .await
    .expect("engine stops in time");

    assert!(matches!(result, Err(RelayError::Checkpoint(_))));
}

// ---------------------------------------------------------------------------
// Controllers and supervisor
// ---------------------------------------------------------------------------

/// Engine factory running `VecSource` engines over an empty stream; the
/// first `failures` engines fail immediately.
struct IdleEngineFactory {
    store: Arc<MemoryKvStore>,
    failures: usize,
    created: AtomicUsize,
}

struct FailingEngine;

#[async_trait]
impl ReplicationEngine for FailingEngine {
    async fn run(
        &mut self,
        _consumer: Arc<dyn ChangeConsumer>,
        _stop: watch::Receiver<bool>,
    ) -> cdc_relay_service::Result<()> {
        Err(RelayError::Engine("source unreachable".into()))
    }
}

impl EngineFactory for IdleEngineFactory {
    fn create(&self, properties: &EngineProperties) -> cdc_relay_service::Result<Box<dyn ReplicationEngine>> {
        let created = self.created.fetch_add(1, Ordering::SeqCst);
        if created < self.failures {
            return Ok(Box::new(FailingEngine));
        }
        let store: Arc<dyn KvStore> = self.store.clone();
        let checkpoint = CheckpointStore::new(&properties.offset_storage_config()?, store);
        Ok(Box::new(StreamEngine::new(
            VecSource::new(Vec::new()),
            checkpoint,
            properties.settings()?,
        )))
    }
}

fn idle_factory(failures: usize) -> Arc<IdleEngineFactory> {
    Arc::new(IdleEngineFactory {
        store: Arc::new(MemoryKvStore::new()),
        failures,
        created: AtomicUsize::new(0),
    })
}

fn controller_options() -> ControllerOptions {
    ControllerOptions {
        lock_prefix: "cdc:lock:".into(),
        offset_key_prefix: OFFSET_PREFIX.into(),
        lease_refresh_interval: Duration::from_millis(50),
        lease_retry_interval: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn test_only_one_controller_holds_the_collection_lease() {
    let backend = Arc::new(MemoryLockBackend::new());
    let locks = DistributedLockService::new(backend.clone());
    let bus = Arc::new(RecordingBus::default());
    let collection = collection(10);
    let factory = idle_factory(0);

    let build = || {
        Controller::new(
            collection.clone(),
            &controller_options(),
            locks.clone(),
            factory.clone(),
            consumer_for(&collection, &bus),
            RelayMetrics::new(),
        )
        .unwrap()
    };
    let first = build();
    let second = build();
    let mut first_state = first.state();
    let mut second_state = second.state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let first_task = tokio::spawn(first.run(shutdown_rx.clone()));
    first_state
        .wait_for(|s| *s == ControllerState::Running)
        .await
        .unwrap();
    let second_task = tokio::spawn(second.run(shutdown_rx));
    second_state
        .wait_for(|s| *s == ControllerState::AcquiringLease)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(*second_state.borrow(), ControllerState::AcquiringLease);
    assert!(backend.holder("cdc:lock:conn1-coll1").await.is_some());

    shutdown_tx.send(true).unwrap();
    first_task.await.unwrap().unwrap();
    second_task.await.unwrap().unwrap();
    assert_eq!(*first_state.borrow(), ControllerState::Terminated);
    assert!(backend.holder("cdc:lock:conn1-coll1").await.is_none());
}

/// Executor that counts submissions and spawns onto the test runtime.
#[derive(Default)]
struct CountingExecutor {
    submitted: AtomicUsize,
}

impl TaskExecutor for CountingExecutor {
    fn submit(&self, name: String, task: BoxFuture<'static, ()>) -> JoinHandle<()> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        TokioExecutor::current().submit(name, task)
    }
}

fn relay_config(collections: &str) -> RelayConfig {
    serde_json::from_value(serde_json::json!({
        "connector_name": "conn1",
        "monitored_collections": collections,
        "lease_refresh_interval_ms": 50,
        "lease_retry_interval_ms": 10,
        "poll_interval_ms": 5,
        "restart_min_backoff_ms": 5,
        "restart_max_backoff_ms": 20
    }))
    .unwrap()
}

fn dependencies(factory: Arc<IdleEngineFactory>) -> RelayDependencies {
    RelayDependencies {
        locks: DistributedLockService::new(Arc::new(MemoryLockBackend::new())),
        engines: factory,
        publishers: Arc::new(PublisherFactory::new(Arc::new(RecordingBuilder {
            bus: Arc::new(RecordingBus::default()),
            built: AtomicUsize::new(0),
        }))),
        flags: Arc::new(StaticFeatureFlags::all_enabled()),
        metrics: RelayMetrics::new(),
    }
}

#[tokio::test]
async fn test_empty_collection_list_submits_no_workers() {
    let supervisor = Supervisor::new();
    let executor = CountingExecutor::default();

    let started = supervisor
        .start(&relay_config(" , "), dependencies(idle_factory(0)), &executor)
        .unwrap();

    assert_eq!(started, 0);
    assert_eq!(executor.submitted.load(Ordering::SeqCst), 0);
    assert!(supervisor.registry().is_empty());
    supervisor.shutdown(Duration::from_millis(50)).await.unwrap();
}

#[tokio::test]
async fn test_invalid_configuration_submits_no_workers() {
    let supervisor = Supervisor::new();
    let executor = CountingExecutor::default();
    let mut config = relay_config("coll1");
    config.consumer_mode = "bulk".into();

    let result = supervisor.start(&config, dependencies(idle_factory(0)), &executor);

    assert!(matches!(result, Err(RelayError::Configuration(_))));
    assert_eq!(executor.submitted.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn test_supervisor_restarts_failed_controllers() {
    let supervisor = Supervisor::new();
    let executor = CountingExecutor::default();
    let factory = idle_factory(2);

    let started = supervisor
        .start(&relay_config("coll1, coll2"), dependencies(factory.clone()), &executor)
        .unwrap();
    assert_eq!(started, 2);
    assert_eq!(executor.submitted.load(Ordering::SeqCst), 2);

    // Two failed engines, then one live engine per collection
    let registry = supervisor.registry();
    wait_until(|| factory.created.load(Ordering::SeqCst) >= 4 && registry.all_running()).await;
    assert_eq!(factory.created.load(Ordering::SeqCst), 4);
    assert_eq!(registry.len(), 2);

    supervisor.shutdown(Duration::from_secs(2)).await.unwrap();
    assert_eq!(registry.state("coll1"), Some(ControllerState::Terminated));
    assert_eq!(registry.state("coll2"), Some(ControllerState::Terminated));
}
