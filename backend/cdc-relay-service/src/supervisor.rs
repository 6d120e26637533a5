/// Supervisor: one restarting worker per monitored collection
///
/// Workers share nothing except the publisher cache, the lock service and
/// the registry. Each restart attempt builds a fresh consumer and a fresh
/// controller from the validated collection configuration.
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{CollectionConfig, RelayConfig};
use crate::consumer::{build_consumer, ConsumerContext};
use crate::controller::{wait_for_shutdown, Controller, ControllerOptions, ControllerState};
use crate::engine::EngineFactory;
use crate::error::{RelayError, Result};
use crate::flags::{FeatureFlags, PublishFlags};
use crate::lock::DistributedLockService;
use crate::metrics::RelayMetrics;
use crate::publisher::PublisherFactory;

/// Runs supervised worker futures.
pub trait TaskExecutor: Send + Sync {
    fn submit(&self, name: String, task: BoxFuture<'static, ()>) -> JoinHandle<()>;
}

/// Spawns workers onto a tokio runtime.
#[derive(Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl TaskExecutor for TokioExecutor {
    fn submit(&self, name: String, task: BoxFuture<'static, ()>) -> JoinHandle<()> {
        info!(worker = %name, "Submitting collection worker");
        self.handle.spawn(task)
    }
}

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct RelayDependencies {
    pub locks: DistributedLockService,
    pub engines: Arc<dyn EngineFactory>,
    pub publishers: Arc<PublisherFactory>,
    pub flags: Arc<dyn FeatureFlags>,
    pub metrics: RelayMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionStatus {
    pub collection: String,
    pub state: ControllerState,
}

/// Live controller states, keyed by collection.
#[derive(Default)]
pub struct ControllerRegistry {
    controllers: DashMap<String, watch::Receiver<ControllerState>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the current controller of `collection`, replacing the previous one.
    pub fn track(&self, collection: &str, state: watch::Receiver<ControllerState>) {
        self.controllers.insert(collection.to_string(), state);
    }

    pub fn state(&self, collection: &str) -> Option<ControllerState> {
        self.controllers.get(collection).map(|rx| *rx.borrow())
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Sorted by collection name
    pub fn snapshot(&self) -> Vec<CollectionStatus> {
        let mut statuses: Vec<CollectionStatus> = self
            .controllers
            .iter()
            .map(|entry| CollectionStatus {
                collection: entry.key().clone(),
                state: *entry.value().borrow(),
            })
            .collect();
        statuses.sort_by(|a, b| a.collection.cmp(&b.collection));
        statuses
    }

    pub fn all_running(&self) -> bool {
        self.controllers
            .iter()
            .all(|entry| *entry.value().borrow() == ControllerState::Running)
    }
}

#[derive(Debug, Clone, Copy)]
struct RestartPolicy {
    min_backoff: Duration,
    max_backoff: Duration,
}

impl RestartPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.min_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff)
    }
}

/// Everything one worker needs; cloned per collection.
#[derive(Clone)]
struct WorkerPlan {
    collection: CollectionConfig,
    options: ControllerOptions,
    publish_flags: PublishFlags,
    destination_topic_prefix: String,
    restart: RestartPolicy,
    deps: RelayDependencies,
    registry: Arc<ControllerRegistry>,
}

pub struct Supervisor {
    registry: Arc<ControllerRegistry>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry: Arc::new(ControllerRegistry::new()),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> Arc<ControllerRegistry> {
        self.registry.clone()
    }

    /// Validate every collection, then submit one worker per collection.
    ///
    /// Returns the number of workers submitted. Configuration errors surface
    /// here, before anything is scheduled.
    pub fn start(
        &self,
        config: &RelayConfig,
        deps: RelayDependencies,
        executor: &dyn TaskExecutor,
    ) -> Result<usize> {
        let collections = config.collection_configs()?;
        if collections.is_empty() {
            info!(connector = %config.connector_name, "No monitored collections configured, nothing to start");
            return Ok(0);
        }

        let options = ControllerOptions::from_config(config);
        let publish_flags = PublishFlags::from_config(config);
        let restart = RestartPolicy {
            min_backoff: Duration::from_millis(config.restart_min_backoff_ms),
            max_backoff: Duration::from_millis(config.restart_max_backoff_ms),
        };

        let submitted = collections.len();
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for collection in collections {
            let name = collection.identity();
            let (_, idle) = watch::channel(ControllerState::Idle);
            self.registry.track(&collection.monitored_collection, idle);

            let plan = WorkerPlan {
                collection,
                options: options.clone(),
                publish_flags: publish_flags.clone(),
                destination_topic_prefix: config.destination_topic_prefix.clone(),
                restart,
                deps: deps.clone(),
                registry: self.registry.clone(),
            };
            let shutdown = self.shutdown_tx.subscribe();
            workers.push(executor.submit(name, Box::pin(supervise(plan, shutdown))));
        }

        info!(
            connector = %config.connector_name,
            workers = submitted,
            "Collection workers started"
        );
        Ok(submitted)
    }

    /// Signal every worker, wait up to `grace`, then abort the stragglers.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        self.shutdown_tx.send_replace(true);

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        if workers.is_empty() {
            return Ok(());
        }

        let aborts: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();
        info!(workers = workers.len(), grace_ms = grace.as_millis() as u64, "Stopping collection workers");

        match tokio::time::timeout(grace, futures::future::join_all(workers)).await {
            Ok(_) => {
                info!("All collection workers stopped");
                Ok(())
            }
            Err(_) => {
                for abort in &aborts {
                    abort.abort();
                }
                error!("Collection workers did not stop within the grace period, aborted");
                Err(RelayError::ShutdownTimeout(format!(
                    "{} worker(s) still running after {:?}",
                    aborts.iter().filter(|a| !a.is_finished()).count(),
                    grace
                )))
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

async fn supervise(plan: WorkerPlan, mut shutdown: watch::Receiver<bool>) {
    let collection = plan.collection.monitored_collection.clone();
    let mut attempt: u32 = 0;

    while !shutdown_requested(&shutdown) {
        let consumer = build_consumer(ConsumerContext {
            collection: plan.collection.clone(),
            publishers: plan.deps.publishers.clone(),
            flags: plan.deps.flags.clone(),
            publish_flags: plan.publish_flags.clone(),
            destination_topic_prefix: plan.destination_topic_prefix.clone(),
            metrics: plan.deps.metrics.clone(),
        });

        let controller = match Controller::new(
            plan.collection.clone(),
            &plan.options,
            plan.deps.locks.clone(),
            plan.deps.engines.clone(),
            consumer,
            plan.deps.metrics.clone(),
        ) {
            Ok(controller) => controller,
            Err(e) => {
                error!(collection = %collection, "Cannot build controller, worker exiting: {}", e);
                let (_, failed) = watch::channel(ControllerState::Failed);
                plan.registry.track(&collection, failed);
                return;
            }
        };
        plan.registry.track(&collection, controller.state());

        let started = Instant::now();
        match controller.run(shutdown.clone()).await {
            Ok(()) => {
                info!(collection = %collection, "Controller terminated");
                return;
            }
            Err(e) => {
                if started.elapsed() >= plan.restart.max_backoff {
                    attempt = 0;
                }
                let delay = plan.restart.backoff(attempt);
                attempt = attempt.saturating_add(1);
                plan.deps
                    .metrics
                    .controller_restarts
                    .with_label_values(&[collection.as_str()])
                    .inc();
                warn!(
                    collection = %collection,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    "Controller failed, restarting with a fresh instance: {}",
                    e
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_for_shutdown(&mut shutdown) => {}
                }
            }
        }
    }
}
