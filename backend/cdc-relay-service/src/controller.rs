/// Per-collection controller
///
/// Drives one collection through its lifecycle:
///
/// ```text
/// IDLE -> ACQUIRING_LEASE -> RUNNING -> STOPPING -> TERMINATED
///              |                |
///              +----> FAILED <--+
/// ```
///
/// A controller never retries internally. On failure the lease is released
/// and the error returned; the supervisor builds a fresh controller.
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{CollectionConfig, RelayConfig};
use crate::consumer::ChangeConsumer;
use crate::engine::{EngineFactory, EngineProperties};
use crate::error::{RelayError, Result};
use crate::lock::{DistributedLockService, Lease};
use crate::metrics::RelayMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerState {
    Idle,
    AcquiringLease,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Idle => "IDLE",
            ControllerState::AcquiringLease => "ACQUIRING_LEASE",
            ControllerState::Running => "RUNNING",
            ControllerState::Stopping => "STOPPING",
            ControllerState::Terminated => "TERMINATED",
            ControllerState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings shared by every controller of a process.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub lock_prefix: String,
    pub offset_key_prefix: String,
    pub lease_refresh_interval: Duration,
    pub lease_retry_interval: Duration,
}

impl ControllerOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            lock_prefix: config.lock_prefix.clone(),
            offset_key_prefix: config.offset_key_prefix.clone(),
            lease_refresh_interval: config.lease_refresh_interval(),
            lease_retry_interval: config.lease_retry_interval(),
        }
    }
}

pub struct Controller {
    collection: CollectionConfig,
    lock_name: String,
    properties: EngineProperties,
    lease_refresh_interval: Duration,
    lease_retry_interval: Duration,
    locks: DistributedLockService,
    engines: Arc<dyn EngineFactory>,
    consumer: Arc<dyn ChangeConsumer>,
    metrics: RelayMetrics,
    state_tx: watch::Sender<ControllerState>,
}

impl Controller {
    pub fn new(
        collection: CollectionConfig,
        options: &ControllerOptions,
        locks: DistributedLockService,
        engines: Arc<dyn EngineFactory>,
        consumer: Arc<dyn ChangeConsumer>,
        metrics: RelayMetrics,
    ) -> Result<Self> {
        let properties = EngineProperties::for_collection(&collection, &options.offset_key_prefix)?;
        let (state_tx, _) = watch::channel(ControllerState::Idle);

        Ok(Self {
            lock_name: collection.lock_name(&options.lock_prefix),
            collection,
            properties,
            lease_refresh_interval: options.lease_refresh_interval,
            lease_retry_interval: options.lease_retry_interval,
            locks,
            engines,
            consumer,
            metrics,
            state_tx,
        })
    }

    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    /// Subscribe to state changes
    pub fn state(&self) -> watch::Receiver<ControllerState> {
        self.state_tx.subscribe()
    }

    fn transition(&self, next: ControllerState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            info!(
                collection = %self.collection.monitored_collection,
                from = %previous,
                to = %next,
                "Controller state changed"
            );
        }
    }

    /// Run until shutdown (Ok) or failure (Err). Blocks for the engine's
    /// whole lifetime.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.transition(ControllerState::AcquiringLease);

        let mut lease = match self.acquire_lease(&mut shutdown).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                self.transition(ControllerState::Stopping);
                self.transition(ControllerState::Terminated);
                return Ok(());
            }
            Err(e) => {
                error!(
                    collection = %self.collection.monitored_collection,
                    lock = %self.lock_name,
                    "Lease acquisition failed: {}",
                    e
                );
                self.transition(ControllerState::Failed);
                return Err(e);
            }
        };

        self.transition(ControllerState::Running);
        self.metrics
            .set_controller_up(&self.collection.monitored_collection, true);

        let result = self.run_engine(&lease, &mut shutdown).await;

        self.metrics
            .set_controller_up(&self.collection.monitored_collection, false);

        // Released on every path; a release error never masks the run result.
        if let Err(e) = lease.release().await {
            warn!(lock = %self.lock_name, "Lease release failed: {}", e);
        }

        match result {
            Ok(()) => {
                self.transition(ControllerState::Stopping);
                self.transition(ControllerState::Terminated);
                Ok(())
            }
            Err(e) => {
                error!(
                    collection = %self.collection.monitored_collection,
                    "Controller failed: {}",
                    e
                );
                self.transition(ControllerState::Failed);
                Err(e)
            }
        }
    }

    /// `Ok(None)` when shutdown arrived before the lease was granted.
    async fn acquire_lease(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Option<Lease>> {
        loop {
            if shutdown_requested(shutdown) {
                return Ok(None);
            }

            match self
                .locks
                .try_acquire_infinite_lock_with_periodic_refresh(
                    &self.lock_name,
                    self.lease_refresh_interval,
                )
                .await
            {
                Ok(Some(lease)) => return Ok(Some(lease)),
                Ok(None) => {
                    info!(
                        lock = %self.lock_name,
                        retry_ms = self.lease_retry_interval.as_millis() as u64,
                        "Lease held elsewhere, waiting"
                    );
                }
                Err(e @ RelayError::Lease(_)) => return Err(e),
                Err(e) => return Err(RelayError::Lease(e.to_string())),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.lease_retry_interval) => {}
                _ = wait_for_shutdown(shutdown) => return Ok(None),
            }
        }
    }

    async fn run_engine(&self, lease: &Lease, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let mut engine = self.engines.create(&self.properties)?;
        let (stop_tx, stop_rx) = watch::channel(false);

        let engine_run = engine.run(self.consumer.clone(), stop_rx);
        tokio::pin!(engine_run);

        tokio::select! {
            result = &mut engine_run => result,
            _ = lease.lost() => {
                // Dropping the engine future stops it before another batch
                // can touch the checkpoint.
                Err(RelayError::LeaseLost(self.lock_name.clone()))
            }
            _ = wait_for_shutdown(shutdown) => {
                self.transition(ControllerState::Stopping);
                let _ = stop_tx.send(true);
                tokio::select! {
                    result = &mut engine_run => result,
                    _ = lease.lost() => Err(RelayError::LeaseLost(self.lock_name.clone())),
                }
            }
        }
    }
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Resolves on shutdown, or when the sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
