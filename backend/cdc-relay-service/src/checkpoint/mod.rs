/// Checkpoint (offset) persistence for monitored collections
///
/// Offsets live in a durable key/value store under
/// `prefix + connectorName + "-" + monitoredCollection`. The adapter does not
/// retry: every store failure is reported as `RelayError::Checkpoint` and the
/// owning controller decides to fail and restart.
pub mod kv;

pub use kv::{KvStore, MemoryKvStore, PgKvStore, RedisKvStore};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::error::{RelayError, Result};

/// Property under which the offset storage settings reach the engine
pub const OFFSET_STORAGE_PROPERTY: &str = "offset.storage.config";

/// Serialized into the engine configuration so the engine can build its own
/// store-backed adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetStorageConfig {
    pub key_prefix: String,
    pub connector_name: String,
    pub monitored_collection: String,
}

impl OffsetStorageConfig {
    pub fn offset_key(&self) -> String {
        offset_key(
            &self.key_prefix,
            &self.connector_name,
            &self.monitored_collection,
        )
    }
}

pub fn offset_key(prefix: &str, connector_name: &str, monitored_collection: &str) -> String {
    format!("{}{}-{}", prefix, connector_name, monitored_collection)
}

/// Per-collection checkpoint adapter bound to one offset key.
///
/// `save` only stages the latest bytes, so it is cheap to call after every
/// batch; `flush` writes the staged value through to the store.
#[derive(Clone)]
pub struct CheckpointStore {
    key: String,
    store: Arc<dyn KvStore>,
    staged: Arc<Mutex<Option<Vec<u8>>>>,
}

impl CheckpointStore {
    pub fn new(config: &OffsetStorageConfig, store: Arc<dyn KvStore>) -> Self {
        Self {
            key: config.offset_key(),
            store,
            staged: Arc::new(Mutex::new(None)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn load(&self) -> Result<Option<Vec<u8>>> {
        let value = self.store.get(&self.key).await.map_err(|e| {
            error!(key = %self.key, "Failed to load checkpoint: {}", e);
            RelayError::Checkpoint(format!("load {}: {}", self.key, e))
        })?;

        match &value {
            Some(bytes) => debug!(key = %self.key, bytes = bytes.len(), "Loaded checkpoint"),
            None => debug!(key = %self.key, "No checkpoint stored"),
        }
        Ok(value)
    }

    pub async fn save(&self, value: Vec<u8>) {
        *self.staged.lock().await = Some(value);
    }

    /// Persist the staged checkpoint, if any.
    ///
    /// On failure the value stays staged so a later flush can still write it.
    pub async fn flush(&self) -> Result<()> {
        let mut staged = self.staged.lock().await;
        let Some(value) = staged.as_ref() else {
            return Ok(());
        };

        self.store.put(&self.key, value).await.map_err(|e| {
            error!(key = %self.key, "Failed to persist checkpoint: {}", e);
            RelayError::Checkpoint(format!("save {}: {}", self.key, e))
        })?;

        debug!(key = %self.key, bytes = value.len(), "Checkpoint flushed");
        *staged = None;
        Ok(())
    }
}
