/// CDC Relay Service Library
///
/// Tails database change streams per monitored collection and republishes
/// every change as a normalized envelope on Kafka, at least once and in order.
///
/// ## Modules
///
/// - `checkpoint`: Per-collection offset persistence over a key-value store
/// - `codec`: Change record to envelope conversion
/// - `config`: Service and per-collection configuration
/// - `consumer`: Snapshot and streaming batch handlers
/// - `controller`: Lease-guarded per-collection state machine
/// - `engine`: Replication-stream engine and its Kafka source
/// - `flags`: Per-tenant publish feature flags
/// - `http`: Health, readiness and metrics endpoints
/// - `lock`: Distributed lease service
/// - `publisher`: Cached per-topic bus publishers
/// - `supervisor`: One restarting worker per collection
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod controller;
pub mod engine;
pub mod error;
pub mod flags;
pub mod http;
pub mod lock;
pub mod metrics;
pub mod models;
pub mod publisher;
pub mod supervisor;

pub use error::{RelayError, Result};
