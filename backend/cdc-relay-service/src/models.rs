use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata attached to a change record by the replication stream.
///
/// Carries the source topic, the record position, and the headers written by
/// the capture connector (including the single-character operation header).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Topic (or table stream) the record was read from
    pub topic: Option<String>,
    /// Partition of the source stream, 0 for unpartitioned sources
    pub partition: i32,
    /// Position of the record within its partition
    pub offset: i64,
    /// Connector headers, e.g. `__op`, `__table`
    pub headers: HashMap<String, String>,
}

impl SourceMetadata {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Raw unit of change delivered by the replication-stream engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeRecord {
    pub key: Option<String>,
    pub value: Option<String>,
    /// Absent when the engine could not attach any metadata
    pub source_metadata: Option<SourceMetadata>,
}

impl ChangeRecord {
    pub fn topic(&self) -> Option<&str> {
        self.source_metadata
            .as_ref()
            .and_then(|meta| meta.topic.as_deref())
    }

    /// (partition, offset) of the record, if the engine supplied one.
    pub fn position(&self) -> Option<(i32, i64)> {
        self.source_metadata
            .as_ref()
            .map(|meta| (meta.partition, meta.offset))
    }
}

/// Operation carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Unknown,
}

/// Normalized event published to the downstream bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEnvelope {
    key: String,
    value: String,
    operation_type: OperationType,
}

impl ChangeEnvelope {
    pub fn new(key: String, value: String, operation_type: OperationType) -> Self {
        Self {
            key,
            value,
            operation_type,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    /// JSON wire form published to the bus
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Tenant on whose behalf a collection is relayed.
///
/// Used for feature-flag lookups and as a routing header; it is never part of
/// the publisher cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
        }
    }
}
