//! Conversion of raw change records into bus envelopes.
//!
//! Pure and total: malformed or missing metadata never fails a batch, it
//! degrades to `OperationType::Unknown` and sentinel payloads.

use crate::models::{ChangeEnvelope, ChangeRecord, OperationType, SourceMetadata};

/// Substituted for a missing record key or value.
pub const DEFAULT_PAYLOAD: &str = "default";

/// Header written by the capture connector with the operation code.
pub const OPERATION_HEADER: &str = "__op";

pub fn to_envelope(record: &ChangeRecord) -> ChangeEnvelope {
    let key = record
        .key
        .clone()
        .unwrap_or_else(|| DEFAULT_PAYLOAD.to_string());
    let value = record
        .value
        .clone()
        .unwrap_or_else(|| DEFAULT_PAYLOAD.to_string());

    ChangeEnvelope::new(
        key,
        value,
        operation_from_metadata(record.source_metadata.as_ref()),
    )
}

pub fn operation_from_metadata(metadata: Option<&SourceMetadata>) -> OperationType {
    metadata
        .and_then(|meta| meta.header(OPERATION_HEADER))
        .map(operation_from_code)
        .unwrap_or(OperationType::Unknown)
}

fn operation_from_code(code: &str) -> OperationType {
    match code {
        "c" => OperationType::Create,
        "u" => OperationType::Update,
        "d" => OperationType::Delete,
        _ => OperationType::Unknown,
    }
}
