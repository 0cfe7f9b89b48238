use crate::core::{operation::Operation, record::Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single captured mutation from the source store.
///
/// Per `(resource, record_id)` the source emits these strictly ordered:
/// an insert precedes any update, and nothing follows a delete until a new
/// insert for the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationEvent {
    pub resource: String,
    pub operation: Operation,
    pub record_id: String,
    /// New value; `None` on delete.
    pub after: Option<Record>,
    /// Previous value; populated on update, may be `None` on insert.
    pub before: Option<Record>,
    pub timestamp: DateTime<Utc>,
}

impl MutationEvent {
    pub fn inserted(resource: &str, record_id: &str, after: Record) -> Self {
        MutationEvent {
            resource: resource.to_string(),
            operation: Operation::Inserted,
            record_id: record_id.to_string(),
            after: Some(after),
            before: None,
            timestamp: Utc::now(),
        }
    }

    pub fn updated(resource: &str, record_id: &str, after: Record, before: Option<Record>) -> Self {
        MutationEvent {
            resource: resource.to_string(),
            operation: Operation::Updated,
            record_id: record_id.to_string(),
            after: Some(after),
            before,
            timestamp: Utc::now(),
        }
    }

    pub fn deleted(resource: &str, record_id: &str, before: Option<Record>) -> Self {
        MutationEvent {
            resource: resource.to_string(),
            operation: Operation::Deleted,
            record_id: record_id.to_string(),
            after: None,
            before,
            timestamp: Utc::now(),
        }
    }
}
