use crate::core::{
    outcome::{OpStatus, SkipReason},
    operation::Operation,
    record::Record,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default name of the replication log collection.
pub const DEFAULT_LOG_RESOURCE: &str = "plg_replicator_logs";

/// One persisted row per terminal op outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub replicator_id: String,
    pub resource: String,
    pub record_id: String,
    pub operation: Operation,
    pub status: OpStatus,
    pub attempts: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_snapshot: Option<Record>,
}

impl LogEntry {
    pub fn new(
        replicator_id: &str,
        resource: &str,
        record_id: &str,
        operation: Operation,
        status: OpStatus,
    ) -> Self {
        let now = Utc::now();
        LogEntry {
            id: Uuid::new_v4().to_string(),
            replicator_id: replicator_id.to_string(),
            resource: resource.to_string(),
            record_id: record_id.to_string(),
            operation,
            status,
            attempts: 0,
            first_seen_at: now,
            last_attempt_at: now,
            last_error: None,
            skip_reason: None,
            payload_snapshot: None,
        }
    }

    pub fn into_record(self) -> Record {
        match serde_json::to_value(&self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Record::new(),
        }
    }
}
