use crate::core::operation::Operation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured events published on the engine's event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicationEvent {
    /// A single op reached the destination.
    Replicated {
        replicator: String,
        resource: String,
        record_id: String,
        operation: Operation,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A driver call failed; emitted once per attempt.
    ReplicatorError {
        replicator: String,
        resource: String,
        record_id: String,
        operation: Operation,
        error: String,
        attempt_no: u32,
        retriable: bool,
        timestamp: DateTime<Utc>,
    },

    /// Persisting a log entry failed.
    ReplicatorLogError {
        replicator: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// The log collection could not be created; logging degrades to stdout.
    ReplicatorLogResourceCreationError {
        resource: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A driver failed to shut down cleanly during `stop`.
    ReplicatorCleanupError {
        replicator: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Schema sync created a missing destination table.
    TableCreated {
        replicator: String,
        table: String,
        columns: usize,
        timestamp: DateTime<Utc>,
    },

    /// Schema sync added columns to an existing table.
    TableAltered {
        replicator: String,
        table: String,
        added_columns: usize,
        timestamp: DateTime<Utc>,
    },

    /// Schema sync dropped and recreated a table; destination data is lost.
    TableRecreated {
        replicator: String,
        table: String,
        timestamp: DateTime<Utc>,
    },

    SchemaSyncCompleted {
        replicator: String,
        tables: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    SchemaSyncFailed {
        replicator: String,
        table: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Non-fatal configuration issue detected at startup.
    ConfigWarning {
        replicator: Option<String>,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ReplicationEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ReplicationEvent::Replicated { .. } => "replicated",
            ReplicationEvent::ReplicatorError { .. } => "replicator_error",
            ReplicationEvent::ReplicatorLogError { .. } => "replicator_log_error",
            ReplicationEvent::ReplicatorLogResourceCreationError { .. } => {
                "replicator_log_resource_creation_error"
            }
            ReplicationEvent::ReplicatorCleanupError { .. } => "replicator_cleanup_error",
            ReplicationEvent::TableCreated { .. } => "table_created",
            ReplicationEvent::TableAltered { .. } => "table_altered",
            ReplicationEvent::TableRecreated { .. } => "table_recreated",
            ReplicationEvent::SchemaSyncCompleted { .. } => "schema_sync_completed",
            ReplicationEvent::SchemaSyncFailed { .. } => "schema_sync_failed",
            ReplicationEvent::ConfigWarning { .. } => "config_warning",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ReplicationEvent::ReplicatorError { .. }
                | ReplicationEvent::ReplicatorLogError { .. }
                | ReplicationEvent::ReplicatorLogResourceCreationError { .. }
                | ReplicationEvent::ReplicatorCleanupError { .. }
                | ReplicationEvent::SchemaSyncFailed { .. }
        )
    }
}

impl fmt::Display for ReplicationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationEvent::Replicated {
                replicator,
                resource,
                record_id,
                operation,
                duration_ms,
                ..
            } => write!(
                f,
                "replicated {operation} {resource}/{record_id} via {replicator} in {duration_ms}ms"
            ),
            ReplicationEvent::ReplicatorError {
                replicator,
                resource,
                record_id,
                operation,
                error,
                attempt_no,
                retriable,
                ..
            } => write!(
                f,
                "error on {operation} {resource}/{record_id} via {replicator} (attempt {attempt_no}, retriable={retriable}): {error}"
            ),
            ReplicationEvent::TableCreated { table, columns, .. } => {
                write!(f, "created table {table} with {columns} columns")
            }
            ReplicationEvent::TableAltered {
                table,
                added_columns,
                ..
            } => write!(f, "altered table {table}: {added_columns} columns added"),
            ReplicationEvent::TableRecreated { table, .. } => {
                write!(f, "recreated table {table} (existing data dropped)")
            }
            other => write!(f, "{}", other.event_type()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = ReplicationEvent::TableAltered {
            replicator: "pg-0".into(),
            table: "users_table".into(),
            added_columns: 1,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "table_altered");
        assert_eq!(json["added_columns"], 1);
    }

    #[test]
    fn error_classification() {
        let event = ReplicationEvent::SchemaSyncFailed {
            replicator: "pg-0".into(),
            table: "users_table".into(),
            error: "boom".into(),
            timestamp: Utc::now(),
        };
        assert!(event.is_error());
        assert_eq!(event.event_type(), "schema_sync_failed");
    }
}
