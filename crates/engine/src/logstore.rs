//! Replication log and dead-letter persistence.

use crate::bus::EventBus;
use chrono::Utc;
use model::{
    core::{outcome::OpStatus, attribute::AttributeDecl, record::Record},
    events::ReplicationEvent,
    log::LogEntry,
    store::DocumentStore,
};
use serde_json::Value;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::{debug, warn};
use uuid::Uuid;

fn log_attributes() -> Vec<AttributeDecl> {
    [
        ("id", "string|required"),
        ("replicator_id", "string|required"),
        ("resource", "string|required"),
        ("record_id", "string|required"),
        ("operation", "string|required"),
        ("status", "string|required"),
        ("attempts", "number"),
        ("first_seen_at", "datetime"),
        ("last_attempt_at", "datetime"),
        ("last_error", "string"),
        ("payload_snapshot", "json"),
    ]
    .iter()
    .filter_map(|(name, decl)| AttributeDecl::parse(name, decl).ok())
    .collect()
}

/// Persists terminal outcomes and dead-letter records through the source
/// store. Creation of the log collection is best-effort: on failure the
/// log degrades to tracing output only.
pub struct ReplicatorLog {
    store: Arc<dyn DocumentStore>,
    resource: String,
    persist_all: bool,
    log_errors: bool,
    dead_letter_resource: Option<String>,
    bus: EventBus,
    available: AtomicBool,
}

impl ReplicatorLog {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        resource: String,
        persist_all: bool,
        log_errors: bool,
        dead_letter_resource: Option<String>,
        bus: EventBus,
    ) -> Self {
        ReplicatorLog {
            store,
            resource,
            persist_all,
            log_errors,
            dead_letter_resource,
            bus,
            available: AtomicBool::new(true),
        }
    }

    pub async fn init(&self) {
        if !self.persist_all && !self.log_errors {
            return;
        }
        if let Err(e) = self
            .store
            .create_resource(&self.resource, &log_attributes())
            .await
        {
            warn!(resource = %self.resource, error = %e, "log collection unavailable, falling back to console logging");
            self.available.store(false, Ordering::SeqCst);
            self.bus
                .publish(ReplicationEvent::ReplicatorLogResourceCreationError {
                    resource: self.resource.clone(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                })
                .await;
        }
    }

    fn should_persist(&self, status: OpStatus) -> bool {
        if !self.available.load(Ordering::SeqCst) {
            return false;
        }
        if self.persist_all {
            return true;
        }
        self.log_errors
            && matches!(
                status,
                OpStatus::Failed | OpStatus::Cancelled | OpStatus::DeadLettered
            )
    }

    /// Records one terminal outcome; exactly one entry per op when
    /// persistence is on.
    pub async fn record(&self, entry: LogEntry) {
        debug!(
            replicator = %entry.replicator_id,
            resource = %entry.resource,
            record_id = %entry.record_id,
            status = entry.status.as_str(),
            attempts = entry.attempts,
            "replication outcome"
        );

        if !self.should_persist(entry.status) {
            return;
        }

        let replicator = entry.replicator_id.clone();
        if let Err(e) = self.store.insert(&self.resource, entry.into_record()).await {
            warn!(error = %e, "failed to persist replication log entry");
            self.bus
                .publish(ReplicationEvent::ReplicatorLogError {
                    replicator,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                })
                .await;
        }
    }

    /// Writes the full payload and last error to the dead-letter
    /// collection; returns whether the entry landed.
    pub async fn dead_letter(
        &self,
        entry: &LogEntry,
        payload: Option<&Record>,
        before: Option<&Record>,
    ) -> bool {
        let Some(dlq) = &self.dead_letter_resource else {
            return false;
        };

        let mut record = Record::new();
        record.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
        record.insert("replicator_id".into(), Value::String(entry.replicator_id.clone()));
        record.insert("resource".into(), Value::String(entry.resource.clone()));
        record.insert("record_id".into(), Value::String(entry.record_id.clone()));
        record.insert(
            "operation".into(),
            Value::String(entry.operation.as_str().to_string()),
        );
        record.insert("attempts".into(), Value::from(entry.attempts));
        record.insert(
            "last_error".into(),
            entry
                .last_error
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        record.insert(
            "payload".into(),
            payload
                .map(|r| Value::Object(r.clone()))
                .unwrap_or(Value::Null),
        );
        if let Some(before) = before {
            record.insert("before".into(), Value::Object(before.clone()));
        }
        record.insert("failed_at".into(), Value::String(Utc::now().to_rfc3339()));

        match self.store.insert(dlq, record).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "failed to write dead-letter entry");
                self.bus
                    .publish(ReplicationEvent::ReplicatorLogError {
                        replicator: entry.replicator_id.clone(),
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    })
                    .await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{core::operation::Operation, memory::MemoryStore};

    fn entry(status: OpStatus) -> LogEntry {
        LogEntry::new("pg-0", "users", "u1", Operation::Inserted, status)
    }

    async fn log(persist_all: bool, log_errors: bool) -> (Arc<MemoryStore>, ReplicatorLog) {
        let store = Arc::new(MemoryStore::new());
        let log = ReplicatorLog::new(
            store.clone(),
            "plg_replicator_logs".to_string(),
            persist_all,
            log_errors,
            Some("plg_dead_letters".to_string()),
            EventBus::new(),
        );
        log.init().await;
        (store, log)
    }

    #[tokio::test]
    async fn persists_every_terminal_outcome_when_enabled() {
        let (store, log) = log(true, true).await;
        for status in [
            OpStatus::Success,
            OpStatus::Failed,
            OpStatus::Skipped,
            OpStatus::Cancelled,
        ] {
            log.record(entry(status)).await;
        }
        assert_eq!(store.list("plg_replicator_logs").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn errors_only_mode_skips_successes() {
        let (store, log) = log(false, true).await;
        log.record(entry(OpStatus::Success)).await;
        log.record(entry(OpStatus::Skipped)).await;
        log.record(entry(OpStatus::Failed)).await;
        log.record(entry(OpStatus::Cancelled)).await;

        let entries = store.list("plg_replicator_logs").await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn dead_letter_keeps_payload_and_error() {
        let (store, log) = log(true, true).await;
        let mut failed = entry(OpStatus::DeadLettered);
        failed.last_error = Some("schema: missing column".to_string());

        let payload: Record =
            serde_json::from_value(serde_json::json!({"id": "u1", "name": "A"})).unwrap();
        assert!(log.dead_letter(&failed, Some(&payload), None).await);

        let dlq = store.list("plg_dead_letters").await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0]["payload"]["name"], "A");
        assert_eq!(dlq[0]["last_error"], "schema: missing column");
    }
}
