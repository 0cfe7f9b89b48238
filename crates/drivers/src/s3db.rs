//! Same-kind backup driver: replays mutations into a secondary instance
//! of the primary store. No schema translation; idempotent by record id.

use crate::{
    contract::{Driver, ReplicateOp},
    error::DriverError,
};
use async_trait::async_trait;
use model::{
    core::operation::Operation,
    store::{DocumentStore, StoreError},
};
use std::sync::Arc;
use tracing::debug;

pub struct S3dbDriver {
    target: Arc<dyn DocumentStore>,
}

impl S3dbDriver {
    pub fn new(target: Arc<dyn DocumentStore>) -> Self {
        S3dbDriver { target }
    }
}

fn map_store_error(err: StoreError) -> DriverError {
    match err {
        StoreError::Backend(msg) => DriverError::connection(msg),
        other => DriverError::payload(other.to_string()),
    }
}

#[async_trait]
impl Driver for S3dbDriver {
    fn kind(&self) -> &str {
        "s3db"
    }

    async fn replicate(&self, destination: &str, op: &ReplicateOp) -> Result<(), DriverError> {
        match op.operation {
            Operation::Inserted | Operation::Updated => {
                let record = op
                    .record
                    .clone()
                    .ok_or_else(|| DriverError::payload("missing record payload"))?;
                // Upsert keeps redelivery idempotent.
                let exists = self
                    .target
                    .get(destination, &op.record_id)
                    .await
                    .map_err(map_store_error)?
                    .is_some();
                if exists {
                    self.target
                        .update(destination, &op.record_id, record)
                        .await
                        .map_err(map_store_error)?;
                } else {
                    self.target
                        .insert(destination, record)
                        .await
                        .map_err(map_store_error)?;
                }
            }
            Operation::Deleted => match self.target.delete(destination, &op.record_id).await {
                Ok(()) => {}
                // Already gone; delete is idempotent.
                Err(StoreError::NotFound { .. }) | Err(StoreError::UnknownResource(_)) => {
                    debug!(resource = destination, id = %op.record_id, "delete target already absent");
                }
                Err(other) => return Err(map_store_error(other)),
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use model::{core::record::as_record, memory::MemoryStore};
    use serde_json::json;

    fn op(operation: Operation, id: &str, record: Option<serde_json::Value>) -> ReplicateOp {
        ReplicateOp {
            resource: "users".into(),
            operation,
            record_id: id.into(),
            record: record.map(|v| as_record(v).unwrap()),
            before: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_update_delete_round_trip() {
        let target = Arc::new(MemoryStore::new());
        let driver = S3dbDriver::new(target.clone());

        driver
            .replicate("users", &op(Operation::Inserted, "u1", Some(json!({"id": "u1", "n": 1}))))
            .await
            .unwrap();
        assert!(target.get("users", "u1").await.unwrap().is_some());

        driver
            .replicate("users", &op(Operation::Updated, "u1", Some(json!({"id": "u1", "n": 2}))))
            .await
            .unwrap();
        assert_eq!(target.get("users", "u1").await.unwrap().unwrap()["n"], 2);

        driver
            .replicate("users", &op(Operation::Deleted, "u1", None))
            .await
            .unwrap();
        assert!(target.get("users", "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn redelivered_insert_is_idempotent() {
        let target = Arc::new(MemoryStore::new());
        let driver = S3dbDriver::new(target.clone());

        let event = op(Operation::Inserted, "u1", Some(json!({"id": "u1", "n": 1})));
        driver.replicate("users", &event).await.unwrap();
        driver.replicate("users", &event).await.unwrap();
        assert_eq!(target.list("users").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_of_absent_record_succeeds() {
        let target = Arc::new(MemoryStore::new());
        let driver = S3dbDriver::new(target);
        driver
            .replicate("users", &op(Operation::Deleted, "ghost", None))
            .await
            .unwrap();
    }
}
