use crate::{
    core::{
        attribute::AttributeDecl,
        mutation::MutationEvent,
        record::{Record, record_id},
    },
    store::{DocumentStore, StoreError},
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{Mutex, RwLock, mpsc};
use uuid::Uuid;

#[derive(Default)]
struct ResourceData {
    attributes: Vec<AttributeDecl>,
    records: BTreeMap<String, Record>,
}

/// An embedded, in-memory implementation of [`DocumentStore`].
///
/// Used by the test suite, the `validate` command, and as a same-kind
/// backup target. Mutation events are emitted in apply-order, preserving
/// the per-record ordering invariant.
#[derive(Default)]
pub struct MemoryStore {
    resources: RwLock<HashMap<String, ResourceData>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<MutationEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn emit(&self, event: MutationEvent) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, resource: &str, mut record: Record) -> Result<Record, StoreError> {
        let id = match record_id(&record) {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                record.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };

        {
            let mut resources = self.resources.write().await;
            let data = resources.entry(resource.to_string()).or_default();
            data.records.insert(id.clone(), record.clone());
        }

        self.emit(MutationEvent::inserted(resource, &id, record.clone()))
            .await;
        Ok(record)
    }

    async fn update(&self, resource: &str, id: &str, mut record: Record) -> Result<Record, StoreError> {
        record.insert("id".to_string(), Value::String(id.to_string()));

        let before = {
            let mut resources = self.resources.write().await;
            let data = resources
                .get_mut(resource)
                .ok_or_else(|| StoreError::UnknownResource(resource.to_string()))?;
            let before = data.records.get(id).cloned().ok_or_else(|| StoreError::NotFound {
                resource: resource.to_string(),
                id: id.to_string(),
            })?;
            data.records.insert(id.to_string(), record.clone());
            before
        };

        self.emit(MutationEvent::updated(resource, id, record.clone(), Some(before)))
            .await;
        Ok(record)
    }

    async fn delete(&self, resource: &str, id: &str) -> Result<(), StoreError> {
        let before = {
            let mut resources = self.resources.write().await;
            let data = resources
                .get_mut(resource)
                .ok_or_else(|| StoreError::UnknownResource(resource.to_string()))?;
            data.records.remove(id).ok_or_else(|| StoreError::NotFound {
                resource: resource.to_string(),
                id: id.to_string(),
            })?
        };

        self.emit(MutationEvent::deleted(resource, id, Some(before)))
            .await;
        Ok(())
    }

    async fn get(&self, resource: &str, id: &str) -> Result<Option<Record>, StoreError> {
        let resources = self.resources.read().await;
        Ok(resources
            .get(resource)
            .and_then(|data| data.records.get(id))
            .cloned())
    }

    async fn list(&self, resource: &str) -> Result<Vec<Record>, StoreError> {
        let resources = self.resources.read().await;
        Ok(resources
            .get(resource)
            .map(|data| data.records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn attributes(&self, resource: &str) -> Result<Vec<AttributeDecl>, StoreError> {
        let resources = self.resources.read().await;
        resources
            .get(resource)
            .map(|data| data.attributes.clone())
            .ok_or_else(|| StoreError::UnknownResource(resource.to_string()))
    }

    async fn create_resource(
        &self,
        resource: &str,
        attributes: &[AttributeDecl],
    ) -> Result<(), StoreError> {
        let mut resources = self.resources.write().await;
        let data = resources.entry(resource.to_string()).or_default();
        if data.attributes.is_empty() {
            data.attributes = attributes.to_vec();
        }
        Ok(())
    }

    async fn resource_exists(&self, resource: &str) -> Result<bool, StoreError> {
        let resources = self.resources.read().await;
        Ok(resources.contains_key(resource))
    }

    async fn subscribe(&self) -> mpsc::UnboundedReceiver<MutationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::operation::Operation;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        crate::core::record::as_record(value).unwrap()
    }

    #[tokio::test]
    async fn emits_events_in_apply_order() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe().await;

        store
            .insert("users", record(json!({"id": "u1", "name": "A"})))
            .await
            .unwrap();
        store
            .update("users", "u1", record(json!({"name": "B"})))
            .await
            .unwrap();
        store.delete("users", "u1").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.operation, Operation::Inserted);
        assert_eq!(first.record_id, "u1");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.operation, Operation::Updated);
        assert_eq!(second.before.as_ref().unwrap()["name"], "A");
        assert_eq!(second.after.as_ref().unwrap()["name"], "B");

        let third = rx.recv().await.unwrap();
        assert_eq!(third.operation, Operation::Deleted);
        assert!(third.after.is_none());
        assert_eq!(third.before.as_ref().unwrap()["name"], "B");
    }

    #[tokio::test]
    async fn assigns_missing_ids() {
        let store = MemoryStore::new();
        let inserted = store
            .insert("users", record(json!({"name": "anonymous"})))
            .await
            .unwrap();
        assert!(record_id(&inserted).is_some());
    }

    #[tokio::test]
    async fn update_of_missing_record_fails() {
        let store = MemoryStore::new();
        store
            .insert("users", record(json!({"id": "u1"})))
            .await
            .unwrap();
        let err = store
            .update("users", "nope", record(json!({"x": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_returns_all_records() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store
                .insert("orders", record(json!({"id": format!("o{i}"), "total": i})))
                .await
                .unwrap();
        }
        let all = store.list("orders").await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
