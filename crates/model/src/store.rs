use crate::core::{attribute::AttributeDecl, mutation::MutationEvent, record::Record};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("record not found: {resource}/{id}")]
    NotFound { resource: String, id: String },

    #[error("record has no id")]
    MissingId,

    #[error("store backend error: {0}")]
    Backend(String),
}

/// The upstream contract of the document-oriented primary store.
///
/// The engine consumes mutation events from `subscribe`, reads attribute
/// declarations for schema sync, and enumerates records for manual sync.
/// The same trait doubles as the target of the same-kind backup driver.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts a record; the returned record carries the assigned id.
    async fn insert(&self, resource: &str, record: Record) -> Result<Record, StoreError>;

    /// Replaces a record by id.
    async fn update(&self, resource: &str, id: &str, record: Record) -> Result<Record, StoreError>;

    /// Removes a record by id.
    async fn delete(&self, resource: &str, id: &str) -> Result<(), StoreError>;

    async fn get(&self, resource: &str, id: &str) -> Result<Option<Record>, StoreError>;

    /// Enumerates all records of a resource, used by manual sync.
    async fn list(&self, resource: &str) -> Result<Vec<Record>, StoreError>;

    /// Attribute declarations of a resource, used by the type mapper.
    async fn attributes(&self, resource: &str) -> Result<Vec<AttributeDecl>, StoreError>;

    /// Creates a resource if it does not exist yet.
    async fn create_resource(
        &self,
        resource: &str,
        attributes: &[AttributeDecl],
    ) -> Result<(), StoreError>;

    async fn resource_exists(&self, resource: &str) -> Result<bool, StoreError>;

    /// Opens a mutation event channel. Each subscriber receives every event;
    /// the channel is unbounded so source writes never block on consumers.
    async fn subscribe(&self) -> mpsc::UnboundedReceiver<MutationEvent>;
}
