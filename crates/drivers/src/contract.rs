//! The capability set every destination driver implements.

use crate::error::DriverError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::core::{operation::Operation, record::Record};
use schema::{
    dialect::Dialect,
    mapper::TrackingColumns,
    plan::ActualColumn,
};
use std::time::Duration;

/// One unit of work handed to a driver: a captured mutation after
/// filtering and transformation.
#[derive(Debug, Clone)]
pub struct ReplicateOp {
    pub resource: String,
    pub operation: Operation,
    pub record_id: String,
    /// Post-transform payload; `None` on delete.
    pub record: Option<Record>,
    pub before: Option<Record>,
    pub timestamp: DateTime<Utc>,
}

/// Uniform destination contract.
///
/// Drivers classify their own failures (retriable vs. permanent); the
/// engine schedules retries but never inspects error text. Connections
/// are established lazily — constructing a driver performs no I/O, and
/// `init` is idempotent.
#[async_trait]
pub trait Driver: Send + Sync {
    /// The registry name this driver was created under.
    fn kind(&self) -> &str;

    /// Establishes the connection; safe to call more than once.
    async fn init(&self) -> Result<(), DriverError> {
        Ok(())
    }

    fn supports_batch(&self) -> bool {
        false
    }

    /// Capability probe for destinations with a table schema.
    fn schema_sync(&self) -> Option<&dyn SchemaSync> {
        None
    }

    /// Driver-specific delay policy for the next attempt, consulted by the
    /// engine when the failure carried no server-supplied hint.
    fn retry_delay(&self, _attempt_no: u32) -> Option<Duration> {
        None
    }

    /// Applies one op to the destination named by `destination`.
    async fn replicate(&self, destination: &str, op: &ReplicateOp) -> Result<(), DriverError>;

    /// Applies a buffered run of ops; per-item results. The default loops
    /// over `replicate`, so only batch-capable drivers override this.
    async fn replicate_batch(
        &self,
        destination: &str,
        ops: &[ReplicateOp],
    ) -> Vec<Result<(), DriverError>> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            results.push(self.replicate(destination, op).await);
        }
        results
    }

    /// Releases connections; called once during plugin stop.
    async fn close(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Driver").field("kind", &self.kind()).finish()
    }
}

/// Schema-sync capability for SQL and warehouse destinations.
#[async_trait]
pub trait SchemaSync: Send + Sync {
    fn dialect(&self) -> &dyn Dialect;

    /// Tracking columns the destination table needs for this resource
    /// (warehouse mutability modes).
    fn tracking_columns(&self, _resource: &str) -> TrackingColumns {
        TrackingColumns::None
    }

    /// Reads the actual column set; `None` when the table does not exist.
    async fn introspect(&self, table: &str) -> Result<Option<Vec<ActualColumn>>, DriverError>;

    async fn execute_ddl(&self, statement: &str) -> Result<(), DriverError>;
}
