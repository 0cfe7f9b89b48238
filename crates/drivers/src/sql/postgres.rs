//! PostgreSQL destination driver.

use crate::{
    contract::{Driver, ReplicateOp, SchemaSync},
    error::DriverError,
    sql::{statements, value::SqlValue},
};
use async_trait::async_trait;
use bytes::BytesMut;
use model::core::operation::Operation;
use schema::{
    dialect::{Dialect, Postgres},
    plan::ActualColumn,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_postgres::{
    Client, NoTls,
    types::{IsNull, ToSql, Type, to_sql_checked},
};
use tracing::{debug, warn};
use uuid::Uuid;

fn default_max_connections() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct PgConfig {
    #[serde(alias = "url")]
    pub connection_string: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// TLS is opaque pass-through: `sslmode` in the connection string plus
    /// this switch selecting the native-tls connector.
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// When set, an audit row goes into this table in the same transaction
    /// as the data row.
    #[serde(default)]
    pub log_table: Option<String>,
}

/// A small connection pool: clients are created on demand up to
/// `max_connections` and parked between uses.
struct PgPool {
    idle: Mutex<Vec<Client>>,
    permits: Arc<Semaphore>,
}

impl PgPool {
    fn new(max: usize) -> Self {
        PgPool {
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max.max(1))),
        }
    }

    async fn acquire(&self, config: &PgConfig) -> Result<(OwnedSemaphorePermit, Client), DriverError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DriverError::cancelled("connection pool closed"))?;

        let parked = self.idle.lock().await.pop();
        let client = match parked {
            Some(client) if !client.is_closed() => client,
            _ => connect(config).await?,
        };
        Ok((permit, client))
    }

    async fn release(&self, client: Client) {
        if !client.is_closed() {
            self.idle.lock().await.push(client);
        }
    }

    async fn clear(&self) {
        self.idle.lock().await.clear();
    }
}

async fn connect(config: &PgConfig) -> Result<Client, DriverError> {
    if config.use_tls {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| DriverError::connection(e.to_string()))?;
        let tls = postgres_native_tls::MakeTlsConnector::new(connector);
        let (client, connection) = tokio_postgres::connect(&config.connection_string, tls)
            .await
            .map_err(classify)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection task ended");
            }
        });
        Ok(client)
    } else {
        let (client, connection) = tokio_postgres::connect(&config.connection_string, NoTls)
            .await
            .map_err(classify)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection task ended");
            }
        });
        Ok(client)
    }
}

fn classify(err: tokio_postgres::Error) -> DriverError {
    if let Some(db) = err.as_db_error() {
        let code = db.code().code();
        return match &code[..2] {
            "28" => DriverError::auth(db.message()),
            "42" => DriverError::schema(db.message()),
            "08" => DriverError::connection(db.message()),
            "53" | "57" => DriverError::server(db.message()),
            _ => DriverError::payload(db.message()),
        };
    }
    if err.is_closed() {
        return DriverError::connection(err.to_string());
    }
    DriverError::connection(err.to_string())
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Text(s) => s.to_sql(ty, out),
            SqlValue::Float(f) => f.to_sql(ty, out),
            SqlValue::Bool(b) => b.to_sql(ty, out),
            SqlValue::Json(v) => v.to_sql(ty, out),
            SqlValue::Null => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

pub struct PgDriver {
    config: PgConfig,
    pool: PgPool,
    dialect: Postgres,
}

impl PgDriver {
    pub fn from_config(config: serde_json::Value) -> Result<Self, DriverError> {
        let config: PgConfig =
            serde_json::from_value(config).map_err(|e| DriverError::payload(e.to_string()))?;
        let pool = PgPool::new(config.max_connections);
        Ok(PgDriver {
            config,
            pool,
            dialect: Postgres,
        })
    }

    fn statement_for(&self, destination: &str, op: &ReplicateOp) -> Option<statements::Statement> {
        match op.operation {
            Operation::Inserted => op
                .record
                .as_ref()
                .map(|r| statements::insert(&self.dialect, destination, r)),
            Operation::Updated => op
                .record
                .as_ref()
                .map(|r| statements::update(&self.dialect, destination, &op.record_id, r)),
            Operation::Deleted => Some(statements::delete(&self.dialect, destination, &op.record_id)),
        }
    }

    async fn execute(&self, destination: &str, op: &ReplicateOp) -> Result<(), DriverError> {
        let stmt = self
            .statement_for(destination, op)
            .ok_or_else(|| DriverError::payload("missing record payload"))?;

        let (permit, mut client) = self.pool.acquire(&self.config).await?;
        let result = self.run_statements(&mut client, destination, op, stmt).await;
        self.pool.release(client).await;
        drop(permit);
        result
    }

    async fn run_statements(
        &self,
        client: &mut Client,
        destination: &str,
        op: &ReplicateOp,
        stmt: statements::Statement,
    ) -> Result<(), DriverError> {
        match &self.config.log_table {
            Some(log_table) => {
                let audit = statements::audit_insert(
                    &self.dialect,
                    log_table,
                    &Uuid::new_v4().to_string(),
                    destination,
                    &op.record_id,
                    op.operation.as_str(),
                    op.record.as_ref(),
                );
                let tx = client.transaction().await.map_err(classify)?;
                tx.execute(&stmt.sql, &param_refs(&stmt.params))
                    .await
                    .map_err(classify)?;
                tx.execute(&audit.sql, &param_refs(&audit.params))
                    .await
                    .map_err(classify)?;
                tx.commit().await.map_err(classify)?;
            }
            None => {
                client
                    .execute(&stmt.sql, &param_refs(&stmt.params))
                    .await
                    .map_err(classify)?;
            }
        }
        debug!(table = destination, id = %op.record_id, op = %op.operation, "replicated to postgres");
        Ok(())
    }
}

fn param_refs(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl Driver for PgDriver {
    fn kind(&self) -> &str {
        "postgresql"
    }

    async fn init(&self) -> Result<(), DriverError> {
        let (permit, client) = self.pool.acquire(&self.config).await?;
        self.pool.release(client).await;
        drop(permit);
        Ok(())
    }

    fn schema_sync(&self) -> Option<&dyn SchemaSync> {
        Some(self)
    }

    async fn replicate(&self, destination: &str, op: &ReplicateOp) -> Result<(), DriverError> {
        self.execute(destination, op).await
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.pool.clear().await;
        Ok(())
    }
}

const INTROSPECT_SQL: &str = "SELECT column_name, data_type, character_maximum_length \
     FROM information_schema.columns \
     WHERE table_schema = current_schema() AND table_name = $1 \
     ORDER BY ordinal_position";

#[async_trait]
impl SchemaSync for PgDriver {
    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn introspect(&self, table: &str) -> Result<Option<Vec<ActualColumn>>, DriverError> {
        let (permit, client) = self.pool.acquire(&self.config).await?;
        let rows = client.query(INTROSPECT_SQL, &[&table]).await.map_err(classify);
        self.pool.release(client).await;
        drop(permit);

        let rows = rows?;
        if rows.is_empty() {
            return Ok(None);
        }

        let columns = rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let data_type: String = row.get(1);
                let max_len: Option<i32> = row.get(2);
                let sql_type = match max_len {
                    Some(n) => format!("{data_type}({n})"),
                    None => data_type,
                };
                ActualColumn { name, sql_type }
            })
            .collect();
        Ok(Some(columns))
    }

    async fn execute_ddl(&self, statement: &str) -> Result<(), DriverError> {
        let (permit, client) = self.pool.acquire(&self.config).await?;
        let result = client.batch_execute(statement).await.map_err(classify);
        self.pool.release(client).await;
        drop(permit);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_defaults() {
        let config: PgConfig =
            serde_json::from_value(json!({"connection_string": "postgres://localhost/db"})).unwrap();
        assert_eq!(config.max_connections, 10);
        assert!(!config.use_tls);
        assert!(config.log_table.is_none());
    }

    #[test]
    fn url_alias_accepted() {
        let config: PgConfig =
            serde_json::from_value(json!({"url": "postgres://localhost/db", "log_table": "audit"}))
                .unwrap();
        assert_eq!(config.connection_string, "postgres://localhost/db");
        assert_eq!(config.log_table.as_deref(), Some("audit"));
    }

    #[test]
    fn driver_construction_performs_no_io() {
        let driver =
            PgDriver::from_config(json!({"connection_string": "postgres://localhost/db"})).unwrap();
        assert_eq!(driver.kind(), "postgresql");
        assert!(driver.schema_sync().is_some());
    }
}
