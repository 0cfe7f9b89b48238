//! Turso (libSQL) destination driver.

use crate::{
    contract::{Driver, ReplicateOp, SchemaSync},
    error::DriverError,
    sql::{statements, value::SqlValue},
};
use async_trait::async_trait;
use libsql::Builder;
use model::core::operation::Operation;
use schema::{
    dialect::{Dialect, Sqlite},
    plan::ActualColumn,
};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct TursoConfig {
    /// `libsql://` / `https://` remote URL, or a local file path.
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

pub struct TursoDriver {
    config: TursoConfig,
    conn: OnceCell<libsql::Connection>,
    dialect: Sqlite,
}

fn to_libsql_value(value: &SqlValue) -> libsql::Value {
    match value {
        SqlValue::Text(s) => libsql::Value::Text(s.clone()),
        SqlValue::Float(f) => libsql::Value::Real(*f),
        SqlValue::Bool(b) => libsql::Value::Integer(i64::from(*b)),
        SqlValue::Json(v) => libsql::Value::Text(v.to_string()),
        SqlValue::Null => libsql::Value::Null,
    }
}

fn classify(err: libsql::Error) -> DriverError {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("busy") || lowered.contains("locked") {
        DriverError::server(message)
    } else if lowered.contains("connect") || lowered.contains("network") || lowered.contains("http")
    {
        DriverError::connection(message)
    } else {
        DriverError::payload(message)
    }
}

impl TursoDriver {
    pub fn from_config(config: serde_json::Value) -> Result<Self, DriverError> {
        let config: TursoConfig =
            serde_json::from_value(config).map_err(|e| DriverError::payload(e.to_string()))?;
        Ok(TursoDriver {
            config,
            conn: OnceCell::new(),
            dialect: Sqlite,
        })
    }

    async fn conn(&self) -> Result<&libsql::Connection, DriverError> {
        self.conn
            .get_or_try_init(|| async {
                let remote = self.config.url.starts_with("libsql://")
                    || self.config.url.starts_with("http://")
                    || self.config.url.starts_with("https://");
                let db = if remote {
                    Builder::new_remote(
                        self.config.url.clone(),
                        self.config.auth_token.clone().unwrap_or_default(),
                    )
                    .build()
                    .await
                    .map_err(classify)?
                } else {
                    Builder::new_local(&self.config.url)
                        .build()
                        .await
                        .map_err(classify)?
                };
                db.connect().map_err(classify)
            })
            .await
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
}

#[async_trait]
impl Driver for TursoDriver {
    fn kind(&self) -> &str {
        "turso"
    }

    async fn init(&self) -> Result<(), DriverError> {
        self.conn().await?;
        Ok(())
    }

    fn schema_sync(&self) -> Option<&dyn SchemaSync> {
        Some(self)
    }

    async fn replicate(&self, destination: &str, op: &ReplicateOp) -> Result<(), DriverError> {
        let stmt = self
            .statement_for(destination, op)
            .ok_or_else(|| DriverError::payload("missing record payload"))?;

        let conn = self.conn().await?;
        let params: Vec<libsql::Value> = stmt.params.iter().map(to_libsql_value).collect();
        conn.execute(&stmt.sql, params).await.map_err(classify)?;

        debug!(table = destination, id = %op.record_id, op = %op.operation, "replicated to turso");
        Ok(())
    }
}

#[async_trait]
impl SchemaSync for TursoDriver {
    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn introspect(&self, table: &str) -> Result<Option<Vec<ActualColumn>>, DriverError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT name, type FROM pragma_table_info(?1)",
                vec![libsql::Value::Text(table.to_string())],
            )
            .await
            .map_err(classify)?;

        let mut columns = Vec::new();
        while let Some(row) = rows.next().await.map_err(classify)? {
            let name: String = row.get(0).map_err(classify)?;
            let sql_type: String = row.get(1).map_err(classify)?;
            columns.push(ActualColumn { name, sql_type });
        }

        if columns.is_empty() {
            Ok(None)
        } else {
            Ok(Some(columns))
        }
    }

    async fn execute_ddl(&self, statement: &str) -> Result<(), DriverError> {
        let conn = self.conn().await?;
        conn.execute(statement, ()).await.map_err(classify)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_accepts_remote_and_local_urls() {
        let driver =
            TursoDriver::from_config(json!({"url": "libsql://db.turso.io", "auth_token": "t"}))
                .unwrap();
        assert_eq!(driver.kind(), "turso");

        let local = TursoDriver::from_config(json!({"url": "/tmp/replica.db"})).unwrap();
        assert_eq!(local.config.auth_token, None);
    }

    #[test]
    fn busy_errors_are_retriable() {
        let err = classify(libsql::Error::SqliteFailure(5, "database is locked".into()));
        assert!(err.is_retriable());
    }
}
