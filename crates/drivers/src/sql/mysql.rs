//! MySQL-family destination driver, also covering MariaDB and PlanetScale.

use crate::{
    contract::{Driver, ReplicateOp, SchemaSync},
    error::DriverError,
    sql::{statements, value::SqlValue},
};
use async_trait::async_trait;
use model::core::operation::Operation;
use mysql_async::{
    Opts, OptsBuilder, Params, Pool, PoolConstraints, PoolOpts, SslOpts, TxOpts,
    prelude::Queryable,
};
use schema::{
    dialect::{Dialect, MySql},
    plan::ActualColumn,
};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MySqlFlavor {
    MySql,
    MariaDb,
    /// PlanetScale requires TLS; the driver enables it unconditionally.
    PlanetScale,
}

fn default_max_connections() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct MySqlConfig {
    #[serde(alias = "connection_string")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub log_table: Option<String>,
}

pub struct MySqlDriver {
    flavor: MySqlFlavor,
    config: MySqlConfig,
    pool: OnceCell<Pool>,
    dialect: MySql,
}

fn to_mysql_value(value: &SqlValue) -> mysql_async::Value {
    match value {
        SqlValue::Text(s) => mysql_async::Value::Bytes(s.clone().into_bytes()),
        SqlValue::Float(f) => mysql_async::Value::Double(*f),
        SqlValue::Bool(b) => mysql_async::Value::Int(i64::from(*b)),
        SqlValue::Json(v) => mysql_async::Value::Bytes(v.to_string().into_bytes()),
        SqlValue::Null => mysql_async::Value::NULL,
    }
}

fn to_params(values: &[SqlValue]) -> Params {
    if values.is_empty() {
        Params::Empty
    } else {
        Params::Positional(values.iter().map(to_mysql_value).collect())
    }
}

fn classify(err: mysql_async::Error) -> DriverError {
    match &err {
        mysql_async::Error::Server(server) => match server.code {
            1044 | 1045 | 1142 => DriverError::auth(server.message.clone()),
            1054 | 1146 => DriverError::schema(server.message.clone()),
            1205 | 1213 => DriverError::server(server.message.clone()),
            _ => DriverError::payload(server.message.clone()),
        },
        mysql_async::Error::Io(_) | mysql_async::Error::Driver(_) => {
            DriverError::connection(err.to_string())
        }
        _ => DriverError::connection(err.to_string()),
    }
}

impl MySqlDriver {
    pub fn from_config(config: serde_json::Value, flavor: MySqlFlavor) -> Result<Self, DriverError> {
        let config: MySqlConfig =
            serde_json::from_value(config).map_err(|e| DriverError::payload(e.to_string()))?;
        Ok(MySqlDriver {
            flavor,
            config,
            pool: OnceCell::new(),
            dialect: MySql,
        })
    }

    async fn pool(&self) -> Result<&Pool, DriverError> {
        self.pool
            .get_or_try_init(|| async {
                let opts =
                    Opts::from_url(&self.config.url).map_err(|e| DriverError::payload(e.to_string()))?;
                let constraints = PoolConstraints::new(1, self.config.max_connections.max(1))
                    .unwrap_or_default();
                let mut builder = OptsBuilder::from_opts(opts)
                    .pool_opts(PoolOpts::default().with_constraints(constraints));
                if self.config.ssl || self.flavor == MySqlFlavor::PlanetScale {
                    builder = builder.ssl_opts(SslOpts::default());
                }
                Ok(Pool::new(builder))
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
impl Driver for MySqlDriver {
    fn kind(&self) -> &str {
        match self.flavor {
            MySqlFlavor::MySql => "mysql",
            MySqlFlavor::MariaDb => "mariadb",
            MySqlFlavor::PlanetScale => "planetscale",
        }
    }

    async fn init(&self) -> Result<(), DriverError> {
        let pool = self.pool().await?;
        pool.get_conn().await.map_err(classify)?;
        Ok(())
    }

    fn schema_sync(&self) -> Option<&dyn SchemaSync> {
        Some(self)
    }

    async fn replicate(&self, destination: &str, op: &ReplicateOp) -> Result<(), DriverError> {
        let stmt = self
            .statement_for(destination, op)
            .ok_or_else(|| DriverError::payload("missing record payload"))?;

        let pool = self.pool().await?;
        let mut conn = pool.get_conn().await.map_err(classify)?;

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
                let mut tx = conn
                    .start_transaction(TxOpts::default())
                    .await
                    .map_err(classify)?;
                tx.exec_drop(&stmt.sql, to_params(&stmt.params))
                    .await
                    .map_err(classify)?;
                tx.exec_drop(&audit.sql, to_params(&audit.params))
                    .await
                    .map_err(classify)?;
                tx.commit().await.map_err(classify)?;
            }
            None => {
                conn.exec_drop(&stmt.sql, to_params(&stmt.params))
                    .await
                    .map_err(classify)?;
            }
        }

        debug!(table = destination, id = %op.record_id, op = %op.operation, "replicated to mysql");
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        if let Some(pool) = self.pool.get() {
            pool.clone()
                .disconnect()
                .await
                .map_err(|e| DriverError::connection(e.to_string()))?;
        }
        Ok(())
    }
}

const INTROSPECT_SQL: &str = "SELECT COLUMN_NAME, COLUMN_TYPE \
     FROM information_schema.COLUMNS \
     WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
     ORDER BY ORDINAL_POSITION";

#[async_trait]
impl SchemaSync for MySqlDriver {
    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn introspect(&self, table: &str) -> Result<Option<Vec<ActualColumn>>, DriverError> {
        let pool = self.pool().await?;
        let mut conn = pool.get_conn().await.map_err(classify)?;
        let rows: Vec<(String, String)> = conn
            .exec(INTROSPECT_SQL, (table,))
            .await
            .map_err(classify)?;

        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            rows.into_iter()
                .map(|(name, sql_type)| ActualColumn { name, sql_type })
                .collect(),
        ))
    }

    async fn execute_ddl(&self, statement: &str) -> Result<(), DriverError> {
        let pool = self.pool().await?;
        let mut conn = pool.get_conn().await.map_err(classify)?;
        conn.query_drop(statement).await.map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flavor_selects_kind() {
        let mk = |flavor| {
            MySqlDriver::from_config(json!({"url": "mysql://localhost/db"}), flavor).unwrap()
        };
        assert_eq!(mk(MySqlFlavor::MySql).kind(), "mysql");
        assert_eq!(mk(MySqlFlavor::MariaDb).kind(), "mariadb");
        assert_eq!(mk(MySqlFlavor::PlanetScale).kind(), "planetscale");
    }

    #[test]
    fn value_conversion() {
        assert_eq!(
            to_mysql_value(&SqlValue::Bool(true)),
            mysql_async::Value::Int(1)
        );
        assert_eq!(to_mysql_value(&SqlValue::Null), mysql_async::Value::NULL);
        assert!(matches!(
            to_mysql_value(&SqlValue::Json(json!({"a": 1}))),
            mysql_async::Value::Bytes(_)
        ));
    }
}
