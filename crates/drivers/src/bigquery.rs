//! BigQuery destination driver: REST streaming inserts plus DML for the
//! mutable mode.
//!
//! The streaming buffer rejects UPDATE / DELETE against freshly inserted
//! rows, so the driver offers three mutability modes. `append-only`
//! (default) turns every mutation into an insert with tracking columns;
//! `mutable` issues real DML and retries streaming-buffer contention;
//! `immutable` appends versioned rows with a tombstone flag.

use crate::{
    contract::{Driver, ReplicateOp, SchemaSync},
    error::DriverError,
    sql::{statements, value::SqlValue},
};
use async_trait::async_trait;
use model::core::operation::Operation;
use reqwest::StatusCode;
use schema::{
    dialect::{BigQuery, Dialect},
    mapper::TrackingColumns,
    plan::ActualColumn,
};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::{collections::HashMap, time::Duration};
use tracing::{debug, warn};

const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com";

/// Fixed schedule for rows stuck in the streaming buffer.
const STREAMING_BUFFER_DELAY: Duration = Duration::from_secs(30);
const STREAMING_BUFFER_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mutability {
    #[default]
    AppendOnly,
    Mutable,
    Immutable,
}

impl Mutability {
    pub fn tracking_columns(&self) -> TrackingColumns {
        match self {
            Mutability::AppendOnly => TrackingColumns::AppendOnly,
            Mutability::Mutable => TrackingColumns::None,
            Mutability::Immutable => TrackingColumns::Immutable,
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BigQueryConfig {
    pub project_id: String,
    pub dataset: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub mutability: Mutability,
    /// Per-resource overrides of the global mode.
    #[serde(default)]
    pub resource_mutability: HashMap<String, Mutability>,
}

pub struct BigQueryDriver {
    config: BigQueryConfig,
    client: reqwest::Client,
    dialect: BigQuery,
}

/// Builds the row payload for the append-only and immutable modes.
///
/// Deletes carry only the record id and tracking columns; the data
/// payload stays null.
fn tracked_row(op: &ReplicateOp, mode: Mutability, version: Option<i64>) -> serde_json::Map<String, JsonValue> {
    let mut row = match (&op.record, op.operation) {
        (Some(record), Operation::Inserted | Operation::Updated) => record.clone(),
        _ => {
            let mut row = serde_json::Map::new();
            row.insert("id".to_string(), JsonValue::String(op.record_id.clone()));
            row
        }
    };

    row.insert(
        "_operation_type".to_string(),
        JsonValue::String(op.operation.as_str().to_string()),
    );
    row.insert(
        "_operation_timestamp".to_string(),
        JsonValue::String(op.timestamp.to_rfc3339()),
    );

    if mode == Mutability::Immutable {
        row.insert(
            "_is_deleted".to_string(),
            JsonValue::Bool(op.operation == Operation::Deleted),
        );
        row.insert(
            "_version".to_string(),
            JsonValue::Number(version.unwrap_or(1).into()),
        );
    }

    row
}

fn insert_id(op: &ReplicateOp) -> String {
    format!(
        "{}-{}-{}",
        op.record_id,
        op.operation,
        op.timestamp.timestamp_millis()
    )
}

fn query_parameter(value: &SqlValue) -> JsonValue {
    let (ty, rendered) = match value {
        SqlValue::Text(s) => ("STRING", Some(s.clone())),
        SqlValue::Float(f) => ("FLOAT64", Some(f.to_string())),
        SqlValue::Bool(b) => ("BOOL", Some(b.to_string())),
        SqlValue::Json(v) => ("JSON", Some(v.to_string())),
        SqlValue::Null => ("STRING", None),
    };
    json!({
        "parameterType": {"type": ty},
        "parameterValue": {"value": rendered},
    })
}

fn is_streaming_buffer_error(message: &str) -> bool {
    message.to_lowercase().contains("streaming buffer")
}

/// The tables API reports legacy type names; normalise to standard SQL.
fn standard_type_name(api_type: &str) -> String {
    match api_type.to_uppercase().as_str() {
        "FLOAT" => "FLOAT64".to_string(),
        "BOOLEAN" => "BOOL".to_string(),
        "INTEGER" => "INT64".to_string(),
        other => other.to_string(),
    }
}

impl BigQueryDriver {
    pub fn from_config(config: serde_json::Value) -> Result<Self, DriverError> {
        let config: BigQueryConfig =
            serde_json::from_value(config).map_err(|e| DriverError::payload(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DriverError::connection(e.to_string()))?;
        Ok(BigQueryDriver {
            config,
            client,
            dialect: BigQuery,
        })
    }

    pub fn mode_for(&self, resource: &str) -> Mutability {
        self.config
            .resource_mutability
            .get(resource)
            .copied()
            .unwrap_or(self.config.mutability)
    }

    fn table_ref(&self, table: &str) -> String {
        format!("{}.{}", self.config.dataset, table)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.config.auth_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn classify_transport(err: reqwest::Error) -> DriverError {
        if err.is_timeout() {
            DriverError::timeout(err.to_string())
        } else {
            DriverError::connection(err.to_string())
        }
    }

    fn classify_status(status: StatusCode, body: &str) -> DriverError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DriverError::auth(body.to_string()),
            StatusCode::TOO_MANY_REQUESTS => DriverError::rate_limited(body.to_string()),
            StatusCode::NOT_FOUND => DriverError::schema(body.to_string()),
            s if s.is_server_error() => DriverError::server(body.to_string()),
            _ => DriverError::payload(body.to_string()),
        }
    }

    async fn insert_all(&self, table: &str, rows: Vec<JsonValue>) -> Result<(), DriverError> {
        let url = format!(
            "{}/bigquery/v2/projects/{}/datasets/{}/tables/{}/insertAll",
            self.config.endpoint, self.config.project_id, self.config.dataset, table
        );
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&json!({"rows": rows}))
            .send()
            .await
            .map_err(Self::classify_transport)?;

        let status = response.status();
        let body: JsonValue = response
            .json()
            .await
            .unwrap_or(JsonValue::Null);

        if !status.is_success() {
            return Err(Self::classify_status(status, &body.to_string()));
        }

        if let Some(errors) = body.get("insertErrors").and_then(|e| e.as_array())
            && !errors.is_empty()
        {
            return Err(DriverError::payload(format!(
                "insertAll rejected {} rows: {}",
                errors.len(),
                serde_json::to_string(errors).unwrap_or_default()
            )));
        }

        Ok(())
    }

    async fn run_query(&self, sql: &str, params: &[SqlValue]) -> Result<JsonValue, DriverError> {
        let url = format!(
            "{}/bigquery/v2/projects/{}/queries",
            self.config.endpoint, self.config.project_id
        );
        let parameters: Vec<JsonValue> = params.iter().map(query_parameter).collect();
        let mut body = json!({
            "query": sql,
            "useLegacySql": false,
        });
        if !parameters.is_empty() {
            body["parameterMode"] = json!("POSITIONAL");
            body["queryParameters"] = JsonValue::Array(parameters);
        }

        let response = self
            .request(reqwest::Method::POST, url)
            .json(&body)
            .send()
            .await
            .map_err(Self::classify_transport)?;

        let status = response.status();
        let payload: JsonValue = response.json().await.unwrap_or(JsonValue::Null);
        if !status.is_success() {
            return Err(Self::classify_status(status, &payload.to_string()));
        }
        Ok(payload)
    }

    /// DML with the fixed streaming-buffer schedule: rows still in the
    /// buffer retry after 30 s, twice, then escalate as permanent.
    async fn run_dml(&self, sql: &str, params: &[SqlValue]) -> Result<(), DriverError> {
        let mut attempt = 0;
        loop {
            match self.run_query(sql, params).await {
                Ok(_) => return Ok(()),
                Err(err) if is_streaming_buffer_error(&err.message) => {
                    if attempt >= STREAMING_BUFFER_ATTEMPTS {
                        return Err(DriverError::payload(format!(
                            "row still in streaming buffer after {attempt} retries: {}",
                            err.message
                        )));
                    }
                    attempt += 1;
                    warn!(attempt, "streaming buffer contention, retrying after fixed delay");
                    tokio::time::sleep(STREAMING_BUFFER_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn next_version(&self, table: &str, record_id: &str) -> Result<i64, DriverError> {
        let table_ref = self.dialect.quote_identifier(&self.table_ref(table));
        let sql = format!("SELECT MAX(`_version`) FROM {table_ref} WHERE `id` = ?");
        let result = self
            .run_query(&sql, &[SqlValue::Text(record_id.to_string())])
            .await?;

        let max = result
            .pointer("/rows/0/f/0/v")
            .and_then(|v| v.as_str())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(max + 1)
    }

    async fn replicate_append(
        &self,
        table: &str,
        op: &ReplicateOp,
        mode: Mutability,
    ) -> Result<(), DriverError> {
        let version = if mode == Mutability::Immutable {
            Some(self.next_version(table, &op.record_id).await?)
        } else {
            None
        };
        let row = tracked_row(op, mode, version);
        self.insert_all(
            table,
            vec![json!({"insertId": insert_id(op), "json": row})],
        )
        .await
    }

    async fn replicate_mutable(&self, table: &str, op: &ReplicateOp) -> Result<(), DriverError> {
        let table_ref = self.table_ref(table);
        match op.operation {
            Operation::Inserted => {
                let record = op
                    .record
                    .as_ref()
                    .ok_or_else(|| DriverError::payload("missing record payload"))?;
                self.insert_all(
                    table,
                    vec![json!({"insertId": insert_id(op), "json": record})],
                )
                .await
            }
            Operation::Updated => {
                let record = op
                    .record
                    .as_ref()
                    .ok_or_else(|| DriverError::payload("missing record payload"))?;
                let stmt = statements::update(&self.dialect, &table_ref, &op.record_id, record);
                self.run_dml(&stmt.sql, &stmt.params).await
            }
            Operation::Deleted => {
                let stmt = statements::delete(&self.dialect, &table_ref, &op.record_id);
                self.run_dml(&stmt.sql, &stmt.params).await
            }
        }
    }
}

#[async_trait]
impl Driver for BigQueryDriver {
    fn kind(&self) -> &str {
        "bigquery"
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn schema_sync(&self) -> Option<&dyn SchemaSync> {
        Some(self)
    }

    async fn replicate(&self, destination: &str, op: &ReplicateOp) -> Result<(), DriverError> {
        let mode = self.mode_for(&op.resource);
        debug!(table = destination, id = %op.record_id, ?mode, "replicating to bigquery");
        match mode {
            Mutability::AppendOnly | Mutability::Immutable => {
                self.replicate_append(destination, op, mode).await
            }
            Mutability::Mutable => self.replicate_mutable(destination, op).await,
        }
    }

    async fn replicate_batch(
        &self,
        destination: &str,
        ops: &[ReplicateOp],
    ) -> Vec<Result<(), DriverError>> {
        // Streaming inserts batch naturally; DML in mutable mode does not.
        let all_append = ops
            .iter()
            .all(|op| self.mode_for(&op.resource) != Mutability::Mutable);

        if !all_append {
            let mut results = Vec::with_capacity(ops.len());
            for op in ops {
                results.push(self.replicate(destination, op).await);
            }
            return results;
        }

        let mut rows = Vec::with_capacity(ops.len());
        for op in ops {
            let mode = self.mode_for(&op.resource);
            let version = if mode == Mutability::Immutable {
                match self.next_version(destination, &op.record_id).await {
                    Ok(v) => Some(v),
                    Err(err) => return ops.iter().map(|_| Err(err.clone())).collect(),
                }
            } else {
                None
            };
            rows.push(json!({"insertId": insert_id(op), "json": tracked_row(op, mode, version)}));
        }

        match self.insert_all(destination, rows).await {
            Ok(()) => ops.iter().map(|_| Ok(())).collect(),
            Err(err) => ops.iter().map(|_| Err(err.clone())).collect(),
        }
    }
}

#[async_trait]
impl SchemaSync for BigQueryDriver {
    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    fn tracking_columns(&self, resource: &str) -> TrackingColumns {
        self.mode_for(resource).tracking_columns()
    }

    async fn introspect(&self, table: &str) -> Result<Option<Vec<ActualColumn>>, DriverError> {
        let url = format!(
            "{}/bigquery/v2/projects/{}/datasets/{}/tables/{}",
            self.config.endpoint, self.config.project_id, self.config.dataset, table
        );
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(Self::classify_transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        let body: JsonValue = response.json().await.unwrap_or(JsonValue::Null);
        if !status.is_success() {
            return Err(Self::classify_status(status, &body.to_string()));
        }

        let fields = body
            .pointer("/schema/fields")
            .and_then(|f| f.as_array())
            .cloned()
            .unwrap_or_default();
        let columns: Vec<ActualColumn> = fields
            .iter()
            .filter_map(|field| {
                let name = field.get("name")?.as_str()?.to_string();
                let ty = field.get("type")?.as_str()?;
                Some(ActualColumn {
                    name,
                    sql_type: standard_type_name(ty),
                })
            })
            .collect();

        if columns.is_empty() {
            Ok(None)
        } else {
            Ok(Some(columns))
        }
    }

    async fn execute_ddl(&self, statement: &str) -> Result<(), DriverError> {
        self.run_query(statement, &[]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use model::core::record::as_record;
    use serde_json::json;

    fn op(operation: Operation, record: Option<serde_json::Value>) -> ReplicateOp {
        ReplicateOp {
            resource: "users".into(),
            operation,
            record_id: "x".into(),
            record: record.map(|v| as_record(v).unwrap()),
            before: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn append_only_delete_has_null_payload_and_tracking() {
        let row = tracked_row(&op(Operation::Deleted, None), Mutability::AppendOnly, None);
        assert_eq!(row["_operation_type"], "deleted");
        assert_eq!(row["id"], "x");
        assert!(row.contains_key("_operation_timestamp"));
        assert!(!row.contains_key("_is_deleted"));
        assert!(!row.contains_key("name"), "no data payload on delete");
    }

    #[test]
    fn append_only_update_becomes_tracked_insert() {
        let row = tracked_row(
            &op(Operation::Updated, Some(json!({"id": "x", "name": "B"}))),
            Mutability::AppendOnly,
            None,
        );
        assert_eq!(row["_operation_type"], "updated");
        assert_eq!(row["name"], "B");
    }

    #[test]
    fn immutable_rows_carry_tombstone_and_version() {
        let row = tracked_row(&op(Operation::Deleted, None), Mutability::Immutable, Some(4));
        assert_eq!(row["_is_deleted"], true);
        assert_eq!(row["_version"], 4);

        let row = tracked_row(
            &op(Operation::Inserted, Some(json!({"id": "x"}))),
            Mutability::Immutable,
            Some(1),
        );
        assert_eq!(row["_is_deleted"], false);
    }

    #[test]
    fn mode_resolution_prefers_resource_override() {
        let driver = BigQueryDriver::from_config(json!({
            "project_id": "p",
            "dataset": "d",
            "mutability": "mutable",
            "resource_mutability": {"orders": "immutable"},
        }))
        .unwrap();
        assert_eq!(driver.mode_for("orders"), Mutability::Immutable);
        assert_eq!(driver.mode_for("users"), Mutability::Mutable);
    }

    #[test]
    fn tracking_columns_follow_mode() {
        assert_eq!(
            Mutability::AppendOnly.tracking_columns(),
            TrackingColumns::AppendOnly
        );
        assert_eq!(Mutability::Mutable.tracking_columns(), TrackingColumns::None);
        assert_eq!(
            Mutability::Immutable.tracking_columns(),
            TrackingColumns::Immutable
        );
    }

    #[test]
    fn streaming_buffer_detection() {
        assert!(is_streaming_buffer_error(
            "UPDATE or DELETE statement over table would affect rows in the streaming buffer"
        ));
        assert!(!is_streaming_buffer_error("syntax error at [1:1]"));
    }

    #[test]
    fn legacy_type_names_normalise() {
        assert_eq!(standard_type_name("FLOAT"), "FLOAT64");
        assert_eq!(standard_type_name("BOOLEAN"), "BOOL");
        assert_eq!(standard_type_name("STRING"), "STRING");
    }
}
