//! MongoDB destination driver.

use crate::{
    contract::{Driver, ReplicateOp},
    error::DriverError,
};
use async_trait::async_trait;
use model::core::operation::Operation;
use mongodb::{
    Client,
    bson::{Bson, Document, doc},
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::OnceCell;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    #[serde(alias = "connection_string")]
    pub uri: String,
    pub database: String,
}

pub struct MongoDriver {
    config: MongoConfig,
    client: OnceCell<Client>,
}

fn to_bson(value: &JsonValue) -> Bson {
    match value {
        JsonValue::Null => Bson::Null,
        JsonValue::Bool(b) => Bson::Boolean(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Bson::Int64(i)
            } else {
                Bson::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => Bson::String(s.clone()),
        JsonValue::Array(items) => Bson::Array(items.iter().map(to_bson).collect()),
        JsonValue::Object(map) => {
            let mut doc = Document::new();
            for (k, v) in map {
                doc.insert(k.clone(), to_bson(v));
            }
            Bson::Document(doc)
        }
    }
}

fn classify(err: mongodb::error::Error) -> DriverError {
    use mongodb::error::ErrorKind;
    match err.kind.as_ref() {
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. } => {
            DriverError::connection(err.to_string())
        }
        ErrorKind::Authentication { .. } => DriverError::auth(err.to_string()),
        _ => DriverError::payload(err.to_string()),
    }
}

impl MongoDriver {
    pub fn from_config(config: serde_json::Value) -> Result<Self, DriverError> {
        let config: MongoConfig =
            serde_json::from_value(config).map_err(|e| DriverError::payload(e.to_string()))?;
        Ok(MongoDriver {
            config,
            client: OnceCell::new(),
        })
    }

    async fn client(&self) -> Result<&Client, DriverError> {
        self.client
            .get_or_try_init(|| async {
                Client::with_uri_str(&self.config.uri)
                    .await
                    .map_err(classify)
            })
            .await
    }

    /// The destination's native id: `_id` verbatim when the record carries
    /// one, otherwise derived from the record id.
    fn document_id(op: &ReplicateOp) -> Bson {
        op.record
            .as_ref()
            .and_then(|r| r.get("_id"))
            .map(to_bson)
            .unwrap_or_else(|| Bson::String(op.record_id.clone()))
    }
}

#[async_trait]
impl Driver for MongoDriver {
    fn kind(&self) -> &str {
        "mongodb"
    }

    async fn init(&self) -> Result<(), DriverError> {
        self.client().await?;
        Ok(())
    }

    async fn replicate(&self, destination: &str, op: &ReplicateOp) -> Result<(), DriverError> {
        let client = self.client().await?;
        let collection = client
            .database(&self.config.database)
            .collection::<Document>(destination);
        let id = Self::document_id(op);

        match op.operation {
            Operation::Inserted | Operation::Updated => {
                let record = op
                    .record
                    .as_ref()
                    .ok_or_else(|| DriverError::payload("missing record payload"))?;
                let mut document = match to_bson(&JsonValue::Object(record.clone())) {
                    Bson::Document(doc) => doc,
                    _ => Document::new(),
                };
                document.insert("_id", id.clone());

                collection
                    .replace_one(doc! {"_id": id}, document)
                    .upsert(true)
                    .await
                    .map_err(classify)?;
            }
            Operation::Deleted => {
                collection
                    .delete_one(doc! {"_id": id})
                    .await
                    .map_err(classify)?;
            }
        }

        debug!(collection = destination, id = %op.record_id, op = %op.operation, "replicated to mongodb");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use model::core::record::as_record;
    use serde_json::json;

    fn op(record: serde_json::Value) -> ReplicateOp {
        ReplicateOp {
            resource: "users".into(),
            operation: Operation::Inserted,
            record_id: "u1".into(),
            record: Some(as_record(record).unwrap()),
            before: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn preserves_existing_native_id() {
        let event = op(json!({"_id": "native", "name": "A"}));
        assert_eq!(MongoDriver::document_id(&event), Bson::String("native".into()));
    }

    #[test]
    fn derives_id_from_record_id_when_absent() {
        let event = op(json!({"name": "A"}));
        assert_eq!(MongoDriver::document_id(&event), Bson::String("u1".into()));
    }

    #[test]
    fn bson_conversion_keeps_integer_precision() {
        assert_eq!(to_bson(&json!(7)), Bson::Int64(7));
        assert_eq!(to_bson(&json!(1.5)), Bson::Double(1.5));
        assert!(matches!(to_bson(&json!({"a": [1]})), Bson::Document(_)));
    }
}
