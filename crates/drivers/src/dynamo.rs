//! DynamoDB destination driver.
//!
//! Updates are expressed as update expressions with attribute-name and
//! attribute-value placeholders; record content never reaches the
//! expression text.

use crate::{
    contract::{Driver, ReplicateOp},
    error::DriverError,
};
use async_trait::async_trait;
use aws_sdk_dynamodb::{
    Client,
    error::{ProvideErrorMetadata, SdkError},
    types::AttributeValue,
};
use model::core::{operation::Operation, record::Record};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::debug;

fn default_partition_key() -> String {
    "id".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DynamoDbConfig {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_partition_key")]
    pub partition_key: String,
    #[serde(default)]
    pub sort_key: Option<String>,
}

pub struct DynamoDbDriver {
    config: DynamoDbConfig,
    client: OnceCell<Client>,
}

fn to_attr(value: &JsonValue) -> AttributeValue {
    match value {
        JsonValue::Null => AttributeValue::Null(true),
        JsonValue::Bool(b) => AttributeValue::Bool(*b),
        JsonValue::Number(n) => AttributeValue::N(n.to_string()),
        JsonValue::String(s) => AttributeValue::S(s.clone()),
        JsonValue::Array(items) => AttributeValue::L(items.iter().map(to_attr).collect()),
        JsonValue::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), to_attr(v)))
                .collect(),
        ),
    }
}

fn classify<E, R>(err: SdkError<E, R>) -> DriverError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::DispatchFailure(_) => DriverError::connection(format!("{err:?}")),
        SdkError::TimeoutError(_) => DriverError::timeout(format!("{err:?}")),
        SdkError::ResponseError(_) => DriverError::server(format!("{err:?}")),
        SdkError::ServiceError(service) => {
            let code = service.err().code().unwrap_or_default();
            let message = service
                .err()
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{err:?}"));
            match code {
                "ProvisionedThroughputExceededException"
                | "ThrottlingException"
                | "RequestLimitExceeded" => DriverError::rate_limited(message),
                "ResourceNotFoundException" => DriverError::schema(message),
                "AccessDeniedException"
                | "UnrecognizedClientException"
                | "InvalidSignatureException" => DriverError::auth(message),
                "InternalServerError" | "ServiceUnavailable" => DriverError::server(message),
                _ => DriverError::payload(message),
            }
        }
        _ => DriverError::connection(format!("{err:?}")),
    }
}

impl DynamoDbDriver {
    pub fn from_config(config: serde_json::Value) -> Result<Self, DriverError> {
        let config: DynamoDbConfig =
            serde_json::from_value(config).map_err(|e| DriverError::payload(e.to_string()))?;
        Ok(DynamoDbDriver {
            config,
            client: OnceCell::new(),
        })
    }

    async fn client(&self) -> Result<&Client, DriverError> {
        self.client
            .get_or_try_init(|| async {
                let mut loader =
                    aws_config::defaults(aws_config::BehaviorVersion::latest());
                if let Some(region) = &self.config.region {
                    loader = loader.region(aws_config::Region::new(region.clone()));
                }
                let shared = loader.load().await;
                let mut builder = aws_sdk_dynamodb::config::Builder::from(&shared);
                if let Some(endpoint) = &self.config.endpoint_url {
                    builder = builder.endpoint_url(endpoint);
                }
                Ok(Client::from_conf(builder.build()))
            })
            .await
    }

    fn key_for(&self, op: &ReplicateOp) -> Result<HashMap<String, AttributeValue>, DriverError> {
        let mut key = HashMap::new();
        key.insert(
            self.config.partition_key.clone(),
            AttributeValue::S(op.record_id.clone()),
        );
        if let Some(sort_key) = &self.config.sort_key {
            let source = op.record.as_ref().or(op.before.as_ref());
            let value = source
                .and_then(|r| r.get(sort_key))
                .ok_or_else(|| {
                    DriverError::payload(format!("record missing sort key `{sort_key}`"))
                })?;
            key.insert(sort_key.clone(), to_attr(value));
        }
        Ok(key)
    }

    fn is_key_attribute(&self, name: &str) -> bool {
        name == self.config.partition_key
            || self.config.sort_key.as_deref() == Some(name)
            || name == "id"
    }

    async fn put(&self, table: &str, op: &ReplicateOp, record: &Record) -> Result<(), DriverError> {
        let client = self.client().await?;
        let mut item: HashMap<String, AttributeValue> = record
            .iter()
            .map(|(k, v)| (k.clone(), to_attr(v)))
            .collect();
        item.entry(self.config.partition_key.clone())
            .or_insert_with(|| AttributeValue::S(op.record_id.clone()));

        client
            .put_item()
            .table_name(table)
            .set_item(Some(item))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn update(&self, table: &str, op: &ReplicateOp, record: &Record) -> Result<(), DriverError> {
        let attrs: Vec<(&String, &JsonValue)> = record
            .iter()
            .filter(|(name, _)| !self.is_key_attribute(name))
            .collect();
        if attrs.is_empty() {
            return self.put(table, op, record).await;
        }

        let mut names = HashMap::new();
        let mut values = HashMap::new();
        let mut sets = Vec::with_capacity(attrs.len());
        for (i, (name, value)) in attrs.iter().enumerate() {
            let name_ph = format!("#a{i}");
            let value_ph = format!(":v{i}");
            sets.push(format!("{name_ph} = {value_ph}"));
            names.insert(name_ph, (*name).clone());
            values.insert(value_ph, to_attr(value));
        }

        let client = self.client().await?;
        client
            .update_item()
            .table_name(table)
            .set_key(Some(self.key_for(op)?))
            .update_expression(format!("SET {}", sets.join(", ")))
            .set_expression_attribute_names(Some(names))
            .set_expression_attribute_values(Some(values))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}

#[async_trait]
impl Driver for DynamoDbDriver {
    fn kind(&self) -> &str {
        "dynamodb"
    }

    async fn init(&self) -> Result<(), DriverError> {
        self.client().await?;
        Ok(())
    }

    async fn replicate(&self, destination: &str, op: &ReplicateOp) -> Result<(), DriverError> {
        match op.operation {
            Operation::Inserted => {
                let record = op
                    .record
                    .as_ref()
                    .ok_or_else(|| DriverError::payload("missing record payload"))?;
                self.put(destination, op, record).await?;
            }
            Operation::Updated => {
                let record = op
                    .record
                    .as_ref()
                    .ok_or_else(|| DriverError::payload("missing record payload"))?;
                self.update(destination, op, record).await?;
            }
            Operation::Deleted => {
                let client = self.client().await?;
                client
                    .delete_item()
                    .table_name(destination)
                    .set_key(Some(self.key_for(op)?))
                    .send()
                    .await
                    .map_err(classify)?;
            }
        }
        debug!(table = destination, id = %op.record_id, op = %op.operation, "replicated to dynamodb");
        Ok(())
    }
}
