//! SQS destination driver.
//!
//! Destinations resolve to a per-resource queue URL or a single default
//! queue. FIFO queues get a message group id for ordering and, when
//! enabled, a deterministic content-derived deduplication id.

use crate::{
    contract::{Driver, ReplicateOp},
    error::DriverError,
};
use async_trait::async_trait;
use aws_sdk_sqs::{
    Client,
    error::{ProvideErrorMetadata, SdkError},
    types::SendMessageBatchRequestEntry,
};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct SqsConfig {
    /// Fallback queue when no per-resource entry matches.
    #[serde(default)]
    pub queue_url: Option<String>,
    /// Per-resource queue URLs.
    #[serde(default)]
    pub queues: HashMap<String, String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Group id for FIFO queues; defaults to the resource name.
    #[serde(default)]
    pub message_group_id: Option<String>,
    /// Attach a deterministic deduplication id on FIFO queues.
    #[serde(default)]
    pub deduplication: bool,
}

pub struct SqsDriver {
    config: SqsConfig,
    client: OnceCell<Client>,
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
                "ThrottlingException" | "RequestThrottled" => DriverError::rate_limited(message),
                "QueueDoesNotExist"
                | "AWS.SimpleQueueService.NonExistentQueue" => DriverError::payload(message),
                "AccessDeniedException" | "InvalidSignatureException" => DriverError::auth(message),
                "ServiceUnavailable" | "InternalError" => DriverError::server(message),
                _ => DriverError::payload(message),
            }
        }
        _ => DriverError::connection(format!("{err:?}")),
    }
}

/// Message body: the wire format consumers see on the queue.
fn message_body(op: &ReplicateOp) -> JsonValue {
    let mut body = json!({
        "resource": op.resource,
        "operation": op.operation,
        "recordId": op.record_id,
        "data": op.record,
        "timestamp": op.timestamp.to_rfc3339(),
    });
    if let Some(before) = &op.before {
        body["before"] = JsonValue::Object(before.clone());
    }
    body
}

/// Deterministic deduplication id from the op identity: same op, same id.
fn dedup_id(op: &ReplicateOp) -> String {
    let discriminant = op
        .record
        .as_ref()
        .and_then(|r| r.get("version"))
        .map(|v| v.to_string())
        .unwrap_or_else(|| op.timestamp.timestamp_millis().to_string());
    let raw = format!(
        "{}-{}-{}-{}",
        op.resource, op.record_id, op.operation, discriminant
    );
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(128)
        .collect()
}

impl SqsDriver {
    pub fn from_config(config: serde_json::Value) -> Result<Self, DriverError> {
        let config: SqsConfig =
            serde_json::from_value(config).map_err(|e| DriverError::payload(e.to_string()))?;
        Ok(SqsDriver {
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
                let mut builder = aws_sdk_sqs::config::Builder::from(&shared);
                if let Some(endpoint) = &self.config.endpoint_url {
                    builder = builder.endpoint_url(endpoint);
                }
                Ok(Client::from_conf(builder.build()))
            })
            .await
    }

    fn resolve_queue(&self, destination: &str) -> Result<String, DriverError> {
        if destination.starts_with("http://") || destination.starts_with("https://") {
            return Ok(destination.to_string());
        }
        self.config
            .queues
            .get(destination)
            .or(self.config.queue_url.as_ref())
            .cloned()
            .ok_or_else(|| {
                DriverError::payload(format!("no queue url configured for `{destination}`"))
            })
    }

    fn group_id(&self, op: &ReplicateOp) -> String {
        self.config
            .message_group_id
            .clone()
            .unwrap_or_else(|| op.resource.clone())
    }
}

#[async_trait]
impl Driver for SqsDriver {
    fn kind(&self) -> &str {
        "sqs"
    }

    async fn init(&self) -> Result<(), DriverError> {
        self.client().await?;
        Ok(())
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn replicate(&self, destination: &str, op: &ReplicateOp) -> Result<(), DriverError> {
        let queue_url = self.resolve_queue(destination)?;
        let client = self.client().await?;

        let mut request = client
            .send_message()
            .queue_url(&queue_url)
            .message_body(message_body(op).to_string());

        if queue_url.ends_with(".fifo") {
            request = request.message_group_id(self.group_id(op));
            if self.config.deduplication {
                request = request.message_deduplication_id(dedup_id(op));
            }
        }

        request.send().await.map_err(classify)?;
        debug!(queue = %queue_url, id = %op.record_id, op = %op.operation, "message sent to sqs");
        Ok(())
    }

    async fn replicate_batch(
        &self,
        destination: &str,
        ops: &[ReplicateOp],
    ) -> Vec<Result<(), DriverError>> {
        let queue_url = match self.resolve_queue(destination) {
            Ok(url) => url,
            Err(err) => return ops.iter().map(|_| Err(err.clone())).collect(),
        };
        let client = match self.client().await {
            Ok(client) => client,
            Err(err) => return ops.iter().map(|_| Err(err.clone())).collect(),
        };

        let fifo = queue_url.ends_with(".fifo");
        let mut results: Vec<Result<(), DriverError>> = Vec::with_capacity(ops.len());

        // SendMessageBatch accepts at most ten entries per call.
        for (chunk_no, chunk) in ops.chunks(10).enumerate() {
            let mut entries = Vec::with_capacity(chunk.len());
            let mut build_error = None;
            for (i, op) in chunk.iter().enumerate() {
                let mut entry = SendMessageBatchRequestEntry::builder()
                    .id(format!("{chunk_no}-{i}"))
                    .message_body(message_body(op).to_string());
                if fifo {
                    entry = entry.message_group_id(self.group_id(op));
                    if self.config.deduplication {
                        entry = entry.message_deduplication_id(dedup_id(op));
                    }
                }
                match entry.build() {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        build_error = Some(DriverError::payload(e.to_string()));
                        break;
                    }
                }
            }
            if let Some(err) = build_error {
                for _ in chunk {
                    results.push(Err(err.clone()));
                }
                continue;
            }

            match client
                .send_message_batch()
                .queue_url(&queue_url)
                .set_entries(Some(entries))
                .send()
                .await
            {
                Ok(output) => {
                    let failed: Vec<String> = output
                        .failed()
                        .iter()
                        .map(|f| f.id().to_string())
                        .collect();
                    for (i, _) in chunk.iter().enumerate() {
                        if failed.contains(&format!("{chunk_no}-{i}")) {
                            results.push(Err(DriverError::server("batch entry rejected")));
                        } else {
                            results.push(Ok(()));
                        }
                    }
                }
                Err(err) => {
                    let classified = classify(err);
                    for _ in chunk {
                        results.push(Err(classified.clone()));
                    }
                }
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use model::core::{operation::Operation, record::as_record};
    use serde_json::json;

    fn op() -> ReplicateOp {
        ReplicateOp {
            resource: "orders".into(),
            operation: Operation::Updated,
            record_id: "o1".into(),
            record: Some(as_record(json!({"id": "o1", "total": 10})).unwrap()),
            before: Some(as_record(json!({"id": "o1", "total": 5})).unwrap()),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn body_carries_wire_fields() {
        let body = message_body(&op());
        assert_eq!(body["resource"], "orders");
        assert_eq!(body["operation"], "updated");
        assert_eq!(body["recordId"], "o1");
        assert_eq!(body["data"]["total"], 10);
        assert_eq!(body["before"]["total"], 5);
        assert!(body["timestamp"].as_str().unwrap().starts_with("2023-"));
    }

    #[test]
    fn dedup_id_is_deterministic() {
        assert_eq!(dedup_id(&op()), dedup_id(&op()));
        assert!(dedup_id(&op()).len() <= 128);
    }

    #[test]
    fn dedup_id_prefers_record_version() {
        let mut event = op();
        event
            .record
            .as_mut()
            .unwrap()
            .insert("version".into(), json!(7));
        assert!(dedup_id(&event).ends_with("-7"));
    }

    #[test]
    fn queue_resolution_order() {
        let driver = SqsDriver::from_config(json!({
            "queue_url": "https://sqs.aws/default",
            "queues": {"orders": "https://sqs.aws/orders.fifo"},
        }))
        .unwrap();
        assert_eq!(
            driver.resolve_queue("orders").unwrap(),
            "https://sqs.aws/orders.fifo"
        );
        assert_eq!(
            driver.resolve_queue("users").unwrap(),
            "https://sqs.aws/default"
        );
        assert_eq!(
            driver.resolve_queue("https://sqs.aws/explicit").unwrap(),
            "https://sqs.aws/explicit"
        );

        let bare = SqsDriver::from_config(json!({})).unwrap();
        assert!(bare.resolve_queue("users").is_err());
    }
}
