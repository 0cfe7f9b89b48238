//! Webhook destination driver.
//!
//! POSTs the wire payload to a configured endpoint, classifies responses
//! into retriable and permanent failures, honours `Retry-After`, and
//! exposes a fixed or exponential backoff schedule as its delay policy.

use crate::{
    contract::{Driver, ReplicateOp},
    error::DriverError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::{Method, StatusCode, header::RETRY_AFTER};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::{collections::HashMap, time::Duration};
use tracing::debug;

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_retry_on_status() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_source() -> String {
    "fanout".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    ApiKey {
        header: String,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Base URL; a binding destination may be an absolute URL or a path
    /// joined onto this base.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_on_status")]
    pub retry_on_status: Vec<u16>,
    /// When set, the driver's own schedule overrides the engine backoff.
    #[serde(default)]
    pub retry_strategy: Option<RetryStrategy>,
    #[serde(default)]
    pub initial_delay_ms: Option<u64>,
    /// Engine identifier reported in the payload.
    #[serde(default = "default_source")]
    pub source: String,
}

#[derive(Debug)]
pub struct WebhookDriver {
    config: WebhookConfig,
    method: Method,
    client: reqwest::Client,
}

/// Parses a `Retry-After` header value: delay seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let delta = when.with_timezone(&Utc) - Utc::now();
    Some(Duration::from_secs(delta.num_seconds().max(0) as u64))
}

/// Computes the delay before `attempt_no` (1-based attempt that just
/// failed), with ±25% jitter.
pub fn compute_backoff(strategy: RetryStrategy, initial: Duration, attempt_no: u32) -> Duration {
    let base_ms = match strategy {
        RetryStrategy::Fixed => initial.as_millis() as u64,
        RetryStrategy::Exponential => {
            let factor = 1u64 << attempt_no.saturating_sub(1).min(16);
            (initial.as_millis() as u64).saturating_mul(factor)
        }
    };
    let jitter = rand::rng().random_range(0.75..=1.25);
    Duration::from_millis((base_ms as f64 * jitter) as u64)
}

fn single_payload(op: &ReplicateOp, source: &str) -> JsonValue {
    let mut payload = json!({
        "resource": op.resource,
        "action": op.operation,
        "timestamp": op.timestamp.to_rfc3339(),
        "source": source,
        "data": op.record,
    });
    if let Some(before) = &op.before {
        payload["before"] = JsonValue::Object(before.clone());
    }
    payload
}

impl WebhookDriver {
    pub fn from_config(config: serde_json::Value) -> Result<Self, DriverError> {
        let config: WebhookConfig =
            serde_json::from_value(config).map_err(|e| DriverError::payload(e.to_string()))?;
        let method = Method::from_bytes(config.method.to_uppercase().as_bytes())
            .map_err(|_| DriverError::payload(format!("invalid HTTP method `{}`", config.method)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| DriverError::connection(e.to_string()))?;
        Ok(WebhookDriver {
            config,
            method,
            client,
        })
    }

    fn resolve_url(&self, destination: &str) -> Result<String, DriverError> {
        if destination.starts_with("http://") || destination.starts_with("https://") {
            return Ok(destination.to_string());
        }
        match &self.config.url {
            Some(base) => Ok(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                destination.trim_start_matches('/')
            )),
            None => Err(DriverError::payload(format!(
                "destination `{destination}` is not a URL and no base url is configured"
            ))),
        }
    }

    fn classify_response(&self, status: StatusCode, retry_after: Option<Duration>, body: &str) -> DriverError {
        let code = status.as_u16();
        if self.config.retry_on_status.contains(&code) || code == 408 {
            let mut err = match code {
                429 => DriverError::rate_limited(format!("status {code}: {body}")),
                408 => DriverError::timeout(format!("status {code}: {body}")),
                _ => DriverError::server(format!("status {code}: {body}")),
            };
            if let Some(delay) = retry_after {
                err = err.with_retry_after(delay);
            }
            return err;
        }
        match code {
            401 | 403 => DriverError::auth(format!("status {code}: {body}")),
            _ => DriverError::payload(format!("status {code}: {body}")),
        }
    }

    async fn send(&self, destination: &str, payload: JsonValue) -> Result<(), DriverError> {
        let url = self.resolve_url(destination)?;
        let mut request = self.client.request(self.method.clone(), &url);

        request = match &self.config.auth {
            AuthConfig::None => request,
            AuthConfig::Bearer { token } => request.bearer_auth(token),
            AuthConfig::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            AuthConfig::ApiKey { header, value } => request.header(header.as_str(), value.as_str()),
        };
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.json(&payload).send().await.map_err(|e| {
            if e.is_timeout() {
                DriverError::timeout(e.to_string())
            } else {
                DriverError::connection(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(url = %url, status = status.as_u16(), "webhook delivered");
            return Ok(());
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        Err(self.classify_response(status, retry_after, &body))
    }
}

#[async_trait]
impl Driver for WebhookDriver {
    fn kind(&self) -> &str {
        "webhook"
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn retry_delay(&self, attempt_no: u32) -> Option<Duration> {
        if self.config.retry_strategy.is_none() && self.config.initial_delay_ms.is_none() {
            return None;
        }
        let strategy = self.config.retry_strategy.unwrap_or_default();
        let initial =
            Duration::from_millis(self.config.initial_delay_ms.unwrap_or_else(default_initial_delay_ms));
        Some(compute_backoff(strategy, initial, attempt_no))
    }

    async fn replicate(&self, destination: &str, op: &ReplicateOp) -> Result<(), DriverError> {
        self.send(destination, single_payload(op, &self.config.source))
            .await
    }

    async fn replicate_batch(
        &self,
        destination: &str,
        ops: &[ReplicateOp],
    ) -> Vec<Result<(), DriverError>> {
        let batch: Vec<JsonValue> = ops
            .iter()
            .map(|op| single_payload(op, &self.config.source))
            .collect();
        match self.send(destination, json!({"batch": batch})).await {
            Ok(()) => ops.iter().map(|_| Ok(())).collect(),
            Err(err) => ops.iter().map(|_| Err(err.clone())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use model::core::{operation::Operation, record::as_record};
    use serde_json::json;

    fn driver(config: serde_json::Value) -> WebhookDriver {
        WebhookDriver::from_config(config).unwrap()
    }

    fn op(operation: Operation) -> ReplicateOp {
        ReplicateOp {
            resource: "users".into(),
            operation,
            record_id: "u1".into(),
            record: Some(as_record(json!({"id": "u1", "name": "A"})).unwrap()),
            before: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn payload_shape_matches_wire_format() {
        let payload = single_payload(&op(Operation::Inserted), "fanout");
        assert_eq!(payload["resource"], "users");
        assert_eq!(payload["action"], "inserted");
        assert_eq!(payload["source"], "fanout");
        assert_eq!(payload["data"]["name"], "A");
        assert!(payload.get("before").is_none());

        let mut updated = op(Operation::Updated);
        updated.before = Some(as_record(json!({"id": "u1", "name": "Z"})).unwrap());
        let payload = single_payload(&updated, "fanout");
        assert_eq!(payload["before"]["name"], "Z");
    }

    #[test]
    fn retry_after_parses_seconds_and_http_date() {
        assert_eq!(parse_retry_after("17"), Some(Duration::from_secs(17)));

        let future = (Utc::now() + ChronoDuration::seconds(30)).to_rfc2822();
        let parsed = parse_retry_after(&future).unwrap();
        assert!(parsed >= Duration::from_secs(28) && parsed <= Duration::from_secs(31));

        let past = (Utc::now() - ChronoDuration::seconds(30)).to_rfc2822();
        assert_eq!(parse_retry_after(&past), Some(Duration::ZERO));

        assert_eq!(parse_retry_after("not a date"), None);
    }

    #[test]
    fn exponential_backoff_doubles_within_jitter() {
        let initial = Duration::from_millis(100);
        for (attempt, expected_ms) in [(1u32, 100u64), (2, 200), (3, 400)] {
            let delay = compute_backoff(RetryStrategy::Exponential, initial, attempt);
            let ms = delay.as_millis() as u64;
            let low = expected_ms * 3 / 4;
            let high = expected_ms * 5 / 4;
            assert!(
                (low..=high).contains(&ms),
                "attempt {attempt}: {ms}ms outside [{low}, {high}]"
            );
        }
    }

    #[test]
    fn fixed_backoff_stays_flat() {
        let delay = compute_backoff(RetryStrategy::Fixed, Duration::from_millis(200), 5);
        let ms = delay.as_millis() as u64;
        assert!((150..=250).contains(&ms));
    }

    #[test]
    fn default_retriable_statuses() {
        let d = driver(json!({"url": "https://example.com/hooks"}));
        for code in [429u16, 500, 502, 503, 504] {
            let err = d.classify_response(StatusCode::from_u16(code).unwrap(), None, "");
            assert!(err.is_retriable(), "status {code} should be retriable");
        }
        assert!(
            d.classify_response(StatusCode::REQUEST_TIMEOUT, None, "")
                .is_retriable(),
            "408 is retriable"
        );
    }

    #[test]
    fn non_retriable_statuses_fail_permanently() {
        let d = driver(json!({"url": "https://example.com/hooks"}));
        let err = d.classify_response(StatusCode::UNPROCESSABLE_ENTITY, None, "bad");
        assert!(!err.is_retriable());

        let err = d.classify_response(StatusCode::UNAUTHORIZED, None, "no");
        assert!(!err.is_retriable());
        assert_eq!(err.kind, crate::error::ErrorKind::Auth);
    }

    #[test]
    fn retry_after_overrides_computed_delay() {
        let d = driver(json!({"url": "https://example.com/hooks"}));
        let err = d.classify_response(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(42)),
            "",
        );
        assert_eq!(err.retry_after, Some(Duration::from_secs(42)));
    }

    #[test]
    fn url_resolution_joins_paths() {
        let d = driver(json!({"url": "https://example.com/hooks/"}));
        assert_eq!(
            d.resolve_url("orders").unwrap(),
            "https://example.com/hooks/orders"
        );
        assert_eq!(
            d.resolve_url("https://other.example/x").unwrap(),
            "https://other.example/x"
        );

        let bare = driver(json!({}));
        assert!(bare.resolve_url("orders").is_err());
    }

    #[test]
    fn rejects_invalid_method() {
        let err = WebhookDriver::from_config(json!({"method": "NOT A METHOD"})).unwrap_err();
        assert!(err.message.contains("invalid HTTP method"));
    }

    #[test]
    fn driver_advertises_delay_policy_only_when_configured() {
        let d = driver(json!({"url": "https://example.com", "retry_strategy": "fixed", "initial_delay_ms": 100}));
        let delay = d.retry_delay(3).unwrap();
        assert!(delay >= Duration::from_millis(75) && delay <= Duration::from_millis(125));

        let unconfigured = driver(json!({"url": "https://example.com"}));
        assert!(unconfigured.retry_delay(1).is_none(), "engine backoff governs by default");
    }
}
