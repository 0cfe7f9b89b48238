//! Plugin configuration: deserialized once at startup, immutable until
//! restart.

use crate::mapping::ResourcesSpec;
use model::log::DEFAULT_LOG_RESOURCE;
use schema::plan::SyncOptions;
use serde::Deserialize;

fn default_true() -> bool {
    true
}

fn default_log_resource() -> String {
    DEFAULT_LOG_RESOURCE.to_string()
}

fn default_replicator_concurrency() -> usize {
    5
}

fn default_stop_concurrency() -> usize {
    5
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    250
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    /// Master kill-switch.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub replicators: Vec<ReplicatorSpec>,

    #[serde(default)]
    pub verbose: bool,

    /// Persist every terminal outcome to the log collection.
    #[serde(default)]
    pub persist_replicator_log: bool,

    #[serde(default = "default_log_resource")]
    pub replicator_log_resource: String,

    /// With the full log off, still persist failures and cancellations.
    #[serde(default = "default_true")]
    pub log_errors: bool,

    /// Dead-letter collection for permanently failed ops.
    #[serde(default)]
    pub dead_letter_resource: Option<String>,

    /// Per-event driver fan-out cap.
    #[serde(default = "default_replicator_concurrency")]
    pub replicator_concurrency: usize,

    /// Parallel driver shutdowns during stop.
    #[serde(default = "default_stop_concurrency")]
    pub stop_concurrency: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Max wait to accumulate a batch, measured from the oldest queued item.
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Retries per op before terminal failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff; grows exponentially.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Per-attempt timeout, and the drain grace period on stop.
    #[serde(default = "default_timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("empty config deserializes")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplicatorSpec {
    /// Defaults to `<driver>-<index>`.
    #[serde(default)]
    pub id: Option<String>,

    pub driver: String,

    /// Opaque driver-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,

    pub resources: ResourcesSpec,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Schema-sync behaviour for drivers that support it.
    #[serde(default)]
    pub schema: SyncOptions,
}
