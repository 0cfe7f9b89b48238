use serde::{Deserialize, Serialize};

/// Terminal state of a replicated op, as persisted in the log.
///
/// Individual driver attempts are transient; they surface as
/// attempt-numbered error events rather than stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Success,
    Failed,
    Skipped,
    DeadLettered,
    Cancelled,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Success => "success",
            OpStatus::Failed => "failed",
            OpStatus::Skipped => "skipped",
            OpStatus::DeadLettered => "dead_lettered",
            OpStatus::Cancelled => "cancelled",
        }
    }
}

/// Why an op was skipped before reaching the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The binding predicate returned false.
    Filtered,
    /// The transform returned nothing.
    TransformedAway,
}
