use std::{fmt, time::Duration};
use thiserror::Error;

/// Structural classification of a driver failure.
///
/// The engine interprets only the class, never the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network-level failure reaching the destination.
    Connection,
    /// The attempt exceeded its deadline.
    Timeout,
    /// Destination asked us to back off (HTTP 429, throttling).
    RateLimited,
    /// Transient server-side failure (5xx, streaming-buffer contention).
    Server,
    /// Authentication or authorization rejected.
    Auth,
    /// Destination schema does not accept the payload.
    Schema,
    /// The payload itself is malformed for this destination.
    Payload,
    /// The driver does not implement the requested capability.
    Unsupported,
    /// Produced by shutdown; not counted as failure.
    Cancelled,
}

impl ErrorKind {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::RateLimited | ErrorKind::Server
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Server => "server",
            ErrorKind::Auth => "auth",
            ErrorKind::Schema => "schema",
            ErrorKind::Payload => "payload",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A classified driver failure, optionally carrying a server-supplied
/// minimum delay before the next attempt.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct DriverError {
    pub kind: ErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl DriverError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        DriverError {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Schema, message)
    }

    pub fn payload(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Payload, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classes() {
        assert!(DriverError::connection("down").is_retriable());
        assert!(DriverError::timeout("slow").is_retriable());
        assert!(DriverError::rate_limited("429").is_retriable());
        assert!(DriverError::server("500").is_retriable());
        assert!(!DriverError::auth("401").is_retriable());
        assert!(!DriverError::schema("missing column").is_retriable());
        assert!(!DriverError::payload("bad json").is_retriable());
        assert!(!DriverError::cancelled("stop").is_retriable());
    }

    #[test]
    fn retry_after_hint_is_carried() {
        let err = DriverError::rate_limited("slow down").with_retry_after(Duration::from_secs(7));
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
        assert_eq!(err.to_string(), "rate_limited: slow down");
    }
}
