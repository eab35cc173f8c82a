//! Error types for skiff-bus.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur on the internal bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus could not be brought up. Fatal to the node.
    #[error("bus bring-up failed: {0}")]
    BringUp(String),

    /// A request saw no reply within its deadline.
    #[error("request on {subject} timed out after {timeout:?}")]
    TimedOut {
        /// Subject the request was sent on
        subject: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// A request was published on a subject nobody subscribes to.
    #[error("no responders on {0}")]
    NoResponders(String),

    /// Connection-level failure (disconnect mid-request, closed channel).
    #[error("transport error: {0}")]
    Transport(String),

    /// Credentials were missing or did not match.
    #[error("authorization failed: {0}")]
    Unauthorized(String),

    /// Traffic on a subject outside the credential's scope.
    #[error("permission denied for subject {0}")]
    PermissionDenied(String),

    /// Named bucket does not exist.
    #[error("no such bucket: {0}")]
    BucketNotFound(String),

    /// Named object does not exist in the bucket.
    #[error("no such object: {bucket}/{key}")]
    ObjectNotFound {
        /// Bucket that was searched
        bucket: String,
        /// Key that was missing
        key: String,
    },

    /// Subscription drain exceeded its quiescence window.
    #[error("subscription drain timed out")]
    DrainTimedOut,

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BusError {
    /// Check whether this error is a request deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::TimedOut { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_timeout() {
        let err = BusError::TimedOut {
            subject: "agentint.x.deploy".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert!(err.is_timeout());
        assert!(!BusError::NoResponders("s".to_string()).is_timeout());
    }
}
