// Error types for the sync engine

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures of the local durable queue.
///
/// Every storage failure is surfaced; a swallowed one is indistinguishable
/// from data loss.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Persistent storage unavailable at {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },

    #[error("Storage operation `{op}` failed: {source}")]
    Sqlite {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid queue entry: {0}")]
    InvalidEntry(String),

    #[error("Queue store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub(crate) fn sqlite(op: &'static str) -> impl FnOnce(rusqlite::Error) -> StoreError {
        move |source| StoreError::Sqlite { op, source }
    }

    /// True for failures that mean the store can't be used at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}

/// Why a single remote submission failed. The entry stays queued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server rejected submission with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Submission timed out after {0:?}")]
    Timeout(Duration),
}

impl SubmitError {
    /// Short classification used in logs and diagnostics.
    pub fn reason(&self) -> &'static str {
        match self {
            SubmitError::Network(_) => "network",
            SubmitError::Rejected { .. } => "server-rejected",
            SubmitError::Timeout(_) => "timeout",
        }
    }
}

/// Environment-level failures of the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("Offline queue disabled, mutation not accepted: {0}")]
    QueueDisabled(String),

    #[error("Background coordinator unavailable: {0}")]
    BackgroundUnavailable(String),

    #[error("No async runtime to run {0} on")]
    NoRuntime(&'static str),

    #[error("Invalid server URL {url}: {reason}")]
    InvalidServerUrl { url: String, reason: String },

    #[error("In-flight sync run failed: {0}")]
    InflightRunFailed(String),

    #[error("Blocking task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SubmitError::Rejected {
            status: 417,
            body: "bad".to_string(),
        };
        assert_eq!(err.to_string(), "Server rejected submission with HTTP 417: bad");
        assert_eq!(err.reason(), "server-rejected");
        assert_eq!(SubmitError::Timeout(Duration::from_secs(1)).reason(), "timeout");
    }

    #[test]
    fn test_storage_error_is_transparent() {
        let err: SyncError = StoreError::Poisoned.into();
        assert_eq!(err.to_string(), "Queue store lock poisoned");
    }

    #[test]
    fn test_server_url_error_names_the_url() {
        let err = SyncError::InvalidServerUrl {
            url: "nope".to_string(),
            reason: "relative URL without a base".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid server URL nope: relative URL without a base");
    }

    #[test]
    fn test_unavailable_classification() {
        let err = StoreError::Unavailable {
            path: PathBuf::from("/nope"),
            reason: "denied".to_string(),
        };
        assert!(err.is_unavailable());
        assert!(!StoreError::Poisoned.is_unavailable());
    }
}
