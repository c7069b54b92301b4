//! Unified error handling for the sync runtime.
//!
//! Most of these never reach a caller as `Err`: transient failures are
//! retried or polled around, and the rest are reported as data in
//! [`SyncResult`](crate::SyncResult).

use quill_engine::{OperationId, RecordId, TableName};

/// Sync error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("network unavailable")]
    NetworkUnavailable,

    #[error("remote write failed for {table}/{record_id}: {message}")]
    RemoteWriteFailed {
        table: TableName,
        record_id: RecordId,
        message: String,
    },

    #[error("could not fetch {table}/{record_id} for conflict check: {message}")]
    ConflictFetchFailed {
        table: TableName,
        record_id: RecordId,
        message: String,
    },

    #[error("push channel error on '{table}': {message}")]
    ChannelError { table: TableName, message: String },

    #[error("push channel timed out on '{table}'")]
    ChannelTimeout { table: TableName },

    #[error("choices for segment {segment_id} rejected: {reason}")]
    ValidationRejected { segment_id: RecordId, reason: String },

    #[error("operation {op_id} on {record_id} abandoned after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        op_id: OperationId,
        record_id: RecordId,
        attempts: u32,
        last_error: String,
    },

    #[error("record not found: {table}/{record_id}")]
    NotFound { table: TableName, record_id: RecordId },

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("engine error: {0}")]
    Engine(#[from] quill_engine::Error),
}

impl SyncError {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnavailable
                | SyncError::RemoteWriteFailed { .. }
                | SyncError::ConflictFetchFailed { .. }
                | SyncError::ChannelError { .. }
                | SyncError::ChannelTimeout { .. }
                | SyncError::Remote(_)
        )
    }
}

/// Errors from a remote store or push channel.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid remote row: {0}")]
    InvalidRow(String),
}

/// Errors from local persistence.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] quill_engine::Error),
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_classification() {
        let err = SyncError::MaxRetriesExceeded {
            op_id: "op-1".into(),
            record_id: "seg-1".into(),
            attempts: 6,
            last_error: "remote returned 500: boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "operation op-1 on seg-1 abandoned after 6 attempts: remote returned 500: boom"
        );
        assert!(!err.is_transient());

        let err = SyncError::from(RemoteError::Unavailable("offline".into()));
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "remote error: remote unavailable: offline");
    }
}
