//! Error types for the Quill engine.

use crate::{OperationId, RecordId};
use thiserror::Error;

/// All possible errors from the Quill engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Row errors
    #[error("row is missing a string `id`")]
    MissingRowId,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid timestamp for field '{field}': {value}")]
    InvalidTimestamp { field: String, value: String },

    // Queue errors
    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("operation {op_id} is not in flight")]
    NotInFlight { op_id: OperationId },

    #[error("record {0} already has an operation in flight")]
    RecordBusy(RecordId),

    // Resolution errors
    #[error("records disagree on identity: server '{server}', client '{client}'")]
    IdentityMismatch { server: RecordId, client: RecordId },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
