//! Queued remote mutations derived from local writes.
//!
//! Every local write produces an operation. Operations are replayed against
//! the remote store until they succeed, so each kind must be idempotent from
//! the remote side's point of view: Insert is an upsert of the full row,
//! Update sets the written fields to absolute values, and deleting an absent
//! row is a success.

use crate::{OperationId, RecordId, Row, TableName, Timestamp};
use serde::{Deserialize, Serialize};

/// Kind of remote mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Insert => write!(f, "insert"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    /// Waiting to be executed (possibly backing off)
    Pending,
    /// Currently executing against the remote store
    InFlight,
    /// Acknowledged by the remote store
    Done,
    /// Gave up after exceeding the attempt limit
    Failed,
}

/// A queued, retryable remote mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Operation ID
    pub id: OperationId,
    /// What to do remotely
    pub kind: OperationKind,
    /// Table the record lives in
    pub target_table: TableName,
    /// Record the operation targets
    pub record_id: RecordId,
    /// Full row for Insert, written fields for Update, empty for Delete
    pub payload: Row,
    /// Current status
    pub status: OperationStatus,
    /// Failed attempts so far
    pub attempts: u32,
    /// When the local write happened
    pub created_at: Timestamp,
    /// Earliest time the next attempt may run
    #[serde(default)]
    pub next_attempt_at: Timestamp,
    /// Message from the most recent failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Operation {
    /// Create a pending operation.
    pub fn new(
        id: impl Into<OperationId>,
        kind: OperationKind,
        target_table: impl Into<TableName>,
        record_id: impl Into<RecordId>,
        payload: Row,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            target_table: target_table.into(),
            record_id: record_id.into(),
            payload,
            status: OperationStatus::Pending,
            attempts: 0,
            created_at,
            next_attempt_at: created_at,
            last_error: None,
        }
    }

    /// Create an insert (upsert) operation.
    pub fn insert(
        id: impl Into<OperationId>,
        target_table: impl Into<TableName>,
        record_id: impl Into<RecordId>,
        payload: Row,
        created_at: Timestamp,
    ) -> Self {
        Self::new(
            id,
            OperationKind::Insert,
            target_table,
            record_id,
            payload,
            created_at,
        )
    }

    /// Create an update operation.
    pub fn update(
        id: impl Into<OperationId>,
        target_table: impl Into<TableName>,
        record_id: impl Into<RecordId>,
        payload: Row,
        created_at: Timestamp,
    ) -> Self {
        Self::new(
            id,
            OperationKind::Update,
            target_table,
            record_id,
            payload,
            created_at,
        )
    }

    /// Create a delete operation.
    pub fn delete(
        id: impl Into<OperationId>,
        target_table: impl Into<TableName>,
        record_id: impl Into<RecordId>,
        created_at: Timestamp,
    ) -> Self {
        Self::new(
            id,
            OperationKind::Delete,
            target_table,
            record_id,
            Row::new(),
            created_at,
        )
    }

    /// Whether the operation still needs to run (pending or in flight).
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Pending | OperationStatus::InFlight
        )
    }

    /// Whether the operation can start at `now`.
    pub fn is_ready(&self, now: Timestamp) -> bool {
        self.status == OperationStatus::Pending && self.next_attempt_at <= now
    }
}

/// Retry policy for failed operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Attempts beyond this count move the operation to `Failed`
    pub max_attempts: u32,
    /// Delay after the first failure (milliseconds)
    pub base_delay_ms: u64,
    /// Upper bound on any single delay (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failure number `attempts`.
    ///
    /// `min(base * 2^(attempts - 1), max)`, saturating on overflow.
    pub fn delay_for(&self, attempts: u32) -> u64 {
        exponential_delay(
            self.base_delay_ms,
            self.max_delay_ms,
            attempts.saturating_sub(1),
        )
    }
}

/// `min(base * 2^exponent, cap)` without overflow.
pub fn exponential_delay(base_ms: u64, cap_ms: u64, exponent: u32) -> u64 {
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(cap_ms)
}
