//! Ordered log of pending remote mutations.
//!
//! The log is the pure half of the operation queue: it decides which
//! operations may run, records outcomes and computes retry schedules. It
//! never touches the network or the disk; the async runtime persists it
//! after every change.
//!
//! # Ordering
//!
//! Operations run FIFO per record. At most one operation per record is in
//! flight, and an operation never overtakes an older outstanding operation
//! on the same record, even while that older one is backing off. Operations
//! on different records have no ordering guarantee.

use crate::operation::RetryPolicy;
use crate::{error::Result, Error, Operation, OperationStatus, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The operation will be retried no earlier than `at`
    Retry { at: Timestamp, attempts: u32 },
    /// The attempt limit was exceeded; the operation is now `Failed`
    Exhausted { attempts: u32 },
}

/// Ordered log of operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationLog {
    ops: Vec<Operation>,
}

impl OperationLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Rebuild a log from persisted operations, oldest first.
    ///
    /// Operations that were in flight when the process stopped are reset to
    /// pending; they are replayed because the remote accepts duplicates.
    pub fn restore(mut ops: Vec<Operation>) -> Self {
        ops.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let mut log = Self { ops };
        log.recover_in_flight();
        log
    }

    /// Append an operation.
    pub fn enqueue(&mut self, op: Operation) {
        self.ops.push(op);
    }

    /// All operations, oldest first.
    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    /// Get an operation by ID.
    pub fn get(&self, op_id: &str) -> Option<&Operation> {
        self.ops.iter().find(|op| op.id == op_id)
    }

    /// Number of operations in the log, any status.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check if the log holds no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Whether any operation is pending or in flight.
    pub fn has_pending(&self) -> bool {
        self.ops.iter().any(Operation::is_outstanding)
    }

    /// Whether the record has any operation that is not done.
    ///
    /// Failed operations count: a record whose write was abandoned is still
    /// unsynced.
    pub fn has_unfinished_for(&self, record_id: &str) -> bool {
        self.ops
            .iter()
            .any(|op| op.record_id == record_id && op.status != OperationStatus::Done)
    }

    /// Outstanding operations for a record, oldest first.
    pub fn pending_for(&self, record_id: &str) -> Vec<&Operation> {
        self.ops
            .iter()
            .filter(|op| op.record_id == record_id && op.is_outstanding())
            .collect()
    }

    /// Field names written by operations on a record that are not done.
    ///
    /// Failed operations count: their writes are kept until `retry_failed`
    /// replays them.
    pub fn pending_fields(&self, record_id: &str) -> HashSet<String> {
        self.ops
            .iter()
            .filter(|op| op.record_id == record_id && op.status != OperationStatus::Done)
            .flat_map(|op| op.payload.keys().cloned())
            .collect()
    }

    /// Operations that may start at `now`.
    ///
    /// Returns at most one operation per record: the oldest unfinished one,
    /// and only when it is pending and its backoff has elapsed. A failed
    /// operation blocks its record until it is re-armed.
    pub fn next_ready(&self, now: Timestamp) -> Vec<Operation> {
        let mut seen = HashSet::new();
        let mut ready = Vec::new();

        for op in &self.ops {
            if op.status == OperationStatus::Done || !seen.insert(op.record_id.as_str()) {
                continue;
            }
            if op.is_ready(now) {
                ready.push(op.clone());
            }
        }

        ready
    }

    /// Mark an operation as in flight.
    pub fn mark_in_flight(&mut self, op_id: &str) -> Result<()> {
        let record_id = self.find(op_id)?.record_id.clone();
        let busy = self.ops.iter().any(|op| {
            op.record_id == record_id && op.id != op_id && op.status == OperationStatus::InFlight
        });
        if busy {
            return Err(Error::RecordBusy(record_id));
        }

        let op = self.find_mut(op_id)?;
        op.status = OperationStatus::InFlight;
        Ok(())
    }

    /// Record success: the operation is marked done and removed.
    pub fn complete(&mut self, op_id: &str) -> Result<Operation> {
        let index = self.index_of(op_id)?;
        if self.ops[index].status != OperationStatus::InFlight {
            return Err(Error::NotInFlight {
                op_id: op_id.to_string(),
            });
        }
        let mut op = self.ops.remove(index);
        op.status = OperationStatus::Done;
        op.last_error = None;
        Ok(op)
    }

    /// Record a failed attempt and reschedule or exhaust the operation.
    pub fn fail(
        &mut self,
        op_id: &str,
        error: impl Into<String>,
        now: Timestamp,
        policy: &RetryPolicy,
    ) -> Result<FailOutcome> {
        let op = self.find_mut(op_id)?;
        if op.status != OperationStatus::InFlight {
            return Err(Error::NotInFlight {
                op_id: op_id.to_string(),
            });
        }

        op.attempts = op.attempts.saturating_add(1);
        op.last_error = Some(error.into());

        if op.attempts > policy.max_attempts {
            op.status = OperationStatus::Failed;
            return Ok(FailOutcome::Exhausted {
                attempts: op.attempts,
            });
        }

        op.status = OperationStatus::Pending;
        op.next_attempt_at = now.saturating_add(policy.delay_for(op.attempts));
        Ok(FailOutcome::Retry {
            at: op.next_attempt_at,
            attempts: op.attempts,
        })
    }

    /// Re-arm every failed operation for an immediate attempt.
    ///
    /// Returns how many operations were re-armed.
    pub fn retry_failed(&mut self, now: Timestamp) -> usize {
        let mut count = 0;
        for op in &mut self.ops {
            if op.status == OperationStatus::Failed {
                op.status = OperationStatus::Pending;
                op.attempts = 0;
                op.next_attempt_at = now;
                count += 1;
            }
        }
        count
    }

    /// Reset in-flight operations to pending.
    pub fn recover_in_flight(&mut self) -> usize {
        let mut count = 0;
        for op in &mut self.ops {
            if op.status == OperationStatus::InFlight {
                op.status = OperationStatus::Pending;
                count += 1;
            }
        }
        count
    }

    /// Failed operations.
    pub fn failed(&self) -> impl Iterator<Item = &Operation> {
        self.ops
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
    }

    fn index_of(&self, op_id: &str) -> Result<usize> {
        self.ops
            .iter()
            .position(|op| op.id == op_id)
            .ok_or_else(|| Error::OperationNotFound(op_id.to_string()))
    }

    fn find(&self, op_id: &str) -> Result<&Operation> {
        let index = self.index_of(op_id)?;
        Ok(&self.ops[index])
    }

    fn find_mut(&mut self, op_id: &str) -> Result<&mut Operation> {
        let index = self.index_of(op_id)?;
        Ok(&mut self.ops[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Row;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn insert(op_id: &str, record_id: &str, at: Timestamp) -> Operation {
        Operation::insert(
            op_id,
            "segments",
            record_id,
            row(json!({"id": record_id, "content": "x"})),
            at,
        )
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        }
    }

    #[test]
    fn ready_returns_one_op_per_record() {
        let mut log = OperationLog::new();
        log.enqueue(insert("op-1", "seg-1", 1));
        log.enqueue(insert("op-2", "seg-1", 2));
        log.enqueue(insert("op-3", "seg-2", 3));

        let ready: Vec<_> = log.next_ready(10).into_iter().map(|op| op.id).collect();
        assert_eq!(ready, vec!["op-1".to_string(), "op-3".to_string()]);
    }

    #[test]
    fn in_flight_blocks_same_record() {
        let mut log = OperationLog::new();
        log.enqueue(insert("op-1", "seg-1", 1));
        log.enqueue(insert("op-2", "seg-1", 2));

        log.mark_in_flight("op-1").unwrap();
        assert!(log.next_ready(10).is_empty());
        assert_eq!(
            log.mark_in_flight("op-2"),
            Err(Error::RecordBusy("seg-1".into()))
        );

        log.complete("op-1").unwrap();
        let ready = log.next_ready(10);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "op-2");
    }

    #[test]
    fn backing_off_op_is_not_overtaken() {
        let mut log = OperationLog::new();
        log.enqueue(insert("op-1", "seg-1", 1));
        log.enqueue(insert("op-2", "seg-1", 2));

        log.mark_in_flight("op-1").unwrap();
        let outcome = log.fail("op-1", "offline", 10, &policy()).unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retry {
                at: 110,
                attempts: 1
            }
        );

        // op-1 is backing off, op-2 must wait behind it
        assert!(log.next_ready(50).is_empty());
        assert_eq!(log.next_ready(110)[0].id, "op-1");
    }

    #[test]
    fn exhausted_after_exceeding_max_attempts() {
        let mut log = OperationLog::new();
        log.enqueue(insert("op-1", "seg-1", 0));

        for now in [0, 1_000] {
            log.mark_in_flight("op-1").unwrap();
            assert!(matches!(
                log.fail("op-1", "boom", now, &policy()).unwrap(),
                FailOutcome::Retry { .. }
            ));
        }

        log.mark_in_flight("op-1").unwrap();
        assert_eq!(
            log.fail("op-1", "boom", 5_000, &policy()).unwrap(),
            FailOutcome::Exhausted { attempts: 3 }
        );

        let op = log.get("op-1").unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.last_error.as_deref(), Some("boom"));
        assert!(!log.has_pending());
        assert!(log.has_unfinished_for("seg-1"));
        assert!(log.next_ready(u64::MAX).is_empty());
    }

    #[test]
    fn failed_head_is_not_overtaken() {
        let mut log = OperationLog::new();
        log.enqueue(insert("op-1", "seg-1", 0));
        log.enqueue(Operation::update(
            "op-2",
            "segments",
            "seg-1",
            row(json!({"title": "B"})),
            1,
        ));
        let strict = RetryPolicy {
            max_attempts: 0,
            ..policy()
        };
        log.mark_in_flight("op-1").unwrap();
        log.fail("op-1", "boom", 0, &strict).unwrap();

        assert!(log.next_ready(u64::MAX).is_empty());

        log.retry_failed(5);
        assert_eq!(log.next_ready(5)[0].id, "op-1");
    }

    #[test]
    fn failed_writes_keep_their_fields_pending() {
        let mut log = OperationLog::new();
        log.enqueue(Operation::update(
            "op-1",
            "segments",
            "seg-1",
            row(json!({"title": "T"})),
            0,
        ));
        log.mark_in_flight("op-1").unwrap();
        log.fail(
            "op-1",
            "boom",
            0,
            &RetryPolicy {
                max_attempts: 0,
                ..policy()
            },
        )
        .unwrap();

        assert!(log.pending_for("seg-1").is_empty());
        assert!(log.pending_fields("seg-1").contains("title"));
    }

    #[test]
    fn retry_failed_rearms() {
        let mut log = OperationLog::new();
        log.enqueue(insert("op-1", "seg-1", 0));
        let strict = RetryPolicy {
            max_attempts: 0,
            ..policy()
        };
        log.mark_in_flight("op-1").unwrap();
        log.fail("op-1", "boom", 0, &strict).unwrap();

        assert_eq!(log.failed().count(), 1);
        assert_eq!(log.retry_failed(42), 1);
        assert_eq!(log.next_ready(42)[0].attempts, 0);
    }

    #[test]
    fn complete_requires_in_flight() {
        let mut log = OperationLog::new();
        log.enqueue(insert("op-1", "seg-1", 0));
        assert!(matches!(
            log.complete("op-1"),
            Err(Error::NotInFlight { .. })
        ));
        assert!(matches!(
            log.complete("missing"),
            Err(Error::OperationNotFound(_))
        ));
    }

    #[test]
    fn completed_op_is_removed_and_done() {
        let mut log = OperationLog::new();
        log.enqueue(insert("op-1", "seg-1", 0));
        log.mark_in_flight("op-1").unwrap();

        let done = log.complete("op-1").unwrap();
        assert_eq!(done.status, OperationStatus::Done);
        assert!(log.is_empty());
        assert!(!log.has_unfinished_for("seg-1"));
    }

    #[test]
    fn restore_resets_in_flight_and_orders() {
        let mut a = insert("op-a", "seg-1", 20);
        a.status = OperationStatus::InFlight;
        let b = insert("op-b", "seg-2", 10);

        let log = OperationLog::restore(vec![a, b]);
        let ids: Vec<_> = log.operations().iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec!["op-b", "op-a"]);
        assert!(log
            .operations()
            .iter()
            .all(|op| op.status == OperationStatus::Pending));
    }

    #[test]
    fn pending_fields_cover_outstanding_payloads() {
        let mut log = OperationLog::new();
        log.enqueue(Operation::update(
            "op-1",
            "segments",
            "seg-1",
            row(json!({"title": "T"})),
            0,
        ));
        log.enqueue(Operation::update(
            "op-2",
            "segments",
            "seg-1",
            row(json!({"choices": []})),
            1,
        ));

        let fields = log.pending_fields("seg-1");
        assert!(fields.contains("title"));
        assert!(fields.contains("choices"));
        assert!(log.pending_fields("seg-2").is_empty());
    }
}
