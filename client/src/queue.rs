//! Durable operation queue.
//!
//! Wraps the engine's [`OperationLog`] with a tokio mutex and persists every
//! state change before releasing it, so a process that dies mid-drain
//! restarts with the same queue (in-flight operations are replayed).

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use quill_engine::{FailOutcome, Operation, OperationId, OperationLog, RetryPolicy};
use tokio::sync::Mutex;

use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::now_ms;
use crate::persistence::LocalPersistence;

/// What one drain pass did.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Operations acknowledged by the remote store
    pub completed: Vec<Operation>,
    /// Operations that failed and will be retried later
    pub retried: usize,
    /// Operations that exceeded the attempt limit during this pass
    pub exhausted: Vec<SyncError>,
}

/// Ordered, persisted queue of remote mutations.
pub struct OperationQueue {
    log: Mutex<OperationLog>,
    persistence: Arc<dyn LocalPersistence>,
    policy: RetryPolicy,
    events: Arc<EventBus>,
}

impl OperationQueue {
    /// Restore the queue from persistence.
    pub async fn load(
        persistence: Arc<dyn LocalPersistence>,
        policy: RetryPolicy,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let stored = persistence.list_operations().await?;
        let interrupted = stored
            .iter()
            .filter(|op| op.status == quill_engine::OperationStatus::InFlight)
            .count();
        let log = OperationLog::restore(stored);

        if interrupted > 0 {
            tracing::info!(interrupted, "replaying operations interrupted mid-flight");
            for op in log.operations() {
                persistence.put_operation(op).await?;
            }
        }

        tracing::debug!(operations = log.len(), "operation queue loaded");

        Ok(Self {
            log: Mutex::new(log),
            persistence,
            policy,
            events,
        })
    }

    /// Append an operation durably.
    pub async fn enqueue(&self, op: Operation) -> Result<()> {
        let mut log = self.log.lock().await;
        self.persistence.put_operation(&op).await?;

        tracing::debug!(
            op_id = %op.id,
            kind = %op.kind,
            table = %op.target_table,
            record_id = %op.record_id,
            "operation enqueued"
        );
        log.enqueue(op);
        Ok(())
    }

    /// Whether any operation is pending or in flight.
    pub async fn has_pending(&self) -> bool {
        self.log.lock().await.has_pending()
    }

    /// Whether the record has any operation that is not done.
    pub async fn has_unfinished_for(&self, record_id: &str) -> bool {
        self.log.lock().await.has_unfinished_for(record_id)
    }

    /// Fields written by queued operations on a record, failed ones included.
    pub async fn pending_fields(&self, record_id: &str) -> HashSet<String> {
        self.log.lock().await.pending_fields(record_id)
    }

    /// Copy of every queued operation, oldest first.
    pub async fn operations(&self) -> Vec<Operation> {
        self.log.lock().await.operations().to_vec()
    }

    /// Operations that exhausted their attempts.
    pub async fn failed(&self) -> Vec<Operation> {
        self.log.lock().await.failed().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.log.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.log.lock().await.is_empty()
    }

    /// Re-arm failed operations for an immediate attempt.
    pub async fn retry_failed(&self) -> Result<usize> {
        let mut log = self.log.lock().await;
        let count = log.retry_failed(now_ms());
        for op in log.operations() {
            self.persistence.put_operation(op).await?;
        }
        if count > 0 {
            tracing::info!(count, "re-armed failed operations");
        }
        Ok(count)
    }

    /// Run every ready operation through `executor`.
    ///
    /// Ready operations of different records run concurrently; operations
    /// of one record run one at a time, oldest first. Each operation is
    /// attempted at most once per drain, so a failing remote cannot spin
    /// the loop even with a zero retry delay.
    pub async fn drain<E, Fut>(&self, executor: E) -> Result<DrainReport>
    where
        E: Fn(Operation) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut report = DrainReport::default();
        let mut attempted: HashSet<OperationId> = HashSet::new();

        loop {
            let batch = self.start_batch(&mut attempted).await?;
            if batch.is_empty() {
                break;
            }

            let outcomes = join_all(batch.iter().cloned().map(&executor)).await;

            let mut log = self.log.lock().await;
            for (op, outcome) in batch.into_iter().zip(outcomes) {
                match outcome {
                    Ok(()) => {
                        let done = log.complete(&op.id)?;
                        self.persistence.remove_operation(&done.id).await?;
                        tracing::debug!(op_id = %done.id, record_id = %done.record_id, "operation done");
                        report.completed.push(done);
                    }
                    Err(error) => {
                        let message = error.to_string();
                        let outcome = log.fail(&op.id, message.clone(), now_ms(), &self.policy)?;
                        if let Some(failed) = log.get(&op.id) {
                            self.persistence.put_operation(failed).await?;
                        }

                        match outcome {
                            FailOutcome::Retry { at, attempts } => {
                                tracing::warn!(
                                    op_id = %op.id,
                                    record_id = %op.record_id,
                                    attempts,
                                    retry_at = at,
                                    error = %message,
                                    "operation failed, will retry"
                                );
                                report.retried += 1;
                            }
                            FailOutcome::Exhausted { attempts } => {
                                tracing::error!(
                                    op_id = %op.id,
                                    record_id = %op.record_id,
                                    attempts,
                                    error = %message,
                                    "operation abandoned"
                                );
                                self.events.emit(SyncEvent::OperationFailed {
                                    op_id: op.id.clone(),
                                    table: op.target_table.clone(),
                                    record_id: op.record_id.clone(),
                                    attempts,
                                    error: message.clone(),
                                });
                                report.exhausted.push(SyncError::MaxRetriesExceeded {
                                    op_id: op.id,
                                    record_id: op.record_id,
                                    attempts,
                                    last_error: message,
                                });
                            }
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    /// Pick the next ready operations and mark them in flight durably.
    async fn start_batch(&self, attempted: &mut HashSet<OperationId>) -> Result<Vec<Operation>> {
        let mut log = self.log.lock().await;
        let mut batch = Vec::new();

        for op in log.next_ready(now_ms()) {
            if !attempted.insert(op.id.clone()) {
                continue;
            }
            log.mark_in_flight(&op.id)?;
            if let Some(in_flight) = log.get(&op.id) {
                self.persistence.put_operation(in_flight).await?;
            }
            batch.push(op);
        }

        Ok(batch)
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("policy", &self.policy)
            .finish()
    }
}
