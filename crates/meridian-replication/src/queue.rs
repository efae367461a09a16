//! Per-database ordered execution of mutating tasks
//!
//! A task runs only when it is the direct successor of the last operation
//! executed locally on its database. Tasks arriving early wait on the
//! database's [`Notify`]; the wait is bounded so the ordering predicate is
//! re-checked even if a wake-up is missed. Tasks the node already executed
//! are skipped without blocking.

use crate::journal::{OperationJournal, OperationStatus};
use crate::storage::StorageEngine;
use crate::task::{ExecutionContext, OperationId, ReplicationTask, TaskKind, TaskOutput};
use crate::{ReplicationError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// Outcome of a local execution
#[derive(Debug, Clone, PartialEq)]
pub enum LocalExecution {
    /// The task ran and produced this result
    Applied(TaskOutput),
    /// The task was already executed and has been dropped
    Skipped,
}

impl LocalExecution {
    pub fn output(self) -> TaskOutput {
        match self {
            LocalExecution::Applied(output) => output,
            LocalExecution::Skipped => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, LocalExecution::Skipped)
    }
}

#[derive(Default)]
struct DatabaseQueue {
    notify: Notify,
    /// Operation currently executing
    in_flight: Mutex<Option<OperationId>>,
}

enum Admission {
    Run,
    Wait(OperationId),
    Skip(OperationId),
}

/// Releases the turn of an admitted task, whatever happens to its future
struct Turn<'a> {
    queue: &'a LocalExecutionQueue,
    database: &'a str,
    operation: OperationId,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        self.queue.finish(self.database, self.operation, false);
    }
}

/// Ordered executor of mutating tasks on the local node
pub struct LocalExecutionQueue {
    journal: Arc<dyn OperationJournal>,
    storage: Arc<dyn StorageEngine>,
    queues: DashMap<String, Arc<DatabaseQueue>>,
    wait_timeout: Duration,
}

impl LocalExecutionQueue {
    pub fn new(
        journal: Arc<dyn OperationJournal>,
        storage: Arc<dyn StorageEngine>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            journal,
            storage,
            queues: DashMap::new(),
            wait_timeout,
        }
    }

    pub fn journal(&self) -> &Arc<dyn OperationJournal> {
        &self.journal
    }

    /// Whether the task was already executed on this node
    pub fn is_replay(&self, task: &ReplicationTask) -> bool {
        task.operation()
            .is_replay_of(self.journal.last_executed(task.database()))
    }

    /// Run a mutating task in sequence order
    ///
    /// The entry is journaled `pending`, applied, then marked `committed` or
    /// `canceled`. A storage failure is returned after the journal update.
    pub async fn enqueue_local(
        &self,
        task: &ReplicationTask,
        ctx: &ExecutionContext,
    ) -> Result<LocalExecution> {
        if !task.kind().is_mutable() {
            return Err(ReplicationError::configuration(format!(
                "{} cannot be queued",
                task
            )));
        }

        let database = task.database();
        let queue = self.queue_for(database);

        loop {
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.admit(&queue, task) {
                Admission::Run => break,
                Admission::Skip(last) => {
                    warn!(
                        "Skipping {} from {}: already executed up to {}",
                        task,
                        ctx.source().unwrap_or("local"),
                        last
                    );
                    return Ok(LocalExecution::Skipped);
                }
                Admission::Wait(last) => {
                    debug!("Waiting to execute {}, last executed {}", task, last);
                }
            }

            tokio::select! {
                _ = ctx.cancellation().cancelled() => return Err(ReplicationError::Cancelled),
                _ = tokio::time::timeout(self.wait_timeout, notified) => {}
            }
        }

        let _turn = Turn {
            queue: self,
            database,
            operation: task.operation(),
        };
        self.apply(task).await
    }

    /// Advance the ordering state past an operation that will not run here
    /// and wake every waiter of the database
    pub fn notify_waiters(&self, database: &str, operation: OperationId) {
        self.finish(database, operation, false);
    }

    fn queue_for(&self, database: &str) -> Arc<DatabaseQueue> {
        self.queues
            .entry(database.to_string())
            .or_default()
            .clone()
    }

    fn admit(&self, queue: &DatabaseQueue, task: &ReplicationTask) -> Admission {
        let mut in_flight = queue.in_flight.lock();
        let last = self.journal.last_executed(task.database());
        let operation = task.operation();

        if operation.is_replay_of(last) {
            return Admission::Skip(last);
        }
        if in_flight.is_none() && operation.follows(last) {
            *in_flight = Some(operation);
            return Admission::Run;
        }
        Admission::Wait(last)
    }

    fn finish(&self, database: &str, operation: OperationId, force: bool) {
        let queue = self.queue_for(database);
        {
            let mut in_flight = queue.in_flight.lock();
            self.journal
                .advance_last_executed(database, operation, force);
            if *in_flight == Some(operation) {
                *in_flight = None;
            }
        }
        queue.notify.notify_waiters();
    }

    async fn apply(&self, task: &ReplicationTask) -> Result<LocalExecution> {
        let database = task.database();
        let offset = self.journal.append(task).await?;

        let applied = match task.kind() {
            TaskKind::Replicated { payload } => self.storage.apply(database, payload).await,
            _ => Ok(None),
        };

        match applied {
            Ok(output) => {
                self.journal
                    .update_status(database, offset, OperationStatus::Committed)
                    .await?;
                debug!("Executed {} locally", task);
                Ok(LocalExecution::Applied(output))
            }
            Err(e) => {
                if let Err(journal_error) = self
                    .journal
                    .update_status(database, offset, OperationStatus::Canceled)
                    .await
                {
                    error!("Cannot cancel {} in the journal: {}", task, journal_error);
                }
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;
    use crate::storage::MemoryStorage;
    use crate::testing::{FailingJournal, FlakyStorage, FAILING_PAYLOAD};
    use serde_json::json;

    fn task(run_id: i64, serial: i64) -> ReplicationTask {
        ReplicationTask::replicated("demo", OperationId::new(run_id, serial), vec![serial as u8])
    }

    fn queue_with(
        journal: Arc<MemoryJournal>,
        storage: Arc<dyn StorageEngine>,
        wait_timeout: Duration,
    ) -> Arc<LocalExecutionQueue> {
        Arc::new(LocalExecutionQueue::new(journal, storage, wait_timeout))
    }

    #[tokio::test]
    async fn test_successor_waits_for_predecessor() {
        let journal = Arc::new(MemoryJournal::new());
        let storage = Arc::new(MemoryStorage::new());
        journal.advance_last_executed("demo", OperationId::new(7, 4), true);
        let queue = queue_with(journal.clone(), storage.clone(), Duration::from_secs(5));

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue_local(&task(7, 6), &ExecutionContext::local()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        assert!(storage.is_empty("demo"));

        let fifth = queue
            .enqueue_local(&task(7, 5), &ExecutionContext::local())
            .await
            .unwrap();
        assert_eq!(fifth, LocalExecution::Applied(Some(json!(1))));

        let sixth = waiting.await.unwrap().unwrap();
        assert_eq!(sixth, LocalExecution::Applied(Some(json!(2))));
        assert_eq!(storage.applied("demo"), vec![vec![5], vec![6]]);
        assert_eq!(journal.last_executed("demo"), OperationId::new(7, 6));
    }

    #[tokio::test]
    async fn test_new_run_starts_at_serial_one() {
        let journal = Arc::new(MemoryJournal::new());
        let storage = Arc::new(MemoryStorage::new());
        let queue = queue_with(journal.clone(), storage, Duration::from_secs(5));

        let result = queue
            .enqueue_local(&task(9, 1), &ExecutionContext::local())
            .await
            .unwrap();
        assert!(!result.is_skipped());
        assert_eq!(journal.last_executed("demo"), OperationId::new(9, 1));
    }

    #[tokio::test]
    async fn test_replayed_task_is_skipped() {
        let journal = Arc::new(MemoryJournal::new());
        let storage = Arc::new(MemoryStorage::new());
        journal.advance_last_executed("demo", OperationId::new(7, 4), true);
        let queue = queue_with(journal.clone(), storage.clone(), Duration::from_secs(5));

        assert!(queue.is_replay(&task(7, 4)));
        let result = queue
            .enqueue_local(&task(7, 3), &ExecutionContext::remote("n2"))
            .await
            .unwrap();
        assert_eq!(result, LocalExecution::Skipped);
        assert!(journal.entries("demo").is_empty());
        assert!(storage.is_empty("demo"));
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_execute_once() {
        let journal = Arc::new(MemoryJournal::new());
        let storage = Arc::new(MemoryStorage::new());
        let queue = queue_with(journal.clone(), storage.clone(), Duration::from_secs(5));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.enqueue_local(&task(3, 1), &ExecutionContext::local()).await })
            })
            .collect();

        let mut skipped = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_skipped() {
                skipped += 1;
            }
        }
        assert_eq!(skipped, 1);
        assert_eq!(storage.len("demo"), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_cancels_and_advances() {
        let journal = Arc::new(MemoryJournal::new());
        let storage = Arc::new(FlakyStorage::default());
        let queue = queue_with(journal.clone(), storage, Duration::from_secs(5));

        let failing = ReplicationTask::replicated("demo", OperationId::new(2, 1), FAILING_PAYLOAD.to_vec());
        let err = queue
            .enqueue_local(&failing, &ExecutionContext::local())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Storage(_)));

        let entries = journal.entries("demo");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, OperationStatus::Canceled);
        assert_eq!(journal.last_executed("demo"), OperationId::new(2, 1));

        // The next operation is not blocked by the failed one
        queue
            .enqueue_local(&task(2, 2), &ExecutionContext::local())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_journal_append_failure_releases_successor() {
        let journal = Arc::new(FailingJournal::default());
        let storage = Arc::new(MemoryStorage::new());
        journal.fail_append(OperationId::new(8, 1));
        let queue = Arc::new(LocalExecutionQueue::new(
            journal.clone(),
            storage.clone(),
            Duration::from_secs(5),
        ));

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue_local(&task(8, 2), &ExecutionContext::local()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        let err = queue
            .enqueue_local(&task(8, 1), &ExecutionContext::local())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Journal(_)));

        let second = waiting.await.unwrap().unwrap();
        assert_eq!(second, LocalExecution::Applied(Some(json!(1))));
        assert_eq!(storage.applied("demo"), vec![vec![2]]);
        assert_eq!(journal.last_executed("demo"), OperationId::new(8, 2));
    }

    #[tokio::test]
    async fn test_journal_update_failure_surfaces() {
        let journal = Arc::new(FailingJournal::default());
        let storage = Arc::new(MemoryStorage::new());
        journal.fail_updates(true);
        let queue = Arc::new(LocalExecutionQueue::new(
            journal.clone(),
            storage.clone(),
            Duration::from_secs(5),
        ));

        let err = queue
            .enqueue_local(&task(8, 1), &ExecutionContext::local())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Journal(_)));
        assert_eq!(journal.inner.entries("demo")[0].status, OperationStatus::Pending);
        assert_eq!(journal.last_executed("demo"), OperationId::new(8, 1));

        journal.fail_updates(false);
        queue
            .enqueue_local(&task(8, 2), &ExecutionContext::local())
            .await
            .unwrap();
        assert_eq!(journal.inner.entries("demo")[1].status, OperationStatus::Committed);
    }

    #[tokio::test]
    async fn test_no_op_skips_storage() {
        let journal = Arc::new(MemoryJournal::new());
        let storage = Arc::new(MemoryStorage::new());
        let queue = queue_with(journal.clone(), storage.clone(), Duration::from_secs(5));

        let no_op = task(4, 1).as_no_op();
        let result = queue
            .enqueue_local(&no_op, &ExecutionContext::local())
            .await
            .unwrap();
        assert_eq!(result, LocalExecution::Applied(None));
        assert!(storage.is_empty("demo"));
        assert_eq!(journal.entries("demo")[0].status, OperationStatus::Committed);
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let journal = Arc::new(MemoryJournal::new());
        let storage = Arc::new(MemoryStorage::new());
        let queue = queue_with(journal, storage, Duration::from_secs(5));

        let ctx = ExecutionContext::local();
        let cancel = ctx.cancellation().clone();
        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue_local(&task(5, 3), &ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, ReplicationError::Cancelled));
    }

    #[tokio::test]
    async fn test_bounded_wait_rechecks_predicate() {
        let journal = Arc::new(MemoryJournal::new());
        let storage = Arc::new(MemoryStorage::new());
        let queue = queue_with(journal.clone(), storage.clone(), Duration::from_millis(10));

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue_local(&task(5, 2), &ExecutionContext::local()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Advanced behind the queue's back, no wake-up is sent
        journal.advance_last_executed("demo", OperationId::new(5, 1), false);

        let result = waiting.await.unwrap().unwrap();
        assert!(!result.is_skipped());
        assert_eq!(storage.len("demo"), 1);
    }

    #[tokio::test]
    async fn test_coordination_task_rejected() {
        let queue = queue_with(
            Arc::new(MemoryJournal::new()),
            Arc::new(MemoryStorage::new()),
            Duration::from_secs(1),
        );
        let request = ReplicationTask::align_request("demo", OperationId::NONE);
        assert!(queue
            .enqueue_local(&request, &ExecutionContext::local())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_notify_waiters_releases_gap() {
        let journal = Arc::new(MemoryJournal::new());
        let storage = Arc::new(MemoryStorage::new());
        let queue = queue_with(journal.clone(), storage, Duration::from_secs(5));

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue_local(&task(6, 2), &ExecutionContext::local()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.notify_waiters("demo", OperationId::new(6, 1));

        assert!(!waiting.await.unwrap().unwrap().is_skipped());
        assert_eq!(journal.last_executed("demo"), OperationId::new(6, 2));
    }
}
