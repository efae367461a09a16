//! Fakes shared by the unit tests

use crate::journal::{JournalEntry, MemoryJournal, OperationJournal, OperationStatus};
use crate::storage::{MemoryStorage, StorageEngine, StorageError};
use crate::task::{OperationId, ReplicationTask, TaskOutput};
use crate::transport::{RemoteResult, TaskTransport};
use crate::{ReplicationError, Result as ReplicationResult};
use async_trait::async_trait;
use dashmap::DashMap;
use meridian_cluster::{Member, NodeId};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const FAILING_PAYLOAD: &[u8] = b"fail";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn member(port: u16) -> Member {
    Member::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port))
}

/// Memory storage that rejects [`FAILING_PAYLOAD`]
#[derive(Default)]
pub struct FlakyStorage {
    pub inner: MemoryStorage,
}

#[async_trait]
impl StorageEngine for FlakyStorage {
    async fn apply(&self, database: &str, payload: &[u8]) -> Result<TaskOutput, StorageError> {
        if payload == FAILING_PAYLOAD {
            return Err(StorageError::Failed("rejected payload".to_string()));
        }
        self.inner.apply(database, payload).await
    }

    async fn rollback(&self, task: &ReplicationTask) -> Result<(), StorageError> {
        self.inner.rollback(task).await
    }
}

/// Transport answering from a script and recording every call
#[derive(Default)]
pub struct ScriptedTransport {
    replies: DashMap<NodeId, RemoteResult>,
    delays: DashMap<NodeId, Duration>,
    calls: Mutex<Vec<(NodeId, ReplicationTask)>>,
}

impl ScriptedTransport {
    pub fn reply(&self, node: &str, result: RemoteResult) {
        self.replies.insert(node.to_string(), result);
    }

    pub fn delay(&self, node: &str, delay: Duration) {
        self.delays.insert(node.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<(NodeId, ReplicationTask)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl TaskTransport for ScriptedTransport {
    async fn send(&self, target: &str, task: ReplicationTask) -> RemoteResult {
        self.calls.lock().push((target.to_string(), task));
        let delay = self.delays.get(target).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .get(target)
            .map(|r| r.clone())
            .unwrap_or_else(|| Ok(Some(json!(1))))
    }
}

/// Memory journal whose writes fail on demand
#[derive(Default)]
pub struct FailingJournal {
    pub inner: MemoryJournal,
    failing_appends: Mutex<HashSet<OperationId>>,
    failing_updates: AtomicBool,
}

impl FailingJournal {
    pub fn fail_append(&self, operation: OperationId) {
        self.failing_appends.lock().insert(operation);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.failing_updates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl OperationJournal for FailingJournal {
    async fn append(&self, task: &ReplicationTask) -> ReplicationResult<u64> {
        if self.failing_appends.lock().contains(&task.operation()) {
            return Err(ReplicationError::journal("disk full"));
        }
        self.inner.append(task).await
    }

    async fn update_status(&self, database: &str, offset: u64, status: OperationStatus) -> ReplicationResult<()> {
        if self.failing_updates.load(Ordering::SeqCst) {
            return Err(ReplicationError::journal("disk full"));
        }
        self.inner.update_status(database, offset, status).await
    }

    async fn roll_back(&self, database: &str, operation: OperationId) -> ReplicationResult<()> {
        self.inner.roll_back(database, operation).await
    }

    fn last_executed(&self, database: &str) -> OperationId {
        self.inner.last_executed(database)
    }

    fn advance_last_executed(&self, database: &str, operation: OperationId, force: bool) {
        self.inner.advance_last_executed(database, operation, force);
    }

    async fn last_journaled(&self, database: &str, status: OperationStatus) -> ReplicationResult<OperationId> {
        self.inner.last_journaled(database, status).await
    }

    async fn replay_after(&self, database: &str, checkpoint: OperationId) -> ReplicationResult<Vec<JournalEntry>> {
        self.inner.replay_after(database, checkpoint).await
    }

    fn databases(&self) -> Vec<String> {
        self.inner.databases()
    }
}
