//! Storage engine seam
//!
//! The coordinator never interprets payloads; it hands them to a
//! [`StorageEngine`] and compares the results the engines report.

use crate::task::{ReplicationTask, TaskKind, TaskOutput};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

/// Errors reported by a storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage failure: {0}")]
    Failed(String),

    #[error("Rollback not supported: {0}")]
    RollbackUnsupported(String),
}

/// Applies replicated mutations to the local database storage
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Apply a payload to `database` and return its result
    async fn apply(&self, database: &str, payload: &[u8]) -> Result<TaskOutput, StorageError>;

    /// Undo an applied task
    async fn rollback(&self, task: &ReplicationTask) -> Result<(), StorageError> {
        Err(StorageError::RollbackUnsupported(task.to_string()))
    }
}

/// Log-structured engine keeping every applied payload in memory
///
/// The result of an apply is the number of mutations the database holds
/// afterwards, so nodes that applied the same sequence report equal results.
#[derive(Default)]
pub struct MemoryStorage {
    databases: DashMap<String, Vec<Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads applied to `database`, in order
    pub fn applied(&self, database: &str) -> Vec<Vec<u8>> {
        self.databases
            .get(database)
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn len(&self, database: &str) -> usize {
        self.databases.get(database).map(|log| log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, database: &str) -> bool {
        self.len(database) == 0
    }
}

#[async_trait]
impl StorageEngine for MemoryStorage {
    async fn apply(&self, database: &str, payload: &[u8]) -> Result<TaskOutput, StorageError> {
        let mut log = self.databases.entry(database.to_string()).or_default();
        log.push(payload.to_vec());
        debug!("Applied mutation #{} to db={}", log.len(), database);
        Ok(Some(json!(log.len())))
    }

    async fn rollback(&self, task: &ReplicationTask) -> Result<(), StorageError> {
        let TaskKind::Replicated { payload } = task.kind() else {
            return Ok(());
        };

        let mut log = self
            .databases
            .get_mut(task.database())
            .ok_or_else(|| StorageError::Failed(format!("db={} is empty", task.database())))?;
        if log.last() != Some(payload) {
            return Err(StorageError::Failed(format!(
                "{} is not the last applied mutation",
                task
            )));
        }
        log.pop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::OperationId;

    #[tokio::test]
    async fn test_apply_reports_sequence_length() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.apply("demo", b"a").await.unwrap(), Some(json!(1)));
        assert_eq!(storage.apply("demo", b"b").await.unwrap(), Some(json!(2)));
        assert_eq!(storage.apply("other", b"c").await.unwrap(), Some(json!(1)));
        assert_eq!(storage.applied("demo"), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn test_rollback_last_mutation() {
        let storage = MemoryStorage::new();
        let first = ReplicationTask::replicated("demo", OperationId::new(1, 1), b"a".to_vec());
        let second = ReplicationTask::replicated("demo", OperationId::new(1, 2), b"b".to_vec());
        storage.apply("demo", b"a").await.unwrap();
        storage.apply("demo", b"b").await.unwrap();

        assert!(storage.rollback(&first).await.is_err());
        storage.rollback(&second).await.unwrap();
        assert_eq!(storage.len("demo"), 1);
    }
}
