//! Conflict and quorum detection
//!
//! After a write, the local result is compared with the result of each
//! replica. Any divergence is handed to a [`ConflictResolver`]; a replica
//! that failed counts as divergent too. When fewer replicas than the
//! configured minimum succeeded, the [`QuorumPolicy`] decides what happens
//! to the write.

use crate::config::QuorumPolicy;
use crate::journal::OperationJournal;
use crate::storage::StorageEngine;
use crate::task::{OperationId, ReplicationTask, TaskKind, TaskOutput};
use crate::transport::RemoteResult;
use crate::{ReplicationError, Result};
use chrono::{DateTime, Utc};
use meridian_cluster::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, warn};

/// Reacts to a replica whose result differs from the local one
pub trait ConflictResolver: Send + Sync {
    fn handle_conflict(
        &self,
        task: &ReplicationTask,
        node: &str,
        local: &TaskOutput,
        remote: &RemoteResult,
    );
}

/// Logs every conflict
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingResolver;

impl ConflictResolver for LoggingResolver {
    fn handle_conflict(
        &self,
        task: &ReplicationTask,
        node: &str,
        local: &TaskOutput,
        remote: &RemoteResult,
    ) {
        match remote {
            Ok(output) => warn!(
                "Conflict on {}: local result {:?}, node {} returned {:?}",
                task, local, node, output
            ),
            Err(failure) => warn!(
                "Conflict on {}: local result {:?}, node {} failed: {}",
                task, local, node, failure
            ),
        }
    }
}

/// A recorded divergence
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub database: String,
    pub operation: OperationId,
    pub node: NodeId,
    pub local: TaskOutput,
    pub remote: RemoteResult,
    pub detected_at: DateTime<Utc>,
}

/// Keeps conflicts in memory for inspection
#[derive(Debug, Default)]
pub struct RecordingResolver {
    conflicts: RwLock<Vec<Conflict>>,
}

impl RecordingResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.conflicts.read().clone()
    }

    pub fn len(&self) -> usize {
        self.conflicts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.read().is_empty()
    }

    pub fn clear(&self) {
        self.conflicts.write().clear();
    }
}

impl ConflictResolver for RecordingResolver {
    fn handle_conflict(
        &self,
        task: &ReplicationTask,
        node: &str,
        local: &TaskOutput,
        remote: &RemoteResult,
    ) {
        self.conflicts.write().push(Conflict {
            database: task.database().to_string(),
            operation: task.operation(),
            node: node.to_string(),
            local: local.clone(),
            remote: remote.clone(),
            detected_at: Utc::now(),
        });
    }
}

/// Outcome of comparing one write's results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictReport {
    /// Replicas whose result differs from the local one
    pub conflicting: Vec<NodeId>,
    /// Replicas that did not fail
    pub successful: usize,
    /// Minimum number of successful replicas
    pub required: usize,
}

impl ConflictReport {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicting.is_empty()
    }

    pub fn is_under_quorum(&self) -> bool {
        self.successful < self.required
    }
}

/// Compares local and remote results of writes
pub struct ConflictDetector {
    resolver: Arc<dyn ConflictResolver>,
    policy: QuorumPolicy,
    storage: Arc<dyn StorageEngine>,
    journal: Arc<dyn OperationJournal>,
}

impl ConflictDetector {
    pub fn new(
        resolver: Arc<dyn ConflictResolver>,
        policy: QuorumPolicy,
        storage: Arc<dyn StorageEngine>,
        journal: Arc<dyn OperationJournal>,
    ) -> Self {
        Self {
            resolver,
            policy,
            storage,
            journal,
        }
    }

    /// Whether a remote result differs from the local one
    pub fn diverges(local: &TaskOutput, remote: &RemoteResult) -> bool {
        match remote {
            Ok(output) => output != local,
            Err(_) => true,
        }
    }

    /// Check every synchronous result of a write
    ///
    /// Returns `QuorumNotMet` for an under-quorum write unless the policy is
    /// [`QuorumPolicy::Report`].
    pub async fn check(
        &self,
        task: &ReplicationTask,
        local: &TaskOutput,
        results: &HashMap<NodeId, RemoteResult>,
        min_successful: usize,
    ) -> Result<ConflictReport> {
        let mut nodes: Vec<&NodeId> = results.keys().collect();
        nodes.sort();

        let mut report = ConflictReport {
            conflicting: Vec::new(),
            successful: 0,
            required: min_successful,
        };
        for node in nodes {
            let remote = &results[node];
            if remote.is_ok() {
                report.successful += 1;
            }
            if self.check_single(task, node, local, remote) {
                report.conflicting.push(node.clone());
            }
        }

        if report.is_under_quorum() {
            self.handle_under_quorum(task, &report).await?;
        }
        Ok(report)
    }

    /// Check one result, typically from an asynchronous replica
    pub fn check_single(
        &self,
        task: &ReplicationTask,
        node: &str,
        local: &TaskOutput,
        remote: &RemoteResult,
    ) -> bool {
        if Self::diverges(local, remote) {
            self.resolver.handle_conflict(task, node, local, remote);
            true
        } else {
            false
        }
    }

    async fn handle_under_quorum(&self, task: &ReplicationTask, report: &ConflictReport) -> Result<()> {
        let quorum_error = ReplicationError::QuorumNotMet {
            needed: report.required,
            available: report.successful,
        };

        match self.policy {
            QuorumPolicy::Report => {
                warn!(
                    "Quorum not reached for {}: {} successful replicas, {} required",
                    task, report.successful, report.required
                );
                Ok(())
            }
            QuorumPolicy::Fail => {
                error!("Failing {}: {}", task, quorum_error);
                Err(quorum_error)
            }
            QuorumPolicy::Rollback => {
                if matches!(task.kind(), TaskKind::Replicated { .. }) {
                    self.roll_back(task, &quorum_error).await;
                }
                Err(quorum_error)
            }
        }
    }

    /// Undo a write in storage and record it in the journal, so nodes
    /// aligning from here replay it as a no-op
    async fn roll_back(&self, task: &ReplicationTask, reason: &ReplicationError) {
        if let Err(e) = self.storage.rollback(task).await {
            error!("Cannot roll back {}: {}", task, e);
            return;
        }
        match self.journal.roll_back(task.database(), task.operation()).await {
            Ok(()) => warn!("Rolled back {} after {}", task, reason),
            Err(e) => error!("Rolled back {} in storage but not in the journal: {}", task, e),
        }
    }
}
