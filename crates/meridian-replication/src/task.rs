//! Replication task model
//!
//! A task is an immutable value describing one unit of replicated work. Each
//! mutating task carries an [`OperationId`] that fixes its place in the
//! per-database execution order.

use chrono::{DateTime, Utc};
use meridian_cluster::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Result produced by executing a task on one node
pub type TaskOutput = Option<serde_json::Value>;

/// Position of a mutating operation in the execution order of a database
///
/// Ordered lexicographically on `(run_id, serial)`. The run id changes once
/// per cluster lifetime, the serial is a cluster-wide counter per database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId {
    pub run_id: i64,
    pub serial: i64,
}

impl OperationId {
    /// Nothing executed or journaled yet
    pub const NONE: OperationId = OperationId {
        run_id: -1,
        serial: -1,
    };

    pub fn new(run_id: i64, serial: i64) -> Self {
        Self { run_id, serial }
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    /// Whether this operation may execute right after `last`
    ///
    /// Within a run the serial must be exactly the next one; a new run must
    /// start from serial 1.
    pub fn follows(&self, last: OperationId) -> bool {
        if self.run_id == last.run_id {
            self.serial == last.serial + 1
        } else {
            self.serial == 1
        }
    }

    /// Whether this operation was already executed when `last` is the last one
    pub fn is_replay_of(&self, last: OperationId) -> bool {
        self.run_id == last.run_id && self.serial <= last.serial
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.run_id, self.serial)
    }
}

/// What a task does when executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Mutation to apply to the database storage
    Replicated { payload: Vec<u8> },
    /// Placeholder that only consumes a sequence number
    NoOp,
    /// Ask a node to replay what it journaled after `checkpoint`
    AlignRequest { checkpoint: OperationId },
}

impl TaskKind {
    /// Mutable tasks are journaled and ordered, coordination tasks are not
    pub fn is_mutable(&self) -> bool {
        matches!(self, TaskKind::Replicated { .. } | TaskKind::NoOp)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Replicated { .. } => "replicated",
            TaskKind::NoOp => "no_op",
            TaskKind::AlignRequest { .. } => "align_request",
        }
    }
}

/// One unit of replicated work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTask {
    id: Uuid,
    operation: OperationId,
    source: Option<NodeId>,
    destination: Option<NodeId>,
    database: String,
    kind: TaskKind,
    created_at: DateTime<Utc>,
}

impl ReplicationTask {
    /// Create a task of any kind
    pub fn new(database: impl Into<String>, operation: OperationId, kind: TaskKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            source: None,
            destination: None,
            database: database.into(),
            kind,
            created_at: Utc::now(),
        }
    }

    /// Create a mutation task
    pub fn replicated(database: impl Into<String>, operation: OperationId, payload: Vec<u8>) -> Self {
        Self::new(database, operation, TaskKind::Replicated { payload })
    }

    /// Create an alignment request for everything after `checkpoint`
    pub fn align_request(database: impl Into<String>, checkpoint: OperationId) -> Self {
        Self::new(
            database,
            OperationId::NONE,
            TaskKind::AlignRequest { checkpoint },
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operation(&self) -> OperationId {
        self.operation
    }

    /// Node the task was sent from, `None` for locally submitted tasks
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Same task marked as sent from `source`
    pub fn with_source(mut self, source: impl Into<NodeId>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Copy addressed to one destination, with its own task id
    pub fn for_destination(&self, destination: impl Into<NodeId>) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4();
        copy.destination = Some(destination.into());
        copy
    }

    /// No-op with the same operation id, used to keep replica sequences
    /// gap-free when the mutation itself could not be applied
    pub fn as_no_op(&self) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4();
        copy.kind = TaskKind::NoOp;
        copy
    }
}

impl fmt::Display for ReplicationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(db={} op={})",
            self.kind.name(),
            self.database,
            self.operation
        )
    }
}

/// Per-call execution context
///
/// Carries the node an inbound task came from, so that work received from a
/// peer is applied locally and never propagated again, and the token that
/// cancels any blocking wait of the call.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    source: Option<NodeId>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    /// Context of a locally submitted request
    pub fn local() -> Self {
        Self {
            source: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Context of a task received from `source`
    pub fn remote(source: impl Into<NodeId>) -> Self {
        Self {
            source: Some(source.into()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn is_remote(&self) -> bool {
        self.source.is_some()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_ordering() {
        assert!(OperationId::new(7, 4) < OperationId::new(7, 5));
        assert!(OperationId::new(7, 90) < OperationId::new(8, 1));
        assert!(OperationId::NONE < OperationId::new(0, 0));
        assert_eq!(OperationId::new(7, 5).to_string(), "7.5");
    }

    #[test]
    fn test_admission_predicate() {
        let last = OperationId::new(7, 4);
        assert!(OperationId::new(7, 5).follows(last));
        assert!(!OperationId::new(7, 6).follows(last));
        assert!(OperationId::new(9, 1).follows(last));
        assert!(!OperationId::new(9, 2).follows(last));
        assert!(OperationId::new(9, 1).follows(OperationId::NONE));
    }

    #[test]
    fn test_replay_detection() {
        let last = OperationId::new(7, 4);
        assert!(OperationId::new(7, 4).is_replay_of(last));
        assert!(OperationId::new(7, 2).is_replay_of(last));
        assert!(!OperationId::new(7, 5).is_replay_of(last));
        assert!(!OperationId::new(6, 1).is_replay_of(last));
    }

    #[test]
    fn test_destination_copies_get_fresh_ids() {
        let task = ReplicationTask::replicated("demo", OperationId::new(1, 1), b"x".to_vec())
            .with_source("n1");
        let a = task.for_destination("n2");
        let b = task.for_destination("n3");

        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), task.id());
        assert_eq!(a.destination(), Some("n2"));
        assert_eq!(a.source(), Some("n1"));
        assert_eq!(a.operation(), task.operation());
    }

    #[test]
    fn test_no_op_copy() {
        let task = ReplicationTask::replicated("demo", OperationId::new(1, 3), b"x".to_vec());
        let no_op = task.as_no_op();
        assert_eq!(no_op.kind(), &TaskKind::NoOp);
        assert_eq!(no_op.operation(), OperationId::new(1, 3));
        assert!(no_op.kind().is_mutable());
        assert!(!ReplicationTask::align_request("demo", OperationId::NONE)
            .kind()
            .is_mutable());
    }

    #[test]
    fn test_task_serialization() {
        let task = ReplicationTask::align_request("demo", OperationId::new(3, 9));
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["kind"]["type"], "align_request");
        let back: ReplicationTask = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }
}
