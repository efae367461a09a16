//! Remote task execution
//!
//! [`TaskTransport`] is the remote-procedure side of the substrate: it
//! delivers a task to a peer and returns the peer's result. Per-peer failures
//! are values, never errors of the whole write.

use crate::coordinator::Coordinator;
use crate::task::{ReplicationTask, TaskOutput};
use async_trait::async_trait;
use dashmap::DashMap;
use meridian_cluster::NodeId;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::debug;

/// Why a remote execution produced no result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// No answer within the execution timeout
    Timeout,
    /// The peer is no longer part of the cluster
    NodeLeft,
    /// The peer refused or failed to execute the task
    Rejected,
    /// The task could not be delivered
    Transport,
}

/// Failure of one remote execution
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(node: &str) -> Self {
        Self::new(FailureKind::Timeout, format!("node {} did not answer in time", node))
    }

    pub fn node_left(node: &str) -> Self {
        Self::new(FailureKind::NodeLeft, format!("node {} left the cluster", node))
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Rejected, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, message)
    }

    pub fn is_node_left(&self) -> bool {
        self.kind == FailureKind::NodeLeft
    }
}

/// Result of executing a task on one peer
pub type RemoteResult = std::result::Result<TaskOutput, RemoteFailure>;

/// Delivers tasks to peers
#[async_trait]
pub trait TaskTransport: Send + Sync {
    /// Execute `task` on `target` and wait for its result
    async fn send(&self, target: &str, task: ReplicationTask) -> RemoteResult;
}

/// Transport between coordinators living in the same process
#[derive(Default)]
pub struct InProcessTransport {
    nodes: DashMap<NodeId, Weak<Coordinator>>,
}

impl InProcessTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a coordinator reachable under its node id
    pub fn register(&self, coordinator: &Arc<Coordinator>) {
        let node_id = coordinator.local_node_id().to_string();
        debug!("Registered node {} on the in-process transport", node_id);
        self.nodes.insert(node_id, Arc::downgrade(coordinator));
    }

    /// Make a node unreachable, as if its process stopped
    pub fn unregister(&self, node_id: &str) {
        self.nodes.remove(node_id);
    }
}

#[async_trait]
impl TaskTransport for InProcessTransport {
    async fn send(&self, target: &str, task: ReplicationTask) -> RemoteResult {
        let coordinator = self.nodes.get(target).and_then(|node| node.upgrade());
        match coordinator {
            Some(coordinator) => coordinator.handle_remote_task(task).await,
            None => Err(RemoteFailure::node_left(target)),
        }
    }
}
