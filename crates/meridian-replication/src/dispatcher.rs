//! Fan-out of tasks to replicas
//!
//! Every destination receives its own copy of the task. Synchronous replicas
//! run concurrently and the caller waits for all of them; asynchronous ones
//! report to an [`AsyncResultHandler`] whenever they finish.

use crate::config::ReplicationConfig;
use crate::membership::MembershipTracker;
use crate::task::ReplicationTask;
use crate::transport::{RemoteFailure, RemoteResult, TaskTransport};
use crate::{ReplicationError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use meridian_cluster::{ClusterSubstrate, Member, NodeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How the caller waits for a remote execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// The caller gets a handle to await
    Synchronous,
    /// The result goes to a callback
    Asynchronous,
}

/// Receives results of asynchronous replicas
#[async_trait]
pub trait AsyncResultHandler: Send + Sync {
    async fn on_result(&self, node: NodeId, task: ReplicationTask, result: RemoteResult);
}

/// Sends tasks to remote nodes
pub struct ReplicationDispatcher {
    local_node: NodeId,
    substrate: Arc<dyn ClusterSubstrate>,
    transport: Arc<dyn TaskTransport>,
    /// Tells destinations that left apart from ones never seen
    membership: Option<Arc<MembershipTracker>>,
    execution_timeout: Duration,
}

impl ReplicationDispatcher {
    pub fn new(
        substrate: Arc<dyn ClusterSubstrate>,
        transport: Arc<dyn TaskTransport>,
        execution_timeout: Duration,
    ) -> Self {
        Self {
            local_node: substrate.local_member().node_id(),
            substrate,
            transport,
            membership: None,
            execution_timeout,
        }
    }

    pub fn with_membership(mut self, membership: Arc<MembershipTracker>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Send `task` to every replica of `config`
    ///
    /// Returns the results of the synchronous replicas. A replica that fails
    /// or already left shows up as an `Err` value in the map; only a
    /// destination the cluster never knew fails the whole call.
    pub async fn propagate(
        &self,
        task: &ReplicationTask,
        config: &ReplicationConfig,
        on_async: Option<Arc<dyn AsyncResultHandler>>,
    ) -> Result<HashMap<NodeId, RemoteResult>> {
        let mut results = HashMap::new();
        if !config.has_replicas() {
            return Ok(results);
        }

        let members = self.member_ids().await?;
        let mut departed = HashSet::new();
        for node in config.sync_replicas.iter().chain(&config.async_replicas) {
            if members.contains(node) {
                continue;
            }
            if !self.has_departed(node) {
                return Err(ReplicationError::NodeNotFound(node.clone()));
            }
            departed.insert(node.clone());
        }

        let task = task.clone().with_source(self.local_node.clone());

        if !config.sync_replicas.is_empty() {
            debug!(
                "Sending {} to synchronous replicas {:?}",
                task, config.sync_replicas
            );
        }
        let mut nodes = Vec::with_capacity(config.sync_replicas.len());
        let mut handles = Vec::with_capacity(config.sync_replicas.len());
        for node in &config.sync_replicas {
            if departed.contains(node) {
                warn!("Not sending {} to node {}: it left the cluster", task, node);
                results.insert(node.clone(), Err(RemoteFailure::node_left(node)));
                continue;
            }
            let copy = task.for_destination(node.as_str());
            if let Some(handle) = self.spawn_send(node, copy, ExecutionMode::Synchronous, None) {
                nodes.push(node.clone());
                handles.push(handle);
            }
        }

        if !config.async_replicas.is_empty() {
            debug!(
                "Sending {} to asynchronous replicas {:?}",
                task, config.async_replicas
            );
        }
        for node in &config.async_replicas {
            if departed.contains(node) {
                warn!("Not sending {} to node {}: it left the cluster", task, node);
                continue;
            }
            let copy = task.for_destination(node.as_str());
            self.spawn_send(node, copy, ExecutionMode::Asynchronous, on_async.clone());
        }

        for (node, joined) in nodes.into_iter().zip(join_all(handles).await) {
            let result = joined.unwrap_or_else(|e| Err(RemoteFailure::transport(e.to_string())));
            if let Err(failure) = &result {
                warn!("Error on executing {} on node {}: {}", task, node, failure);
            }
            results.insert(node, result);
        }

        Ok(results)
    }

    /// Send one task to one node
    ///
    /// Synchronous mode returns the handle to await; asynchronous mode hands
    /// the result to `on_async` and returns `None`.
    pub async fn send_task_to_node(
        &self,
        node: &str,
        task: ReplicationTask,
        mode: ExecutionMode,
        on_async: Option<Arc<dyn AsyncResultHandler>>,
    ) -> Result<Option<JoinHandle<RemoteResult>>> {
        self.ensure_member(node).await?;
        Ok(self.spawn_send(node, task, mode, on_async))
    }

    /// Send one task to one node and wait for its result
    pub async fn send_and_wait(&self, node: &str, task: ReplicationTask) -> Result<RemoteResult> {
        if !self.member_ids().await?.contains(node) {
            if self.has_departed(node) {
                return Ok(Err(RemoteFailure::node_left(node)));
            }
            return Err(ReplicationError::NodeNotFound(node.to_string()));
        }
        let task = task
            .with_source(self.local_node.clone())
            .for_destination(node);
        Ok(Self::call(self.transport.clone(), node.to_string(), task, self.execution_timeout).await)
    }

    fn spawn_send(
        &self,
        node: &str,
        task: ReplicationTask,
        mode: ExecutionMode,
        on_async: Option<Arc<dyn AsyncResultHandler>>,
    ) -> Option<JoinHandle<RemoteResult>> {
        let transport = self.transport.clone();
        let timeout = self.execution_timeout;
        let node = node.to_string();

        match mode {
            ExecutionMode::Synchronous => Some(tokio::spawn(Self::call(transport, node, task, timeout))),
            ExecutionMode::Asynchronous => {
                tokio::spawn(async move {
                    let result = Self::call(transport, node.clone(), task.clone(), timeout).await;
                    match on_async {
                        Some(handler) => handler.on_result(node, task, result).await,
                        None => {
                            if let Err(failure) = result {
                                warn!("Error on executing {} on node {}: {}", task, node, failure);
                            }
                        }
                    }
                });
                None
            }
        }
    }

    async fn call(
        transport: Arc<dyn TaskTransport>,
        node: NodeId,
        task: ReplicationTask,
        timeout: Duration,
    ) -> RemoteResult {
        debug!("Sending {} to node {}", task, node);
        match tokio::time::timeout(timeout, transport.send(&node, task)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteFailure::timeout(&node)),
        }
    }

    async fn ensure_member(&self, node: &str) -> Result<()> {
        if self.member_ids().await?.contains(node) {
            Ok(())
        } else {
            Err(ReplicationError::NodeNotFound(node.to_string()))
        }
    }

    fn has_departed(&self, node: &str) -> bool {
        self.membership
            .as_ref()
            .is_some_and(|membership| membership.is_known(node))
    }

    async fn member_ids(&self) -> Result<HashSet<NodeId>> {
        Ok(self
            .substrate
            .members()
            .await?
            .iter()
            .map(Member::node_id)
            .collect())
    }
}
