//! Live view of the cluster from the local node
//!
//! Remote nodes enter the live set when their status document appears in
//! the shared configuration map, not when the substrate reports the join:
//! a node that has not published itself yet cannot take part in replication.
//! The tracker also owns the local node's status document and the key
//! ownership ring used by `$auto` master resolution.

use crate::{ReplicationError, Result};
use dashmap::DashMap;
use meridian_cluster::{
    node_key, ClusterError, ConsistentHashRing, EntryEvent, Member, NetworkListener, NodeDocument,
    NodeId, NodeStatus, SharedMap, NODE_KEY_PREFIX,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Snapshot of the cluster pushed to connected clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    /// Node that produced the snapshot
    pub local: NodeId,
    /// Status documents of the local node and every known remote node
    pub members: Vec<NodeDocument>,
}

impl ClusterConfiguration {
    pub fn member(&self, node_id: &str) -> Option<&NodeDocument> {
        self.members.iter().find(|doc| doc.id == node_id)
    }
}

/// Receives the cluster configuration whenever a node document changes
pub trait ClusterConfigurationListener: Send + Sync {
    fn on_cluster_configuration(&self, configuration: &ClusterConfiguration);
}

/// Tracks remote nodes and publishes the local node's status
pub struct MembershipTracker {
    local_id: NodeId,
    local: RwLock<NodeDocument>,
    /// Serializes status changes so publications land in order
    publish_lock: Mutex<()>,
    remote: RwLock<BTreeSet<NodeId>>,
    /// Nodes that were live and left, until they publish themselves again
    departed: RwLock<BTreeSet<NodeId>>,
    statuses: DashMap<NodeId, NodeStatus>,
    ring: RwLock<ConsistentHashRing>,
    map: Arc<dyn SharedMap>,
    listeners: RwLock<Vec<Arc<dyn ClusterConfigurationListener>>>,
    topology: Arc<Notify>,
    retry_interval: Duration,
}

impl MembershipTracker {
    pub fn new(
        local_id: impl Into<NodeId>,
        alias: Option<String>,
        listeners: Vec<NetworkListener>,
        map: Arc<dyn SharedMap>,
        retry_interval: Duration,
    ) -> Self {
        let local_id = local_id.into();
        let local = NodeDocument::new(local_id.clone(), alias, NodeStatus::Starting)
            .with_listeners(listeners);
        let ring = ConsistentHashRing::with_nodes([local_id.clone()]);

        Self {
            local_id,
            local: RwLock::new(local),
            publish_lock: Mutex::new(()),
            remote: RwLock::new(BTreeSet::new()),
            departed: RwLock::new(BTreeSet::new()),
            statuses: DashMap::new(),
            ring: RwLock::new(ring),
            map,
            listeners: RwLock::new(Vec::new()),
            topology: Arc::new(Notify::new()),
            retry_interval,
        }
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_id
    }

    pub fn status(&self) -> NodeStatus {
        self.local.read().status
    }

    pub fn local_document(&self) -> NodeDocument {
        self.local.read().clone()
    }

    /// Write the local status document to the shared map
    pub async fn publish_local(&self) -> Result<()> {
        let _guard = self.publish_lock.lock().await;
        self.write_local().await
    }

    /// Change the local status, publishing it only when it differs
    pub async fn set_local_status(&self, status: NodeStatus) -> Result<()> {
        let _guard = self.publish_lock.lock().await;
        {
            let mut local = self.local.write();
            if local.status == status {
                return Ok(());
            }
            local.status = status;
        }
        warn!("Updated node {} status to '{}'", self.local_id, status);
        self.write_local().await
    }

    async fn write_local(&self) -> Result<()> {
        let document = {
            let mut local = self.local.write();
            local.updated_at = chrono::Utc::now();
            local.clone()
        };
        self.map.put(&document.key(), document.to_value()?).await?;
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn ClusterConfigurationListener>) {
        self.listeners.write().push(listener);
    }

    /// Fired whenever the live set or a remote status changes
    pub fn topology_changed(&self) -> Arc<Notify> {
        self.topology.clone()
    }

    /// Register the members already in the cluster when the node starts
    pub fn register_members(&self, members: &[Member]) {
        for member in members {
            let node_id = member.node_id();
            if node_id != self.local_id {
                self.add_remote(&node_id);
            }
        }
    }

    /// Add the members that already published their status document
    pub async fn discover_members(&self, members: &[Member]) -> Result<()> {
        for member in members {
            let node_id = member.node_id();
            if node_id == self.local_id {
                continue;
            }
            match self.map.get(&node_key(&node_id)).await? {
                Some(value) => {
                    let document = NodeDocument::from_value(&value)?;
                    self.add_remote(&document.id);
                    self.statuses.insert(document.id.clone(), document.status);
                }
                None => debug!("Node {} has not published its status yet", node_id),
            }
        }
        self.notify_listeners().await;
        Ok(())
    }

    /// Substrate reported a join; the node is added once it publishes itself
    pub fn on_join(&self, member: &Member) {
        debug!(
            "Node {} joined, waiting for its status document",
            member.node_id()
        );
    }

    /// Substrate reported a leave
    pub async fn on_leave(&self, member: &Member) -> Result<()> {
        let node_id = member.node_id();
        if node_id == self.local_id {
            return Ok(());
        }

        if self.remove_remote(&node_id) {
            warn!("Node {} left the cluster", node_id);
        }
        self.map.remove(&node_key(&node_id)).await?;
        self.notify_listeners().await;
        Ok(())
    }

    /// A shared map entry changed
    pub async fn on_entry_event(&self, event: &EntryEvent) -> Result<()> {
        let Some(node_id) = event.key().strip_prefix(NODE_KEY_PREFIX) else {
            return Ok(());
        };
        if node_id == self.local_id {
            return Ok(());
        }

        match event {
            EntryEvent::Added { value, .. } | EntryEvent::Updated { value, .. } => {
                let document = NodeDocument::from_value(value)?;
                self.add_remote(&document.id);
                let previous = self.statuses.insert(document.id.clone(), document.status);
                if previous != Some(document.status) {
                    info!("Node {} is now {}", document.id, document.status);
                    self.topology.notify_waiters();
                }
            }
            EntryEvent::Removed { .. } => {
                if self.remove_remote(node_id) {
                    warn!("Status document of node {} was removed", node_id);
                }
            }
        }

        self.notify_listeners().await;
        Ok(())
    }

    fn add_remote(&self, node_id: &str) -> bool {
        let added = self.remote.write().insert(node_id.to_string());
        self.departed.write().remove(node_id);
        if added {
            self.ring.write().add_node(node_id.to_string());
            info!("Added node {} to the live set", node_id);
            self.topology.notify_waiters();
        }
        added
    }

    fn remove_remote(&self, node_id: &str) -> bool {
        let removed = self.remote.write().remove(node_id);
        self.statuses.remove(node_id);
        if removed {
            self.departed.write().insert(node_id.to_string());
            self.ring.write().remove_node(node_id);
            self.topology.notify_waiters();
        }
        removed
    }

    /// Remote nodes in the live set, sorted
    pub fn remote_nodes(&self) -> Vec<NodeId> {
        self.remote.read().iter().cloned().collect()
    }

    /// Remote nodes in the live set except `exclude`, whatever their status
    pub fn remote_nodes_except(&self, exclude: &[&str]) -> Vec<NodeId> {
        self.remote
            .read()
            .iter()
            .filter(|node| !exclude.contains(&node.as_str()))
            .cloned()
            .collect()
    }

    pub fn is_remote(&self, node_id: &str) -> bool {
        self.remote.read().contains(node_id)
    }

    /// Whether the node is live or left after having been live
    pub fn is_known(&self, node_id: &str) -> bool {
        self.is_remote(node_id) || self.departed.read().contains(node_id)
    }

    /// Last status seen in the node's document events
    pub fn remote_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.statuses.get(node_id).map(|s| *s)
    }

    /// Owner of a key among the local node and the live remote nodes
    pub fn key_owner(&self, key: &str) -> Option<NodeId> {
        self.ring.read().owner(key)
    }

    /// Read a node's status document, retrying while the map is unavailable
    pub async fn node_document(
        &self,
        node_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<NodeDocument>> {
        let key = node_key(node_id);
        loop {
            match self.map.get(&key).await {
                Ok(Some(value)) => return Ok(Some(NodeDocument::from_value(&value)?)),
                Ok(None) => return Ok(None),
                Err(ClusterError::Unavailable(name)) => {
                    debug!(
                        "Configuration map {} unavailable reading {}, retrying",
                        name, key
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ReplicationError::Cancelled),
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// A node without a document or with a status other than online is offline
    pub async fn is_offline(&self, node_id: &str, cancel: &CancellationToken) -> Result<bool> {
        if node_id == self.local_id {
            return Ok(self.status() != NodeStatus::Online);
        }
        Ok(self
            .node_document(node_id, cancel)
            .await?
            .map(|doc| !doc.is_online())
            .unwrap_or(true))
    }

    /// Current view of the cluster
    pub async fn cluster_configuration(&self) -> Result<ClusterConfiguration> {
        let mut members = vec![self.local_document()];
        for node_id in self.remote_nodes() {
            if let Some(value) = self.map.get(&node_key(&node_id)).await? {
                members.push(NodeDocument::from_value(&value)?);
            }
        }
        Ok(ClusterConfiguration {
            local: self.local_id.clone(),
            members,
        })
    }

    async fn notify_listeners(&self) {
        let listeners = self.listeners.read().clone();
        if listeners.is_empty() {
            return;
        }
        match self.cluster_configuration().await {
            Ok(configuration) => {
                for listener in listeners {
                    listener.on_cluster_configuration(&configuration);
                }
            }
            Err(e) => warn!("Cannot build the cluster configuration: {}", e),
        }
    }
}
