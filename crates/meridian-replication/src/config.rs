//! Coordinator and database replication configuration

use crate::router::MASTER_AUTO;
use meridian_cluster::{NetworkListener, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Cluster name that applies when no specific cluster is configured
pub const ALL_CLUSTERS: &str = "*";

/// What to do when fewer than `min_successful` replicas agree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// Report the conflict and keep the write
    #[default]
    Report,
    /// Fail the write, the local mutation stays applied
    Fail,
    /// Ask the storage engine to undo the write, then fail it
    Rollback,
}

/// Settings of one coordinator instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Alias published in the node document
    pub alias: Option<String>,
    /// Client listeners published in the node document
    pub listeners: Vec<NetworkListener>,
    /// Name of the shared configuration map
    pub configuration_map: String,
    /// Upper bound of a single remote call
    pub execution_timeout: Duration,
    /// Poll interval while waiting for an offline master
    pub master_poll_interval: Duration,
    /// Upper bound of a single wait of the ordering queue before re-checking
    pub queue_wait_timeout: Duration,
    /// Pause between reads of the configuration map while it is unavailable
    pub map_retry_interval: Duration,
    /// Align with the running nodes at startup
    pub alignment_at_startup: bool,
    /// Period of the alignment timer, zero disables it
    pub alignment_interval: Duration,
    /// Times a write is routed again after its master left
    pub max_reroutes: usize,
    /// Reaction to an under-quorum write
    pub quorum_policy: QuorumPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            alias: None,
            listeners: Vec::new(),
            configuration_map: "meridian".to_string(),
            execution_timeout: Duration::from_secs(5),
            master_poll_interval: Duration::from_millis(200),
            queue_wait_timeout: Duration::from_secs(1),
            map_retry_interval: Duration::from_millis(100),
            alignment_at_startup: true,
            alignment_interval: Duration::from_secs(30),
            max_reroutes: 3,
            quorum_policy: QuorumPolicy::Report,
        }
    }
}

fn default_synchronization() -> bool {
    true
}

fn default_master() -> Option<String> {
    Some(MASTER_AUTO.to_string())
}

/// Replication settings of a database for one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterReplicationConfig {
    /// Replicate writes at all
    #[serde(default = "default_synchronization")]
    pub synchronization: bool,
    /// Fixed node id, or a `$`-prefixed strategy name
    #[serde(default)]
    pub master: Option<String>,
    /// Nodes that receive writes without the writer waiting for them
    #[serde(default)]
    pub asynchronous: Vec<NodeId>,
    /// Non-failing results needed for a write to meet its quorum
    #[serde(default)]
    pub min_successful: usize,
}

impl Default for ClusterReplicationConfig {
    fn default() -> Self {
        Self {
            synchronization: true,
            master: default_master(),
            asynchronous: Vec::new(),
            min_successful: 0,
        }
    }
}

impl ClusterReplicationConfig {
    pub fn with_master(mut self, master: impl Into<String>) -> Self {
        self.master = Some(master.into());
        self
    }

    pub fn with_asynchronous(mut self, nodes: Vec<NodeId>) -> Self {
        self.asynchronous = nodes;
        self
    }

    pub fn with_min_successful(mut self, min_successful: usize) -> Self {
        self.min_successful = min_successful;
        self
    }

    pub fn without_synchronization(mut self) -> Self {
        self.synchronization = false;
        self
    }
}

/// Replication configuration document of a database
///
/// Stored as JSON under `db.<name>` in the shared configuration map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterReplicationConfig>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new(ClusterReplicationConfig::default())
    }
}

impl DatabaseConfig {
    /// Configuration applying `config` to every cluster
    pub fn new(config: ClusterReplicationConfig) -> Self {
        let mut clusters = BTreeMap::new();
        clusters.insert(ALL_CLUSTERS.to_string(), config);
        Self { clusters }
    }

    /// Override the settings of one cluster
    pub fn with_cluster(mut self, name: impl Into<String>, config: ClusterReplicationConfig) -> Self {
        self.clusters.insert(name.into(), config);
        self
    }

    /// Settings of `cluster`, falling back to the `*` entry
    pub fn cluster(&self, cluster: Option<&str>) -> Option<&ClusterReplicationConfig> {
        cluster
            .and_then(|name| self.clusters.get(name))
            .or_else(|| self.clusters.get(ALL_CLUSTERS))
    }
}

/// Resolved replication targets of one write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// Node that applies the write first
    pub master: NodeId,
    /// Nodes the writer waits for, in dispatch order
    pub sync_replicas: Vec<NodeId>,
    /// Nodes updated in the background
    pub async_replicas: Vec<NodeId>,
    pub min_successful: usize,
}

impl ReplicationConfig {
    pub fn new(master: impl Into<NodeId>) -> Self {
        Self {
            master: master.into(),
            sync_replicas: Vec::new(),
            async_replicas: Vec::new(),
            min_successful: 0,
        }
    }

    /// Targets all awaited by the writer
    pub fn synchronous(master: impl Into<NodeId>, replicas: Vec<NodeId>) -> Self {
        Self {
            sync_replicas: replicas,
            ..Self::new(master)
        }
    }

    pub fn has_replicas(&self) -> bool {
        !self.sync_replicas.is_empty() || !self.async_replicas.is_empty()
    }
}
