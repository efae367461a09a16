//! Cluster membership substrate for meridian
//!
//! This crate describes the part of the cluster the replication coordinator
//! consumes but does not own:
//! - Node identity and the status document every node publishes
//! - Membership and shared-map entry events
//! - A replicated key-value configuration map behind a narrow trait
//! - Cluster-wide counters, named locks and a logical clock
//! - Consistent hashing for key ownership
//!
//! [`memory::InMemoryCluster`] implements the substrate for a set of nodes
//! living in one process.

pub mod memory;
pub mod shard;
pub mod substrate;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub use memory::{InMemoryCluster, InMemoryNode, InMemorySharedMap};
pub use shard::ConsistentHashRing;
pub use substrate::{ClusterSubstrate, EntryEvent, MembershipEvent, SharedMap};

/// Key prefix of node status documents in the configuration map
pub const NODE_KEY_PREFIX: &str = "node.";

/// Key prefix of database configuration documents in the configuration map
pub const DATABASE_KEY_PREFIX: &str = "db.";

/// Cluster-related errors
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Shared configuration map unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid node status: {0}")]
    InvalidStatus(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Node identifier, derived from the member address
pub type NodeId = String;

/// Status a node publishes about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Process is up but not registered yet
    Starting,
    /// Catching up with the rest of the cluster
    Aligning,
    /// Serving traffic
    Online,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Starting => "starting",
            NodeStatus::Aligning => "aligning",
            NodeStatus::Online => "online",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "starting" => Ok(NodeStatus::Starting),
            "aligning" => Ok(NodeStatus::Aligning),
            "online" => Ok(NodeStatus::Online),
            other => Err(ClusterError::InvalidStatus(other.to_string())),
        }
    }
}

/// A member as seen by the substrate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Address the member is reachable on, if known
    pub address: Option<SocketAddr>,
    /// Substrate-assigned unique identifier
    pub uuid: Uuid,
}

impl Member {
    /// Create a member reachable on `address`
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address: Some(address),
            uuid: Uuid::new_v4(),
        }
    }

    /// Create a member that has not published an address
    pub fn without_address() -> Self {
        Self {
            address: None,
            uuid: Uuid::new_v4(),
        }
    }

    /// The node id: `ip:port` when the address is known, the uuid otherwise
    pub fn node_id(&self) -> NodeId {
        match self.address {
            Some(addr) => addr.to_string(),
            None => self.uuid.to_string(),
        }
    }
}

/// A network listener a node exposes to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkListener {
    /// Protocol name, e.g. "binary" or "http"
    pub protocol: String,
    /// Listening address
    pub listen: String,
}

impl NetworkListener {
    pub fn new(protocol: impl Into<String>, listen: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            listen: listen.into(),
        }
    }
}

/// Status document a node publishes under `node.<id>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDocument {
    /// Node identifier
    pub id: NodeId,
    /// Human readable alias, defaults to the id
    pub alias: String,
    /// Current status
    pub status: NodeStatus,
    /// Published client listeners
    pub listeners: Vec<NetworkListener>,
    /// Last time the document was written
    pub updated_at: DateTime<Utc>,
}

impl NodeDocument {
    /// Create a document for a node
    pub fn new(id: impl Into<NodeId>, alias: Option<String>, status: NodeStatus) -> Self {
        let id = id.into();
        Self {
            alias: alias.unwrap_or_else(|| id.clone()),
            id,
            status,
            listeners: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Attach the listeners
    pub fn with_listeners(mut self, listeners: Vec<NetworkListener>) -> Self {
        self.listeners = listeners;
        self
    }

    /// Map key the document is stored under
    pub fn key(&self) -> String {
        node_key(&self.id)
    }

    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Map key of the status document of `node_id`
pub fn node_key(node_id: &str) -> String {
    format!("{}{}", NODE_KEY_PREFIX, node_id)
}

/// Map key of the configuration document of `database`
pub fn database_key(database: &str) -> String {
    format!("{}{}", DATABASE_KEY_PREFIX, database)
}
