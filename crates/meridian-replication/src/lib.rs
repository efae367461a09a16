//! Replication coordinator for meridian database nodes
//!
//! For every mutating operation the coordinator decides which nodes execute
//! it, in what order and with what durability guarantee:
//! - Master routing per key/cluster with a wait for offline masters
//! - Fan-out to synchronous and asynchronous replicas
//! - Strict per-database ordering through the operation journal
//! - Conflict and quorum detection between local and remote results
//! - Alignment of nodes that fell behind or just joined
//!
//! # Examples
//!
//! ```no_run
//! use meridian_cluster::{InMemoryCluster, Member};
//! use meridian_replication::{
//!     Coordinator, CoordinatorConfig, DatabaseConfig, ExecutionContext, InProcessTransport,
//!     MemoryJournal, MemoryStorage,
//! };
//! use std::sync::Arc;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster = InMemoryCluster::new();
//!     let node = cluster.join(Member::new("127.0.0.1:2424".parse()?));
//!     let transport = InProcessTransport::new();
//!
//!     let coordinator = Coordinator::builder(Arc::new(node), transport.clone())
//!         .journal(Arc::new(MemoryJournal::new()))
//!         .storage(Arc::new(MemoryStorage::new()))
//!         .config(CoordinatorConfig::default())
//!         .build();
//!     coordinator.register_database("demo", DatabaseConfig::default());
//!     transport.register(&coordinator);
//!     coordinator.startup().await?;
//!
//!     let task = coordinator.new_task("demo", b"insert".to_vec()).await?;
//!     let replication = coordinator.replication_data("demo", None, Some("k1"), &[]).await?;
//!     coordinator
//!         .execute(None, Some("k1"), task, replication, &ExecutionContext::local())
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod alignment;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod databases;
pub mod dispatcher;
pub mod journal;
pub mod membership;
pub mod queue;
pub mod router;
pub mod storage;
pub mod task;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use alignment::{AlignmentProtocol, AlignmentReply};
pub use config::{
    ClusterReplicationConfig, CoordinatorConfig, DatabaseConfig, QuorumPolicy, ReplicationConfig,
};
pub use conflict::{Conflict, ConflictDetector, ConflictReport, ConflictResolver, LoggingResolver, RecordingResolver};
pub use coordinator::{Coordinator, CoordinatorBuilder, DatabaseStatus};
pub use databases::DatabaseRegistry;
pub use dispatcher::{AsyncResultHandler, ExecutionMode, ReplicationDispatcher};
pub use journal::{FileJournal, JournalEntry, MemoryJournal, OperationJournal, OperationStatus};
pub use membership::{ClusterConfiguration, ClusterConfigurationListener, MembershipTracker};
pub use queue::{LocalExecution, LocalExecutionQueue};
pub use router::{KeyOwnershipStrategy, MasterRouter, MasterStrategy, MASTER_AUTO};
pub use storage::{MemoryStorage, StorageEngine, StorageError};
pub use task::{ExecutionContext, OperationId, ReplicationTask, TaskKind, TaskOutput};
pub use transport::{FailureKind, InProcessTransport, RemoteFailure, RemoteResult, TaskTransport};

pub use meridian_cluster::{NodeId, NodeStatus};

use thiserror::Error;

/// Result type for replication operations
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication operations
#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No master available: {0}")]
    NoMasterAvailable(String),

    #[error("Remote node '{0}' is not configured")]
    NodeNotFound(String),

    #[error("Operation must be retried: {0}")]
    Retryable(String),

    #[error("Quorum not met: needed {needed}, got {available}")]
    QuorumNotMet { needed: usize, available: usize },

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Remote execution failed: {0}")]
    Remote(#[from] RemoteFailure),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Cluster error: {0}")]
    Cluster(#[from] meridian_cluster::ClusterError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplicationError {
    /// Create a configuration error with a custom message
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        ReplicationError::Configuration(msg.into())
    }

    /// Create a journal error with a custom message
    pub fn journal<S: Into<String>>(msg: S) -> Self {
        ReplicationError::Journal(msg.into())
    }
}
