//! The membership/messaging substrate seen by the coordinator
//!
//! The substrate discovers peers, detects failures and hosts a cluster-wide
//! configuration map with change notifications. The coordinator treats the
//! map as eventually consistent: each key is last-writer-wins and nothing
//! spans more than one key.

use crate::{Member, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Change notification for a shared map entry
#[derive(Debug, Clone, PartialEq)]
pub enum EntryEvent {
    Added { key: String, value: Value },
    Updated { key: String, old: Value, value: Value },
    Removed { key: String, value: Value },
}

impl EntryEvent {
    /// Key the event refers to
    pub fn key(&self) -> &str {
        match self {
            EntryEvent::Added { key, .. }
            | EntryEvent::Updated { key, .. }
            | EntryEvent::Removed { key, .. } => key,
        }
    }

    /// Current value, or the removed value for removals
    pub fn value(&self) -> &Value {
        match self {
            EntryEvent::Added { value, .. }
            | EntryEvent::Updated { value, .. }
            | EntryEvent::Removed { value, .. } => value,
        }
    }
}

/// Membership change reported by the substrate
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Joined(Member),
    Left(Member),
}

/// Replicated key-value map with listenable entries
#[async_trait]
pub trait SharedMap: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write a value, returning the previous one
    async fn put(&self, key: &str, value: Value) -> Result<Option<Value>>;

    /// Write a value only if the key is absent, returning the existing value otherwise
    async fn put_if_absent(&self, key: &str, value: Value) -> Result<Option<Value>>;

    /// Remove a value, returning it
    async fn remove(&self, key: &str) -> Result<Option<Value>>;

    /// All keys currently stored
    async fn keys(&self) -> Result<Vec<String>>;

    /// Register for entry change notifications
    fn subscribe(&self) -> broadcast::Receiver<EntryEvent>;
}

/// Cluster services the coordinator consumes
#[async_trait]
pub trait ClusterSubstrate: Send + Sync {
    /// The member this process runs as
    fn local_member(&self) -> Member;

    /// Current members, the local one included
    async fn members(&self) -> Result<Vec<Member>>;

    /// Register for join/leave notifications
    fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent>;

    /// Named cluster-wide map
    fn shared_map(&self, name: &str) -> Arc<dyn SharedMap>;

    /// Increment a cluster-wide counter and return the new value
    async fn increment_counter(&self, name: &str) -> Result<i64>;

    /// Named cluster-wide mutual-exclusion lock
    fn named_lock(&self, name: &str) -> Arc<Mutex<()>>;

    /// Cluster logical clock in milliseconds
    async fn cluster_time(&self) -> Result<i64>;
}
