//! In-process implementation of the cluster substrate
//!
//! All nodes created from one [`InMemoryCluster`] share members, maps,
//! counters and locks, which is enough to run several coordinators side by
//! side in a single process.

use crate::substrate::{ClusterSubstrate, EntryEvent, MembershipEvent, SharedMap};
use crate::{ClusterError, Member, NodeId, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 1024;

/// Shared map kept in process memory
pub struct InMemorySharedMap {
    name: String,
    entries: DashMap<String, Value>,
    available: AtomicBool,
    events: broadcast::Sender<EntryEvent>,
}

impl InMemorySharedMap {
    /// Create an empty map
    pub fn new(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: name.into(),
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            events,
        }
    }

    /// Simulate the map becoming reachable or unreachable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClusterError::Unavailable(self.name.clone()))
        }
    }

    fn publish(&self, event: EntryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl SharedMap for InMemorySharedMap {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.check_available()?;
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<Option<Value>> {
        self.check_available()?;
        let old = self.entries.insert(key.to_string(), value.clone());
        let event = match &old {
            Some(old) => EntryEvent::Updated {
                key: key.to_string(),
                old: old.clone(),
                value,
            },
            None => EntryEvent::Added {
                key: key.to_string(),
                value,
            },
        };
        self.publish(event);
        Ok(old)
    }

    async fn put_if_absent(&self, key: &str, value: Value) -> Result<Option<Value>> {
        self.check_available()?;
        let existing = match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(value.clone());
                None
            }
        };
        if existing.is_none() {
            self.publish(EntryEvent::Added {
                key: key.to_string(),
                value,
            });
        }
        Ok(existing)
    }

    async fn remove(&self, key: &str) -> Result<Option<Value>> {
        self.check_available()?;
        let removed = self.entries.remove(key).map(|(_, v)| v);
        if let Some(value) = &removed {
            self.publish(EntryEvent::Removed {
                key: key.to_string(),
                value: value.clone(),
            });
        }
        Ok(removed)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<EntryEvent> {
        self.events.subscribe()
    }
}

struct ClusterState {
    members: RwLock<Vec<Member>>,
    maps: DashMap<String, Arc<InMemorySharedMap>>,
    counters: DashMap<String, i64>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    membership: broadcast::Sender<MembershipEvent>,
}

/// A cluster whose substrate state lives in this process
#[derive(Clone)]
pub struct InMemoryCluster {
    state: Arc<ClusterState>,
}

impl InMemoryCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        let (membership, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(ClusterState {
                members: RwLock::new(Vec::new()),
                maps: DashMap::new(),
                counters: DashMap::new(),
                locks: DashMap::new(),
                membership,
            }),
        }
    }

    /// Add a member and return its view of the substrate
    pub fn join(&self, member: Member) -> InMemoryNode {
        info!("Member {} joined the cluster", member.node_id());
        self.state.members.write().push(member.clone());
        let _ = self
            .state
            .membership
            .send(MembershipEvent::Joined(member.clone()));
        InMemoryNode {
            member,
            cluster: self.clone(),
        }
    }

    /// Remove a member, notifying the remaining ones
    pub fn leave(&self, node_id: &str) -> Option<Member> {
        let removed = {
            let mut members = self.state.members.write();
            let index = members.iter().position(|m| m.node_id() == node_id)?;
            members.remove(index)
        };
        info!("Member {} left the cluster", node_id);
        let _ = self
            .state
            .membership
            .send(MembershipEvent::Left(removed.clone()));
        Some(removed)
    }

    /// Current member ids
    pub fn member_ids(&self) -> Vec<NodeId> {
        self.state.members.read().iter().map(Member::node_id).collect()
    }

    /// The concrete map behind `name`, created on first use
    pub fn map(&self, name: &str) -> Arc<InMemorySharedMap> {
        self.state
            .maps
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Creating shared map {}", name);
                Arc::new(InMemorySharedMap::new(name))
            })
            .clone()
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// One member's handle on an [`InMemoryCluster`]
#[derive(Clone)]
pub struct InMemoryNode {
    member: Member,
    cluster: InMemoryCluster,
}

impl InMemoryNode {
    /// The cluster this node belongs to
    pub fn cluster(&self) -> &InMemoryCluster {
        &self.cluster
    }
}

#[async_trait]
impl ClusterSubstrate for InMemoryNode {
    fn local_member(&self) -> Member {
        self.member.clone()
    }

    async fn members(&self) -> Result<Vec<Member>> {
        Ok(self.cluster.state.members.read().clone())
    }

    fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.cluster.state.membership.subscribe()
    }

    fn shared_map(&self, name: &str) -> Arc<dyn SharedMap> {
        self.cluster.map(name)
    }

    async fn increment_counter(&self, name: &str) -> Result<i64> {
        let mut counter = self.cluster.state.counters.entry(name.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    fn named_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.cluster
            .state
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn cluster_time(&self) -> Result<i64> {
        Ok(Utc::now().timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn member(port: u16) -> Member {
        Member::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port))
    }

    #[tokio::test]
    async fn test_put_if_absent_first_writer_wins() {
        let map = InMemorySharedMap::new("cfg");
        assert_eq!(map.put_if_absent("runId", json!(7)).await.unwrap(), None);
        assert_eq!(
            map.put_if_absent("runId", json!(9)).await.unwrap(),
            Some(json!(7))
        );
        assert_eq!(map.get("runId").await.unwrap(), Some(json!(7)));
    }

    #[tokio::test]
    async fn test_entry_events() {
        let map = InMemorySharedMap::new("cfg");
        let mut events = map.subscribe();

        map.put("node.a", json!({"id": "a"})).await.unwrap();
        map.put("node.a", json!({"id": "a", "v": 2})).await.unwrap();
        map.remove("node.a").await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), EntryEvent::Added { .. }));
        assert!(matches!(events.recv().await.unwrap(), EntryEvent::Updated { .. }));
        let removed = events.recv().await.unwrap();
        assert_eq!(removed.key(), "node.a");
        assert!(matches!(removed, EntryEvent::Removed { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_map() {
        let map = InMemorySharedMap::new("cfg");
        map.set_available(false);
        assert!(matches!(
            map.get("x").await,
            Err(ClusterError::Unavailable(_))
        ));
        map.set_available(true);
        assert!(map.get("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_join_leave_and_shared_state() {
        let cluster = InMemoryCluster::new();
        let a = cluster.join(member(2424));
        let mut events = a.subscribe_membership();
        let b = cluster.join(member(2425));

        assert_eq!(a.members().await.unwrap().len(), 2);
        assert!(matches!(events.recv().await.unwrap(), MembershipEvent::Joined(_)));

        a.shared_map("cfg").put("k", json!(1)).await.unwrap();
        assert_eq!(b.shared_map("cfg").get("k").await.unwrap(), Some(json!(1)));

        assert_eq!(a.increment_counter("db.demo").await.unwrap(), 1);
        assert_eq!(b.increment_counter("db.demo").await.unwrap(), 2);

        cluster.leave("127.0.0.1:2425").unwrap();
        assert!(matches!(events.recv().await.unwrap(), MembershipEvent::Left(_)));
        assert_eq!(cluster.member_ids(), vec!["127.0.0.1:2424".to_string()]);
    }
}
