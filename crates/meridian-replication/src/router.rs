//! Master resolution and failover wait
//!
//! The master of a write is configured per database and cluster. A value
//! starting with `$` names a [`MasterStrategy`]; anything else is a fixed
//! node id. When the resolved master is offline the caller waits, resolving
//! again on every poll because ownership may move while it waits.

use crate::config::ClusterReplicationConfig;
use crate::databases::DatabaseRegistry;
use crate::membership::MembershipTracker;
use crate::{ReplicationError, Result};
use dashmap::DashMap;
use meridian_cluster::{ClusterError, NodeId};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Strategy resolving to the owner of the key
pub const MASTER_AUTO: &str = "$auto";

/// Picks the master of a write
pub trait MasterStrategy: Send + Sync {
    fn resolve(
        &self,
        membership: &MembershipTracker,
        database: &str,
        cluster: Option<&str>,
        key: Option<&str>,
    ) -> Option<NodeId>;
}

/// Master is the node owning the key on the consistent hash ring
///
/// Without a key the cluster name is hashed instead, so every keyless write
/// of a cluster goes to the same node.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyOwnershipStrategy;

impl MasterStrategy for KeyOwnershipStrategy {
    fn resolve(
        &self,
        membership: &MembershipTracker,
        _database: &str,
        cluster: Option<&str>,
        key: Option<&str>,
    ) -> Option<NodeId> {
        membership.key_owner(key.or(cluster).unwrap_or(""))
    }
}

/// Resolves masters and waits for offline ones
pub struct MasterRouter {
    membership: Arc<MembershipTracker>,
    databases: Arc<DatabaseRegistry>,
    strategies: DashMap<String, Arc<dyn MasterStrategy>>,
    poll_interval: Duration,
}

impl MasterRouter {
    pub fn new(
        membership: Arc<MembershipTracker>,
        databases: Arc<DatabaseRegistry>,
        poll_interval: Duration,
    ) -> Self {
        let strategies: DashMap<String, Arc<dyn MasterStrategy>> = DashMap::new();
        strategies.insert(MASTER_AUTO.to_string(), Arc::new(KeyOwnershipStrategy));
        Self {
            membership,
            databases,
            strategies,
            poll_interval,
        }
    }

    /// Make a strategy selectable as `name` in the database configuration
    pub fn register_strategy(&self, name: impl Into<String>, strategy: Arc<dyn MasterStrategy>) -> Result<()> {
        let name = name.into();
        if !name.starts_with('$') {
            return Err(ReplicationError::configuration(format!(
                "master strategy name '{}' must start with '$'",
                name
            )));
        }
        self.strategies.insert(name, strategy);
        Ok(())
    }

    /// Current master of a write on `database`
    pub async fn resolve_master(
        &self,
        database: &str,
        cluster: Option<&str>,
        key: Option<&str>,
    ) -> Result<NodeId> {
        let config = self.databases.cluster_configuration(database, cluster).await?;
        self.resolve_with(&config, database, cluster, key)
    }

    /// Resolve the master from an already loaded configuration
    pub fn resolve_with(
        &self,
        config: &ClusterReplicationConfig,
        database: &str,
        cluster: Option<&str>,
        key: Option<&str>,
    ) -> Result<NodeId> {
        let master = match config.master.as_deref() {
            Some(master) => master,
            None => {
                warn!(
                    "No master configured for db={} cluster={}, using {}",
                    database,
                    cluster.unwrap_or("*"),
                    MASTER_AUTO
                );
                MASTER_AUTO
            }
        };

        if !master.starts_with('$') {
            return Ok(master.to_string());
        }

        let strategy = self
            .strategies
            .get(master)
            .map(|s| s.clone())
            .ok_or_else(|| {
                ReplicationError::configuration(format!(
                    "unknown master strategy '{}' for db={}",
                    master, database
                ))
            })?;
        strategy
            .resolve(&self.membership, database, cluster, key)
            .ok_or_else(|| {
                ReplicationError::NoMasterAvailable(format!(
                    "strategy {} found no master for db={} key={}",
                    master,
                    database,
                    key.unwrap_or("-")
                ))
            })
    }

    /// Wait until the master of a write is online and return it
    ///
    /// Returns at once when `master` is the local node or already online.
    /// Otherwise the master is resolved again on every poll and on every
    /// topology change, and a different master is adopted. An unreachable
    /// configuration map only delays the next attempt. There is no deadline;
    /// cancelling `cancel` ends the wait with `Cancelled`.
    pub async fn wait_until_master_online(
        &self,
        database: &str,
        cluster: Option<&str>,
        key: Option<&str>,
        master: NodeId,
        cancel: &CancellationToken,
    ) -> Result<NodeId> {
        let local = self.membership.local_node_id();
        let mut master = master;
        if master == local || !self.membership.is_offline(&master, cancel).await? {
            return Ok(master);
        }

        warn!(
            "Master {} of db={} is offline, waiting for it to come online",
            master, database
        );

        let topology = self.membership.topology_changed();
        loop {
            let changed = topology.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            tokio::select! {
                _ = cancel.cancelled() => return Err(ReplicationError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = changed => debug!("Topology changed while waiting for master {}", master),
            }

            let resolved = match self.resolve_master(database, cluster, key).await {
                Ok(resolved) => resolved,
                Err(ReplicationError::Cluster(ClusterError::Unavailable(name))) => {
                    debug!(
                        "Configuration map {} unavailable resolving the master of db={}, retrying",
                        name, database
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            if resolved != master {
                warn!(
                    "Master of db={} moved from {} to {}",
                    database, master, resolved
                );
                master = resolved;
            }

            if master == local || !self.membership.is_offline(&master, cancel).await? {
                break;
            }
        }

        info!(
            "Master {} of db={} is online, resuming the write",
            master, database
        );
        Ok(master)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use meridian_cluster::{InMemorySharedMap, NodeDocument, NodeStatus, SharedMap};

    const LOCAL: &str = "127.0.0.1:2424";
    const A: &str = "127.0.0.1:2425";
    const B: &str = "127.0.0.1:2426";

    struct NoMaster;

    impl MasterStrategy for NoMaster {
        fn resolve(&self, _: &MembershipTracker, _: &str, _: Option<&str>, _: Option<&str>) -> Option<NodeId> {
            None
        }
    }

    fn setup(master: Option<&str>) -> (Arc<MasterRouter>, Arc<InMemorySharedMap>, Arc<DatabaseRegistry>) {
        let map = Arc::new(InMemorySharedMap::new("meridian"));
        let membership = Arc::new(MembershipTracker::new(
            LOCAL,
            None,
            Vec::new(),
            map.clone(),
            Duration::from_millis(10),
        ));
        let databases = Arc::new(DatabaseRegistry::new(map.clone()));
        let mut cluster = ClusterReplicationConfig::default();
        cluster.master = master.map(str::to_string);
        databases.register("demo", DatabaseConfig::new(cluster));

        let router = Arc::new(MasterRouter::new(
            membership,
            databases.clone(),
            Duration::from_millis(20),
        ));
        (router, map, databases)
    }

    async fn publish(map: &InMemorySharedMap, id: &str, status: NodeStatus) {
        let doc = NodeDocument::new(id, None, status);
        map.put(&doc.key(), doc.to_value().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_fixed_master() {
        let (router, _, _) = setup(Some(A));
        assert_eq!(router.resolve_master("demo", None, Some("k")).await.unwrap(), A);
    }

    #[tokio::test]
    async fn test_missing_master_uses_key_ownership() {
        let (router, _, _) = setup(None);
        // The local node is the only one on the ring
        assert_eq!(router.resolve_master("demo", None, Some("k")).await.unwrap(), LOCAL);
    }

    #[tokio::test]
    async fn test_unknown_strategy() {
        let (router, _, _) = setup(Some("$nearest"));
        let err = router.resolve_master("demo", None, None).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_strategy_without_master() {
        let (router, _, _) = setup(Some("$none"));
        router.register_strategy("$none", Arc::new(NoMaster)).unwrap();
        assert!(router.register_strategy("none", Arc::new(NoMaster)).is_err());

        let err = router.resolve_master("demo", None, None).await.unwrap_err();
        assert!(matches!(err, ReplicationError::NoMasterAvailable(_)));
    }

    #[tokio::test]
    async fn test_online_master_returns_immediately() {
        let (router, map, _) = setup(Some(A));
        publish(&map, A, NodeStatus::Online).await;

        let master = router
            .wait_until_master_online("demo", None, None, A.to_string(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(master, A);
    }

    #[tokio::test]
    async fn test_waits_until_master_online() {
        let (router, map, _) = setup(Some(A));
        publish(&map, A, NodeStatus::Aligning).await;

        let waiting = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .wait_until_master_online("demo", None, None, A.to_string(), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!waiting.is_finished());

        publish(&map, A, NodeStatus::Online).await;
        assert_eq!(waiting.await.unwrap().unwrap(), A);
    }

    #[tokio::test]
    async fn test_wait_adopts_new_master() {
        let (router, map, databases) = setup(Some(A));
        publish(&map, B, NodeStatus::Online).await;

        let waiting = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .wait_until_master_online("demo", None, None, A.to_string(), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!waiting.is_finished());

        databases
            .update_configuration(
                "demo",
                DatabaseConfig::new(ClusterReplicationConfig::default().with_master(B)),
            )
            .await
            .unwrap();
        assert_eq!(waiting.await.unwrap().unwrap(), B);
    }

    #[tokio::test]
    async fn test_wait_survives_unavailable_map() {
        let (router, map, _) = setup(Some(A));
        publish(&map, A, NodeStatus::Aligning).await;

        let waiting = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .wait_until_master_online("demo", None, None, A.to_string(), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        map.set_available(false);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!waiting.is_finished());

        map.set_available(true);
        publish(&map, A, NodeStatus::Online).await;
        assert_eq!(waiting.await.unwrap().unwrap(), A);
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let (router, _, _) = setup(Some(A));
        let cancel = CancellationToken::new();

        let waiting = {
            let router = router.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                router
                    .wait_until_master_online("demo", None, None, A.to_string(), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        assert!(matches!(
            waiting.await.unwrap().unwrap_err(),
            ReplicationError::Cancelled
        ));
    }
}
