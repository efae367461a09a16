//! Databases hosted by this node and their shared configuration

use crate::config::{ClusterReplicationConfig, DatabaseConfig};
use crate::{ReplicationError, Result};
use dashmap::DashMap;
use meridian_cluster::{database_key, SharedMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Registry of locally hosted databases
///
/// The cluster-wide configuration of a database lives under `db.<name>` in
/// the shared map. The first node hosting a database seeds that entry from
/// its local configuration; afterwards every node follows the shared one.
pub struct DatabaseRegistry {
    local: DashMap<String, DatabaseConfig>,
    map: Arc<dyn SharedMap>,
}

impl DatabaseRegistry {
    pub fn new(map: Arc<dyn SharedMap>) -> Self {
        Self {
            local: DashMap::new(),
            map,
        }
    }

    /// Host a database on this node
    pub fn register(&self, name: impl Into<String>, config: DatabaseConfig) {
        let name = name.into();
        debug!("Hosting db={}", name);
        self.local.insert(name, config);
    }

    pub fn is_hosted(&self, name: &str) -> bool {
        self.local.contains_key(name)
    }

    /// Names of the hosted databases, sorted
    pub fn hosted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.local.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Cluster-wide configuration of a database
    pub async fn configuration(&self, name: &str) -> Result<DatabaseConfig> {
        let key = database_key(name);
        if let Some(value) = self.map.get(&key).await? {
            let config: DatabaseConfig = serde_json::from_value(value)?;
            if let Some(mut local) = self.local.get_mut(name) {
                *local = config.clone();
            }
            return Ok(config);
        }

        let config = self
            .local
            .get(name)
            .map(|c| c.clone())
            .ok_or_else(|| {
                ReplicationError::configuration(format!("db={} is not configured", name))
            })?;

        match self.map.put_if_absent(&key, serde_json::to_value(&config)?).await? {
            Some(existing) => Ok(serde_json::from_value(existing)?),
            None => {
                info!("Published configuration of db={}", name);
                Ok(config)
            }
        }
    }

    /// Replication settings of a database for one cluster
    pub async fn cluster_configuration(
        &self,
        name: &str,
        cluster: Option<&str>,
    ) -> Result<ClusterReplicationConfig> {
        self.configuration(name)
            .await?
            .cluster(cluster)
            .cloned()
            .ok_or_else(|| {
                ReplicationError::configuration(format!(
                    "db={} has no replication settings for cluster {}",
                    name,
                    cluster.unwrap_or("*")
                ))
            })
    }

    /// Replace the shared configuration of a database
    pub async fn update_configuration(&self, name: &str, config: DatabaseConfig) -> Result<()> {
        self.map
            .put(&database_key(name), serde_json::to_value(&config)?)
            .await?;
        if let Some(mut local) = self.local.get_mut(name) {
            *local = config;
        }
        info!("Updated configuration of db={}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterReplicationConfig;
    use meridian_cluster::InMemorySharedMap;

    #[tokio::test]
    async fn test_first_host_seeds_shared_configuration() {
        let map = Arc::new(InMemorySharedMap::new("meridian"));
        let first = DatabaseRegistry::new(map.clone());
        let second = DatabaseRegistry::new(map.clone());

        let seeded = DatabaseConfig::new(ClusterReplicationConfig::default().with_min_successful(2));
        first.register("demo", seeded.clone());
        second.register("demo", DatabaseConfig::default());

        assert_eq!(first.configuration("demo").await.unwrap(), seeded);
        assert_eq!(second.configuration("demo").await.unwrap(), seeded);
        assert!(map.get("db.demo").await.unwrap().is_some());
        assert_eq!(first.hosted(), vec!["demo".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_database() {
        let registry = DatabaseRegistry::new(Arc::new(InMemorySharedMap::new("meridian")));
        let err = registry.configuration("ghost").await.unwrap_err();
        assert!(matches!(err, ReplicationError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_update_configuration() {
        let registry = DatabaseRegistry::new(Arc::new(InMemorySharedMap::new("meridian")));
        registry.register("demo", DatabaseConfig::default());

        let updated = DatabaseConfig::new(ClusterReplicationConfig::default().without_synchronization());
        registry.update_configuration("demo", updated).await.unwrap();

        let cluster = registry.cluster_configuration("demo", Some("eu")).await.unwrap();
        assert!(!cluster.synchronization);
    }
}
