//! Routing key to shard mapping.

use super::registry::ConnectionRegistry;
use crate::error::{Error, Result};
use crate::shard::ShardConnection;
use crate::types::{RoutingKey, ShardName};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// One routing entry. The shard name and its connection are installed and
/// read together, so a reader never pairs a name with another shard's
/// connection.
#[derive(Debug, Clone)]
struct RouteEntry {
    shard: ShardName,
    connection: Arc<ShardConnection>,
}

/// Maps routing keys to shards.
///
/// Every mutation replaces a whole entry under the write lock; readers clone
/// the entry under the read lock. No lock is held across an `.await`: the
/// connection is built first, then the entry is swapped in.
#[derive(Debug)]
pub struct RoutingTable {
    registry: Arc<ConnectionRegistry>,
    entries: RwLock<HashMap<RoutingKey, RouteEntry>>,
    /// Incremented on every change.
    version: AtomicU64,
}

impl RoutingTable {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            entries: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// The shard `key` is currently routed to.
    pub fn shard_for(&self, key: &RoutingKey) -> Option<ShardName> {
        self.entries.read().get(key).map(|e| e.shard.clone())
    }

    /// Snapshot of all routes, sorted by key.
    pub fn routes(&self) -> Vec<(RoutingKey, ShardName)> {
        let mut routes: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(k, e)| (k.clone(), e.shard.clone()))
            .collect();
        routes.sort();
        routes
    }

    /// Resolve `key` to a live connection.
    ///
    /// Falls back to the registry when the entry's connection has been closed,
    /// which surfaces a connection error if the shard cannot be rebuilt.
    pub async fn resolve(&self, key: &RoutingKey) -> Result<Arc<ShardConnection>> {
        let entry = self
            .entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::KeyNotFound(key.clone()))?;

        if !entry.connection.is_closed() {
            return Ok(entry.connection);
        }

        self.registry.connect(&entry.shard).await
    }

    /// Install or replace the route for `key`. Returns the previous shard.
    ///
    /// On error the previous route, if any, is untouched.
    pub async fn register(&self, key: RoutingKey, shard: ShardName) -> Result<Option<ShardName>> {
        if !self.registry.is_configured(shard.as_str()) {
            return Err(Error::UnknownShard(shard));
        }

        let connection = self.registry.connect(&shard).await?;
        let previous = self.install(key.clone(), shard.clone(), connection);

        info!(key = %key, shard = %shard, previous = ?previous, "Registered routing key");
        Ok(previous)
    }

    /// Replace the route for `key` only if it still points at `expected`.
    ///
    /// Used by migration cutover so a route changed or removed during the copy
    /// is not silently overwritten.
    pub async fn switch(
        &self,
        key: &RoutingKey,
        expected: &ShardName,
        shard: ShardName,
    ) -> Result<()> {
        if !self.registry.is_configured(shard.as_str()) {
            return Err(Error::UnknownShard(shard));
        }

        let connection = self.registry.connect(&shard).await?;

        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(current) if &current.shard == expected => {}
            Some(current) => {
                return Err(Error::Input(format!(
                    "key {} moved to {} during migration",
                    key, current.shard
                )))
            }
            None => return Err(Error::KeyNotFound(key.clone())),
        }

        entries.insert(key.clone(), RouteEntry { shard: shard.clone(), connection });
        self.version.fetch_add(1, Ordering::SeqCst);
        drop(entries);

        info!(key = %key, from = %expected, to = %shard, "Switched routing key");
        Ok(())
    }

    /// Remove the route for `key`. Removing an absent key is not an error.
    pub fn unregister(&self, key: &RoutingKey) -> Option<ShardName> {
        let removed = self.entries.write().remove(key).map(|e| e.shard);
        if removed.is_some() {
            self.version.fetch_add(1, Ordering::SeqCst);
            info!(key = %key, "Removed routing key");
        }
        removed
    }

    fn install(
        &self,
        key: RoutingKey,
        shard: ShardName,
        connection: Arc<ShardConnection>,
    ) -> Option<ShardName> {
        let previous = self
            .entries
            .write()
            .insert(key, RouteEntry { shard, connection })
            .map(|e| e.shard);
        self.version.fetch_add(1, Ordering::SeqCst);
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardConfig;
    use crate::shard::MemoryConnector;

    fn table(connector: Arc<MemoryConnector>) -> RoutingTable {
        let registry = ConnectionRegistry::new(
            vec![ShardConfig::memory("shardA"), ShardConfig::memory("shardB")],
            connector,
        );
        RoutingTable::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_register_then_resolve() {
        let table = table(Arc::new(MemoryConnector::new()));

        let previous = table.register("tenant1".into(), "shardA".into()).await.unwrap();
        assert!(previous.is_none());

        let conn = table.resolve(&"tenant1".into()).await.unwrap();
        assert_eq!(conn.shard_name().as_str(), "shardA");
        assert_eq!(table.version(), 1);
    }

    #[tokio::test]
    async fn test_unregister_then_resolve_is_not_found() {
        let table = table(Arc::new(MemoryConnector::new()));
        table.register("tenant1".into(), "shardA".into()).await.unwrap();

        assert_eq!(table.unregister(&"tenant1".into()), Some("shardA".into()));
        assert_eq!(table.unregister(&"tenant1".into()), None);

        let err = table.resolve(&"tenant1".into()).await.unwrap_err();
        assert!(matches!(err, Error::KeyNotFound(_)));
    }

    #[tokio::test]
    async fn test_register_unknown_shard_keeps_prior_mapping() {
        let table = table(Arc::new(MemoryConnector::new()));
        table.register("tenant1".into(), "shardA".into()).await.unwrap();

        let err = table
            .register("tenant1".into(), "shardZ".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownShard(_)));
        assert_eq!(table.shard_for(&"tenant1".into()), Some("shardA".into()));
    }

    #[tokio::test]
    async fn test_register_unreachable_shard_keeps_prior_mapping() {
        let connector = Arc::new(MemoryConnector::new());
        connector.set_unreachable("shardB", true);
        let table = table(connector);
        table.register("tenant1".into(), "shardA".into()).await.unwrap();

        let err = table
            .register("tenant1".into(), "shardB".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(table.shard_for(&"tenant1".into()), Some("shardA".into()));
    }

    #[tokio::test]
    async fn test_replace_is_visible_immediately() {
        let table = table(Arc::new(MemoryConnector::new()));
        table.register("tenant1".into(), "shardA".into()).await.unwrap();
        let previous = table.register("tenant1".into(), "shardB".into()).await.unwrap();
        assert_eq!(previous, Some("shardA".into()));

        let conn = table.resolve(&"tenant1".into()).await.unwrap();
        assert_eq!(conn.shard_name().as_str(), "shardB");
    }

    #[tokio::test]
    async fn test_switch_requires_expected_source() {
        let table = table(Arc::new(MemoryConnector::new()));
        table.register("tenant1".into(), "shardA".into()).await.unwrap();

        let err = table
            .switch(&"tenant1".into(), &"shardB".into(), "shardA".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Input(_)));

        table
            .switch(&"tenant1".into(), &"shardA".into(), "shardB".into())
            .await
            .unwrap();
        assert_eq!(table.shard_for(&"tenant1".into()), Some("shardB".into()));

        let err = table
            .switch(&"ghost".into(), &"shardA".into(), "shardB".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyNotFound(_)));
    }

    #[tokio::test]
    async fn test_resolve_under_concurrent_registration() {
        let table = Arc::new(table(Arc::new(MemoryConnector::new())));
        table.register("stable".into(), "shardA".into()).await.unwrap();

        let writer = {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                for i in 0..200 {
                    let shard = if i % 2 == 0 { "shardA" } else { "shardB" };
                    table.register(format!("k{}", i % 10).into(), shard.into()).await.unwrap();
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let table = Arc::clone(&table);
            readers.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let conn = table.resolve(&"stable".into()).await.unwrap();
                    assert_eq!(conn.shard_name().as_str(), "shardA");
                    tokio::task::yield_now().await;
                }
            }));
        }

        writer.await.unwrap();
        for r in readers {
            r.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_routes_snapshot_sorted() {
        let table = table(Arc::new(MemoryConnector::new()));
        table.register("b".into(), "shardB".into()).await.unwrap();
        table.register("a".into(), "shardA".into()).await.unwrap();

        let expected: Vec<(RoutingKey, ShardName)> = vec![
            ("a".into(), "shardA".into()),
            ("b".into(), "shardB".into()),
        ];
        assert_eq!(table.routes(), expected);
        assert_eq!(table.len(), 2);
    }
}
