//! Cache of live shard connections, one per configured shard name.

use crate::config::ShardConfig;
use crate::error::{ConnectionError, Error, Result};
use crate::shard::{ShardConnection, ShardConnector};
use crate::types::ShardName;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Builds and caches shard connections.
///
/// # Locking
///
/// Lookups take a read lock on `connections` only. Builds are serialized by
/// `build_lock` (an async mutex, since connecting awaits) and re-check the
/// cache after acquiring it, so concurrent first references build once. A
/// connection is inserted only after a successful build; a failed build
/// leaves nothing behind.
///
/// After [`close_all`](Self::close_all) the registry refuses to build new
/// connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    /// Configured shards by name. Fixed for the registry's lifetime.
    configs: HashMap<ShardName, ShardConfig>,

    connector: Arc<dyn ShardConnector>,

    connections: RwLock<HashMap<ShardName, Arc<ShardConnection>>>,

    build_lock: tokio::sync::Mutex<()>,

    closed: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new(shards: Vec<ShardConfig>, connector: Arc<dyn ShardConnector>) -> Self {
        let configs = shards.into_iter().map(|s| (s.name.clone(), s)).collect();
        Self {
            configs,
            connector,
            connections: RwLock::new(HashMap::new()),
            build_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether `name` is a configured shard.
    pub fn is_configured(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }

    /// Names of all configured shards.
    pub fn shard_names(&self) -> Vec<ShardName> {
        let mut names: Vec<ShardName> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    /// The cached connection for `name`, if built and still open.
    pub fn get(&self, name: &str) -> Option<Arc<ShardConnection>> {
        self.connections
            .read()
            .get(name)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Get the cached connection for `name`, building it if absent.
    pub async fn connect(&self, name: &ShardName) -> Result<Arc<ShardConnection>> {
        if let Some(conn) = self.get(name.as_str()) {
            return Ok(conn);
        }

        let config = self
            .configs
            .get(name)
            .ok_or_else(|| Error::UnknownShard(name.clone()))?;

        let _guard = self.build_lock.lock().await;

        // Another task may have finished the build while we waited.
        if let Some(conn) = self.get(name.as_str()) {
            return Ok(conn);
        }

        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed(name.clone()).into());
        }

        let driver = match self.connector.connect(config).await {
            Ok(driver) => driver,
            Err(e) => {
                warn!(shard = %name, error = %e, "Failed to build shard connection");
                return Err(e);
            }
        };

        let conn = Arc::new(ShardConnection::new(name.clone(), driver));
        self.connections.write().insert(name.clone(), Arc::clone(&conn));
        info!(shard = %name, "Shard connection established");

        Ok(conn)
    }

    /// All cached open connections.
    pub fn connections(&self) -> Vec<Arc<ShardConnection>> {
        self.connections
            .read()
            .values()
            .filter(|c| !c.is_closed())
            .cloned()
            .collect()
    }

    /// Close and drop every cached connection. Called on gateway shutdown.
    pub async fn close_all(&self) {
        // Under the build lock so no build lands after the drain.
        let _guard = self.build_lock.lock().await;
        self.closed.store(true, Ordering::Release);

        let drained: Vec<Arc<ShardConnection>> = {
            let mut guard = self.connections.write();
            guard.drain().map(|(_, c)| c).collect()
        };

        for conn in &drained {
            conn.close().await;
        }

        info!(closed = drained.len(), "Closed shard connections");
    }
}
