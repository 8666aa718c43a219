//! Physical shard access.
//!
//! The gateway talks to shards only through the [`ShardDriver`] trait. A
//! driver is wrapped in a [`ShardConnection`], which is what the routing table
//! hands out and what the connection registry caches.
//!
//! Two drivers ship with the crate:
//! - [`SqliteShard`]: a SQLite database file
//! - [`MemoryShard`]: an in-process shard for tests and demos
//!
//! # Partition scope
//!
//! Migration copies one routing key's partition, not the whole shard. A
//! driver decides what belongs to a key; for SQLite it is every row of every
//! table that has the configured partition column, filtered by that column.

mod memory;
mod partition;
mod sqlite;

pub use memory::{MemoryConnector, MemoryShard};
pub use partition::{PartitionDigest, PartitionDump, TableDigest, TableDump};
pub use sqlite::SqliteShard;

use crate::config::{ShardBackend, ShardConfig};
use crate::error::{ConnectionError, Result};
use crate::types::{ExecOutcome, RoutingKey, RowSet, ShardName};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Driver for one physical shard.
///
/// Statement failures are returned as [`crate::Error::Query`] carrying the
/// engine's message unchanged. Reachability failures are
/// [`crate::Error::Connection`].
#[async_trait]
pub trait ShardDriver: Send + Sync + fmt::Debug {
    /// Run a statement that returns rows.
    async fn query(&self, sql: &str) -> Result<RowSet>;

    /// Run a statement that modifies data.
    async fn exec(&self, sql: &str) -> Result<ExecOutcome>;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<()>;

    /// Read the schema objects and rows owned by `key`.
    async fn export_partition(&self, key: &RoutingKey) -> Result<PartitionDump>;

    /// Replace whatever this shard holds for the dump's key with the dump.
    async fn import_partition(&self, dump: &PartitionDump) -> Result<()>;

    /// Row counts and checksums for `key`'s rows.
    async fn partition_digest(&self, key: &RoutingKey) -> Result<PartitionDigest>;

    /// Release driver resources.
    async fn close(&self) {}
}

/// Builds drivers for configured shards.
#[async_trait]
pub trait ShardConnector: Send + Sync + fmt::Debug {
    /// Open a driver. Failure means the shard is unreachable.
    async fn connect(&self, config: &ShardConfig) -> Result<Arc<dyn ShardDriver>>;
}

/// Connector that opens drivers according to each shard's backend.
#[derive(Debug, Default)]
pub struct BackendConnector;

#[async_trait]
impl ShardConnector for BackendConnector {
    async fn connect(&self, config: &ShardConfig) -> Result<Arc<dyn ShardDriver>> {
        match &config.backend {
            ShardBackend::Sqlite {
                path,
                partition_column,
            } => {
                let shard =
                    SqliteShard::open(config.name.clone(), path.clone(), partition_column.clone())
                        .await?;
                Ok(Arc::new(shard))
            }
            ShardBackend::Memory => Ok(Arc::new(MemoryShard::new(config.name.clone()))),
        }
    }
}

/// A live handle to one physical shard.
///
/// Shared by every routing key mapped to the shard. Once closed it refuses
/// all further work.
#[derive(Debug)]
pub struct ShardConnection {
    name: ShardName,
    driver: Arc<dyn ShardDriver>,
    closed: AtomicBool,
    opened_at: Instant,
}

impl ShardConnection {
    pub fn new(name: ShardName, driver: Arc<dyn ShardDriver>) -> Self {
        Self {
            name,
            driver,
            closed: AtomicBool::new(false),
            opened_at: Instant::now(),
        }
    }

    /// Name of the shard this connection is bound to.
    pub fn shard_name(&self) -> &ShardName {
        &self.name
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ConnectionError::Closed(self.name.clone()).into());
        }
        Ok(())
    }

    pub async fn query(&self, sql: &str) -> Result<RowSet> {
        self.ensure_open()?;
        self.driver.query(sql).await
    }

    pub async fn exec(&self, sql: &str) -> Result<ExecOutcome> {
        self.ensure_open()?;
        self.driver.exec(sql).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.ensure_open()?;
        self.driver.ping().await
    }

    pub async fn export_partition(&self, key: &RoutingKey) -> Result<PartitionDump> {
        self.ensure_open()?;
        self.driver.export_partition(key).await
    }

    pub async fn import_partition(&self, dump: &PartitionDump) -> Result<()> {
        self.ensure_open()?;
        self.driver.import_partition(dump).await
    }

    pub async fn partition_digest(&self, key: &RoutingKey) -> Result<PartitionDigest> {
        self.ensure_open()?;
        self.driver.partition_digest(key).await
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.driver.close().await;
            tracing::debug!(shard = %self.name, "Shard connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_closed_connection_refuses_work() {
        let conn = ShardConnection::new("a".into(), Arc::new(MemoryShard::new("a".into())));
        assert!(conn.query("SELECT 1").await.is_ok());

        conn.close().await;
        conn.close().await;

        assert!(conn.is_closed());
        assert!(matches!(
            conn.query("SELECT 1").await,
            Err(Error::Connection(ConnectionError::Closed(_)))
        ));
        assert!(conn.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_backend_connector_memory() {
        let driver = BackendConnector
            .connect(&ShardConfig::memory("m"))
            .await
            .unwrap();
        assert!(driver.ping().await.is_ok());
    }
}
