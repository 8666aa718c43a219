//! In-process shard driver.
//!
//! Does not interpret SQL. Queries answer with one row naming the shard and
//! echoing the statement, execs are recorded, and partitions are stored as
//! dumps. Failure knobs let tests make the shard unreachable, reject
//! statements, slow queries down, drop exec capabilities, or corrupt imports.

use super::{PartitionDigest, PartitionDump, ShardConnector, ShardDriver};
use crate::config::ShardConfig;
use crate::error::{ConnectionError, Error, Result};
use crate::types::{ExecOutcome, RoutingKey, RowSet, ShardName, Value};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub struct MemoryShard {
    name: ShardName,
    partitions: RwLock<HashMap<RoutingKey, PartitionDump>>,
    executed: Mutex<Vec<String>>,
    rejected_sql: RwLock<HashSet<String>>,
    query_delay: Mutex<Option<Duration>>,
    reachable: AtomicBool,
    reports_rows_affected: AtomicBool,
    reports_last_insert_id: AtomicBool,
    corrupt_imports: AtomicBool,
    queries: AtomicU64,
    last_insert_id: AtomicI64,
}

impl MemoryShard {
    pub fn new(name: ShardName) -> Self {
        Self {
            name,
            partitions: RwLock::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            rejected_sql: RwLock::new(HashSet::new()),
            query_delay: Mutex::new(None),
            reachable: AtomicBool::new(true),
            reports_rows_affected: AtomicBool::new(true),
            reports_last_insert_id: AtomicBool::new(true),
            corrupt_imports: AtomicBool::new(false),
            queries: AtomicU64::new(0),
            last_insert_id: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &ShardName {
        &self.name
    }

    /// Make pings and statements fail as if the shard went away.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make the shard reject `sql` with a query error.
    pub fn reject_sql(&self, sql: impl Into<String>) {
        self.rejected_sql.write().insert(sql.into());
    }

    /// Delay every query, exec and ping.
    pub fn set_query_delay(&self, delay: Option<Duration>) {
        *self.query_delay.lock() = delay;
    }

    /// Control which exec results the shard can report.
    pub fn set_exec_capabilities(&self, rows_affected: bool, last_insert_id: bool) {
        self.reports_rows_affected.store(rows_affected, Ordering::SeqCst);
        self.reports_last_insert_id.store(last_insert_id, Ordering::SeqCst);
    }

    /// Drop the last row of every imported table, so verification fails.
    pub fn set_corrupt_imports(&self, corrupt: bool) {
        self.corrupt_imports.store(corrupt, Ordering::SeqCst);
    }

    /// Store a partition directly.
    pub fn seed_partition(&self, dump: PartitionDump) {
        self.partitions.write().insert(dump.key.clone(), dump);
    }

    pub fn partition(&self, key: &RoutingKey) -> Option<PartitionDump> {
        self.partitions.read().get(key).cloned()
    }

    pub fn executed_statements(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    /// Number of queries and execs that reached the shard.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ConnectionError::Unreachable {
                shard: self.name.clone(),
                reason: "memory shard marked unreachable".to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn run_statement(&self, sql: &str) -> Result<()> {
        self.check_reachable()?;

        let delay = *self.query_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.queries.fetch_add(1, Ordering::SeqCst);

        if self.rejected_sql.read().contains(sql) {
            return Err(Error::Query(format!("syntax error near \"{}\"", sql)));
        }
        Ok(())
    }
}

#[async_trait]
impl ShardDriver for MemoryShard {
    async fn query(&self, sql: &str) -> Result<RowSet> {
        self.run_statement(sql).await?;
        Ok(RowSet::new(
            vec!["shard".to_string(), "sql".to_string()],
            vec![vec![Value::from(self.name.as_str()), Value::from(sql)]],
        ))
    }

    async fn exec(&self, sql: &str) -> Result<ExecOutcome> {
        self.run_statement(sql).await?;
        self.executed.lock().push(sql.to_string());

        let id = self.last_insert_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ExecOutcome {
            rows_affected: self.reports_rows_affected.load(Ordering::SeqCst).then_some(1),
            last_insert_id: self.reports_last_insert_id.load(Ordering::SeqCst).then_some(id),
        })
    }

    async fn ping(&self) -> Result<()> {
        self.check_reachable()?;

        let delay = *self.query_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn export_partition(&self, key: &RoutingKey) -> Result<PartitionDump> {
        self.check_reachable()?;
        Ok(self
            .partition(key)
            .unwrap_or_else(|| PartitionDump::new(key.clone())))
    }

    async fn import_partition(&self, dump: &PartitionDump) -> Result<()> {
        self.check_reachable()?;

        let mut dump = dump.clone();
        if self.corrupt_imports.load(Ordering::SeqCst) {
            for table in &mut dump.tables {
                table.rows.pop();
            }
        }
        self.seed_partition(dump);
        Ok(())
    }

    async fn partition_digest(&self, key: &RoutingKey) -> Result<PartitionDigest> {
        self.check_reachable()?;
        Ok(self
            .partition(key)
            .map(|dump| dump.digest())
            .unwrap_or_default())
    }
}

/// Connector that hands out shared [`MemoryShard`]s, one per shard name.
///
/// Tests keep the connector to reach the shards the gateway is using.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    shards: DashMap<ShardName, Arc<MemoryShard>>,
    unreachable: RwLock<HashSet<ShardName>>,
    connects: AtomicU64,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shard for `name`, created on first use.
    pub fn shard(&self, name: &str) -> Arc<MemoryShard> {
        self.shards
            .entry(ShardName::new(name))
            .or_insert_with(|| Arc::new(MemoryShard::new(ShardName::new(name))))
            .clone()
    }

    /// Make connection attempts to `name` fail.
    pub fn set_unreachable(&self, name: &str, unreachable: bool) {
        let mut set = self.unreachable.write();
        if unreachable {
            set.insert(ShardName::new(name));
        } else {
            set.remove(name);
        }
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShardConnector for MemoryConnector {
    async fn connect(&self, config: &ShardConfig) -> Result<Arc<dyn ShardDriver>> {
        // Yield so concurrent connects can interleave in tests.
        tokio::task::yield_now().await;

        if self.unreachable.read().contains(&config.name) {
            return Err(ConnectionError::Unreachable {
                shard: config.name.clone(),
                reason: "connection refused".to_string(),
            }
            .into());
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.shard(config.name.as_str()))
    }
}
