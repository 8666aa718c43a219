//! Configuration types for the gateway.

use crate::error::{Error, Result};
use crate::types::ShardName;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default RPC listening port.
pub const DEFAULT_PORT: u16 = 15501;

/// Default column that scopes a table's rows to a routing key.
pub const DEFAULT_PARTITION_COLUMN: &str = "routing_key";

/// Main configuration for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the RPC listener binds to.
    pub listen_addr: SocketAddr,

    /// Physical shards the gateway may route to.
    pub shards: Vec<ShardConfig>,

    /// Background health probing.
    pub probe: ProbeConfig,

    /// Migration behavior.
    pub migration: MigrationConfig,

    /// How long in-flight requests get to finish during shutdown.
    pub shutdown_grace: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            shards: Vec::new(),
            probe: ProbeConfig::default(),
            migration: MigrationConfig::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl GatewayConfig {
    /// Create a configuration listening on the given address.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Add a shard.
    pub fn with_shard(mut self, shard: ShardConfig) -> Self {
        self.shards.push(shard);
        self
    }

    /// Replace the shard list.
    pub fn with_shards(mut self, shards: Vec<ShardConfig>) -> Self {
        self.shards = shards;
        self
    }

    /// Set probe configuration.
    pub fn with_probe_config(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    /// Set migration configuration.
    pub fn with_migration_config(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Look up a shard by name.
    pub fn shard(&self, name: &str) -> Option<&ShardConfig> {
        self.shards.iter().find(|s| s.name.as_str() == name)
    }

    /// Check the configuration for mistakes that would only show up at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(Error::Config("at least one shard must be configured".into()));
        }

        let mut seen = HashSet::new();
        for shard in &self.shards {
            if shard.name.as_str().is_empty() {
                return Err(Error::Config("shard name must not be empty".into()));
            }
            if !seen.insert(shard.name.clone()) {
                return Err(Error::Config(format!("duplicate shard name: {}", shard.name)));
            }
        }

        if self.probe.interval.is_zero() {
            return Err(Error::Config("probe interval must be non-zero".into()));
        }
        if self.probe.failure_threshold == 0 {
            return Err(Error::Config("probe failure threshold must be at least 1".into()));
        }

        Ok(())
    }

    /// Parse a TOML configuration document.
    ///
    /// ```toml
    /// listen_addr = "0.0.0.0:15501"
    /// shutdown_grace_ms = 10000
    ///
    /// [probe]
    /// interval_ms = 5000
    ///
    /// [[shards]]
    /// name = "shardA"
    /// kind = "sqlite"
    /// path = "/var/lib/shardgate/a.db"
    /// ```
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(s)?;
        let config = file.into_config()?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }
}

/// Configuration for one physical shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardConfig {
    /// Name used in routing registrations.
    pub name: ShardName,

    /// How to reach the shard.
    pub backend: ShardBackend,
}

impl ShardConfig {
    /// A SQLite-backed shard using the default partition column.
    pub fn sqlite(name: impl Into<ShardName>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            backend: ShardBackend::Sqlite {
                path: path.into(),
                partition_column: DEFAULT_PARTITION_COLUMN.to_string(),
            },
        }
    }

    /// An in-process memory shard.
    pub fn memory(name: impl Into<ShardName>) -> Self {
        Self {
            name: name.into(),
            backend: ShardBackend::Memory,
        }
    }
}

/// Backend kind of a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardBackend {
    /// A SQLite database file. Tables holding a `partition_column` are
    /// partitioned by routing key.
    Sqlite {
        path: PathBuf,
        partition_column: String,
    },

    /// An in-process shard, for tests and demos.
    Memory,
}

/// Health probe configuration.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Time between probe rounds.
    pub interval: Duration,

    /// Per-probe timeout.
    pub timeout: Duration,

    /// Consecutive failures tolerated before the gateway stops.
    pub failure_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_millis(2000),
            failure_threshold: 3,
        }
    }
}

impl ProbeConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }
}

/// Migration configuration.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Upper bound on the drain wait before cutover. `None` waits forever.
    pub drain_timeout: Option<Duration>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl MigrationConfig {
    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

// On-disk shape of the configuration file. Durations are in milliseconds.

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen_addr: Option<String>,
    shutdown_grace_ms: Option<u64>,
    #[serde(default)]
    probe: FileProbeConfig,
    #[serde(default)]
    migration: FileMigrationConfig,
    #[serde(default)]
    shards: Vec<FileShardConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileProbeConfig {
    interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
    failure_threshold: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileMigrationConfig {
    /// 0 disables the drain timeout.
    drain_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
enum FileShardConfig {
    Sqlite {
        name: String,
        path: PathBuf,
        partition_column: Option<String>,
    },
    Memory {
        name: String,
    },
}

impl FileConfig {
    fn into_config(self) -> Result<GatewayConfig> {
        let mut config = GatewayConfig::default();

        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr
                .parse()
                .map_err(|e| Error::Config(format!("invalid listen_addr {}: {}", addr, e)))?;
        }
        if let Some(ms) = self.shutdown_grace_ms {
            config.shutdown_grace = Duration::from_millis(ms);
        }

        if let Some(ms) = self.probe.interval_ms {
            config.probe.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.probe.timeout_ms {
            config.probe.timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.probe.failure_threshold {
            config.probe.failure_threshold = n;
        }

        if let Some(ms) = self.migration.drain_timeout_ms {
            config.migration.drain_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        config.shards = self
            .shards
            .into_iter()
            .map(|s| match s {
                FileShardConfig::Sqlite {
                    name,
                    path,
                    partition_column,
                } => ShardConfig {
                    name: ShardName::new(name),
                    backend: ShardBackend::Sqlite {
                        path,
                        partition_column: partition_column
                            .unwrap_or_else(|| DEFAULT_PARTITION_COLUMN.to_string()),
                    },
                },
                FileShardConfig::Memory { name } => ShardConfig::memory(name),
            })
            .collect();

        Ok(config)
    }
}
