//! Sharding gateway for keyed SQL traffic.
//!
//! Clients send statements tagged with a routing key. The gateway maps each
//! key to one physical shard, forwards the statement over a cached shard
//! connection, and returns the shard's result unchanged. A key can be moved
//! to another shard while traffic is running: its partition is copied and
//! verified, new requests are held at a gate while in-flight ones drain, and
//! the route is switched before the gate reopens.
//!
//! # Example
//!
//! ```rust,no_run
//! use shardgate::{Gateway, GatewayConfig, ShardConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::new("127.0.0.1:15501".parse()?)
//!         .with_shard(ShardConfig::sqlite("shardA", "/var/lib/shardgate/a.db"))
//!         .with_shard(ShardConfig::sqlite("shardB", "/var/lib/shardgate/b.db"));
//!
//!     let gateway = Gateway::new(config)?;
//!     gateway.register_key("tenant1", "shardA").await?;
//!
//!     let rows = gateway.query("tenant1", "SELECT * FROM orders").await?;
//!     println!("{} rows", rows.len());
//!
//!     // Move tenant1 while traffic keeps flowing.
//!     gateway.migrate_shard("tenant1", "shardB").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │      NetworkServer (framed bincode RPC)      │
//! └──────────────────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────┐
//! │                  Gateway                     │
//! │  • query / exec          (through the gate)  │
//! │  • register / remove     (route changes)     │
//! │  • migrate_shard         (copy + cutover)    │
//! └──────────────────────────────────────────────┘
//!        │               │                 │
//!        ▼               ▼                 ▼
//! ┌────────────┐  ┌──────────────┐  ┌─────────────┐
//! │ Quiesce    │  │ RoutingTable │  │ Migration   │
//! │ Gate       │  │ + Registry   │  │ Orchestrator│
//! └────────────┘  └──────────────┘  └─────────────┘
//!                        │
//!                        ▼
//!               ShardDriver (SQLite, memory)
//! ```
//!
//! The listener and the health prober run under a supervision tree; the
//! first fatal failure stops the gateway.

pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod migration;
pub mod network;
pub mod quiesce;
pub mod routing;
pub mod shard;
pub mod supervision;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{GatewayConfig, MigrationConfig, ProbeConfig, ShardBackend, ShardConfig};
pub use error::{ConnectionError, Error, FatalError, MigrationError, NetworkError, Result};
pub use gateway::Gateway;
pub use types::{ExecOutcome, RoutingKey, RowSet, ShardName, Value, EXEC_UNSUPPORTED_SENTINEL};

pub use metrics::{
    Counter, Gauge, GatewayMetrics, Histogram, HistogramSnapshot, HistogramTimer, LabeledCounter,
    MetricsSnapshot, MIGRATION_DURATION_BUCKETS, REQUEST_LATENCY_BUCKETS,
};

pub use migration::{
    Cutover, MigrationJob, MigrationOrchestrator, MigrationPhase, MigrationRecord,
    MigrationReport, MigrationStatus,
};

pub use network::{GatewayClient, GatewayRequest, GatewayResponse, NetworkServer};
pub use quiesce::{AdmissionPermit, ClosedGate, QuiesceGate};
pub use routing::{ConnectionRegistry, HealthProber, ProbeResult, RoutingTable};
pub use shard::{
    BackendConnector, MemoryConnector, MemoryShard, ShardConnection, ShardConnector, ShardDriver,
    SqliteShard,
};
pub use supervision::{SupervisionNode, SupervisorRoot};
