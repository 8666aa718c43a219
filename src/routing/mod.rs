//! Routing of keys to shards.
//!
//! - [`ConnectionRegistry`]: one cached connection per configured shard
//! - [`RoutingTable`]: routing key to shard entry, sharing the registry's
//!   connections
//! - [`HealthProber`]: periodic liveness checks of the cached connections
//!
//! # Lock order
//!
//! The routing table never holds its entry lock while calling into the
//! registry; connections are resolved first and installed afterwards. The
//! registry's build lock is an async mutex held across connector calls, and
//! its connection map lock is never held across an `.await`.

mod probe;
mod registry;
mod table;

pub use probe::{HealthProber, ProbeResult};
pub use registry::ConnectionRegistry;
pub use table::RoutingTable;
