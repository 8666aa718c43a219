//! Test fixtures and end-to-end scenarios for the gateway.
//!
//! Fixtures build gateways over [`MemoryConnector`] shards, so tests can
//! reach into the shards the gateway uses and flip their failure knobs.

mod gateway_tests;

use crate::config::{GatewayConfig, ShardConfig};
use crate::gateway::Gateway;
use crate::shard::{MemoryConnector, PartitionDump, TableDump};
use crate::types::{RoutingKey, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

/// Configuration with one memory shard per name, listening on an
/// OS-assigned local port.
pub fn memory_config(shards: &[&str]) -> GatewayConfig {
    let mut config = GatewayConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
    for name in shards {
        config = config.with_shard(ShardConfig::memory(*name));
    }
    config
}

/// Gateway over memory shards, plus the connector that owns them.
pub fn memory_gateway(config: GatewayConfig) -> (Arc<Gateway>, Arc<MemoryConnector>) {
    let connector = Arc::new(MemoryConnector::new());
    let gateway = Gateway::with_connector(config, connector.clone())
        .expect("test configuration must be valid");
    (Arc::new(gateway), connector)
}

/// An `orders` partition for `key` with `rows` rows.
pub fn orders_partition(key: &str, rows: i64) -> PartitionDump {
    let table = TableDump::new(
        "orders",
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, routing_key TEXT, item TEXT)",
        vec!["id".into(), "routing_key".into(), "item".into()],
    )
    .with_rows(
        (1..=rows)
            .map(|id| vec![Value::from(id), Value::from(key), Value::from(format!("item-{}", id))])
            .collect(),
    );
    PartitionDump::new(RoutingKey::new(key)).with_table(table)
}

/// Bind a listener on an OS-assigned local port.
pub async fn local_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
