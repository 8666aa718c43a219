//! Periodic liveness probing of open shard connections.
//!
//! Every interval the prober pings each cached connection in parallel, each
//! ping bounded by the probe timeout. A success resets the shard's failure
//! count. A shard whose consecutive failures exceed the configured tolerance
//! is reported as [`FatalError::ShardUnreachable`] to the prober's
//! supervision node, which stops the gateway.

use super::registry::ConnectionRegistry;
use crate::config::ProbeConfig;
use crate::error::FatalError;
use crate::metrics::GatewayMetrics;
use crate::shard::ShardConnection;
use crate::supervision::SupervisionNode;
use crate::types::ShardName;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Outcome of probing one shard.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub shard: ShardName,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub latency: Duration,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct HealthProber {
    registry: Arc<ConnectionRegistry>,
    config: ProbeConfig,
    failures: DashMap<ShardName, u32>,
    metrics: Arc<GatewayMetrics>,
}

impl HealthProber {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        config: ProbeConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            registry,
            config,
            failures: DashMap::new(),
            metrics,
        }
    }

    pub fn consecutive_failures(&self, shard: &str) -> u32 {
        self.failures.get(shard).map(|f| *f).unwrap_or(0)
    }

    /// Probe every open connection once.
    pub async fn probe_once(&self) -> Vec<ProbeResult> {
        let connections = self.registry.connections();
        let timeout = self.config.timeout;

        let probes = connections
            .into_iter()
            .map(|conn| async move { Self::probe_connection(&conn, timeout).await });
        let outcomes = futures::future::join_all(probes).await;

        outcomes
            .into_iter()
            .map(|(shard, latency, outcome)| self.record(shard, latency, outcome))
            .collect()
    }

    async fn probe_connection(
        conn: &ShardConnection,
        timeout: Duration,
    ) -> (ShardName, Duration, Result<(), String>) {
        let start = Instant::now();
        let outcome = match tokio::time::timeout(timeout, conn.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("probe timed out after {:?}", timeout)),
        };
        (conn.shard_name().clone(), start.elapsed(), outcome)
    }

    fn record(
        &self,
        shard: ShardName,
        latency: Duration,
        outcome: Result<(), String>,
    ) -> ProbeResult {
        self.metrics.record_probe(outcome.is_ok());

        match outcome {
            Ok(()) => {
                if let Some((_, previous)) = self.failures.remove(&shard) {
                    info!(shard = %shard, previous_failures = previous, "Shard probe recovered");
                }
                ProbeResult {
                    shard,
                    healthy: true,
                    consecutive_failures: 0,
                    latency,
                    error: None,
                }
            }
            Err(error) => {
                let failures = {
                    let mut count = self.failures.entry(shard.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                warn!(
                    shard = %shard,
                    failures,
                    threshold = self.config.failure_threshold,
                    error = %error,
                    "Shard probe failed"
                );
                ProbeResult {
                    shard,
                    healthy: false,
                    consecutive_failures: failures,
                    latency,
                    error: Some(error),
                }
            }
        }
    }

    /// The first result past the failure tolerance, as a fatal cause.
    fn fatal_cause(&self, results: &[ProbeResult]) -> Option<FatalError> {
        results
            .iter()
            .find(|r| r.consecutive_failures > self.config.failure_threshold)
            .map(|r| FatalError::ShardUnreachable {
                shard: r.shard.clone(),
                failures: r.consecutive_failures,
                reason: r.error.clone().unwrap_or_default(),
            })
    }

    /// Probe until cancelled or until a shard exceeds the failure tolerance.
    pub async fn run(self: Arc<Self>, node: SupervisionNode) -> Result<(), FatalError> {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            threshold = self.config.failure_threshold,
            "Health prober started"
        );

        loop {
            tokio::select! {
                _ = node.cancelled() => {
                    debug!("Health prober stopping");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            let results = self.probe_once().await;
            if let Some(cause) = self.fatal_cause(&results) {
                return Err(cause);
            }
        }
    }
}
