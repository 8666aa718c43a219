//! Prometheus-style metrics for the gateway.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       GatewayMetrics                          │
//! │  ┌──────────────┐  ┌───────────────┐  ┌───────────────────┐  │
//! │  │  Counters    │  │   Gauges      │  │   Histograms      │  │
//! │  │ - queries    │  │ - routes      │  │ - request latency │  │
//! │  │ - execs      │  │ - in flight   │  │ - migration time  │  │
//! │  │ - migrations │  │ - migrations  │  │                   │  │
//! │  │ - probes     │  │   active      │  │                   │  │
//! │  └──────────────┘  └───────────────┘  └───────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;
pub use histograms::{
    Histogram, HistogramSnapshot, HistogramTimer, MIGRATION_DURATION_BUCKETS,
    REQUEST_LATENCY_BUCKETS,
};

use std::fmt::Write as _;
use std::time::Duration;

/// Request kind, for recording outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Query,
    Exec,
}

#[derive(Debug)]
pub struct GatewayMetrics {
    pub queries_total: Counter,
    pub queries_failed: Counter,
    pub execs_total: Counter,
    pub execs_failed: Counter,
    /// Operations refused before routing (empty key).
    pub requests_rejected: Counter,
    /// Requests that reached a shard, by shard name.
    pub shard_requests: LabeledCounter,
    /// RPC requests received, by operation.
    pub rpc_requests: LabeledCounter,
    pub request_latency: Histogram,

    pub routes: Gauge,
    pub in_flight: Gauge,

    pub migrations_started: Counter,
    pub migrations_completed: Counter,
    pub migrations_failed: Counter,
    pub migrations_active: Gauge,
    pub migration_rows_copied: Counter,
    pub migration_duration: Histogram,

    pub probes_total: Counter,
    pub probe_failures: Counter,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            queries_total: Counter::new("gateway_queries_total", "Total queries"),
            queries_failed: Counter::new("gateway_queries_failed", "Failed queries"),
            execs_total: Counter::new("gateway_execs_total", "Total execs"),
            execs_failed: Counter::new("gateway_execs_failed", "Failed execs"),
            requests_rejected: Counter::new(
                "gateway_requests_rejected",
                "Requests rejected before routing",
            ),
            shard_requests: LabeledCounter::new(
                "gateway_shard_requests",
                "Requests forwarded to each shard",
                "shard",
            ),
            rpc_requests: LabeledCounter::new(
                "gateway_rpc_requests",
                "RPC requests received per operation",
                "operation",
            ),
            request_latency: Histogram::new(
                "gateway_request_latency_seconds",
                "Query and exec latency",
            ),
            routes: Gauge::new("gateway_routes", "Registered routing keys"),
            in_flight: Gauge::new("gateway_in_flight", "Admitted requests still running"),
            migrations_started: Counter::new("gateway_migrations_started", "Migrations started"),
            migrations_completed: Counter::new(
                "gateway_migrations_completed",
                "Migrations completed",
            ),
            migrations_failed: Counter::new("gateway_migrations_failed", "Migrations failed"),
            migrations_active: Gauge::new("gateway_migrations_active", "Migrations running"),
            migration_rows_copied: Counter::new(
                "gateway_migration_rows_copied",
                "Rows copied by migrations",
            ),
            migration_duration: Histogram::with_buckets(
                "gateway_migration_duration_seconds",
                "Migration duration",
                MIGRATION_DURATION_BUCKETS.to_vec(),
            ),
            probes_total: Counter::new("gateway_probes_total", "Shard liveness probes"),
            probe_failures: Counter::new("gateway_probe_failures", "Failed shard probes"),
        }
    }

    /// Record the outcome of a query or exec that was routed to `shard`.
    pub fn record_request(&self, kind: RequestKind, shard: &str, success: bool) {
        let (total, failed) = match kind {
            RequestKind::Query => (&self.queries_total, &self.queries_failed),
            RequestKind::Exec => (&self.execs_total, &self.execs_failed),
        };
        total.inc();
        if !success {
            failed.inc();
        }
        self.shard_requests.inc(shard);
    }

    /// Record a request that failed before reaching a shard.
    pub fn record_unrouted(&self, kind: RequestKind) {
        match kind {
            RequestKind::Query => {
                self.queries_total.inc();
                self.queries_failed.inc();
            }
            RequestKind::Exec => {
                self.execs_total.inc();
                self.execs_failed.inc();
            }
        }
    }

    /// Record an RPC request by its operation name.
    pub fn record_rpc(&self, operation: &str) {
        self.rpc_requests.inc(operation);
    }

    pub fn record_migration_start(&self) {
        self.migrations_started.inc();
        self.migrations_active.inc();
    }

    pub fn record_migration_complete(&self, duration: Duration, rows: u64) {
        self.migrations_completed.inc();
        self.migrations_active.dec();
        self.migration_rows_copied.inc_by(rows);
        self.migration_duration.observe_duration(duration);
    }

    pub fn record_migration_failed(&self) {
        self.migrations_failed.inc();
        self.migrations_active.dec();
    }

    pub fn record_probe(&self, healthy: bool) {
        self.probes_total.inc();
        if !healthy {
            self.probe_failures.inc();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queries_total: self.queries_total.get(),
            queries_failed: self.queries_failed.get(),
            execs_total: self.execs_total.get(),
            execs_failed: self.execs_failed.get(),
            requests_rejected: self.requests_rejected.get(),
            routes: self.routes.get(),
            in_flight: self.in_flight.get(),
            migrations_started: self.migrations_started.get(),
            migrations_completed: self.migrations_completed.get(),
            migrations_failed: self.migrations_failed.get(),
            migrations_active: self.migrations_active.get(),
            probe_failures: self.probe_failures.get(),
            request_latency: self.request_latency.snapshot(),
        }
    }

    /// Prometheus text exposition.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        for c in [
            &self.queries_total,
            &self.queries_failed,
            &self.execs_total,
            &self.execs_failed,
            &self.requests_rejected,
            &self.migrations_started,
            &self.migrations_completed,
            &self.migrations_failed,
            &self.migration_rows_copied,
            &self.probes_total,
            &self.probe_failures,
        ] {
            c.render(&mut out);
        }
        for g in [&self.routes, &self.in_flight, &self.migrations_active] {
            g.render(&mut out);
        }
        self.shard_requests.render(&mut out);
        self.rpc_requests.render(&mut out);

        for h in [&self.request_latency, &self.migration_duration] {
            let snap = h.snapshot();
            let _ = write!(
                out,
                "# HELP {0} {1}\n# TYPE {0} histogram\n",
                h.name(),
                h.help()
            );
            for (bound, count) in snap.buckets.iter().zip(&snap.bucket_counts) {
                let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", h.name(), bound, count);
            }
            let _ = write!(
                out,
                "{0}_bucket{{le=\"+Inf\"}} {1}\n{0}_sum {2}\n{0}_count {1}\n",
                h.name(),
                snap.count,
                snap.sum
            );
        }

        out
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub queries_total: u64,
    pub queries_failed: u64,
    pub execs_total: u64,
    pub execs_failed: u64,
    pub requests_rejected: u64,
    pub routes: i64,
    pub in_flight: i64,
    pub migrations_started: u64,
    pub migrations_completed: u64,
    pub migrations_failed: u64,
    pub migrations_active: i64,
    pub probe_failures: u64,
    pub request_latency: HistogramSnapshot,
}

impl MetricsSnapshot {
    /// Fraction of queries and execs that failed.
    pub fn error_rate(&self) -> f64 {
        let total = self.queries_total + self.execs_total;
        if total == 0 {
            0.0
        } else {
            (self.queries_failed + self.execs_failed) as f64 / total as f64
        }
    }
}
