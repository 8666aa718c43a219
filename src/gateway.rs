//! The gateway: client operations, migrations and the serve loop.
//!
//! ```text
//!   clients ──► NetworkServer ──► Gateway ──► QuiesceGate (admit)
//!                                    │
//!                                    ├──► RoutingTable ──► ConnectionRegistry ──► shards
//!                                    │
//!                                    └──► MigrationOrchestrator (copy, verify, cutover)
//! ```
//!
//! `serve` runs the listener and the health prober under a supervision tree.
//! The first fatal failure in either stops the gateway: the listener stops
//! accepting, in-flight requests get `shutdown_grace` to finish, shard
//! connections are closed, and `serve` returns the cause.

use crate::config::GatewayConfig;
use crate::error::{Error, FatalError, Result};
use crate::metrics::{GatewayMetrics, MetricsSnapshot, RequestKind};
use crate::migration::{Cutover, MigrationJob, MigrationOrchestrator, MigrationReport};
use crate::network::{
    GatewayRequest, GatewayResponse, NetworkServer, RequestHandler, SimpleResult,
};
use crate::quiesce::QuiesceGate;
use crate::routing::{ConnectionRegistry, HealthProber, RoutingTable};
use crate::shard::{BackendConnector, ShardConnection, ShardConnector};
use crate::supervision::SupervisorRoot;
use crate::types::{ExecOutcome, RoutingKey, RowSet, ShardName};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ConnectionRegistry>,
    table: RoutingTable,
    gate: QuiesceGate,
    orchestrator: MigrationOrchestrator,
    /// Serializes migrations; only one cutover may hold the gate closed.
    migration_lock: tokio::sync::Mutex<()>,
    metrics: Arc<GatewayMetrics>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Create a gateway that opens shards according to their configured
    /// backends.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(BackendConnector))
    }

    pub fn with_connector(config: GatewayConfig, connector: Arc<dyn ShardConnector>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(ConnectionRegistry::new(config.shards.clone(), connector));
        let metrics = Arc::new(GatewayMetrics::new());

        Ok(Self {
            table: RoutingTable::new(Arc::clone(&registry)),
            registry,
            gate: QuiesceGate::new(),
            orchestrator: MigrationOrchestrator::new(Arc::clone(&metrics)),
            migration_lock: tokio::sync::Mutex::new(()),
            metrics,
            shutdown: CancellationToken::new(),
            config,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &QuiesceGate {
        &self.gate
    }

    pub fn orchestrator(&self) -> &MigrationOrchestrator {
        &self.orchestrator
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Metrics with the route and in-flight gauges refreshed.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.refresh_gauges();
        self.metrics.snapshot()
    }

    /// Metrics in Prometheus text format, gauges refreshed.
    pub fn metrics_text(&self) -> String {
        self.refresh_gauges();
        self.metrics.to_prometheus()
    }

    fn refresh_gauges(&self) {
        self.metrics.routes.set(self.table.len() as i64);
        self.metrics.in_flight.set(self.gate.in_flight() as i64);
    }

    /// All routes, sorted by key.
    pub fn routes(&self) -> Vec<(RoutingKey, ShardName)> {
        self.table.routes()
    }

    pub fn shard_for(&self, key: &RoutingKey) -> Option<ShardName> {
        self.table.shard_for(key)
    }

    /// Run a row-returning statement on the shard `key` is routed to.
    ///
    /// The shard's error is returned unchanged.
    pub async fn query(&self, key: impl Into<RoutingKey>, sql: &str) -> Result<RowSet> {
        let key = key.into();
        let _permit = self.gate.admit().await;
        let _timer = self.metrics.request_latency.start_timer();

        let conn = self.route(&key, RequestKind::Query).await?;
        debug!(key = %key, shard = %conn.shard_name(), sql, "Query");

        let result = conn.query(sql).await;
        self.metrics
            .record_request(RequestKind::Query, conn.shard_name().as_str(), result.is_ok());
        if let Err(e) = &result {
            debug!(key = %key, shard = %conn.shard_name(), error = %e, "Query failed");
        }
        result
    }

    /// Run a modifying statement on the shard `key` is routed to.
    pub async fn exec(&self, key: impl Into<RoutingKey>, sql: &str) -> Result<ExecOutcome> {
        let key = key.into();
        let _permit = self.gate.admit().await;
        let _timer = self.metrics.request_latency.start_timer();

        let conn = self.route(&key, RequestKind::Exec).await?;
        debug!(key = %key, shard = %conn.shard_name(), sql, "Exec");

        let result = conn.exec(sql).await;
        self.metrics
            .record_request(RequestKind::Exec, conn.shard_name().as_str(), result.is_ok());
        if let Err(e) = &result {
            debug!(key = %key, shard = %conn.shard_name(), error = %e, "Exec failed");
        }
        result
    }

    async fn route(&self, key: &RoutingKey, kind: RequestKind) -> Result<Arc<ShardConnection>> {
        if key.is_empty() {
            self.metrics.record_unrouted(kind);
            return Err(self.reject_empty_key());
        }

        match self.table.resolve(key).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                self.metrics.record_unrouted(kind);
                Err(e)
            }
        }
    }

    /// Route `key` to `shard`, replacing any previous route.
    pub async fn register_key(
        &self,
        key: impl Into<RoutingKey>,
        shard: impl Into<ShardName>,
    ) -> Result<()> {
        let key = key.into();
        if key.is_empty() {
            return Err(self.reject_empty_key());
        }

        self.table.register(key, shard.into()).await?;
        self.metrics.routes.set(self.table.len() as i64);
        Ok(())
    }

    /// Drop the route for `key`. Removing an unknown key succeeds.
    pub async fn remove_key(&self, key: impl Into<RoutingKey>) -> Result<()> {
        let key = key.into();
        if key.is_empty() {
            return Err(self.reject_empty_key());
        }

        self.table.unregister(&key);
        self.metrics.routes.set(self.table.len() as i64);
        Ok(())
    }

    /// Move `key`'s data to `to_shard` and route it there.
    ///
    /// Requests for every key are held at the gate for the length of the
    /// cutover. On any error the route is unchanged.
    pub async fn migrate_shard(
        &self,
        key: impl Into<RoutingKey>,
        to_shard: impl Into<ShardName>,
    ) -> Result<MigrationReport> {
        let key = key.into();
        let to_shard = to_shard.into();

        if key.is_empty() {
            return Err(self.reject_empty_key());
        }
        if !self.registry.is_configured(to_shard.as_str()) {
            return Err(Error::UnknownShard(to_shard));
        }

        let _serial = self.migration_lock.lock().await;

        let source = self.table.resolve(&key).await?;
        if source.shard_name() == &to_shard {
            return Err(Error::Input(format!(
                "key {} is already on shard {}",
                key, to_shard
            )));
        }
        let dest = self.registry.connect(&to_shard).await?;

        let job = MigrationJob::new(key, source.shard_name().clone(), to_shard);
        let cutover_job = job.clone();

        self.orchestrator
            .migrate(job, &source, &dest, || {
                self.cutover(&cutover_job, &source, &dest)
            })
            .await
    }

    /// Count an operation refused for an empty key and build its error.
    fn reject_empty_key(&self) -> Error {
        self.metrics.requests_rejected.inc();
        Error::Input("key is empty".to_string())
    }

    /// Close the gate, drain, catch up, switch the route. The gate reopens
    /// when `closed` drops, on every path out of this function.
    async fn cutover(
        &self,
        job: &MigrationJob,
        source: &ShardConnection,
        dest: &ShardConnection,
    ) -> Cutover {
        let closed = self.gate.quiesce();
        let timeout = self.config.migration.drain_timeout;

        if self.gate.drain(timeout).await.is_err() {
            warn!(
                key = %job.key,
                in_flight = self.gate.in_flight(),
                "In-flight requests did not drain, aborting cutover"
            );
            return Cutover::DrainTimedOut(timeout.unwrap_or_default());
        }

        match self.orchestrator.catch_up(job, source, dest).await {
            Ok(0) => {}
            Ok(rows) => debug!(key = %job.key, rows, "Caught up before cutover"),
            Err(e) => return Cutover::Rejected(e.to_string()),
        }

        let outcome = match self
            .table
            .switch(&job.key, &job.source_shard, job.dest_shard.clone())
            .await
        {
            Ok(()) => Cutover::Switched,
            Err(e) => Cutover::Rejected(e.to_string()),
        };

        drop(closed);
        outcome
    }

    /// Ask a running [`serve`](Self::serve) to stop gracefully.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Serve on the configured listen address. A failed bind is a fatal
    /// listener failure, reported the same way as one while serving.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = self.config.listen_addr;
        self.supervise(Listen::Addr(addr)).await
    }

    /// Serve on `listener` until [`shutdown`](Self::shutdown) or a fatal
    /// failure. Returns the fatal cause, if any.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        self.supervise(Listen::Bound(listener)).await
    }

    async fn supervise(self: Arc<Self>, listen: Listen) -> Result<()> {
        let root = SupervisorRoot::new("gateway");
        info!(shards = ?self.registry.shard_names(), "Gateway starting");

        let handler: Arc<dyn RequestHandler> = self.clone();
        let mut listener_task = root.node().spawn("listener", move |node| async move {
            let listener = match listen {
                Listen::Bound(listener) => listener,
                Listen::Addr(addr) => TcpListener::bind(addr).await.map_err(|e| {
                    FatalError::ListenerFailed(format!("bind {}: {}", addr, e))
                })?,
            };
            info!(addr = ?listener.local_addr().ok(), "Listening");

            let server = NetworkServer::new(listener, handler, node.token());
            match server.run().await {
                Ok(()) if node.is_cancelled() => Ok(()),
                Ok(()) => Err(FatalError::ListenerFailed(
                    "listener stopped unexpectedly".to_string(),
                )),
                Err(e) => Err(FatalError::ListenerFailed(e.to_string())),
            }
        });

        let prober = Arc::new(HealthProber::new(
            Arc::clone(&self.registry),
            self.config.probe.clone(),
            Arc::clone(&self.metrics),
        ));
        let mut probe_task = root
            .node()
            .spawn("health-probe", move |node| prober.run(node));

        let cause = tokio::select! {
            cause = root.wait_fatal() => Some(cause),
            _ = self.shutdown.cancelled() => None,
        };

        match &cause {
            Some(cause) => error!(cause = %cause, "Fatal failure, shutting down gateway"),
            None => info!("Shutdown requested"),
        }
        root.shutdown();

        let grace = self.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            let _ = (&mut listener_task).await;
            let _ = (&mut probe_task).await;
            let _ = self.gate.drain(None).await;
        })
        .await;

        if drained.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                in_flight = self.gate.in_flight(),
                "Grace period elapsed with requests still running"
            );
            listener_task.abort();
            probe_task.abort();
        }

        self.registry.close_all().await;
        info!("Gateway stopped");

        match cause {
            Some(cause) => Err(Error::Fatal(cause)),
            None => Ok(()),
        }
    }
}


/// Where the listener task gets its socket.
enum Listen {
    Bound(TcpListener),
    Addr(SocketAddr),
}

#[async_trait]
impl RequestHandler for Gateway {
    async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        self.metrics.record_rpc(request.kind());

        let result = match request {
            GatewayRequest::Query { key, sql } => {
                self.query(key, &sql).await.map(GatewayResponse::Rows)
            }
            GatewayRequest::Exec { key, sql } => self
                .exec(key, &sql)
                .await
                .map(|outcome| GatewayResponse::Exec(outcome.into())),
            GatewayRequest::RegisterKey { key, shard } => self
                .register_key(key, shard)
                .await
                .map(|()| GatewayResponse::Simple(SimpleResult::success())),
            GatewayRequest::RemoveKey { key } => self
                .remove_key(key)
                .await
                .map(|()| GatewayResponse::Simple(SimpleResult::success())),
            GatewayRequest::MigrateShard { key, to_shard } => self
                .migrate_shard(key, to_shard)
                .await
                .map(|_| GatewayResponse::Simple(SimpleResult::success())),
            GatewayRequest::Ping => Ok(GatewayResponse::Pong),
            GatewayRequest::Metrics => Ok(GatewayResponse::Metrics(self.metrics_text())),
        };

        result.unwrap_or_else(GatewayResponse::from)
    }
}
