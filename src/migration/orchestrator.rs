//! Runs migrations: copy, verify, then hand over to the cutover step.

use super::{
    Cutover, MigrationJob, MigrationPhase, MigrationRecord, MigrationReport, MigrationStatus,
};
use crate::error::{MigrationError, Result};
use crate::metrics::GatewayMetrics;
use crate::shard::ShardConnection;
use crate::types::RoutingKey;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Finished migrations kept for inspection.
const MAX_HISTORY: usize = 64;

#[derive(Debug)]
struct ActiveMigration {
    job: MigrationJob,
    phase: MigrationPhase,
    started_at: Instant,
}

/// Removes the key from the active set when the migration ends.
struct ActiveGuard<'a> {
    active: &'a RwLock<HashMap<RoutingKey, ActiveMigration>>,
    key: RoutingKey,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.write().remove(&self.key);
    }
}

#[derive(Debug)]
pub struct MigrationOrchestrator {
    active: RwLock<HashMap<RoutingKey, ActiveMigration>>,
    history: RwLock<VecDeque<MigrationRecord>>,
    metrics: Arc<GatewayMetrics>,
}

impl MigrationOrchestrator {
    pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            metrics,
        }
    }

    /// Migrations currently running.
    pub fn active(&self) -> Vec<MigrationStatus> {
        self.active
            .read()
            .values()
            .map(|m| MigrationStatus {
                job: m.job.clone(),
                phase: m.phase,
                elapsed: m.started_at.elapsed(),
            })
            .collect()
    }

    pub fn is_migrating(&self, key: &RoutingKey) -> bool {
        self.active.read().contains_key(key)
    }

    /// Recently finished migrations, oldest first.
    pub fn history(&self) -> Vec<MigrationRecord> {
        self.history.read().iter().cloned().collect()
    }

    /// Run `job`: copy and verify the partition, then call `cutover`.
    ///
    /// `cutover` is invoked at most once, and only after a verified copy. Any
    /// error returned here means the cutover did not switch the route.
    pub async fn migrate<F, Fut>(
        &self,
        job: MigrationJob,
        source: &ShardConnection,
        dest: &ShardConnection,
        cutover: F,
    ) -> Result<MigrationReport>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Cutover>,
    {
        let _guard = self.begin(&job)?;
        let started = Instant::now();
        self.metrics.record_migration_start();

        info!(
            migration_id = %job.id,
            key = %job.key,
            from = %job.source_shard,
            to = %job.dest_shard,
            "Migration started"
        );

        let result = self.execute(&job, source, dest, cutover).await;
        let duration = started.elapsed();

        match &result {
            Ok(report) => {
                self.set_phase(&job.key, MigrationPhase::Done);
                self.metrics
                    .record_migration_complete(duration, report.rows_copied);
                info!(
                    migration_id = %job.id,
                    key = %job.key,
                    rows = report.rows_copied,
                    duration_ms = duration.as_millis() as u64,
                    "Migration completed"
                );
            }
            Err(e) => {
                self.set_phase(&job.key, MigrationPhase::Failed);
                self.metrics.record_migration_failed();
                warn!(
                    migration_id = %job.id,
                    key = %job.key,
                    error = %e,
                    "Migration failed, route unchanged"
                );
            }
        }

        self.remember(MigrationRecord {
            job: job.clone(),
            phase: if result.is_ok() {
                MigrationPhase::Done
            } else {
                MigrationPhase::Failed
            },
            error: result.as_ref().err().map(|e| e.to_string()),
            duration,
        });

        result
    }

    async fn execute<F, Fut>(
        &self,
        job: &MigrationJob,
        source: &ShardConnection,
        dest: &ShardConnection,
        cutover: F,
    ) -> Result<MigrationReport>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Cutover>,
    {
        let started = Instant::now();
        let rows_copied = self.copy_partition(job, source, dest).await?;

        self.set_phase(&job.key, MigrationPhase::Cutover);
        match cutover().await {
            Cutover::Switched => {}
            Cutover::Rejected(reason) => {
                return Err(MigrationError::CutoverRejected {
                    key: job.key.clone(),
                    dest_shard: job.dest_shard.clone(),
                    reason,
                }
                .into())
            }
            Cutover::DrainTimedOut(timeout) => {
                return Err(MigrationError::DrainTimeout {
                    key: job.key.clone(),
                    timeout,
                }
                .into())
            }
        }

        Ok(MigrationReport {
            job: job.clone(),
            rows_copied,
            duration: started.elapsed(),
        })
    }

    /// Copy the key's partition and verify the destination against the copy.
    /// Returns the number of rows copied.
    pub async fn copy_partition(
        &self,
        job: &MigrationJob,
        source: &ShardConnection,
        dest: &ShardConnection,
    ) -> Result<u64> {
        self.set_phase(&job.key, MigrationPhase::Copying);

        let dump = source
            .export_partition(&job.key)
            .await
            .map_err(|e| copy_failed(job, format!("export from source: {}", e)))?;

        dest.import_partition(&dump)
            .await
            .map_err(|e| copy_failed(job, format!("import into destination: {}", e)))?;

        debug!(
            migration_id = %job.id,
            tables = dump.tables.len(),
            rows = dump.row_count(),
            "Partition copied"
        );

        self.set_phase(&job.key, MigrationPhase::Verifying);

        let copied = dump.digest();
        let landed = dest
            .partition_digest(&job.key)
            .await
            .map_err(|e| copy_failed(job, format!("digest of destination: {}", e)))?;

        if let Some(mismatch) = copied.mismatch(&landed) {
            return Err(copy_failed(job, format!("verification: {}", mismatch)));
        }

        Ok(dump.row_count() as u64)
    }

    /// Bring the destination up to date with the source.
    ///
    /// Meant to run while admissions are quiesced, so rows written to the
    /// source during the copy reach the destination before the route moves.
    /// Returns the number of rows copied again, zero if nothing changed.
    pub async fn catch_up(
        &self,
        job: &MigrationJob,
        source: &ShardConnection,
        dest: &ShardConnection,
    ) -> Result<u64> {
        let (current, landed) = futures::try_join!(
            source.partition_digest(&job.key),
            dest.partition_digest(&job.key)
        )
        .map_err(|e| copy_failed(job, format!("digest during catch-up: {}", e)))?;

        match current.mismatch(&landed) {
            None => Ok(0),
            Some(diff) => {
                info!(migration_id = %job.id, key = %job.key, diff = %diff, "Catching up writes made during copy");
                let rows = self.copy_partition(job, source, dest).await?;
                self.set_phase(&job.key, MigrationPhase::Cutover);
                Ok(rows)
            }
        }
    }

    fn begin(&self, job: &MigrationJob) -> Result<ActiveGuard<'_>> {
        let mut active = self.active.write();
        if active.contains_key(&job.key) {
            return Err(MigrationError::InProgress(job.key.clone()).into());
        }
        active.insert(
            job.key.clone(),
            ActiveMigration {
                job: job.clone(),
                phase: MigrationPhase::Copying,
                started_at: Instant::now(),
            },
        );

        Ok(ActiveGuard {
            active: &self.active,
            key: job.key.clone(),
        })
    }

    fn set_phase(&self, key: &RoutingKey, phase: MigrationPhase) {
        if let Some(m) = self.active.write().get_mut(key) {
            debug!(migration_id = %m.job.id, from = %m.phase, to = %phase, "Migration phase");
            m.phase = phase;
        }
    }

    fn remember(&self, record: MigrationRecord) {
        let mut history = self.history.write();
        if history.len() == MAX_HISTORY {
            history.pop_front();
        }
        history.push_back(record);
    }
}

fn copy_failed(job: &MigrationJob, reason: String) -> crate::error::Error {
    MigrationError::CopyFailed {
        key: job.key.clone(),
        source_shard: job.source_shard.clone(),
        dest_shard: job.dest_shard.clone(),
        reason,
    }
    .into()
}
