//! Moving one routing key's partition between shards.
//!
//! A migration runs through these phases:
//!
//! ```text
//! Copying ──► Verifying ──► Cutover ──► Done
//!    │            │            │
//!    └────────────┴────────────┴──► Failed
//! ```
//!
//! Copy and verification happen with traffic still flowing to the source.
//! The cutover step is supplied by the caller; the gateway's cutover closes
//! the admission gate, drains, catches up any rows written during the copy,
//! switches the route, and reopens the gate. A failure before a successful
//! cutover leaves the routing table as it was.

mod orchestrator;

pub use orchestrator::MigrationOrchestrator;

use crate::types::{RoutingKey, ShardName};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// One requested move of `key` from `source_shard` to `dest_shard`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: Uuid,
    pub key: RoutingKey,
    pub source_shard: ShardName,
    pub dest_shard: ShardName,
}

impl MigrationJob {
    pub fn new(key: RoutingKey, source_shard: ShardName, dest_shard: ShardName) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            source_shard,
            dest_shard,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationPhase {
    /// Exporting from the source and importing into the destination.
    Copying,
    /// Comparing the destination against what was copied.
    Verifying,
    /// The caller's cutover step is running.
    Cutover,
    Done,
    Failed,
}

impl MigrationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationPhase::Done | MigrationPhase::Failed)
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationPhase::Copying => write!(f, "copying"),
            MigrationPhase::Verifying => write!(f, "verifying"),
            MigrationPhase::Cutover => write!(f, "cutover"),
            MigrationPhase::Done => write!(f, "done"),
            MigrationPhase::Failed => write!(f, "failed"),
        }
    }
}

/// What the cutover step reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cutover {
    /// The route now points at the destination.
    Switched,
    /// The step refused to switch; the route is unchanged.
    Rejected(String),
    /// In-flight requests did not drain in time; the route is unchanged.
    DrainTimedOut(Duration),
}

/// Summary of a completed migration.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub job: MigrationJob,
    pub rows_copied: u64,
    pub duration: Duration,
}

/// A migration that is running.
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub job: MigrationJob,
    pub phase: MigrationPhase,
    pub elapsed: Duration,
}

/// A finished migration, kept in the orchestrator's history.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub job: MigrationJob,
    pub phase: MigrationPhase,
    pub error: Option<String>,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display_and_terminal() {
        assert_eq!(MigrationPhase::Cutover.to_string(), "cutover");
        assert!(MigrationPhase::Done.is_terminal());
        assert!(MigrationPhase::Failed.is_terminal());
        assert!(!MigrationPhase::Verifying.is_terminal());
    }

    #[test]
    fn test_jobs_get_distinct_ids() {
        let a = MigrationJob::new("t".into(), "a".into(), "b".into());
        let b = MigrationJob::new("t".into(), "a".into(), "b".into());
        assert_ne!(a.id, b.id);
    }
}
