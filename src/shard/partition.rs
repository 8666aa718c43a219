//! Partition dumps and digests used to copy and verify one key's data.

use crate::types::{Row, RoutingKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Seed for row checksums. Must match on both sides of a migration.
const ROW_HASH_SEED: u64 = 0x5AFE_CAFE_DEAD_BEEF;

/// All schema objects and rows owned by one routing key on a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionDump {
    pub key: RoutingKey,
    pub tables: Vec<TableDump>,
}

impl PartitionDump {
    pub fn new(key: RoutingKey) -> Self {
        Self {
            key,
            tables: Vec::new(),
        }
    }

    pub fn with_table(mut self, table: TableDump) -> Self {
        self.tables.push(table);
        self
    }

    /// Total rows across all tables.
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }

    /// Digest of the dump as it would be computed on a shard holding exactly
    /// these rows.
    pub fn digest(&self) -> PartitionDigest {
        let mut digest = PartitionDigest::default();
        for table in &self.tables {
            digest.add_table(&table.name, &table.rows);
        }
        digest
    }
}

/// One table's slice of a partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDump {
    pub name: String,
    /// Statement that recreates the table on a shard that lacks it.
    pub create_sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl TableDump {
    pub fn new(name: impl Into<String>, create_sql: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            create_sql: create_sql.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }
}

/// Row count and checksum of one table's partition rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDigest {
    pub row_count: u64,
    pub checksum: u64,
}

/// Per-table digests for one key. Tables with no rows for the key are omitted,
/// so a shard with extra empty partitioned tables still verifies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDigest {
    pub tables: BTreeMap<String, TableDigest>,
}

impl PartitionDigest {
    /// Fold a table's rows into the digest. Row order does not matter.
    pub fn add_table(&mut self, table: &str, rows: &[Row]) {
        if rows.is_empty() {
            return;
        }

        let entry = self.tables.entry(table.to_string()).or_default();
        for row in rows {
            entry.row_count += 1;
            entry.checksum = entry.checksum.wrapping_add(row_hash(row));
        }
    }

    pub fn row_count(&self) -> u64 {
        self.tables.values().map(|t| t.row_count).sum()
    }

    /// Describe the first difference against `other`, if any.
    pub fn mismatch(&self, other: &PartitionDigest) -> Option<String> {
        for (table, digest) in &self.tables {
            match other.tables.get(table) {
                None => return Some(format!("table {} missing on destination", table)),
                Some(theirs) if theirs.row_count != digest.row_count => {
                    return Some(format!(
                        "table {} row count {} != {}",
                        table, digest.row_count, theirs.row_count
                    ))
                }
                Some(theirs) if theirs.checksum != digest.checksum => {
                    return Some(format!("table {} checksum mismatch", table))
                }
                Some(_) => {}
            }
        }

        other
            .tables
            .keys()
            .find(|t| !self.tables.contains_key(*t))
            .map(|t| format!("unexpected rows in table {} on destination", t))
    }
}

fn row_hash(row: &Row) -> u64 {
    let mut hasher = XxHash64::with_seed(ROW_HASH_SEED);
    // bincode of a Vec<Value> is infallible; fall back to the debug form anyway
    // so a hashing problem can only cause a verification mismatch.
    match bincode::serialize(row) {
        Ok(bytes) => hasher.write(&bytes),
        Err(_) => hasher.write(format!("{:?}", row).as_bytes()),
    }
    hasher.finish()
}
