//! SQLite shard driver.
//!
//! A table belongs to the partitioned schema when it has the configured
//! partition column; a key's partition is every row of those tables whose
//! partition column equals the key. Other tables are never copied.
//!
//! An `INTEGER PRIMARY KEY` column aliases the rowid and is local to each
//! shard: it is left out of dumps and digests, and the destination assigns
//! fresh values on import.

use super::{PartitionDigest, PartitionDump, ShardDriver, TableDump};
use crate::error::{ConnectionError, Error, Result};
use crate::types::{ExecOutcome, Row, RoutingKey, RowSet, ShardName, Value};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, ToSql};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug)]
pub struct SqliteShard {
    name: ShardName,
    conn: Arc<Mutex<Connection>>,
    /// Second connection to the same file, used only by `ping` so health
    /// checks never wait behind long statements. `None` for in-memory shards.
    health: Option<Arc<Mutex<Connection>>>,
    partition_column: String,
}

impl SqliteShard {
    /// Open or create the database file.
    pub async fn open(name: ShardName, path: PathBuf, partition_column: String) -> Result<Self> {
        info!(shard = %name, path = ?path, "Opening SQLite shard");

        let shard = name.clone();
        let (conn, health) = tokio::task::spawn_blocking(
            move || -> rusqlite::Result<(Connection, Connection)> {
                let conn = Connection::open(&path)?;
                conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
                let health = Connection::open(&path)?;
                Ok((conn, health))
            },
        )
        .await
        .map_err(|e| Error::Internal(format!("open task failed: {}", e)))?
        .map_err(|e| ConnectionError::Unreachable {
            shard,
            reason: e.to_string(),
        })?;

        let mut shard = Self::from_connection(name, conn, partition_column);
        shard.health = Some(Arc::new(Mutex::new(health)));
        Ok(shard)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory(name: ShardName, partition_column: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| ConnectionError::Unreachable {
            shard: name.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_connection(name, conn, partition_column.into()))
    }

    fn from_connection(name: ShardName, conn: Connection, partition_column: String) -> Self {
        Self {
            name,
            conn: Arc::new(Mutex::new(conn)),
            health: None,
            partition_column,
        }
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, &str) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let column = self.partition_column.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard, &column)
        })
        .await
        .map_err(|e| Error::Internal(format!("sqlite task failed: {}", e)))?
    }

    /// Health check for a shard without a second connection. A held lock
    /// means a statement is running, so the shard counts as alive.
    fn ping_shared(&self) -> Result<()> {
        match self.conn.try_lock() {
            Some(conn) => health_check(&conn, &self.name),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ShardDriver for SqliteShard {
    async fn query(&self, sql: &str) -> Result<RowSet> {
        let sql = sql.to_string();
        self.with_conn(move |conn, _| select_rows(conn, &sql, &[]).map_err(query_error))
            .await
    }

    async fn exec(&self, sql: &str) -> Result<ExecOutcome> {
        let sql = sql.to_string();
        self.with_conn(move |conn, _| {
            let changed = conn.execute(&sql, []).map_err(query_error)?;
            // The connection keeps the rowid of its last INSERT around, so
            // only report it for a statement that just inserted.
            let inserted = changed > 0 && is_insert(&sql);
            Ok(ExecOutcome {
                rows_affected: i64::try_from(changed).ok(),
                last_insert_id: inserted.then(|| conn.last_insert_rowid()),
            })
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        let Some(health) = &self.health else {
            return self.ping_shared();
        };

        let health = Arc::clone(health);
        let shard = self.name.clone();
        tokio::task::spawn_blocking(move || health_check(&health.lock(), &shard))
            .await
            .map_err(|e| Error::Internal(format!("sqlite task failed: {}", e)))?
    }

    async fn export_partition(&self, key: &RoutingKey) -> Result<PartitionDump> {
        let key = key.clone();
        self.with_conn(move |conn, column| {
            let mut dump = PartitionDump::new(key.clone());
            for table in partitioned_tables(conn, column).map_err(query_error)? {
                let rows = select_partition_rows(conn, &table, column, &key).map_err(query_error)?;
                dump.tables.push(table.with_rows(rows));
            }
            debug!(key = %key, tables = dump.tables.len(), rows = dump.row_count(), "Exported partition");
            Ok(dump)
        })
        .await
    }

    async fn import_partition(&self, dump: &PartitionDump) -> Result<()> {
        let dump = dump.clone();
        self.with_conn(move |conn, column| {
            let tx = conn.transaction().map_err(query_error)?;

            for table in &dump.tables {
                let exists: Option<String> = tx
                    .query_row(
                        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                        [&table.name],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(query_error)?;
                if exists.is_none() {
                    tx.execute_batch(&table.create_sql).map_err(query_error)?;
                }

                tx.execute(
                    &format!(
                        "DELETE FROM {} WHERE {} = ?1",
                        quote_ident(&table.name),
                        quote_ident(column)
                    ),
                    [dump.key.as_str()],
                )
                .map_err(query_error)?;

                if table.rows.is_empty() {
                    continue;
                }

                let columns: Vec<String> = table.columns.iter().map(|c| quote_ident(c)).collect();
                let placeholders: Vec<String> =
                    (1..=table.columns.len()).map(|i| format!("?{}", i)).collect();
                let insert = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote_ident(&table.name),
                    columns.join(", "),
                    placeholders.join(", ")
                );

                let mut stmt = tx.prepare(&insert).map_err(query_error)?;
                for row in &table.rows {
                    stmt.execute(rusqlite::params_from_iter(row.iter()))
                        .map_err(query_error)?;
                }
            }

            tx.commit().map_err(query_error)?;
            debug!(key = %dump.key, rows = dump.row_count(), "Imported partition");
            Ok(())
        })
        .await
    }

    async fn partition_digest(&self, key: &RoutingKey) -> Result<PartitionDigest> {
        let key = key.clone();
        self.with_conn(move |conn, column| {
            let mut digest = PartitionDigest::default();
            for table in partitioned_tables(conn, column).map_err(query_error)? {
                let rows = select_partition_rows(conn, &table, column, &key).map_err(query_error)?;
                digest.add_table(&table.name, &rows);
            }
            Ok(digest)
        })
        .await
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            Value::Real(v) => ToSqlOutput::Borrowed(ValueRef::Real(*v)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn query_error(e: rusqlite::Error) -> Error {
    Error::Query(e.to_string())
}

fn health_check(conn: &Connection, shard: &ShardName) -> Result<()> {
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
        .map(|_| ())
        .map_err(|e| {
            ConnectionError::ProbeFailed {
                shard: shard.clone(),
                reason: e.to_string(),
            }
            .into()
        })
}

fn is_insert(sql: &str) -> bool {
    sql.split_whitespace().next().map_or(false, |word| {
        word.eq_ignore_ascii_case("INSERT") || word.eq_ignore_ascii_case("REPLACE")
    })
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

fn select_rows(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> rusqlite::Result<RowSet> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();

    let mut out = Vec::new();
    let mut rows = stmt.query(params)?;
    while let Some(row) = rows.next()? {
        let mut values: Row = Vec::with_capacity(width);
        for i in 0..width {
            values.push(to_value(row.get_ref(i)?));
        }
        out.push(values);
    }

    Ok(RowSet::new(columns, out))
}

/// Tables carrying the partition column, without rows. `columns` lists the
/// copied columns, which excludes a rowid alias.
fn partitioned_tables(conn: &Connection, column: &str) -> rusqlite::Result<Vec<TableDump>> {
    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let tables: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let mut out = Vec::new();
    for (name, create_sql) in tables {
        let mut pragma = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(&name)))?;
        let info: Vec<ColumnInfo> = pragma
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    decl_type: row.get(2)?,
                    pk: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        if !info.iter().any(|c| c.name == column) {
            continue;
        }

        let alias = rowid_alias(&info, &create_sql).filter(|alias| *alias != column);
        let columns = info
            .iter()
            .filter(|c| Some(c.name.as_str()) != alias)
            .map(|c| c.name.clone())
            .collect();
        out.push(TableDump::new(name, create_sql, columns));
    }
    Ok(out)
}

struct ColumnInfo {
    name: String,
    decl_type: String,
    pk: i64,
}

/// The column aliasing the rowid: a sole `INTEGER` primary key on a table
/// that has a rowid.
fn rowid_alias<'a>(info: &'a [ColumnInfo], create_sql: &str) -> Option<&'a str> {
    let mut pk = info.iter().filter(|c| c.pk > 0);
    let column = pk.next()?;
    if pk.next().is_some()
        || !column.decl_type.eq_ignore_ascii_case("INTEGER")
        || create_sql.to_ascii_uppercase().contains("WITHOUT ROWID")
    {
        return None;
    }
    Some(column.name.as_str())
}

fn select_partition_rows(
    conn: &Connection,
    table: &TableDump,
    column: &str,
    key: &RoutingKey,
) -> rusqlite::Result<Vec<Row>> {
    let columns: Vec<String> = table.columns.iter().map(|c| quote_ident(c)).collect();
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        columns.join(", "),
        quote_ident(&table.name),
        quote_ident(column)
    );
    let key = key.as_str();
    Ok(select_rows(conn, &sql, &[&key])?.rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SCHEMA: &str = "
        CREATE TABLE users (id INTEGER PRIMARY KEY, routing_key TEXT NOT NULL, name TEXT);
        CREATE TABLE orders (id INTEGER PRIMARY KEY, routing_key TEXT NOT NULL, amount REAL);
        CREATE TABLE settings (k TEXT PRIMARY KEY, v TEXT);
    ";

    fn seeded(name: &str) -> SqliteShard {
        let shard = SqliteShard::open_in_memory(name.into(), "routing_key").unwrap();
        {
            let conn = shard.conn.lock();
            conn.execute_batch(SCHEMA).unwrap();
            conn.execute_batch(
                "INSERT INTO users (routing_key, name) VALUES ('tenant1', 'alice'), ('tenant1', 'bob'), ('tenant2', 'carol');
                 INSERT INTO orders (routing_key, amount) VALUES ('tenant1', 9.5), ('tenant2', 3.0);
                 INSERT INTO settings VALUES ('mode', 'test');",
            )
            .unwrap();
        }
        shard
    }

    #[tokio::test]
    async fn test_query_and_exec() {
        let shard = seeded("a");

        let rows = shard
            .query("SELECT name FROM users WHERE routing_key = 'tenant1' ORDER BY id")
            .await
            .unwrap();
        assert_eq!(rows.columns, vec!["name".to_string()]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.get(0, "name"), Some(&Value::from("alice")));

        let outcome = shard
            .exec("INSERT INTO users (routing_key, name) VALUES ('tenant3', 'dave')")
            .await
            .unwrap();
        assert_eq!(outcome.rows_affected, Some(1));
        assert_eq!(outcome.last_insert_id, Some(4));

        let outcome = shard
            .exec("UPDATE users SET name = 'erin' WHERE routing_key = 'tenant1'")
            .await
            .unwrap();
        assert_eq!(outcome.rows_affected, Some(2));
        assert_eq!(outcome.last_insert_id, None);

        let outcome = shard
            .exec("DELETE FROM users WHERE routing_key = 'nobody'")
            .await
            .unwrap();
        assert_eq!(outcome.rows_affected, Some(0));
        assert_eq!(outcome.last_insert_id, None);
    }

    #[tokio::test]
    async fn test_sql_error_is_passed_through() {
        let shard = seeded("a");
        let err = shard.query("SELECT * FROM missing").await.unwrap_err();
        match err {
            Error::Query(msg) => assert!(msg.contains("no such table: missing"), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_export_scopes_to_key() {
        let shard = seeded("a");
        let dump = shard.export_partition(&"tenant1".into()).await.unwrap();

        let names: Vec<&str> = dump.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["orders", "users"]);
        assert_eq!(dump.row_count(), 3);

        // The rowid alias stays behind.
        assert_eq!(dump.tables[1].columns, vec!["routing_key", "name"]);
        assert_eq!(
            dump.tables[1].rows[0],
            vec![Value::from("tenant1"), Value::from("alice")]
        );
    }

    #[tokio::test]
    async fn test_import_into_empty_shard_verifies() {
        let source = seeded("a");
        let dest = SqliteShard::open_in_memory("b".into(), "routing_key").unwrap();
        let key = RoutingKey::new("tenant1");

        let dump = source.export_partition(&key).await.unwrap();
        dest.import_partition(&dump).await.unwrap();

        let source_digest = source.partition_digest(&key).await.unwrap();
        let dest_digest = dest.partition_digest(&key).await.unwrap();
        assert_eq!(source_digest, dest_digest);
        assert_eq!(dest_digest.row_count(), 3);

        // Only the key's rows moved.
        let other = dest.partition_digest(&"tenant2".into()).await.unwrap();
        assert_eq!(other.row_count(), 0);
        assert!(dest.query("SELECT * FROM settings").await.is_err());
    }

    #[tokio::test]
    async fn test_import_replaces_stale_rows() {
        let source = seeded("a");
        let dest = seeded("b");
        dest.exec("INSERT INTO users (routing_key, name) VALUES ('tenant1', 'stale')")
            .await
            .unwrap();

        let key = RoutingKey::new("tenant1");
        let dump = source.export_partition(&key).await.unwrap();
        dest.import_partition(&dump).await.unwrap();

        let rows = dest
            .query("SELECT name FROM users WHERE routing_key = 'tenant1' ORDER BY name")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            source.partition_digest(&key).await.unwrap(),
            dest.partition_digest(&key).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_import_next_to_other_keys() {
        let source = seeded("a");
        let dest = SqliteShard::open_in_memory("b".into(), "routing_key").unwrap();
        {
            let conn = dest.conn.lock();
            conn.execute_batch(SCHEMA).unwrap();
            // Occupies the ids tenant1 uses on the source.
            conn.execute_batch(
                "INSERT INTO users (routing_key, name) VALUES ('tenant2', 'erin'), ('tenant2', 'frank'), ('tenant2', 'grace');
                 INSERT INTO orders (routing_key, amount) VALUES ('tenant2', 1.0);",
            )
            .unwrap();
        }

        let key = RoutingKey::new("tenant1");
        let dump = source.export_partition(&key).await.unwrap();
        dest.import_partition(&dump).await.unwrap();

        assert_eq!(
            source.partition_digest(&key).await.unwrap(),
            dest.partition_digest(&key).await.unwrap()
        );
        let rows = dest
            .query("SELECT id, name FROM users WHERE routing_key = 'tenant1' ORDER BY id")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.get(0, "id"), Some(&Value::Integer(4)));
        assert_eq!(rows.get(0, "name"), Some(&Value::from("alice")));

        let others = dest.partition_digest(&"tenant2".into()).await.unwrap();
        assert_eq!(others.row_count(), 4);
    }

    const SLOW_QUERY: &str = "WITH RECURSIVE c(x) AS \
        (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 20000000) \
        SELECT count(*) FROM c";

    /// Ping must answer while a long statement holds the connection.
    async fn ping_while_busy(shard: Arc<SqliteShard>) {
        let interrupt = shard.conn.lock().get_interrupt_handle();

        let busy = Arc::clone(&shard);
        let slow = tokio::spawn(async move { busy.query(SLOW_QUERY).await });
        let started = crate::testing::wait_for(
            || shard.conn.is_locked(),
            std::time::Duration::from_secs(5),
        )
        .await;
        assert!(started);

        let result = tokio::time::timeout(std::time::Duration::from_millis(500), shard.ping()).await;
        interrupt.interrupt();

        assert!(matches!(result, Ok(Ok(()))), "{:?}", result);
        let _ = slow.await;
    }

    #[tokio::test]
    async fn test_ping_during_slow_query() {
        let dir = TempDir::new().unwrap();
        let shard = SqliteShard::open("a".into(), dir.path().join("a.db"), "routing_key".into())
            .await
            .unwrap();
        ping_while_busy(Arc::new(shard)).await;
    }

    #[tokio::test]
    async fn test_ping_during_slow_query_in_memory() {
        ping_while_busy(Arc::new(seeded("a"))).await;
    }

    #[tokio::test]
    async fn test_file_backed_shard() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shard.db");

        let shard = SqliteShard::open("a".into(), path.clone(), "routing_key".into())
            .await
            .unwrap();
        shard.ping().await.unwrap();
        shard
            .exec("CREATE TABLE t (routing_key TEXT, v INTEGER)")
            .await
            .unwrap();
        drop(shard);

        let reopened = SqliteShard::open("a".into(), path, "routing_key".into())
            .await
            .unwrap();
        assert!(reopened.query("SELECT * FROM t").await.unwrap().is_empty());
    }
}
