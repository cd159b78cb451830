use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use tokio::sync::mpsc;

use super::{ColumnInfo, QueryEvent, Store};
use crate::core::ServerError;

/// Capacity of the row channel between the blocking query task and the
/// connection task. Bounded so a slow client applies backpressure instead
/// of the result set piling up in memory.
const ROW_CHANNEL_CAPACITY: usize = 32;

/// Distinguishes shared-cache in-memory databases from one another.
static MEMORY_DB_ID: AtomicU64 = AtomicU64::new(0);

enum Backing {
    File(PathBuf),
    /// Named shared-cache in-memory database. The anchor connection keeps
    /// it alive for the lifetime of the store; per-query connections attach
    /// to the same cache by URI.
    Memory {
        uri: String,
        _anchor: Mutex<Connection>,
    },
}

/// Read-only SQLite store.
///
/// Every query runs on its own freshly opened connection, so concurrent
/// queries against the same handle proceed independently: a client that
/// stops reading its result stream parks only its own query, never another
/// connection's. Read-only opens are cheap; SQLite's own guarantees cover
/// concurrent readers of one database file.
pub struct SqliteStore {
    backing: Backing,
}

impl SqliteStore {
    /// Opens the database file read-only, or an in-memory database when no
    /// path is given. Fails if the file does not exist or is not a SQLite
    /// database.
    pub fn open(path: Option<&Path>) -> Result<Self, ServerError> {
        let backing = match path {
            Some(path) => Backing::File(path.to_path_buf()),
            None => {
                let id = MEMORY_DB_ID.fetch_add(1, Ordering::Relaxed);
                let uri = format!("file:sqlgate-mem-{id}?mode=memory&cache=shared");
                let anchor = Connection::open_with_flags(
                    &uri,
                    OpenFlags::SQLITE_OPEN_READ_WRITE
                        | OpenFlags::SQLITE_OPEN_CREATE
                        | OpenFlags::SQLITE_OPEN_URI
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                Backing::Memory {
                    uri,
                    _anchor: Mutex::new(anchor),
                }
            }
        };
        let store = Self { backing };
        // SQLite opens lazily; force a read of the header so a missing,
        // corrupt, or non-database file fails here rather than on the first
        // client query.
        store
            .connect()?
            .query_row("PRAGMA schema_version", [], |_| Ok(()))?;
        Ok(store)
    }

    /// A fresh connection to the backing database for one query.
    fn connect(&self) -> rusqlite::Result<Connection> {
        match &self.backing {
            Backing::File(path) => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
            Backing::Memory { uri, .. } => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
        }
    }

    fn run_blocking(&self, sql: &str, tx: &mpsc::Sender<QueryEvent>) {
        let conn = match self.connect() {
            Ok(conn) => conn,
            Err(err) => {
                let _ = tx.blocking_send(QueryEvent::Failed(err.to_string()));
                return;
            }
        };

        let mut stmt = match conn.prepare(sql) {
            Ok(stmt) => stmt,
            Err(err) => {
                let _ = tx.blocking_send(QueryEvent::Failed(err.to_string()));
                return;
            }
        };

        let columns: Vec<ColumnInfo> = stmt
            .columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                decl_type: col.decl_type().map(str::to_string),
            })
            .collect();
        let column_count = columns.len();
        if tx.blocking_send(QueryEvent::Columns(columns)).is_err() {
            return;
        }

        let mut rows = match stmt.query([]) {
            Ok(rows) => rows,
            Err(err) => {
                let _ = tx.blocking_send(QueryEvent::Failed(err.to_string()));
                return;
            }
        };

        loop {
            match rows.next() {
                Ok(Some(row)) => {
                    let mut values = Vec::with_capacity(column_count);
                    for i in 0..column_count {
                        match row.get_ref(i) {
                            Ok(value) => values.push(text_value(value)),
                            Err(err) => {
                                let _ = tx.blocking_send(QueryEvent::Failed(err.to_string()));
                                return;
                            }
                        }
                    }
                    if tx.blocking_send(QueryEvent::Row(values)).is_err() {
                        // Client went away; stop reading rows.
                        return;
                    }
                }
                Ok(None) => {
                    let _ = tx.blocking_send(QueryEvent::Finished);
                    return;
                }
                Err(err) => {
                    let _ = tx.blocking_send(QueryEvent::Failed(err.to_string()));
                    return;
                }
            }
        }
    }
}

impl Store for SqliteStore {
    fn run(self: Arc<Self>, sql: String) -> mpsc::Receiver<QueryEvent> {
        let (tx, rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || self.run_blocking(&sql, &tx));
        rx
    }
}

/// Canonical text rendering for one SQLite value; `None` is SQL NULL.
fn text_value(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(n) => Some(n.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(text) => Some(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Some(hex::encode(blob)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn collect(store: Arc<SqliteStore>, sql: &str) -> Vec<QueryEvent> {
        let mut rx = store.run(sql.to_string());
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn select_literal_from_memory() {
        let store = Arc::new(SqliteStore::open(None).unwrap());
        let events = collect(store, "SELECT 1 AS n").await;

        match &events[0] {
            QueryEvent::Columns(cols) => {
                assert_eq!(cols.len(), 1);
                assert_eq!(cols[0].name, "n");
                assert!(cols[0].decl_type.is_none());
            }
            other => panic!("expected Columns, got {other:?}"),
        }
        match &events[1] {
            QueryEvent::Row(values) => assert_eq!(values, &vec![Some("1".to_string())]),
            other => panic!("expected Row, got {other:?}"),
        }
        assert!(matches!(events[2], QueryEvent::Finished));
    }

    #[tokio::test]
    async fn bad_sql_fails_without_columns() {
        let store = Arc::new(SqliteStore::open(None).unwrap());
        let events = collect(store, "SELECT * FROM missing").await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            QueryEvent::Failed(text) => assert!(text.contains("missing"), "{text}"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reads_typed_values_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let setup = Connection::open(&path).unwrap();
        setup
            .execute_batch(
                "CREATE TABLE t (id INTEGER, score REAL, name TEXT, raw BLOB);
                 INSERT INTO t VALUES (7, 1.5, 'alice', x'cafe');
                 INSERT INTO t VALUES (8, NULL, NULL, NULL);",
            )
            .unwrap();
        drop(setup);

        let store = Arc::new(SqliteStore::open(Some(&path)).unwrap());
        let events = collect(store, "SELECT id, score, name, raw FROM t ORDER BY id").await;

        match &events[0] {
            QueryEvent::Columns(cols) => {
                assert_eq!(cols[0].decl_type.as_deref(), Some("INTEGER"));
                assert_eq!(cols[3].decl_type.as_deref(), Some("BLOB"));
            }
            other => panic!("expected Columns, got {other:?}"),
        }
        match &events[1] {
            QueryEvent::Row(values) => {
                assert_eq!(
                    values,
                    &vec![
                        Some("7".to_string()),
                        Some("1.5".to_string()),
                        Some("alice".to_string()),
                        Some("cafe".to_string()),
                    ]
                );
            }
            other => panic!("expected Row, got {other:?}"),
        }
        match &events[2] {
            QueryEvent::Row(values) => {
                assert_eq!(values, &vec![Some("8".to_string()), None, None, None]);
            }
            other => panic!("expected Row, got {other:?}"),
        }
        assert!(matches!(events[3], QueryEvent::Finished));
    }

    #[tokio::test]
    async fn writes_are_rejected_on_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE t (val TEXT)")
            .unwrap();

        let store = Arc::new(SqliteStore::open(Some(&path)).unwrap());
        let events = collect(store, "INSERT INTO t VALUES ('x')").await;
        assert!(
            events
                .iter()
                .any(|e| matches!(e, QueryEvent::Failed(text) if text.contains("readonly")
                    || text.contains("read-only")))
        );
    }

    #[tokio::test]
    async fn stalled_reader_does_not_block_other_queries() {
        let store = Arc::new(SqliteStore::open(None).unwrap());

        // A result set far larger than the channel capacity, whose reader
        // stops after the column metadata: the producer parks on the full
        // channel for as long as the receiver stays alive unread.
        let mut stalled = Arc::clone(&store).run(
            "WITH RECURSIVE cnt(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM cnt WHERE x < 100000) \
             SELECT x FROM cnt"
                .to_string(),
        );
        let first = stalled.recv().await.unwrap();
        assert!(matches!(first, QueryEvent::Columns(_)));

        // A second query on the same store must still complete.
        let events = tokio::time::timeout(
            Duration::from_secs(2),
            collect(Arc::clone(&store), "SELECT 1"),
        )
        .await
        .expect("query stalled behind another connection's unread result");
        assert!(matches!(events.last(), Some(QueryEvent::Finished)));

        drop(stalled);
    }

    #[test]
    fn missing_file_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.db");
        assert!(SqliteStore::open(Some(&path)).is_err());
    }
}
