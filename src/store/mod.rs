// Embedded read-only store boundary.

mod sqlite;

pub use sqlite::SqliteStore;

use std::sync::Arc;

use tokio::sync::mpsc;

/// Metadata for one result column.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type of the column, if the engine knows one. Computed
    /// expressions have none.
    pub decl_type: Option<String>,
}

/// One step of a streamed query result.
#[derive(Debug)]
pub enum QueryEvent {
    /// Column metadata, sent exactly once before any row.
    Columns(Vec<ColumnInfo>),
    /// A single row of values; `None` marks SQL NULL.
    Row(Vec<Option<String>>),
    /// All rows delivered.
    Finished,
    /// Execution failed; carries the engine's error text verbatim.
    Failed(String),
}

/// A read-only queryable handle to the backing data set.
///
/// The server publishes exactly one current handle at a time. A reload
/// replaces the published `Arc`; a superseded handle closes once the last
/// in-flight query drops its clone, so a query never observes a mix of
/// pre- and post-reload data within itself.
pub trait Store: Send + Sync {
    /// Executes `sql` and streams the outcome as [`QueryEvent`]s.
    ///
    /// The returned channel yields `Columns` first, then zero or more `Row`
    /// events, then exactly one of `Finished` or `Failed`. A failure during
    /// preparation yields `Failed` with no preceding `Columns`.
    fn run(self: Arc<Self>, sql: String) -> mpsc::Receiver<QueryEvent>;
}
