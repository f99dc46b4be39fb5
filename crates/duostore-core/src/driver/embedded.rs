//! Embedded SQLite store.
//!
//! One connection behind a mutex: writes are serialized, async callers run
//! statements on the blocking pool.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use super::sql::{self, quote, Dialect, Statement};
use super::value::from_sqlite;
use super::{ColumnOutcome, DriverError, Filter, Row, TableStore};
use crate::catalog::{ColumnDef, TableSchema};

/// Apply connection pragmas.
///
/// WAL journaling, NORMAL sync, foreign keys on, and a busy timeout so a
/// second process sharing the file waits instead of failing.
pub fn apply_pragmas(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        ",
    )
}

/// Column names of a table, empty if the table does not exist.
pub fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let columns = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

/// Add `column` to `table` unless it is already there.
///
/// Fails if the table itself is missing.
pub fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    declaration: &str,
) -> rusqlite::Result<ColumnOutcome> {
    let columns = table_columns(conn, table)?;
    if columns.is_empty() {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("no such table: {table}")),
        ));
    }
    if columns.iter().any(|c| c == column) {
        return Ok(ColumnOutcome::AlreadyPresent);
    }
    conn.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN {} {declaration}",
        quote(table),
        quote(column)
    ))?;
    debug!(table, column, "column added");
    Ok(ColumnOutcome::Added)
}

/// Read every row of a table without a descriptor.
///
/// Used where the on-disk shape is not the registered one (repairs and
/// restructures).
pub fn read_raw_rows(conn: &Connection, table: &str) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quote(table)))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let rows = stmt
        .query_map([], |row| {
            let mut out = Row::new();
            for (index, name) in names.iter().enumerate() {
                out.insert(name.clone(), from_sqlite(row.get_ref(index)?, None));
            }
            Ok(out)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_rows(conn: &Connection, table: &TableSchema, stmt: &Statement) -> Result<Vec<Row>, DriverError> {
    let mut prepared = conn.prepare(&stmt.sql)?;
    let rows = prepared
        .query_map(params_from_iter(stmt.binds.iter()), |row| {
            let mut out = Row::new();
            for (index, column) in table.columns.iter().enumerate() {
                out.insert(
                    column.name.to_string(),
                    from_sqlite(row.get_ref(index)?, Some(column.ty)),
                );
            }
            Ok(out)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn single(rows: Vec<Row>) -> Result<Row, DriverError> {
    rows.into_iter()
        .next()
        .ok_or_else(|| DriverError::Other("statement returned no row".to_string()))
}

/// The embedded engine.
#[derive(Clone)]
pub struct EmbeddedStore {
    conn: Arc<Mutex<Connection>>,
}

impl EmbeddedStore {
    /// Open (or create) the database file.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, DriverError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn, busy_timeout)?;
        Ok(Self::from_connection(conn))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DriverError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `body` with exclusive access to the connection on the current
    /// thread. Used at boot, before any async traffic.
    pub fn with_conn<T>(&self, body: impl FnOnce(&mut Connection) -> T) -> T {
        let mut guard = self.conn.lock();
        body(&mut guard)
    }

    /// Run `body` on the blocking pool with exclusive access to the
    /// connection.
    pub async fn call<T, F>(&self, body: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, DriverError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            body(&mut guard)
        })
        .await
        .map_err(|e| DriverError::Task(e.to_string()))?
    }
}

impl std::fmt::Debug for EmbeddedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl TableStore for EmbeddedStore {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn select(&self, table: &'static TableSchema, filter: Filter) -> Result<Vec<Row>, DriverError> {
        self.call(move |conn| {
            let stmt = sql::select(Dialect::Sqlite, table, &filter)?;
            query_rows(conn, table, &stmt)
        })
        .await
    }

    async fn scan(
        &self,
        table: &'static TableSchema,
        after: Option<Value>,
        limit: usize,
    ) -> Result<Vec<Row>, DriverError> {
        self.call(move |conn| {
            let stmt = sql::scan(Dialect::Sqlite, table, after.as_ref(), limit)?;
            query_rows(conn, table, &stmt)
        })
        .await
    }

    async fn count(&self, table: &'static TableSchema) -> Result<u64, DriverError> {
        self.call(move |conn| {
            let count: i64 = conn.query_row(&sql::count(table), [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn insert(&self, table: &'static TableSchema, row: Row) -> Result<Row, DriverError> {
        self.call(move |conn| {
            let stmt = sql::insert(Dialect::Sqlite, table, &row)?;
            single(query_rows(conn, table, &stmt)?)
        })
        .await
    }

    async fn upsert(&self, table: &'static TableSchema, row: Row) -> Result<Row, DriverError> {
        self.call(move |conn| {
            let stmt = sql::upsert(Dialect::Sqlite, table, &row)?;
            single(query_rows(conn, table, &stmt)?)
        })
        .await
    }

    async fn update(
        &self,
        table: &'static TableSchema,
        filter: Filter,
        values: Row,
    ) -> Result<Vec<Row>, DriverError> {
        self.call(move |conn| {
            let stmt = sql::update(Dialect::Sqlite, table, &filter, &values)?;
            query_rows(conn, table, &stmt)
        })
        .await
    }

    async fn delete(&self, table: &'static TableSchema, filter: Filter) -> Result<Vec<Row>, DriverError> {
        self.call(move |conn| {
            let stmt = sql::delete(Dialect::Sqlite, table, &filter)?;
            query_rows(conn, table, &stmt)
        })
        .await
    }

    async fn ensure_table(&self, table: &'static TableSchema) -> Result<(), DriverError> {
        self.call(move |conn| {
            conn.execute_batch(&sql::create_table(Dialect::Sqlite, table))?;
            Ok(())
        })
        .await
    }

    async fn ensure_column(
        &self,
        table: &'static TableSchema,
        column: &'static ColumnDef,
    ) -> Result<ColumnOutcome, DriverError> {
        self.call(move |conn| {
            Ok(ensure_column(
                conn,
                table.name,
                column.name,
                column.ty.sqlite_type(),
            )?)
        })
        .await
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.call(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }

    async fn close(&self) {}
}
