//! Storage drivers.
//!
//! Both engines implement [`TableStore`]: the embedded SQLite store and the
//! external PostgreSQL pool. The router and bulk migrator only see the
//! trait.

pub mod embedded;
pub mod external;
pub mod sql;
pub mod value;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::catalog::{ColumnDef, TableSchema};

pub use embedded::EmbeddedStore;
pub use external::PostgresStore;
pub use sql::Dialect;
pub use value::SqlValue;

/// A row as a column-name to value map.
pub type Row = serde_json::Map<String, Value>;

/// Driver-level errors.
#[derive(Debug, Error)]
pub enum DriverError {
    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    /// PostgreSQL error.
    #[error("postgres error: {0}")]
    Postgres(sqlx::Error),

    /// The engine's table lacks a column the statement uses.
    #[error("column missing from engine schema: {}", .0.as_deref().unwrap_or("<unknown>"))]
    MissingColumn(Option<String>),

    /// The engine has no such table.
    #[error("table missing from engine schema")]
    MissingTable,

    /// The request names a column the registry does not know.
    #[error("unknown column: {0}")]
    UnknownColumn(String),

    /// A value cannot be converted to the column type.
    #[error("invalid value for column {column}: {reason}")]
    InvalidValue {
        /// Column name.
        column: String,
        /// Why the conversion failed.
        reason: String,
    },

    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidInput(String),

    /// The pool was retired by a reload.
    #[error("connection pool closed")]
    PoolClosed,

    /// Too many callers are already waiting for a connection.
    #[error("connection pool wait queue is full")]
    QueueFull,

    /// Waited too long for a pooled connection.
    #[error("timed out waiting for a pooled connection")]
    AcquireTimeout,

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),

    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// Whether the error was caused by the request rather than the engine.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            DriverError::UnknownColumn(_)
                | DriverError::InvalidValue { .. }
                | DriverError::InvalidInput(_)
        )
    }

    /// Whether an additive schema change could fix the error.
    pub fn is_schema_gap(&self) -> bool {
        matches!(self, DriverError::MissingColumn(_) | DriverError::MissingTable)
    }
}

impl From<rusqlite::Error> for DriverError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(_, Some(message)) = &err {
            if let Some(column) = message
                .split_once("has no column named ")
                .or_else(|| message.split_once("no such column: "))
                .map(|(_, column)| column.trim().to_string())
            {
                return DriverError::MissingColumn(Some(column));
            }
            if message.starts_with("no such table") {
                return DriverError::MissingTable;
            }
        }
        DriverError::Sqlite(err)
    }
}

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // undefined_column
                Some("42703") => DriverError::MissingColumn(None),
                // undefined_table
                Some("42P01") => DriverError::MissingTable,
                _ => DriverError::Postgres(err),
            },
            sqlx::Error::PoolTimedOut => DriverError::AcquireTimeout,
            sqlx::Error::PoolClosed => DriverError::PoolClosed,
            _ => DriverError::Postgres(err),
        }
    }
}

/// Row selection for reads, updates and deletes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Primary key value.
    pub id: Option<Value>,
    /// Tenant identifier matched against the table's scope column.
    pub scope: Option<String>,
}

impl Filter {
    /// Every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// A single row by primary key.
    pub fn by_id(id: Value) -> Self {
        Self {
            id: Some(id),
            scope: None,
        }
    }

    /// Restrict to one tenant.
    pub fn with_scope(mut self, tenant: impl Into<String>) -> Self {
        self.scope = Some(tenant.into());
        self
    }
}

/// Result of an idempotent column check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnOutcome {
    /// The column was created.
    Added,
    /// The column already existed; nothing changed.
    AlreadyPresent,
}

/// Table-level operations implemented by each engine.
#[async_trait]
pub trait TableStore: Send + Sync + 'static {
    /// SQL dialect spoken by this store.
    fn dialect(&self) -> Dialect;

    async fn select(&self, table: &'static TableSchema, filter: Filter) -> Result<Vec<Row>, DriverError>;

    /// Up to `limit` rows with primary key greater than `after`, in key order.
    async fn scan(
        &self,
        table: &'static TableSchema,
        after: Option<Value>,
        limit: usize,
    ) -> Result<Vec<Row>, DriverError>;

    async fn count(&self, table: &'static TableSchema) -> Result<u64, DriverError>;

    async fn insert(&self, table: &'static TableSchema, row: Row) -> Result<Row, DriverError>;

    /// Insert or update on primary key conflict.
    async fn upsert(&self, table: &'static TableSchema, row: Row) -> Result<Row, DriverError>;

    async fn update(
        &self,
        table: &'static TableSchema,
        filter: Filter,
        values: Row,
    ) -> Result<Vec<Row>, DriverError>;

    async fn delete(&self, table: &'static TableSchema, filter: Filter) -> Result<Vec<Row>, DriverError>;

    /// Create the table if it does not exist.
    async fn ensure_table(&self, table: &'static TableSchema) -> Result<(), DriverError>;

    /// Add the column if it does not exist.
    async fn ensure_column(
        &self,
        table: &'static TableSchema,
        column: &'static ColumnDef,
    ) -> Result<ColumnOutcome, DriverError>;

    /// Create the table and every registered column.
    async fn provision(&self, table: &'static TableSchema) -> Result<(), DriverError> {
        self.ensure_table(table).await?;
        for column in table.columns {
            self.ensure_column(table, column).await?;
        }
        Ok(())
    }

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), DriverError>;

    /// Release engine resources. Waits for in-use connections.
    async fn close(&self);
}
