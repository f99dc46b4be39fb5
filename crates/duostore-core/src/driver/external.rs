//! External PostgreSQL store.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Number, Value};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row as _};
use tracing::{debug, info};

use super::sql::{self, Dialect, Statement};
use super::value::SqlValue;
use super::{ColumnOutcome, DriverError, Filter, Row, TableStore};
use crate::catalog::{ColumnDef, ColumnType, TableSchema};
use crate::engine::EngineConfig;

/// Connection options for an external engine configuration.
pub fn connect_options(config: &EngineConfig) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .database(&config.database);
    if !config.password.is_empty() {
        options = options.password(&config.password);
    }
    options
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    binds: &'q [SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for value in binds {
        query = match value {
            SqlValue::Null(ColumnType::Text | ColumnType::Timestamp) => query.bind(None::<String>),
            SqlValue::Null(ColumnType::Integer) => query.bind(None::<i64>),
            SqlValue::Null(ColumnType::Real) => query.bind(None::<f64>),
            SqlValue::Null(ColumnType::Boolean) => query.bind(None::<bool>),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Real(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.as_str()),
            SqlValue::Bool(b) => query.bind(*b),
        };
    }
    query
}

fn decode_row(table: &TableSchema, row: &PgRow) -> Result<Row, DriverError> {
    let mut out = Row::new();
    for (index, column) in table.columns.iter().enumerate() {
        let value = match column.ty {
            ColumnType::Text | ColumnType::Timestamp => row
                .try_get::<Option<String>, _>(index)?
                .map(Value::String),
            ColumnType::Integer => row
                .try_get::<Option<i64>, _>(index)?
                .map(|i| Value::Number(i.into())),
            ColumnType::Real => row
                .try_get::<Option<f64>, _>(index)?
                .and_then(Number::from_f64)
                .map(Value::Number),
            ColumnType::Boolean => row.try_get::<Option<bool>, _>(index)?.map(Value::Bool),
        };
        out.insert(column.name.to_string(), value.unwrap_or(Value::Null));
    }
    Ok(out)
}

/// The external engine, backed by an sqlx pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect a pool of `pool_size` connections.
    ///
    /// One connection is opened eagerly so an unreachable server fails here.
    pub async fn connect(
        config: &EngineConfig,
        pool_size: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, DriverError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size.max(1))
            .acquire_timeout(acquire_timeout)
            .connect_with(connect_options(config))
            .await?;
        info!(host = %config.host, port = config.port, database = %config.database, "external pool connected");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, table: &TableSchema, stmt: Statement) -> Result<Vec<Row>, DriverError> {
        let rows = bind_all(sqlx::query(&stmt.sql), &stmt.binds)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| decode_row(table, row)).collect()
    }

    async fn fetch_one(&self, table: &TableSchema, stmt: Statement) -> Result<Row, DriverError> {
        self.fetch(table, stmt)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::Other("statement returned no row".to_string()))
    }

    async fn column_names(&self, table: &str) -> Result<Vec<String>, DriverError> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }
}

#[async_trait]
impl TableStore for PostgresStore {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn select(&self, table: &'static TableSchema, filter: Filter) -> Result<Vec<Row>, DriverError> {
        let stmt = sql::select(Dialect::Postgres, table, &filter)?;
        self.fetch(table, stmt).await
    }

    async fn scan(
        &self,
        table: &'static TableSchema,
        after: Option<Value>,
        limit: usize,
    ) -> Result<Vec<Row>, DriverError> {
        let stmt = sql::scan(Dialect::Postgres, table, after.as_ref(), limit)?;
        self.fetch(table, stmt).await
    }

    async fn count(&self, table: &'static TableSchema) -> Result<u64, DriverError> {
        let count: i64 = sqlx::query_scalar(&sql::count(table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn insert(&self, table: &'static TableSchema, row: Row) -> Result<Row, DriverError> {
        let stmt = sql::insert(Dialect::Postgres, table, &row)?;
        self.fetch_one(table, stmt).await
    }

    async fn upsert(&self, table: &'static TableSchema, row: Row) -> Result<Row, DriverError> {
        let stmt = sql::upsert(Dialect::Postgres, table, &row)?;
        self.fetch_one(table, stmt).await
    }

    async fn update(
        &self,
        table: &'static TableSchema,
        filter: Filter,
        values: Row,
    ) -> Result<Vec<Row>, DriverError> {
        let stmt = sql::update(Dialect::Postgres, table, &filter, &values)?;
        self.fetch(table, stmt).await
    }

    async fn delete(&self, table: &'static TableSchema, filter: Filter) -> Result<Vec<Row>, DriverError> {
        let stmt = sql::delete(Dialect::Postgres, table, &filter)?;
        self.fetch(table, stmt).await
    }

    async fn ensure_table(&self, table: &'static TableSchema) -> Result<(), DriverError> {
        sqlx::query(&sql::create_table(Dialect::Postgres, table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ensure_column(
        &self,
        table: &'static TableSchema,
        column: &'static ColumnDef,
    ) -> Result<ColumnOutcome, DriverError> {
        let existing = self.column_names(table.name).await?;
        if existing.is_empty() {
            return Err(DriverError::MissingTable);
        }
        if existing.iter().any(|c| c == column.name) {
            return Ok(ColumnOutcome::AlreadyPresent);
        }
        // Another provisioner may add it between the check and the ALTER.
        let statement = sql::add_column(Dialect::Postgres, table, column)
            .replacen("ADD COLUMN", "ADD COLUMN IF NOT EXISTS", 1);
        sqlx::query(&statement).execute(&self.pool).await?;
        debug!(table = table.name, column = column.name, "external column added");
        Ok(ColumnOutcome::Added)
    }

    async fn ping(&self) -> Result<(), DriverError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        debug!("external pool closed");
    }
}
