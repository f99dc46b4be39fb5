//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use duostore_core::catalog::{ColumnDef, TableSchema};
use duostore_core::driver::{ColumnOutcome, Dialect};
use duostore_core::{
    Connector, DriverError, EmbeddedStore, EngineConfig, Filter, Row, Storage, StorageConfig,
    TableStore,
};

/// An in-memory SQLite store standing in for PostgreSQL.
///
/// Records every table it is asked about, can be slowed down, can be told
/// to fail upserts after a number of successes, and can keep reporting a
/// missing column however often it is provisioned.
pub struct FakeExternal {
    inner: EmbeddedStore,
    calls: Mutex<Vec<String>>,
    delay: Mutex<Duration>,
    upserts: AtomicUsize,
    fail_upserts_after: AtomicUsize,
    inserts: AtomicUsize,
    missing_column: Mutex<Option<String>>,
}

impl FakeExternal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: EmbeddedStore::open_in_memory().unwrap(),
            calls: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            upserts: AtomicUsize::new(0),
            fail_upserts_after: AtomicUsize::new(usize::MAX),
            inserts: AtomicUsize::new(0),
            missing_column: Mutex::new(None),
        })
    }

    pub fn inner(&self) -> &EmbeddedStore {
        &self.inner
    }

    /// Distinct table names this store has been asked about.
    pub fn touched_tables(&self) -> Vec<String> {
        let mut tables = self.calls.lock().clone();
        tables.sort();
        tables.dedup();
        tables
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn fail_upserts_after(&self, successes: usize) {
        self.upserts.store(0, Ordering::SeqCst);
        self.fail_upserts_after.store(successes, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.fail_upserts_after.store(usize::MAX, Ordering::SeqCst);
        *self.missing_column.lock() = None;
    }

    /// Fail every insert as if `column` were absent, even after provisioning.
    pub fn keep_missing_column(&self, column: &str) {
        self.inserts.store(0, Ordering::SeqCst);
        *self.missing_column.lock() = Some(column.to_string());
    }

    pub fn insert_attempts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    /// Run raw SQL against the backing database.
    pub fn execute(&self, sql: &str) {
        self.inner.with_conn(|conn| conn.execute_batch(sql)).unwrap();
    }

    async fn enter(&self, table: &TableSchema) {
        self.calls.lock().push(table.name.to_string());
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl TableStore for FakeExternal {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn select(&self, table: &'static TableSchema, filter: Filter) -> Result<Vec<Row>, DriverError> {
        self.enter(table).await;
        self.inner.select(table, filter).await
    }

    async fn scan(
        &self,
        table: &'static TableSchema,
        after: Option<Value>,
        limit: usize,
    ) -> Result<Vec<Row>, DriverError> {
        self.enter(table).await;
        self.inner.scan(table, after, limit).await
    }

    async fn count(&self, table: &'static TableSchema) -> Result<u64, DriverError> {
        self.enter(table).await;
        self.inner.count(table).await
    }

    async fn insert(&self, table: &'static TableSchema, row: Row) -> Result<Row, DriverError> {
        self.enter(table).await;
        self.inserts.fetch_add(1, Ordering::SeqCst);
        if let Some(column) = self.missing_column.lock().clone() {
            return Err(DriverError::MissingColumn(Some(column)));
        }
        self.inner.insert(table, row).await
    }

    async fn upsert(&self, table: &'static TableSchema, row: Row) -> Result<Row, DriverError> {
        self.enter(table).await;
        let limit = self.fail_upserts_after.load(Ordering::SeqCst);
        if self.upserts.fetch_add(1, Ordering::SeqCst) >= limit {
            return Err(DriverError::Other("connection reset by peer".to_string()));
        }
        self.inner.upsert(table, row).await
    }

    async fn update(
        &self,
        table: &'static TableSchema,
        filter: Filter,
        values: Row,
    ) -> Result<Vec<Row>, DriverError> {
        self.enter(table).await;
        self.inner.update(table, filter, values).await
    }

    async fn delete(&self, table: &'static TableSchema, filter: Filter) -> Result<Vec<Row>, DriverError> {
        self.enter(table).await;
        self.inner.delete(table, filter).await
    }

    async fn ensure_table(&self, table: &'static TableSchema) -> Result<(), DriverError> {
        self.calls.lock().push(table.name.to_string());
        self.inner.ensure_table(table).await
    }

    async fn ensure_column(
        &self,
        table: &'static TableSchema,
        column: &'static ColumnDef,
    ) -> Result<ColumnOutcome, DriverError> {
        self.calls.lock().push(table.name.to_string());
        self.inner.ensure_column(table, column).await
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.inner.ping().await
    }

    // Survives pool retirement so tests can inspect it afterwards.
    async fn close(&self) {}
}

/// Hands out the same [`FakeExternal`] on every connect.
pub struct FakeConnector(pub Arc<FakeExternal>);

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        _config: &EngineConfig,
        _settings: &StorageConfig,
    ) -> Result<Arc<dyn TableStore>, DriverError> {
        Ok(Arc::clone(&self.0) as Arc<dyn TableStore>)
    }
}

/// Never connects.
pub struct UnreachableConnector;

#[async_trait]
impl Connector for UnreachableConnector {
    async fn connect(
        &self,
        _config: &EngineConfig,
        _settings: &StorageConfig,
    ) -> Result<Arc<dyn TableStore>, DriverError> {
        Err(DriverError::Other("connection refused".to_string()))
    }
}

pub fn external_config() -> EngineConfig {
    EngineConfig::external("db.internal", "billing", "billing").with_password("hunter2")
}

/// A storage instance on a temporary data directory.
pub struct TestContext {
    pub storage: Storage,
    pub external: Arc<FakeExternal>,
    pub dir: tempfile::TempDir,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_settings(|config| config).await
    }

    pub async fn with_settings(tune: impl FnOnce(StorageConfig) -> StorageConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let external = FakeExternal::new();
        let config = tune(StorageConfig::new(dir.path().join("data").join("duostore.db")));
        let storage = Storage::initialize_with(config, Arc::new(FakeConnector(Arc::clone(&external))))
            .await
            .unwrap();
        Self {
            storage,
            external,
            dir,
        }
    }

    /// Switch the storage to the fake external engine.
    pub async fn go_external(&self) {
        self.storage.apply_engine_config(external_config()).await.unwrap();
    }
}

pub fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}
