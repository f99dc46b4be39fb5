//! The storage facade handed to collaborators.
//!
//! A [`Storage`] only exists after migrations and schema repair have
//! completed, so nothing can dispatch against an unmigrated database.

use std::sync::Arc;

use rusqlite::Connection;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::bulk::{BulkMigrator, BulkReport};
use crate::config::StorageConfig;
use crate::driver::embedded::apply_pragmas;
use crate::driver::{DriverError, EmbeddedStore, Row};
use crate::engine::{Connector, EngineConfig, EngineSelector, EngineStatus, PostgresConnector, ReloadOutcome};
use crate::error::{Error, StorageError};
use crate::migration::{MigrationReport, MigrationRunner, RepairReport, SchemaRepairProbe};
use crate::router::{Operation, Params, StorageRouter};

/// What happened at boot.
#[derive(Debug, Clone)]
pub struct BootReport {
    pub migrations: MigrationReport,
    pub repair: RepairReport,
    /// Outcome of applying the persisted engine configuration.
    pub engine: ReloadOutcome,
}

/// The storage layer.
pub struct Storage {
    config: StorageConfig,
    embedded: EmbeddedStore,
    selector: Arc<EngineSelector>,
    router: StorageRouter,
    boot: BootReport,
}

impl Storage {
    /// Boot against PostgreSQL as the external engine.
    pub async fn initialize(config: StorageConfig) -> Result<Self, Error> {
        Self::initialize_with(config, Arc::new(PostgresConnector)).await
    }

    /// Boot sequence: open the embedded database, run migrations, repair
    /// settings tables, then apply the persisted engine configuration.
    ///
    /// Migration and repair failures are fatal. An unreachable external
    /// engine is not: the embedded engine serves and the reason is recorded.
    #[instrument(skip_all, fields(path = %config.data_path.display()))]
    pub async fn initialize_with(config: StorageConfig, connector: Arc<dyn Connector>) -> Result<Self, Error> {
        if let Some(parent) = config.data_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let path = config.data_path.clone();
        let busy_timeout = config.busy_timeout;
        let (conn, migrations, repair, engine_config) = tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)?;
            apply_pragmas(&conn, busy_timeout)?;
            let migrations = MigrationRunner::new().run(&mut conn)?;
            let repair = SchemaRepairProbe::new().run(&mut conn)?;
            let engine_config = EngineConfig::load(&conn)?;
            Ok::<_, Error>((conn, migrations, repair, engine_config))
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        info!(
            version = migrations.end_version,
            applied = migrations.applied.len(),
            repaired = repair.repaired_any(),
            "embedded database ready"
        );

        let embedded = EmbeddedStore::from_connection(conn);
        let selector = Arc::new(EngineSelector::new(connector, config.clone()));
        let engine = match selector.reload(engine_config).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "stored engine configuration rejected, using embedded");
                ReloadOutcome::FellBack {
                    reason: e.to_string(),
                }
            }
        };

        let router = StorageRouter::new(Arc::clone(&selector), embedded.clone(), config.request_timeout);
        Ok(Self {
            config,
            embedded,
            selector,
            router,
            boot: BootReport {
                migrations,
                repair,
                engine,
            },
        })
    }

    /// Run one table operation with the default deadline.
    pub async fn dispatch(&self, table: &str, operation: Operation, params: Params) -> Result<Vec<Row>, Error> {
        self.router.dispatch(table, operation, params).await
    }

    /// Run one table operation with a caller deadline.
    pub async fn dispatch_until(
        &self,
        table: &str,
        operation: Operation,
        params: Params,
        deadline: Instant,
    ) -> Result<Vec<Row>, Error> {
        self.router.dispatch_until(table, operation, params, deadline).await
    }

    pub async fn engine_status(&self) -> EngineStatus {
        self.selector.status().await
    }

    /// Persist a new engine configuration, then reload the selector.
    ///
    /// The configuration stays persisted when the external engine cannot be
    /// reached; the embedded engine serves meanwhile and the next boot or
    /// apply retries.
    #[instrument(skip_all, fields(engine = %config.engine))]
    pub async fn apply_engine_config(&self, config: EngineConfig) -> Result<ReloadOutcome, Error> {
        config.validate()?;
        let persisted = config.clone();
        self.embedded
            .call(move |conn| Ok(persisted.save(conn)?))
            .await
            .map_err(|e| match e {
                DriverError::Sqlite(e) => Error::Embedded(e),
                other => Error::Storage(StorageError::new("settings", Operation::Update, other)),
            })?;

        match self.selector.reload(config).await? {
            ReloadOutcome::FellBack { reason } => Err(Error::EngineUnreachable(reason)),
            outcome => Ok(outcome),
        }
    }

    /// Copy the named tables to the active external engine.
    pub async fn run_bulk_migration(&self, tables: &[String]) -> Result<BulkReport, Error> {
        BulkMigrator::new(&self.embedded, &self.selector, self.config.bulk_batch_size)
            .copy_all(tables)
            .await
    }

    pub fn boot_report(&self) -> &BootReport {
        &self.boot
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// The embedded store, for collaborators that need raw access to
    /// embedded-only tables.
    pub fn embedded(&self) -> &EmbeddedStore {
        &self.embedded
    }

    /// Retire the external pool and wait for it to close.
    pub async fn close(&self) {
        self.selector.shutdown().await;
    }
}
