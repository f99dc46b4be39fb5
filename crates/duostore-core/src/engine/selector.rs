//! The engine selector: owned process state for the active engine.
//!
//! Readers take a snapshot with [`EngineSelector::current`]. Reloads are
//! serialized and replace the snapshot wholesale; a snapshot that says
//! external always carries its pool.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use super::config::{EngineConfig, EngineKind};
use super::pool::ExternalPool;
use crate::catalog::migratable_tables;
use crate::config::StorageConfig;
use crate::driver::{DriverError, PostgresStore, TableStore};
use crate::error::Error;

/// Opens external stores.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        config: &EngineConfig,
        settings: &StorageConfig,
    ) -> Result<Arc<dyn TableStore>, DriverError>;
}

/// Connects to PostgreSQL.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresConnector;

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(
        &self,
        config: &EngineConfig,
        settings: &StorageConfig,
    ) -> Result<Arc<dyn TableStore>, DriverError> {
        let store =
            PostgresStore::connect(config, settings.pool_size, settings.acquire_timeout).await?;
        Ok(Arc::new(store))
    }
}

/// Where migratable traffic goes.
#[derive(Debug, Clone)]
pub enum Backend {
    Embedded,
    External(Arc<ExternalPool>),
}

/// A published engine snapshot.
#[derive(Debug, Clone)]
pub struct ActiveEngine {
    pub backend: Backend,
    /// The configuration this snapshot was built from.
    pub config: EngineConfig,
    /// Why an external configuration is being served by the embedded engine.
    pub fallback_reason: Option<String>,
}

impl ActiveEngine {
    fn embedded(config: EngineConfig, fallback_reason: Option<String>) -> Self {
        Self {
            backend: Backend::Embedded,
            config,
            fallback_reason,
        }
    }

    pub fn kind(&self) -> EngineKind {
        match self.backend {
            Backend::Embedded => EngineKind::Embedded,
            Backend::External(_) => EngineKind::External,
        }
    }

    /// The external pool, if external is active and the pool still accepts
    /// leases.
    pub fn external_pool(&self) -> Option<&Arc<ExternalPool>> {
        match &self.backend {
            Backend::External(pool) if !pool.is_retired() => Some(pool),
            _ => None,
        }
    }
}

/// Result of a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Same configuration as the active one; nothing changed.
    Unchanged,
    /// Embedded engine published.
    Embedded,
    /// External engine connected, provisioned and published.
    External,
    /// The external engine could not be brought up; embedded published.
    FellBack { reason: String },
}

/// Administrative view of the external engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalStatus {
    /// Whether the persisted configuration asks for the external engine.
    pub configured: bool,
    pub pool_active: bool,
    pub reachable: bool,
    pub last_error: Option<String>,
}

/// Administrative view of the storage engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    /// Engine currently serving migratable tables.
    pub engine: EngineKind,
    pub external: ExternalStatus,
}

/// Owns the active engine and its external pool.
pub struct EngineSelector {
    active: RwLock<Arc<ActiveEngine>>,
    reload_lock: Mutex<()>,
    connector: Arc<dyn Connector>,
    settings: StorageConfig,
}

impl EngineSelector {
    /// Start on the embedded engine.
    pub fn new(connector: Arc<dyn Connector>, settings: StorageConfig) -> Self {
        Self {
            active: RwLock::new(Arc::new(ActiveEngine::embedded(EngineConfig::embedded(), None))),
            reload_lock: Mutex::new(()),
            connector,
            settings,
        }
    }

    /// Snapshot of the active engine.
    pub fn current(&self) -> Arc<ActiveEngine> {
        Arc::clone(&self.active.read())
    }

    fn publish(&self, engine: ActiveEngine) -> Arc<ActiveEngine> {
        std::mem::replace(&mut *self.active.write(), Arc::new(engine))
    }

    /// Apply a configuration.
    ///
    /// The old pool is retired before the new one is connected; traffic is
    /// served by the embedded engine in between. Connection failures are not
    /// errors: the embedded engine is published with the reason recorded.
    #[instrument(skip_all, fields(engine = %config.engine))]
    pub async fn reload(&self, config: EngineConfig) -> Result<ReloadOutcome, Error> {
        config.validate()?;
        let _guard = self.reload_lock.lock().await;

        let current = self.current();
        if current.config == config && current.fallback_reason.is_none() {
            return Ok(ReloadOutcome::Unchanged);
        }

        let previous = self.publish(ActiveEngine::embedded(config.clone(), None));
        if let Backend::External(pool) = &previous.backend {
            pool.retire();
            let pool = Arc::clone(pool);
            tokio::spawn(async move { pool.drain_and_close().await });
        }

        if !config.is_external() {
            info!("embedded engine active");
            return Ok(ReloadOutcome::Embedded);
        }

        match self.bring_up(&config).await {
            Ok(pool) => {
                self.publish(ActiveEngine {
                    backend: Backend::External(pool),
                    config,
                    fallback_reason: None,
                });
                info!("external engine active");
                Ok(ReloadOutcome::External)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(error = %reason, "external engine unreachable, serving from embedded");
                self.publish(ActiveEngine::embedded(config, Some(reason.clone())));
                Ok(ReloadOutcome::FellBack { reason })
            }
        }
    }

    async fn bring_up(&self, config: &EngineConfig) -> Result<Arc<ExternalPool>, DriverError> {
        let connect = self.connector.connect(config, &self.settings);
        let store = tokio::time::timeout(self.settings.acquire_timeout, connect)
            .await
            .map_err(|_| DriverError::AcquireTimeout)??;

        if let Err(e) = provision(store.as_ref()).await {
            store.close().await;
            return Err(e);
        }

        Ok(ExternalPool::new(
            store,
            self.settings.pool_size as usize,
            self.settings.queue_depth,
            self.settings.acquire_timeout,
        ))
    }

    /// Current status, pinging the external engine when it is active.
    pub async fn status(&self) -> EngineStatus {
        let active = self.current();
        let mut external = ExternalStatus {
            configured: active.config.is_external(),
            pool_active: active.external_pool().is_some(),
            reachable: false,
            last_error: active.fallback_reason.clone(),
        };
        if let Some(pool) = active.external_pool() {
            let ping = async {
                let lease = pool.lease(None).await?;
                lease.ping().await
            };
            match tokio::time::timeout(self.settings.acquire_timeout, ping).await {
                Ok(Ok(())) => external.reachable = true,
                Ok(Err(e)) => external.last_error = Some(e.to_string()),
                Err(_) => external.last_error = Some("ping timed out".to_string()),
            }
        }
        EngineStatus {
            engine: active.kind(),
            external,
        }
    }

    /// Retire the external pool, if any, and wait for it to close.
    pub async fn shutdown(&self) {
        let _guard = self.reload_lock.lock().await;
        let config = self.current().config.clone();
        let previous = self.publish(ActiveEngine::embedded(config, None));
        if let Backend::External(pool) = &previous.backend {
            pool.drain_and_close().await;
        }
    }

    pub fn settings(&self) -> &StorageConfig {
        &self.settings
    }
}

/// Create every migratable table and column on a freshly connected store.
async fn provision(store: &dyn TableStore) -> Result<(), DriverError> {
    store.ping().await?;
    for table in migratable_tables() {
        store.provision(table).await?;
    }
    Ok(())
}
