//! Duostore Core - migrations, engine selection and table routing.
//!
//! This crate owns the embedded SQLite database, keeps its schema current
//! with forward-only migrations, and routes table operations to either the
//! embedded engine or an external PostgreSQL engine.

pub mod bulk;
pub mod catalog;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod migration;
pub mod router;
pub mod storage;

pub use bulk::{BulkMigrator, BulkReport, TableOutcome};
pub use catalog::{Classification, ColumnDef, ColumnType, TableSchema};
pub use config::StorageConfig;
pub use driver::{DriverError, EmbeddedStore, Filter, PostgresStore, Row, TableStore};
pub use engine::{
    Connector, EngineConfig, EngineKind, EngineSelector, EngineStatus, ExternalStatus,
    PostgresConnector, ReloadOutcome,
};
pub use error::{Error, StorageError};
pub use migration::{
    MigrationError, MigrationReport, MigrationRunner, RepairOutcome, RepairReport,
    SchemaRepairProbe,
};
pub use router::{Operation, Params, StorageRouter};
pub use storage::{BootReport, Storage};
