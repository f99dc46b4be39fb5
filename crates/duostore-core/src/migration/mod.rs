//! Forward-only schema migrations for the embedded engine.
//!
//! - [`VersionLedger`]: the single persisted version number
//! - [`MIGRATIONS`]: the ordered step registry
//! - [`MigrationRunner`]: applies pending steps, one transaction per step
//! - [`SchemaRepairProbe`]: rebuilds drifted settings tables after the runner
//!
//! # Example
//!
//! ```ignore
//! let mut conn = rusqlite::Connection::open("duostore.db")?;
//! let report = MigrationRunner::new().run(&mut conn)?;
//! println!("schema at version {}", report.end_version);
//! SchemaRepairProbe::new().run(&mut conn)?;
//! ```

pub mod error;
pub mod ledger;
pub mod registry;
pub mod repair;
pub mod runner;
pub mod step;

pub use error::MigrationError;
pub use ledger::{HistoryEntry, VersionLedger};
pub use registry::{validate_registry, MIGRATIONS};
pub use repair::{RepairOutcome, RepairReport, SchemaRepairProbe};
pub use runner::{MigrationReport, MigrationRunner, RunnerState};
pub use step::{MigrationStep, Restructure, SchemaOp};
