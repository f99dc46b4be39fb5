//! Applies pending migration steps against the embedded engine.

use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{error, info, instrument};

use super::error::MigrationError;
use super::ledger::VersionLedger;
use super::registry::{highest_ordinal, validate_registry, MIGRATIONS};
use super::step::MigrationStep;

/// Runner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    Scanning,
    /// Applying the step with this ordinal.
    Applying(u32),
    /// A step failed. The process must not serve traffic.
    Failed(u32),
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerState::Idle => write!(f, "idle"),
            RunnerState::Scanning => write!(f, "scanning"),
            RunnerState::Applying(n) => write!(f, "applying({n})"),
            RunnerState::Failed(n) => write!(f, "failed({n})"),
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Ledger version before the run.
    pub start_version: u32,
    /// Ledger version after the run.
    pub end_version: u32,
    /// Ordinals applied by this run, ascending.
    pub applied: Vec<u32>,
    pub state: RunnerState,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Forward-only migration runner.
///
/// Each pending step runs in its own IMMEDIATE transaction together with the
/// ledger advance and the history row, so a step is either fully applied
/// and recorded or not at all.
pub struct MigrationRunner {
    steps: &'static [MigrationStep],
    transactional_ddl: bool,
    state: RunnerState,
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationRunner {
    /// Runner over the built-in registry.
    pub fn new() -> Self {
        Self::with_steps(MIGRATIONS)
    }

    pub fn with_steps(steps: &'static [MigrationStep]) -> Self {
        Self {
            steps,
            transactional_ddl: true,
            state: RunnerState::Idle,
        }
    }

    /// Declare whether the engine rolls back DDL. SQLite does.
    pub fn transactional_ddl(mut self, supported: bool) -> Self {
        self.transactional_ddl = supported;
        self
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn highest_ordinal(&self) -> u32 {
        highest_ordinal(self.steps)
    }

    /// Steps that a run would apply, without applying them.
    pub fn pending(&self, conn: &Connection) -> Result<Vec<&'static MigrationStep>, MigrationError> {
        validate_registry(self.steps)?;
        let version = VersionLedger::open(conn)?.read()?;
        self.check_not_ahead(version)?;
        Ok(self.steps.iter().filter(|s| s.ordinal > version).collect())
    }

    fn check_not_ahead(&self, version: u32) -> Result<(), MigrationError> {
        let highest = self.highest_ordinal();
        if version > highest {
            return Err(MigrationError::LedgerAhead {
                stored: version,
                highest,
            });
        }
        Ok(())
    }

    /// Apply every pending step in ascending order.
    ///
    /// Stops at the first failure; later steps are not attempted and the
    /// ledger stays at the last fully applied step.
    #[instrument(skip_all)]
    pub fn run(&mut self, conn: &mut Connection) -> Result<MigrationReport, MigrationError> {
        self.state = RunnerState::Scanning;
        validate_registry(self.steps).inspect_err(|_| self.state = RunnerState::Failed(0))?;

        let start_version = VersionLedger::open(conn)?.read()?;
        if let Err(e) = self.check_not_ahead(start_version) {
            error!(error = %e, "refusing to run against a newer database");
            self.state = RunnerState::Failed(start_version);
            return Err(e);
        }

        let mut current = start_version;
        let mut applied = Vec::new();
        for step in self.steps.iter().filter(|s| s.ordinal > start_version) {
            self.state = RunnerState::Applying(step.ordinal);
            if let Err(e) = self.apply_step(conn, step, current) {
                error!(ordinal = step.ordinal, error = %e, "migration step failed");
                self.state = RunnerState::Failed(step.ordinal);
                return Err(e);
            }
            current = step.ordinal;
            applied.push(step.ordinal);
        }

        self.state = RunnerState::Idle;
        if applied.is_empty() {
            info!(version = current, "schema up to date");
        } else {
            info!(from = start_version, to = current, steps = applied.len(), "migrations applied");
        }
        Ok(MigrationReport {
            start_version,
            end_version: current,
            applied,
            state: self.state,
        })
    }

    fn apply_step(
        &self,
        conn: &mut Connection,
        step: &MigrationStep,
        current: u32,
    ) -> Result<(), MigrationError> {
        if !step.idempotent && !self.transactional_ddl {
            return Err(MigrationError::NotIdempotent {
                ordinal: step.ordinal,
            });
        }

        let failed = |e: rusqlite::Error| MigrationError::StepFailed {
            ordinal: step.ordinal,
            description: step.description,
            message: e.to_string(),
        };

        // Dropping the transaction without commit rolls it back.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(failed)?;
        let stats = step.apply(&tx).map_err(failed)?;
        let ledger = VersionLedger::open(&tx)?;
        ledger.advance(current, step.ordinal)?;
        ledger.record(step.ordinal, step.description)?;
        tx.commit().map_err(failed)?;

        info!(
            ordinal = step.ordinal,
            description = step.description,
            columns_added = stats.columns_added,
            rows_seeded = stats.rows_seeded,
            rows_dropped = stats.rows_dropped,
            "migration step applied"
        );
        Ok(())
    }
}
