//! The version ledger and migration history.
//!
//! The ledger is a single row holding the highest fully-applied step. It is
//! written only through [`VersionLedger::advance`], a compare-and-set that
//! never moves backwards.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;

use super::error::MigrationError;

const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS schema_ledger (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        version INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS schema_history (
        ordinal INTEGER PRIMARY KEY,
        description TEXT NOT NULL,
        applied_at TEXT NOT NULL
    );
";

/// One applied step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub ordinal: u32,
    pub description: String,
    /// RFC 3339 timestamp.
    pub applied_at: String,
}

/// View of the ledger on a connection or open transaction.
pub struct VersionLedger<'c> {
    conn: &'c Connection,
}

impl<'c> VersionLedger<'c> {
    /// Wrap a connection, creating the ledger tables if needed.
    pub fn open(conn: &'c Connection) -> Result<Self, MigrationError> {
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self { conn })
    }

    /// Read the version, creating the row with 0 on first use.
    pub fn read(&self) -> Result<u32, MigrationError> {
        self.conn.execute(
            "INSERT INTO schema_ledger (id, version) VALUES (1, 0) ON CONFLICT (id) DO NOTHING",
            [],
        )?;
        let version: i64 =
            self.conn
                .query_row("SELECT version FROM schema_ledger WHERE id = 1", [], |row| {
                    row.get(0)
                })?;
        u32::try_from(version).map_err(|_| MigrationError::CorruptLedger { stored: version })
    }

    /// Move the ledger from `expected` to `new_version`.
    ///
    /// Fails if the stored value is not `expected` or if `new_version` does
    /// not move forward.
    pub fn advance(&self, expected: u32, new_version: u32) -> Result<(), MigrationError> {
        if new_version <= expected {
            return Err(MigrationError::NonMonotonic {
                from: expected,
                to: new_version,
            });
        }
        let changed = self.conn.execute(
            "UPDATE schema_ledger SET version = ?2 WHERE id = 1 AND version = ?1",
            params![expected, new_version],
        )?;
        if changed == 1 {
            return Ok(());
        }
        let found = self.read()?;
        Err(MigrationError::ConcurrentModification { expected, found })
    }

    /// Record an applied step.
    pub fn record(&self, ordinal: u32, description: &str) -> Result<(), MigrationError> {
        self.conn.execute(
            "INSERT INTO schema_history (ordinal, description, applied_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (ordinal) DO UPDATE SET description = excluded.description,
                 applied_at = excluded.applied_at",
            params![ordinal, description, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Applied steps in ordinal order.
    pub fn history(&self) -> Result<Vec<HistoryEntry>, MigrationError> {
        let mut stmt = self
            .conn
            .prepare("SELECT ordinal, description, applied_at FROM schema_history ORDER BY ordinal")?;
        let entries = stmt
            .query_map([], |row| {
                Ok(HistoryEntry {
                    ordinal: row.get(0)?,
                    description: row.get(1)?,
                    applied_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}
