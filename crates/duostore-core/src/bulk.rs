//! One-shot copy of migratable tables from the embedded engine to the
//! external engine.
//!
//! Rows are paged by primary key and upserted, so an interrupted copy can be
//! re-run without duplicates. Tables are independent: a failure in one does
//! not roll back the others.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::catalog::{is_protected, lookup, TableSchema};
use crate::driver::{DriverError, EmbeddedStore, TableStore};
use crate::engine::{EngineSelector, ExternalPool};
use crate::error::Error;

/// Result of copying one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableOutcome {
    Copied { rows: u64 },
    /// The table may not be placed on the external engine.
    Refused { reason: String },
    Failed { reason: String },
}

impl TableOutcome {
    pub fn is_copied(&self) -> bool {
        matches!(self, TableOutcome::Copied { .. })
    }
}

/// Per-table outcomes keyed by requested table name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub tables: BTreeMap<String, TableOutcome>,
}

impl BulkReport {
    pub fn copied_rows(&self) -> u64 {
        self.tables
            .values()
            .map(|o| match o {
                TableOutcome::Copied { rows } => *rows,
                _ => 0,
            })
            .sum()
    }

    /// Tables worth retrying.
    pub fn failed(&self) -> impl Iterator<Item = &str> {
        self.tables
            .iter()
            .filter(|(_, o)| matches!(o, TableOutcome::Failed { .. }))
            .map(|(t, _)| t.as_str())
    }
}

/// Copies migratable tables to the active external engine.
pub struct BulkMigrator<'a> {
    embedded: &'a EmbeddedStore,
    selector: &'a EngineSelector,
    batch_size: usize,
}

impl<'a> BulkMigrator<'a> {
    pub fn new(embedded: &'a EmbeddedStore, selector: &'a EngineSelector, batch_size: usize) -> Self {
        Self {
            embedded,
            selector,
            batch_size: batch_size.max(1),
        }
    }

    /// Copy each requested table.
    ///
    /// Fails with [`Error::ExternalInactive`] unless the external engine is
    /// active. Names that are unknown, critical, protected or unclassified
    /// are refused and reported, never copied.
    #[instrument(skip_all, fields(tables = tables.len()))]
    pub async fn copy_all(&self, tables: &[String]) -> Result<BulkReport, Error> {
        let snapshot = self.selector.current();
        let pool = snapshot.external_pool().ok_or(Error::ExternalInactive)?;

        let mut report = BulkReport::default();
        for name in tables {
            if report.tables.contains_key(name) {
                continue;
            }
            let outcome = match eligible(name) {
                Err(reason) => {
                    warn!(table = %name, %reason, "table refused for bulk copy");
                    TableOutcome::Refused { reason }
                }
                Ok(table) => match self.copy_table(pool, table).await {
                    Ok(rows) => {
                        info!(table = table.name, rows, "table copied");
                        TableOutcome::Copied { rows }
                    }
                    Err(e) => {
                        warn!(table = table.name, error = %e, "table copy failed");
                        TableOutcome::Failed {
                            reason: e.to_string(),
                        }
                    }
                },
            };
            report.tables.insert(name.clone(), outcome);
        }
        Ok(report)
    }

    async fn copy_table(
        &self,
        pool: &Arc<ExternalPool>,
        table: &'static TableSchema,
    ) -> Result<u64, DriverError> {
        let external = pool.lease(Some(Instant::now() + self.selector.settings().acquire_timeout)).await?;
        external.provision(table).await?;

        let mut copied = 0;
        let mut after: Option<Value> = None;
        loop {
            let page = self.embedded.scan(table, after.clone(), self.batch_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = last.get(table.primary_key).cloned();
            let full_page = page.len() == self.batch_size;
            for row in page {
                external.upsert(table, row).await?;
                copied += 1;
            }
            if !full_page {
                break;
            }
        }
        Ok(copied)
    }
}

/// Re-check placement independently of the caller.
fn eligible(name: &str) -> Result<&'static TableSchema, String> {
    if is_protected(name) {
        return Err("protected table".to_string());
    }
    let table = lookup(name).ok_or_else(|| "unknown table".to_string())?;
    if table.is_critical() {
        return Err("critical table".to_string());
    }
    if !table.is_migratable() {
        return Err("table is not migratable".to_string());
    }
    Ok(table)
}
