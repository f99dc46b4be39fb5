//! Migration steps and the schema operations they are made of.
//!
//! Every operation is safe to re-run: DDL uses `IF NOT EXISTS`, columns go
//! through ensure-column, seeds insert only when absent, and restructures
//! check the current shape first.

use rusqlite::types::Value as SqliteValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::driver::embedded::{ensure_column, read_raw_rows, table_columns, table_exists};
use crate::driver::sql::quote;
use crate::driver::{ColumnOutcome, Row};

/// A migration step.
#[derive(Debug)]
pub struct MigrationStep {
    /// Stable ordinal. Steps apply in ascending order.
    pub ordinal: u32,
    pub description: &'static str,
    pub operations: &'static [SchemaOp],
    /// Whether the step can be replayed if it was only partially applied.
    pub idempotent: bool,
}

/// A single schema operation.
#[derive(Debug)]
pub enum SchemaOp {
    /// Raw DDL, written with `IF NOT EXISTS`.
    Sql(&'static str),
    /// Add a column unless present.
    EnsureColumn {
        table: &'static str,
        column: &'static str,
        declaration: &'static str,
    },
    /// Insert a row unless its key already exists.
    SeedRow {
        table: &'static str,
        values: &'static [(&'static str, &'static str)],
    },
    /// Rebuild a table into a new shape.
    Restructure(Restructure),
}

/// Rebuild of a table whose shape cannot be reached additively.
///
/// Applies when the table exists and lacks `marker_column`, or when an aside
/// table from an interrupted run is still present. The old table is renamed
/// aside, `create_sql` builds the new one, and each old row is passed through
/// `transform` and inserted unless its `key_column` value is already there.
/// Rows it rejects are logged and dropped. An aside table is dropped only
/// after all of its rows have been transplanted.
pub struct Restructure {
    pub table: &'static str,
    /// Column identifying a row in both shapes.
    pub key_column: &'static str,
    /// Column present only in the new shape.
    pub marker_column: &'static str,
    /// CREATE statement for the new shape.
    pub create_sql: &'static str,
    pub transform: fn(&Row) -> Option<Row>,
}

impl std::fmt::Debug for Restructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Restructure")
            .field("table", &self.table)
            .field("key_column", &self.key_column)
            .field("marker_column", &self.marker_column)
            .finish_non_exhaustive()
    }
}

/// Counters from applying one step.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StepStats {
    pub columns_added: usize,
    pub rows_seeded: usize,
    pub rows_restructured: usize,
    pub rows_dropped: usize,
}

impl MigrationStep {
    /// Apply every operation on `conn`, normally an open transaction.
    pub fn apply(&self, conn: &Connection) -> rusqlite::Result<StepStats> {
        let mut stats = StepStats::default();
        for op in self.operations {
            op.apply(conn, &mut stats)?;
        }
        Ok(stats)
    }
}

impl SchemaOp {
    fn apply(&self, conn: &Connection, stats: &mut StepStats) -> rusqlite::Result<()> {
        match self {
            SchemaOp::Sql(sql) => conn.execute_batch(sql),
            SchemaOp::EnsureColumn {
                table,
                column,
                declaration,
            } => {
                if ensure_column(conn, table, column, declaration)? == ColumnOutcome::Added {
                    stats.columns_added += 1;
                }
                Ok(())
            }
            SchemaOp::SeedRow { table, values } => {
                let columns: Vec<String> = values.iter().map(|(c, _)| quote(c)).collect();
                let placeholders: Vec<String> =
                    (1..=values.len()).map(|i| format!("?{i}")).collect();
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
                    quote(table),
                    columns.join(", "),
                    placeholders.join(", ")
                );
                stats.rows_seeded +=
                    conn.execute(&sql, params_from_iter(values.iter().map(|(_, v)| *v)))?;
                Ok(())
            }
            SchemaOp::Restructure(restructure) => restructure.apply(conn, stats),
        }
    }
}

impl Restructure {
    fn apply(&self, conn: &Connection, stats: &mut StepStats) -> rusqlite::Result<()> {
        let aside = format!("{}__legacy", self.table);
        let mut sources = aside_tables(conn, &aside)?;

        let columns = table_columns(conn, self.table)?;
        let old_shape = !columns.is_empty() && !columns.iter().any(|c| c == self.marker_column);
        if sources.is_empty() && !old_shape {
            return conn.execute_batch(self.create_sql);
        }
        if !sources.is_empty() {
            debug!(table = self.table, sources = sources.len(), "resuming interrupted restructure");
        }

        if old_shape {
            // An earlier attempt may still own `aside`; never overwrite it.
            let target = std::iter::once(aside.clone())
                .chain((1..).map(|n| format!("{aside}_{n}")))
                .find(|name| !sources.contains(name))
                .unwrap_or_default();
            conn.execute_batch(&format!(
                "ALTER TABLE {} RENAME TO {}",
                quote(self.table),
                quote(&target)
            ))?;
            sources.push(target);
        }
        conn.execute_batch(self.create_sql)?;

        for source in &sources {
            for old in read_raw_rows(conn, source)? {
                let Some(new) = (self.transform)(&old) else {
                    let row = Value::Object(old);
                    warn!(table = self.table, row = %row, "dropping row that cannot be converted");
                    stats.rows_dropped += 1;
                    continue;
                };
                if let Some(key) = new.get(self.key_column) {
                    if key_present(conn, self.table, self.key_column, key)? {
                        continue;
                    }
                }
                match insert_raw(conn, self.table, &new) {
                    Ok(()) => stats.rows_restructured += 1,
                    Err(e) => {
                        let row = Value::Object(new);
                        warn!(table = self.table, error = %e, row = %row, "dropping row rejected by new shape");
                        stats.rows_dropped += 1;
                    }
                }
            }
            conn.execute_batch(&format!("DROP TABLE {}", quote(source)))?;
        }

        info!(
            table = self.table,
            kept = stats.rows_restructured,
            dropped = stats.rows_dropped,
            "table restructured"
        );
        Ok(())
    }
}

/// Aside tables left by this or an interrupted restructure, oldest first.
fn aside_tables(conn: &Connection, aside: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND (name = ?1 OR name GLOB ?1 || '_[0-9]*')
         ORDER BY length(name), name",
    )?;
    let names = stmt
        .query_map([aside], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

fn key_present(conn: &Connection, table: &str, column: &str, key: &Value) -> rusqlite::Result<bool> {
    if key.is_null() {
        return Ok(false);
    }
    conn.query_row(
        &format!("SELECT 1 FROM {} WHERE {} = ?1", quote(table), quote(column)),
        [to_sqlite(key)],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

/// Convert a JSON value for a raw insert.
pub fn to_sqlite(value: &Value) -> SqliteValue {
    match value {
        Value::Null => SqliteValue::Null,
        Value::Bool(b) => SqliteValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqliteValue::Integer(i),
            None => SqliteValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqliteValue::Text(s.clone()),
        other => SqliteValue::Text(other.to_string()),
    }
}

/// Insert a row whose keys are trusted column names.
pub fn insert_raw(conn: &Connection, table: &str, row: &Row) -> rusqlite::Result<()> {
    let columns: Vec<String> = row.keys().map(|c| quote(c)).collect();
    let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(table),
        columns.join(", "),
        placeholders.join(", ")
    );
    conn.execute(&sql, params_from_iter(row.values().map(to_sqlite)))?;
    Ok(())
}
