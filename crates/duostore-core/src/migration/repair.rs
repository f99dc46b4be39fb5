//! Boot-time repair of drifted key/value settings tables.
//!
//! Older releases and hand edits left some settings tables in shapes other
//! than `(key, value)`: renamed columns, or a single wide row with one
//! column per setting. The probe rebuilds such tables in place, keeping
//! every row it can interpret.

use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::error::MigrationError;
use crate::catalog::registry::{BILLING_SETTINGS, SETTINGS};
use crate::catalog::TableSchema;
use crate::driver::embedded::{ensure_column, read_raw_rows, table_columns, table_exists};
use crate::driver::sql::{create_table, quote, Dialect};
use crate::driver::Row;

/// Tables the probe is allowed to rebuild.
pub static REPAIR_ALLOW_LIST: &[&TableSchema] = &[&SETTINGS, &BILLING_SETTINGS];

const KEY_ALIASES: &[&str] = &["key", "name", "setting", "setting_key", "k"];
const VALUE_ALIASES: &[&str] = &["value", "val", "setting_value", "data", "v"];

/// What the probe did to one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairOutcome {
    /// Already in the mandatory shape.
    Healthy,
    /// The table was missing and has been created.
    Created,
    /// The table had drifted and was rebuilt.
    Rebuilt {
        transplanted: usize,
        skipped: usize,
    },
}

/// Per-table outcomes, in probe order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub tables: Vec<(String, RepairOutcome)>,
}

impl RepairReport {
    pub fn outcome(&self, table: &str) -> Option<&RepairOutcome> {
        self.tables.iter().find(|(t, _)| t == table).map(|(_, o)| o)
    }

    pub fn repaired_any(&self) -> bool {
        self.tables
            .iter()
            .any(|(_, o)| matches!(o, RepairOutcome::Rebuilt { .. }))
    }
}

/// Schema repair probe over the allow-list.
pub struct SchemaRepairProbe {
    tables: &'static [&'static TableSchema],
}

impl Default for SchemaRepairProbe {
    fn default() -> Self {
        Self {
            tables: REPAIR_ALLOW_LIST,
        }
    }
}

impl SchemaRepairProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe and repair every allow-listed table, one transaction each.
    #[instrument(skip_all)]
    pub fn run(&self, conn: &mut Connection) -> Result<RepairReport, MigrationError> {
        let mut report = RepairReport::default();
        for table in self.tables {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let outcome = repair_table(&tx, table)?;
            tx.commit()?;
            if outcome != RepairOutcome::Healthy {
                info!(table = table.name, ?outcome, "settings table repaired");
            }
            report.tables.push((table.name.to_string(), outcome));
        }
        Ok(report)
    }
}

fn repair_table(conn: &Connection, table: &TableSchema) -> Result<RepairOutcome, MigrationError> {
    let columns = table_columns(conn, table.name)?;
    if columns.is_empty() {
        conn.execute_batch(&create_table(Dialect::Sqlite, table))?;
        return Ok(RepairOutcome::Created);
    }
    let shaped = columns.iter().any(|c| c == "key") && columns.iter().any(|c| c == "value");
    if shaped && key_is_unique(conn, table.name)? {
        for column in table.columns {
            ensure_column(conn, table.name, column.name, column.ty.sqlite_type())?;
        }
        return Ok(RepairOutcome::Healthy);
    }

    warn!(table = table.name, columns = ?columns, "schema drift detected, rebuilding");
    let aside = format!("{}__drift", table.name);
    if table_exists(conn, &aside)? {
        conn.execute_batch(&format!("DROP TABLE {}", quote(&aside)))?;
    }
    conn.execute_batch(&format!(
        "ALTER TABLE {} RENAME TO {}",
        quote(table.name),
        quote(&aside)
    ))?;
    conn.execute_batch(&create_table(Dialect::Sqlite, table))?;

    let rows = read_raw_rows(conn, &aside)?;
    let pairs = match find_aliases(&columns) {
        Some((key, value)) => key_value_pairs(&rows, key, value),
        None => exploded_pairs(&rows),
    };

    let insert = format!(
        "INSERT INTO {} (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        quote(table.name)
    );
    let now = chrono::Utc::now().to_rfc3339();
    let mut transplanted = 0;
    let mut skipped = 0;
    for pair in pairs {
        let Some((key, value)) = pair else {
            skipped += 1;
            continue;
        };
        match conn.execute(&insert, params![key, value, now]) {
            Ok(_) => transplanted += 1,
            Err(e) => {
                warn!(table = table.name, key = %key, error = %e, "skipping settings row");
                skipped += 1;
            }
        }
    }

    conn.execute_batch(&format!("DROP TABLE {}", quote(&aside)))?;
    Ok(RepairOutcome::Rebuilt {
        transplanted,
        skipped,
    })
}

/// Whether `key` alone is the primary key or a unique index.
///
/// Writers upsert with `ON CONFLICT (key)`, which needs one of the two.
fn key_is_unique(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let single_key = |columns: Vec<String>| columns.len() == 1 && columns[0] == "key";

    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) WHERE pk > 0")?;
    let pk = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    if single_key(pk) {
        return Ok(true);
    }

    let mut stmt = conn.prepare("SELECT name FROM pragma_index_list(?1) WHERE \"unique\" = 1")?;
    let indexes = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for index in indexes {
        let mut stmt = conn.prepare("SELECT name FROM pragma_index_info(?1)")?;
        let columns = stmt
            .query_map(params![index], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if single_key(columns) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn find_aliases(columns: &[String]) -> Option<(&'static str, &'static str)> {
    let has = |name: &str| columns.iter().any(|c| c.eq_ignore_ascii_case(name));
    let key = KEY_ALIASES.iter().copied().find(|k| has(k))?;
    let value = VALUE_ALIASES.iter().copied().find(|v| has(v))?;
    Some((key, value))
}

fn field<'r>(row: &'r Row, name: &str) -> Option<&'r Value> {
    row.iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

fn as_setting(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// One pair per row. `None` marks a row without a usable key.
fn key_value_pairs(
    rows: &[Row],
    key: &str,
    value: &str,
) -> Vec<Option<(String, Option<String>)>> {
    rows.iter()
        .map(|row| {
            let key_value = field(row, key)
                .and_then(as_setting)
                .filter(|k| !k.trim().is_empty());
            if key_value.is_none() {
                warn!(row = ?row, "settings row has no usable key");
            }
            key_value.map(|k| (k, field(row, value).and_then(as_setting)))
        })
        .collect()
}

/// One pair per column of each row; the id column is not a setting.
fn exploded_pairs(rows: &[Row]) -> Vec<Option<(String, Option<String>)>> {
    if rows.len() > 1 {
        warn!(rows = rows.len(), "wide settings table has several rows; later rows win");
    }
    rows.iter()
        .flat_map(|row| {
            row.iter()
                .filter(|(column, _)| !column.eq_ignore_ascii_case("id"))
                .map(|(column, value)| Some((column.clone(), as_setting(value))))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(conn: &Connection, table: &str) -> Vec<(String, Option<String>)> {
        let mut stmt = conn
            .prepare(&format!("SELECT key, value FROM {table} ORDER BY key"))
            .unwrap();
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        rows
    }

    #[test]
    fn test_missing_tables_are_created() {
        let mut conn = Connection::open_in_memory().unwrap();
        let report = SchemaRepairProbe::new().run(&mut conn).unwrap();
        assert_eq!(report.outcome("settings"), Some(&RepairOutcome::Created));
        assert_eq!(report.outcome("billing_settings"), Some(&RepairOutcome::Created));
        assert!(!report.repaired_any());
    }

    #[test]
    fn test_healthy_table_untouched() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE settings (key TEXT PRIMARY KEY, value TEXT);
             INSERT INTO settings VALUES ('currency', 'KES');",
        )
        .unwrap();
        let report = SchemaRepairProbe::new().run(&mut conn).unwrap();
        assert_eq!(report.outcome("settings"), Some(&RepairOutcome::Healthy));
        assert_eq!(
            settings(&conn, "settings"),
            vec![("currency".to_string(), Some("KES".to_string()))]
        );
        assert!(table_columns(&conn, "settings").unwrap().contains(&"updated_at".to_string()));
    }

    #[test]
    fn test_aliased_columns_transplanted() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE settings (name TEXT, val TEXT);
             INSERT INTO settings VALUES ('currency', 'KES'), ('tax', '16'), (NULL, 'orphan');",
        )
        .unwrap();
        let report = SchemaRepairProbe::new().run(&mut conn).unwrap();
        assert_eq!(
            report.outcome("settings"),
            Some(&RepairOutcome::Rebuilt {
                transplanted: 2,
                skipped: 1
            })
        );
        assert_eq!(settings(&conn, "settings").len(), 2);
        assert!(!table_exists(&conn, "settings__drift").unwrap());
    }

    #[test]
    fn test_wide_row_exploded() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE billing_settings (id INTEGER PRIMARY KEY, currency TEXT, grace_days INTEGER);
             INSERT INTO billing_settings VALUES (1, 'USD', 3);",
        )
        .unwrap();
        SchemaRepairProbe::new().run(&mut conn).unwrap();
        assert_eq!(
            settings(&conn, "billing_settings"),
            vec![
                ("currency".to_string(), Some("USD".to_string())),
                ("grace_days".to_string(), Some("3".to_string())),
            ]
        );
    }

    #[test]
    fn test_non_unique_key_is_rebuilt() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE settings (key TEXT, value TEXT);
             INSERT INTO settings VALUES ('currency', 'USD'), ('currency', 'KES'), ('tax', '16');",
        )
        .unwrap();
        let report = SchemaRepairProbe::new().run(&mut conn).unwrap();
        assert!(matches!(
            report.outcome("settings"),
            Some(RepairOutcome::Rebuilt { skipped: 0, .. })
        ));
        assert!(key_is_unique(&conn, "settings").unwrap());
        assert_eq!(
            settings(&conn, "settings"),
            vec![
                ("currency".to_string(), Some("KES".to_string())),
                ("tax".to_string(), Some("16".to_string())),
            ]
        );
    }

    #[test]
    fn test_unique_index_on_key_is_healthy() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE settings (id INTEGER PRIMARY KEY, key TEXT, value TEXT);
             CREATE UNIQUE INDEX idx_settings_key ON settings (key);",
        )
        .unwrap();
        let report = SchemaRepairProbe::new().run(&mut conn).unwrap();
        assert_eq!(report.outcome("settings"), Some(&RepairOutcome::Healthy));
    }

    #[test]
    fn test_repair_is_stable() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE settings (name TEXT, val TEXT);").unwrap();
        SchemaRepairProbe::new().run(&mut conn).unwrap();
        let second = SchemaRepairProbe::new().run(&mut conn).unwrap();
        assert_eq!(second.outcome("settings"), Some(&RepairOutcome::Healthy));
    }
}
