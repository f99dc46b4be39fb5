//! SQL statement construction from registry descriptors.
//!
//! Identifiers come only from [`TableSchema`] values; every user value is a
//! bound parameter.

use serde_json::Value;

use super::value::SqlValue;
use super::{DriverError, Filter, Row};
use crate::catalog::{ColumnDef, TableSchema};

/// SQL dialect of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Postgres => format!("${index}"),
        }
    }

    fn column_type(&self, column: &ColumnDef) -> &'static str {
        match self {
            Dialect::Sqlite => column.ty.sqlite_type(),
            Dialect::Postgres => column.ty.postgres_type(),
        }
    }
}

/// A statement with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub binds: Vec<SqlValue>,
}

/// Quote a registry identifier.
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn column_list(table: &TableSchema) -> String {
    table
        .column_names()
        .map(quote)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds statements for one dialect.
struct SqlBuilder {
    dialect: Dialect,
    binds: Vec<SqlValue>,
}

impl SqlBuilder {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            binds: Vec::new(),
        }
    }

    fn bind(&mut self, value: SqlValue) -> String {
        self.binds.push(value);
        self.dialect.placeholder(self.binds.len())
    }

    fn bind_json(&mut self, value: &Value, column: &ColumnDef) -> Result<String, DriverError> {
        let value = SqlValue::coerce(value, column)?;
        Ok(self.bind(value))
    }

    fn where_clause(&mut self, table: &TableSchema, filter: &Filter) -> Result<String, DriverError> {
        let mut conditions = Vec::new();
        if let Some(id) = &filter.id {
            let placeholder = self.bind_json(id, table.primary_key_column())?;
            conditions.push(format!("{} = {placeholder}", quote(table.primary_key)));
        }
        if let Some(tenant) = &filter.scope {
            let column = table.scope_column.ok_or_else(|| {
                DriverError::InvalidInput(format!("table {} is not tenant scoped", table.name))
            })?;
            let placeholder = self.bind(SqlValue::Text(tenant.clone()));
            conditions.push(format!("{} = {placeholder}", quote(column)));
        }
        Ok(if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        })
    }

    fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            binds: self.binds,
        }
    }
}

/// Resolve the row's columns against the descriptor, in declaration order.
fn resolve_columns<'a>(
    table: &TableSchema,
    row: &'a Row,
) -> Result<Vec<(&'static ColumnDef, &'a Value)>, DriverError> {
    if let Some(unknown) = row.keys().find(|k| !table.has_column(k)) {
        return Err(DriverError::UnknownColumn(unknown.clone()));
    }
    Ok(table
        .columns
        .iter()
        .filter_map(|c| row.get(c.name).map(|v| (c, v)))
        .collect())
}

pub fn select(dialect: Dialect, table: &TableSchema, filter: &Filter) -> Result<Statement, DriverError> {
    let mut b = SqlBuilder::new(dialect);
    let where_clause = b.where_clause(table, filter)?;
    let sql = format!(
        "SELECT {} FROM {}{where_clause} ORDER BY {}",
        column_list(table),
        quote(table.name),
        quote(table.primary_key)
    );
    Ok(b.finish(sql))
}

/// Keyset page ordered by primary key.
pub fn scan(
    dialect: Dialect,
    table: &TableSchema,
    after: Option<&Value>,
    limit: usize,
) -> Result<Statement, DriverError> {
    let mut b = SqlBuilder::new(dialect);
    let where_clause = match after {
        Some(key) => {
            let placeholder = b.bind_json(key, table.primary_key_column())?;
            format!(" WHERE {} > {placeholder}", quote(table.primary_key))
        }
        None => String::new(),
    };
    let sql = format!(
        "SELECT {} FROM {}{where_clause} ORDER BY {} LIMIT {limit}",
        column_list(table),
        quote(table.name),
        quote(table.primary_key)
    );
    Ok(b.finish(sql))
}

pub fn count(table: &TableSchema) -> String {
    format!("SELECT COUNT(*) FROM {}", quote(table.name))
}

fn insert_head(
    b: &mut SqlBuilder,
    table: &TableSchema,
    columns: &[(&'static ColumnDef, &Value)],
) -> Result<String, DriverError> {
    if columns.is_empty() {
        return Err(DriverError::InvalidInput("empty row".to_string()));
    }
    let mut names = Vec::with_capacity(columns.len());
    let mut placeholders = Vec::with_capacity(columns.len());
    for (column, value) in columns {
        names.push(quote(column.name));
        placeholders.push(b.bind_json(value, column)?);
    }
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(table.name),
        names.join(", "),
        placeholders.join(", ")
    ))
}

pub fn insert(dialect: Dialect, table: &TableSchema, row: &Row) -> Result<Statement, DriverError> {
    let columns = resolve_columns(table, row)?;
    let mut b = SqlBuilder::new(dialect);
    let head = insert_head(&mut b, table, &columns)?;
    let sql = format!("{head} RETURNING {}", column_list(table));
    Ok(b.finish(sql))
}

/// Insert, or update every supplied column when the primary key exists.
pub fn upsert(dialect: Dialect, table: &TableSchema, row: &Row) -> Result<Statement, DriverError> {
    if !row.contains_key(table.primary_key) {
        return Err(DriverError::InvalidInput(format!(
            "upsert into {} requires {}",
            table.name, table.primary_key
        )));
    }
    let columns = resolve_columns(table, row)?;
    let mut b = SqlBuilder::new(dialect);
    let head = insert_head(&mut b, table, &columns)?;

    let mut updates: Vec<String> = columns
        .iter()
        .filter(|(c, _)| c.name != table.primary_key)
        .map(|(c, _)| format!("{0} = excluded.{0}", quote(c.name)))
        .collect();
    if updates.is_empty() {
        updates.push(format!("{0} = excluded.{0}", quote(table.primary_key)));
    }
    let sql = format!(
        "{head} ON CONFLICT ({}) DO UPDATE SET {} RETURNING {}",
        quote(table.primary_key),
        updates.join(", "),
        column_list(table)
    );
    Ok(b.finish(sql))
}

pub fn update(
    dialect: Dialect,
    table: &TableSchema,
    filter: &Filter,
    values: &Row,
) -> Result<Statement, DriverError> {
    if values.contains_key(table.primary_key) {
        return Err(DriverError::InvalidInput(format!(
            "{} cannot be updated",
            table.primary_key
        )));
    }
    let columns = resolve_columns(table, values)?;
    if columns.is_empty() {
        return Err(DriverError::InvalidInput("no columns to update".to_string()));
    }
    let mut b = SqlBuilder::new(dialect);
    let mut assignments = Vec::with_capacity(columns.len());
    for (column, value) in &columns {
        let placeholder = b.bind_json(value, column)?;
        assignments.push(format!("{} = {placeholder}", quote(column.name)));
    }
    let where_clause = b.where_clause(table, filter)?;
    let sql = format!(
        "UPDATE {} SET {}{where_clause} RETURNING {}",
        quote(table.name),
        assignments.join(", "),
        column_list(table)
    );
    Ok(b.finish(sql))
}

pub fn delete(dialect: Dialect, table: &TableSchema, filter: &Filter) -> Result<Statement, DriverError> {
    let mut b = SqlBuilder::new(dialect);
    let where_clause = b.where_clause(table, filter)?;
    let sql = format!(
        "DELETE FROM {}{where_clause} RETURNING {}",
        quote(table.name),
        column_list(table)
    );
    Ok(b.finish(sql))
}

pub fn create_table(dialect: Dialect, table: &TableSchema) -> String {
    let mut defs: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let null = if c.nullable { "" } else { " NOT NULL" };
            format!("{} {}{null}", quote(c.name), dialect.column_type(c))
        })
        .collect();
    defs.push(format!("PRIMARY KEY ({})", quote(table.primary_key)));
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(table.name),
        defs.join(", ")
    )
}

/// Additive column. Always nullable so it applies to tables with rows.
pub fn add_column(dialect: Dialect, table: &TableSchema, column: &ColumnDef) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote(table.name),
        quote(column.name),
        dialect.column_type(column)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::registry::{EXPENSES, SALES};
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_select_with_scope() {
        let filter = Filter::all().with_scope("r1");
        let stmt = select(Dialect::Postgres, &SALES, &filter).unwrap();
        assert!(stmt.sql.contains("WHERE \"router_id\" = $1"));
        assert_eq!(stmt.binds, vec![SqlValue::Text("r1".into())]);
    }

    #[test]
    fn test_scope_on_unscoped_table_rejected() {
        let filter = Filter::all().with_scope("r1");
        assert!(matches!(
            select(Dialect::Sqlite, &EXPENSES, &filter),
            Err(DriverError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_insert_orders_columns_by_declaration() {
        let stmt = insert(
            Dialect::Sqlite,
            &SALES,
            &row(json!({"amount": 50, "id": "s1"})),
        )
        .unwrap();
        assert!(stmt.sql.starts_with("INSERT INTO \"sales\" (\"id\", \"amount\") VALUES (?1, ?2)"));
        assert_eq!(stmt.binds, vec![SqlValue::Text("s1".into()), SqlValue::Int(50)]);
    }

    #[test]
    fn test_insert_rejects_unknown_column() {
        let err = insert(Dialect::Sqlite, &SALES, &row(json!({"id": "s1", "hack": 1}))).unwrap_err();
        assert!(matches!(err, DriverError::UnknownColumn(c) if c == "hack"));
    }

    #[test]
    fn test_upsert_updates_non_key_columns() {
        let stmt = upsert(
            Dialect::Postgres,
            &SALES,
            &row(json!({"id": "s1", "amount": 10})),
        )
        .unwrap();
        assert!(stmt
            .sql
            .contains("ON CONFLICT (\"id\") DO UPDATE SET \"amount\" = excluded.\"amount\" RETURNING"));
    }

    #[test]
    fn test_update_requires_columns() {
        let filter = Filter::by_id(json!("s1"));
        assert!(update(Dialect::Sqlite, &SALES, &filter, &Row::new()).is_err());
        assert!(update(Dialect::Sqlite, &SALES, &filter, &row(json!({"id": "x"}))).is_err());
    }

    #[test]
    fn test_create_table_postgres_types() {
        let sql = create_table(Dialect::Postgres, &SALES);
        assert!(sql.contains("\"amount\" BIGINT NOT NULL"));
        assert!(sql.contains("PRIMARY KEY (\"id\")"));
    }
}
