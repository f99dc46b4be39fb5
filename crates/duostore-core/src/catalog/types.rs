//! Typed table descriptors.

use serde::Serialize;

/// Column data types understood by both engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// UTF-8 text.
    Text,
    /// 64-bit signed integer.
    Integer,
    /// 64-bit floating point.
    Real,
    /// Boolean (stored as 0/1 in SQLite).
    Boolean,
    /// RFC 3339 timestamp stored as text.
    Timestamp,
}

impl ColumnType {
    /// SQLite declared type.
    pub fn sqlite_type(&self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Timestamp => "TEXT",
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }

    /// PostgreSQL declared type.
    pub fn postgres_type(&self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Timestamp => "TEXT",
            ColumnType::Integer => "BIGINT",
            ColumnType::Real => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
        }
    }
}

/// A single column of a registered table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: &'static str,
    /// Column type.
    pub ty: ColumnType,
    /// Whether NULL is accepted.
    pub nullable: bool,
}

impl ColumnDef {
    /// A non-null column.
    pub const fn required(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
        }
    }

    /// A nullable column.
    pub const fn optional(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: true,
        }
    }
}

/// Where a table is allowed to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Identity, credentials, roles, permissions, license and low-level
    /// settings. Always embedded.
    Critical,
    /// Business data eligible for the external engine.
    Migratable,
    /// Not classified; embedded only.
    Unclassified,
}

/// Descriptor for a registered table.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    /// Table name.
    pub name: &'static str,
    /// Columns in declaration order. The primary key is listed first.
    pub columns: &'static [ColumnDef],
    /// Primary key column.
    pub primary_key: &'static str,
    /// Tenant scoping column, if rows belong to a router.
    pub scope_column: Option<&'static str>,
    /// Placement classification.
    pub classification: Classification,
}

impl TableSchema {
    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&'static ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The primary key column descriptor.
    pub fn primary_key_column(&self) -> &'static ColumnDef {
        self.column(self.primary_key).unwrap_or(&self.columns[0])
    }

    /// Whether the table has a column with this name.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }

    pub fn is_critical(&self) -> bool {
        self.classification == Classification::Critical
    }

    pub fn is_migratable(&self) -> bool {
        self.classification == Classification::Migratable
    }

    pub fn is_scoped(&self) -> bool {
        self.scope_column.is_some()
    }
}
