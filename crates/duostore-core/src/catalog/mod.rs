//! Table catalog for duostore.
//!
//! The catalog is a closed set of typed table descriptors: column lists,
//! primary keys, tenant scoping columns and placement classification.

pub mod registry;
mod types;

pub use registry::{
    critical_tables, is_protected, lookup, migratable_tables, PROTECTED_TABLES, SCOPE_COLUMN,
    TABLES,
};
pub use types::{Classification, ColumnDef, ColumnType, TableSchema};
