//! The closed registry of known tables.
//!
//! Every table the router will touch is declared here. Names that are not in
//! [`TABLES`] are rejected before any SQL is built.

use super::types::ColumnType::{Boolean, Integer, Text, Timestamp};
use super::types::{Classification, ColumnDef, TableSchema};

/// Tenant scoping column shared by business tables.
pub const SCOPE_COLUMN: &str = "router_id";

/// Identity and security tables that must never leave the embedded engine.
///
/// Kept independent of the per-table classification so the router can
/// cross-check one against the other.
pub const PROTECTED_TABLES: &[&str] = &[
    "users",
    "roles",
    "permissions",
    "role_permissions",
    "license",
    "settings",
    "billing_settings",
];

pub static USERS: TableSchema = TableSchema {
    name: "users",
    columns: &[
        ColumnDef::required("id", Text),
        ColumnDef::required("username", Text),
        ColumnDef::required("password_hash", Text),
        ColumnDef::optional("role_id", Text),
        ColumnDef::required("is_active", Boolean),
        ColumnDef::optional("created_at", Timestamp),
    ],
    primary_key: "id",
    scope_column: None,
    classification: Classification::Critical,
};

pub static ROLES: TableSchema = TableSchema {
    name: "roles",
    columns: &[
        ColumnDef::required("id", Text),
        ColumnDef::required("name", Text),
        ColumnDef::optional("description", Text),
    ],
    primary_key: "id",
    scope_column: None,
    classification: Classification::Critical,
};

pub static PERMISSIONS: TableSchema = TableSchema {
    name: "permissions",
    columns: &[
        ColumnDef::required("id", Text),
        ColumnDef::required("code", Text),
        ColumnDef::optional("description", Text),
    ],
    primary_key: "id",
    scope_column: None,
    classification: Classification::Critical,
};

pub static ROLE_PERMISSIONS: TableSchema = TableSchema {
    name: "role_permissions",
    columns: &[
        ColumnDef::required("id", Text),
        ColumnDef::required("role_id", Text),
        ColumnDef::required("permission_id", Text),
    ],
    primary_key: "id",
    scope_column: None,
    classification: Classification::Critical,
};

pub static LICENSE: TableSchema = TableSchema {
    name: "license",
    columns: &[
        ColumnDef::required("id", Text),
        ColumnDef::optional("license_key", Text),
        ColumnDef::optional("activated_at", Timestamp),
        ColumnDef::optional("expires_at", Timestamp),
    ],
    primary_key: "id",
    scope_column: None,
    classification: Classification::Critical,
};

pub static SETTINGS: TableSchema = TableSchema {
    name: "settings",
    columns: &[
        ColumnDef::required("key", Text),
        ColumnDef::optional("value", Text),
        ColumnDef::optional("updated_at", Timestamp),
    ],
    primary_key: "key",
    scope_column: None,
    classification: Classification::Critical,
};

pub static BILLING_SETTINGS: TableSchema = TableSchema {
    name: "billing_settings",
    columns: &[
        ColumnDef::required("key", Text),
        ColumnDef::optional("value", Text),
        ColumnDef::optional("updated_at", Timestamp),
    ],
    primary_key: "key",
    scope_column: None,
    classification: Classification::Critical,
};

pub static ROUTERS: TableSchema = TableSchema {
    name: "routers",
    columns: &[
        ColumnDef::required("id", Text),
        ColumnDef::required("name", Text),
        ColumnDef::required("host", Text),
        ColumnDef::optional("port", Integer),
        ColumnDef::optional("username", Text),
        ColumnDef::optional("secret", Text),
        ColumnDef::optional("created_at", Timestamp),
    ],
    primary_key: "id",
    scope_column: None,
    classification: Classification::Unclassified,
};

pub static AUDIT_LOG: TableSchema = TableSchema {
    name: "audit_log",
    columns: &[
        ColumnDef::required("id", Text),
        ColumnDef::optional("actor", Text),
        ColumnDef::required("action", Text),
        ColumnDef::optional("detail", Text),
        ColumnDef::optional("created_at", Timestamp),
    ],
    primary_key: "id",
    scope_column: None,
    classification: Classification::Unclassified,
};

pub static CUSTOMERS: TableSchema = TableSchema {
    name: "customers",
    columns: &[
        ColumnDef::required("id", Text),
        ColumnDef::optional("router_id", Text),
        ColumnDef::required("name", Text),
        ColumnDef::optional("phone", Text),
        ColumnDef::optional("email", Text),
        ColumnDef::optional("balance", Integer),
        ColumnDef::optional("created_at", Timestamp),
    ],
    primary_key: "id",
    scope_column: Some(SCOPE_COLUMN),
    classification: Classification::Migratable,
};

pub static PLANS: TableSchema = TableSchema {
    name: "plans",
    columns: &[
        ColumnDef::required("id", Text),
        ColumnDef::optional("router_id", Text),
        ColumnDef::required("name", Text),
        ColumnDef::required("price", Integer),
        ColumnDef::optional("duration_minutes", Integer),
        ColumnDef::optional("data_limit_mb", Integer),
    ],
    primary_key: "id",
    scope_column: Some(SCOPE_COLUMN),
    classification: Classification::Migratable,
};

pub static VOUCHERS: TableSchema = TableSchema {
    name: "vouchers",
    columns: &[
        ColumnDef::required("id", Text),
        ColumnDef::optional("router_id", Text),
        ColumnDef::required("code", Text),
        ColumnDef::optional("plan_id", Text),
        ColumnDef::required("price", Integer),
        ColumnDef::required("status", Text),
        ColumnDef::optional("created_at", Timestamp),
        ColumnDef::optional("used_at", Timestamp),
    ],
    primary_key: "id",
    scope_column: Some(SCOPE_COLUMN),
    classification: Classification::Migratable,
};

pub static SALES: TableSchema = TableSchema {
    name: "sales",
    columns: &[
        ColumnDef::required("id", Text),
        ColumnDef::optional("router_id", Text),
        ColumnDef::optional("voucher_code", Text),
        ColumnDef::optional("customer_id", Text),
        ColumnDef::required("amount", Integer),
        ColumnDef::optional("method", Text),
        ColumnDef::optional("created_at", Timestamp),
    ],
    primary_key: "id",
    scope_column: Some(SCOPE_COLUMN),
    classification: Classification::Migratable,
};

pub static PAYMENTS: TableSchema = TableSchema {
    name: "payments",
    columns: &[
        ColumnDef::required("id", Text),
        ColumnDef::optional("router_id", Text),
        ColumnDef::optional("reference", Text),
        ColumnDef::required("amount", Integer),
        ColumnDef::optional("status", Text),
        ColumnDef::optional("created_at", Timestamp),
    ],
    primary_key: "id",
    scope_column: Some(SCOPE_COLUMN),
    classification: Classification::Migratable,
};

pub static EXPENSES: TableSchema = TableSchema {
    name: "expenses",
    columns: &[
        ColumnDef::required("id", Text),
        ColumnDef::required("category", Text),
        ColumnDef::required("amount", Integer),
        ColumnDef::optional("note", Text),
        ColumnDef::optional("created_at", Timestamp),
    ],
    primary_key: "id",
    scope_column: None,
    classification: Classification::Migratable,
};

/// All registered tables.
pub static TABLES: &[&TableSchema] = &[
    &USERS,
    &ROLES,
    &PERMISSIONS,
    &ROLE_PERMISSIONS,
    &LICENSE,
    &SETTINGS,
    &BILLING_SETTINGS,
    &ROUTERS,
    &AUDIT_LOG,
    &CUSTOMERS,
    &PLANS,
    &VOUCHERS,
    &SALES,
    &PAYMENTS,
    &EXPENSES,
];

/// Look up a table descriptor by name.
pub fn lookup(name: &str) -> Option<&'static TableSchema> {
    TABLES.iter().copied().find(|t| t.name == name)
}

/// Whether the name is on the protected list.
pub fn is_protected(name: &str) -> bool {
    PROTECTED_TABLES.contains(&name)
}

/// Tables that may be placed on the external engine.
pub fn migratable_tables() -> impl Iterator<Item = &'static TableSchema> {
    TABLES.iter().copied().filter(|t| t.is_migratable())
}

/// Tables that must stay embedded.
pub fn critical_tables() -> impl Iterator<Item = &'static TableSchema> {
    TABLES.iter().copied().filter(|t| t.is_critical())
}
