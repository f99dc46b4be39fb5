//! The ordered list of schema migrations.
//!
//! Ordinals are stable: once released a step is never renumbered, edited or
//! removed. New schema changes are appended as new steps.

use serde_json::Value;

use super::error::MigrationError;
use super::step::{MigrationStep, Restructure, SchemaOp};
use crate::driver::Row;

/// Every migration step, in ascending ordinal order.
pub static MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        ordinal: 1,
        description: "identity and settings tables",
        operations: &[SchemaOp::Sql(
            "
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                role_id TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT
            );
            CREATE TABLE IF NOT EXISTS roles (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT
            );
            CREATE TABLE IF NOT EXISTS permissions (
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                description TEXT
            );
            CREATE TABLE IF NOT EXISTS role_permissions (
                id TEXT PRIMARY KEY,
                role_id TEXT NOT NULL,
                permission_id TEXT NOT NULL,
                UNIQUE (role_id, permission_id)
            );
            CREATE TABLE IF NOT EXISTS license (
                id TEXT PRIMARY KEY,
                license_key TEXT,
                activated_at TEXT,
                expires_at TEXT
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT
            );
            ",
        )],
        idempotent: true,
    },
    MigrationStep {
        ordinal: 2,
        description: "seed roles and permissions",
        operations: &[
            SchemaOp::SeedRow {
                table: "roles",
                values: &[("id", "role-admin"), ("name", "admin"), ("description", "Full access")],
            },
            SchemaOp::SeedRow {
                table: "roles",
                values: &[("id", "role-operator"), ("name", "operator"), ("description", "Sales and vouchers")],
            },
            SchemaOp::SeedRow {
                table: "roles",
                values: &[("id", "role-viewer"), ("name", "viewer"), ("description", "Read only")],
            },
            SchemaOp::SeedRow {
                table: "permissions",
                values: &[("id", "perm-users-manage"), ("code", "users.manage")],
            },
            SchemaOp::SeedRow {
                table: "permissions",
                values: &[("id", "perm-settings-manage"), ("code", "settings.manage")],
            },
            SchemaOp::SeedRow {
                table: "permissions",
                values: &[("id", "perm-sales-view"), ("code", "sales.view")],
            },
            SchemaOp::SeedRow {
                table: "permissions",
                values: &[("id", "perm-sales-manage"), ("code", "sales.manage")],
            },
            SchemaOp::SeedRow {
                table: "permissions",
                values: &[("id", "perm-vouchers-manage"), ("code", "vouchers.manage")],
            },
            SchemaOp::SeedRow {
                table: "role_permissions",
                values: &[("id", "rp-admin-users"), ("role_id", "role-admin"), ("permission_id", "perm-users-manage")],
            },
            SchemaOp::SeedRow {
                table: "role_permissions",
                values: &[("id", "rp-admin-settings"), ("role_id", "role-admin"), ("permission_id", "perm-settings-manage")],
            },
            SchemaOp::SeedRow {
                table: "role_permissions",
                values: &[("id", "rp-admin-sales-view"), ("role_id", "role-admin"), ("permission_id", "perm-sales-view")],
            },
            SchemaOp::SeedRow {
                table: "role_permissions",
                values: &[("id", "rp-admin-sales-manage"), ("role_id", "role-admin"), ("permission_id", "perm-sales-manage")],
            },
            SchemaOp::SeedRow {
                table: "role_permissions",
                values: &[("id", "rp-admin-vouchers"), ("role_id", "role-admin"), ("permission_id", "perm-vouchers-manage")],
            },
            SchemaOp::SeedRow {
                table: "role_permissions",
                values: &[("id", "rp-operator-sales-view"), ("role_id", "role-operator"), ("permission_id", "perm-sales-view")],
            },
            SchemaOp::SeedRow {
                table: "role_permissions",
                values: &[("id", "rp-operator-sales-manage"), ("role_id", "role-operator"), ("permission_id", "perm-sales-manage")],
            },
            SchemaOp::SeedRow {
                table: "role_permissions",
                values: &[("id", "rp-operator-vouchers"), ("role_id", "role-operator"), ("permission_id", "perm-vouchers-manage")],
            },
            SchemaOp::SeedRow {
                table: "role_permissions",
                values: &[("id", "rp-viewer-sales-view"), ("role_id", "role-viewer"), ("permission_id", "perm-sales-view")],
            },
        ],
        idempotent: true,
    },
    MigrationStep {
        ordinal: 3,
        description: "business tables",
        operations: &[SchemaOp::Sql(
            "
            CREATE TABLE IF NOT EXISTS routers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER,
                username TEXT,
                secret TEXT,
                created_at TEXT
            );
            CREATE TABLE IF NOT EXISTS customers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                phone TEXT,
                created_at TEXT
            );
            CREATE TABLE IF NOT EXISTS plans (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                price INTEGER NOT NULL,
                duration_minutes INTEGER
            );
            CREATE TABLE IF NOT EXISTS vouchers (
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                plan TEXT,
                price TEXT,
                used INTEGER NOT NULL DEFAULT 0,
                created_at TEXT
            );
            CREATE TABLE IF NOT EXISTS sales (
                id TEXT PRIMARY KEY,
                voucher_code TEXT,
                amount INTEGER NOT NULL,
                created_at TEXT
            );
            ",
        )],
        idempotent: true,
    },
    MigrationStep {
        ordinal: 4,
        description: "tenant scoping and customer details",
        operations: &[
            SchemaOp::EnsureColumn {
                table: "customers",
                column: "router_id",
                declaration: "TEXT",
            },
            SchemaOp::EnsureColumn {
                table: "customers",
                column: "email",
                declaration: "TEXT",
            },
            SchemaOp::EnsureColumn {
                table: "customers",
                column: "balance",
                declaration: "INTEGER DEFAULT 0",
            },
            SchemaOp::EnsureColumn {
                table: "plans",
                column: "router_id",
                declaration: "TEXT",
            },
            SchemaOp::EnsureColumn {
                table: "plans",
                column: "data_limit_mb",
                declaration: "INTEGER",
            },
            SchemaOp::EnsureColumn {
                table: "sales",
                column: "router_id",
                declaration: "TEXT",
            },
            SchemaOp::EnsureColumn {
                table: "sales",
                column: "customer_id",
                declaration: "TEXT",
            },
            SchemaOp::EnsureColumn {
                table: "sales",
                column: "method",
                declaration: "TEXT",
            },
            SchemaOp::Sql(
                "
                CREATE INDEX IF NOT EXISTS idx_customers_router ON customers (router_id);
                CREATE INDEX IF NOT EXISTS idx_plans_router ON plans (router_id);
                CREATE INDEX IF NOT EXISTS idx_sales_router ON sales (router_id);
                CREATE INDEX IF NOT EXISTS idx_sales_created ON sales (created_at);
                ",
            ),
        ],
        idempotent: true,
    },
    MigrationStep {
        ordinal: 5,
        description: "typed voucher prices and status",
        operations: &[
            SchemaOp::Restructure(Restructure {
                table: "vouchers",
                key_column: "id",
                marker_column: "status",
                create_sql: "
                    CREATE TABLE IF NOT EXISTS vouchers (
                        id TEXT PRIMARY KEY,
                        router_id TEXT,
                        code TEXT NOT NULL UNIQUE,
                        plan_id TEXT,
                        price INTEGER NOT NULL,
                        status TEXT NOT NULL DEFAULT 'unused',
                        created_at TEXT,
                        used_at TEXT
                    );
                ",
                transform: upgrade_voucher,
            }),
            SchemaOp::Sql("CREATE INDEX IF NOT EXISTS idx_vouchers_router ON vouchers (router_id);"),
        ],
        idempotent: true,
    },
    MigrationStep {
        ordinal: 6,
        description: "payments, expenses, billing settings and audit log",
        operations: &[
            SchemaOp::Sql(
                "
                CREATE TABLE IF NOT EXISTS payments (
                    id TEXT PRIMARY KEY,
                    router_id TEXT,
                    reference TEXT,
                    amount INTEGER NOT NULL,
                    status TEXT,
                    created_at TEXT
                );
                CREATE TABLE IF NOT EXISTS expenses (
                    id TEXT PRIMARY KEY,
                    category TEXT NOT NULL,
                    amount INTEGER NOT NULL,
                    note TEXT,
                    created_at TEXT
                );
                CREATE TABLE IF NOT EXISTS billing_settings (
                    key TEXT PRIMARY KEY,
                    value TEXT
                );
                CREATE TABLE IF NOT EXISTS audit_log (
                    id TEXT PRIMARY KEY,
                    actor TEXT,
                    action TEXT NOT NULL,
                    detail TEXT,
                    created_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_payments_router ON payments (router_id);
                ",
            ),
            SchemaOp::EnsureColumn {
                table: "settings",
                column: "updated_at",
                declaration: "TEXT",
            },
            SchemaOp::EnsureColumn {
                table: "billing_settings",
                column: "updated_at",
                declaration: "TEXT",
            },
        ],
        idempotent: true,
    },
];

/// Legacy vouchers stored the price as free text and a `used` flag.
fn upgrade_voucher(old: &Row) -> Option<Row> {
    let id = old.get("id").filter(|v| !v.is_null())?.clone();
    let code = old.get("code").filter(|v| !v.is_null())?.clone();
    let price = parse_price(old.get("price")?)?;
    let used = match old.get("used") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => matches!(s.trim(), "1" | "true" | "yes"),
        Some(Value::Bool(b)) => *b,
        _ => false,
    };

    let mut new = Row::new();
    new.insert("id".into(), id);
    new.insert("code".into(), code);
    new.insert("plan_id".into(), old.get("plan").cloned().unwrap_or(Value::Null));
    new.insert("price".into(), Value::from(price));
    new.insert(
        "status".into(),
        Value::from(if used { "used" } else { "unused" }),
    );
    new.insert(
        "created_at".into(),
        old.get("created_at").cloned().unwrap_or(Value::Null),
    );
    Some(new)
}

/// Accepts `1500`, `"1500"`, `"1,500"` and `"1500.00"`.
fn parse_price(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            cleaned
                .parse::<i64>()
                .ok()
                .or_else(|| cleaned.parse::<f64>().ok().map(|f| f.round() as i64))
        }
        _ => None,
    }
}

/// Reject zero, duplicate or descending ordinals.
pub fn validate_registry(steps: &[MigrationStep]) -> Result<(), MigrationError> {
    let mut previous = 0;
    for step in steps {
        if step.ordinal == 0 {
            return Err(MigrationError::InvalidRegistry {
                message: format!("step '{}' has ordinal 0", step.description),
            });
        }
        if step.ordinal <= previous {
            return Err(MigrationError::InvalidRegistry {
                message: format!(
                    "ordinal {} follows {}; ordinals must be unique and ascending",
                    step.ordinal, previous
                ),
            });
        }
        previous = step.ordinal;
    }
    Ok(())
}

/// Highest registered ordinal, 0 when empty.
pub fn highest_ordinal(steps: &[MigrationStep]) -> u32 {
    steps.iter().map(|s| s.ordinal).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_is_valid() {
        validate_registry(MIGRATIONS).unwrap();
        assert_eq!(highest_ordinal(MIGRATIONS), 6);
    }

    #[test]
    fn test_validate_rejects_bad_ordinals() {
        static DUPLICATE: &[MigrationStep] = &[
            MigrationStep {
                ordinal: 1,
                description: "a",
                operations: &[],
                idempotent: true,
            },
            MigrationStep {
                ordinal: 1,
                description: "b",
                operations: &[],
                idempotent: true,
            },
        ];
        static ZERO: &[MigrationStep] = &[MigrationStep {
            ordinal: 0,
            description: "zero",
            operations: &[],
            idempotent: true,
        }];
        assert!(validate_registry(DUPLICATE).is_err());
        assert!(validate_registry(ZERO).is_err());
    }

    #[test]
    fn test_upgrade_voucher() {
        let old = json!({"id": "v1", "code": "ABC", "plan": "p1", "price": "1,500", "used": 1});
        let new = upgrade_voucher(old.as_object().unwrap()).unwrap();
        assert_eq!(new["price"], json!(1500));
        assert_eq!(new["status"], json!("used"));
        assert_eq!(new["plan_id"], json!("p1"));
    }

    #[test]
    fn test_upgrade_voucher_rejects_garbage_price() {
        let old = json!({"id": "v1", "code": "ABC", "price": "free", "used": 0});
        assert!(upgrade_voucher(old.as_object().unwrap()).is_none());
    }

    #[test]
    fn test_parse_price() {
        assert_eq!(parse_price(&json!("1500.00")), Some(1500));
        assert_eq!(parse_price(&json!(20)), Some(20));
        assert_eq!(parse_price(&Value::Null), None);
    }
}
