//! The storage router.
//!
//! Decides per table and per request whether to use the embedded or the
//! external engine, then dispatches. Critical and protected tables are
//! always embedded regardless of the active engine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::catalog::{is_protected, lookup, TableSchema};
use crate::driver::{DriverError, EmbeddedStore, Filter, Row, TableStore};
use crate::engine::{ActiveEngine, EngineSelector, ExternalPool};
use crate::error::{Error, StorageError};

/// A table-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    /// Delete every row, or every row of one tenant.
    Clear,
}

impl Operation {
    pub fn is_write(&self) -> bool {
        !matches!(self, Operation::Read)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Clear => "clear",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "read" => Ok(Operation::Read),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            "clear" => Ok(Operation::Clear),
            other => Err(Error::InvalidConfig(format!("unknown operation '{other}'"))),
        }
    }
}

/// Request parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    /// Primary key of the target row.
    pub id: Option<Value>,
    /// Tenant, matched against the table's scope column.
    pub tenant: Option<String>,
    /// Column values for create and update.
    pub values: Row,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_values(mut self, values: Row) -> Self {
        self.values = values;
        self
    }
}

/// Routing decision for one request.
#[derive(Debug, Clone)]
pub enum Route {
    Embedded,
    External(Arc<ExternalPool>),
}

impl Route {
    pub fn is_external(&self) -> bool {
        matches!(self, Route::External(_))
    }
}

/// Decide where a request for `table` goes under the `active` snapshot.
pub fn route(table: &TableSchema, active: &ActiveEngine) -> Route {
    if table.is_critical() || is_protected(table.name) {
        if table.is_migratable() {
            error!(table = table.name, "protected table classified as migratable; keeping embedded");
        }
        return Route::Embedded;
    }
    match active.external_pool() {
        Some(pool) if table.is_migratable() => Route::External(Arc::clone(pool)),
        _ => Route::Embedded,
    }
}

/// Dispatches table operations to the right engine.
pub struct StorageRouter {
    selector: Arc<EngineSelector>,
    embedded: EmbeddedStore,
    request_timeout: Duration,
}

impl StorageRouter {
    pub fn new(selector: Arc<EngineSelector>, embedded: EmbeddedStore, request_timeout: Duration) -> Self {
        Self {
            selector,
            embedded,
            request_timeout,
        }
    }

    /// Dispatch with the default request deadline.
    pub async fn dispatch(&self, table: &str, operation: Operation, params: Params) -> Result<Vec<Row>, Error> {
        self.dispatch_until(table, operation, params, Instant::now() + self.request_timeout)
            .await
    }

    /// Dispatch with an explicit deadline.
    pub async fn dispatch_until(
        &self,
        table: &str,
        operation: Operation,
        params: Params,
        deadline: Instant,
    ) -> Result<Vec<Row>, Error> {
        let schema = lookup(table).ok_or_else(|| Error::UnknownTable(table.to_string()))?;
        let fail = |cause: DriverError| Error::Storage(StorageError::new(schema.name, operation, cause));

        if let Some(unknown) = params.values.keys().find(|k| !schema.has_column(k)) {
            return Err(fail(DriverError::UnknownColumn(unknown.clone())));
        }
        let request = Request::build(schema, operation, params).map_err(fail)?;

        match tokio::time::timeout_at(deadline, self.execute(&request, deadline)).await {
            Ok(result) => result.map_err(fail),
            Err(_) => {
                warn!(table = schema.name, %operation, "dispatch deadline elapsed");
                Err(Error::Timeout {
                    table: schema.name.to_string(),
                    operation,
                })
            }
        }
    }

    async fn execute(&self, request: &Request, deadline: Instant) -> Result<Vec<Row>, DriverError> {
        let mut redispatched = false;
        loop {
            let snapshot = self.selector.current();
            let result = match route(request.table, &snapshot) {
                Route::Embedded => {
                    debug!(table = request.table.name, operation = %request.operation, "embedded");
                    request.run(&self.embedded).await
                }
                Route::External(pool) => {
                    debug!(table = request.table.name, operation = %request.operation, "external");
                    self.execute_external(&pool, request, deadline).await
                }
            };
            match result {
                // The pool was retired by a reload after the snapshot was taken.
                Err(DriverError::PoolClosed) if !redispatched => {
                    redispatched = true;
                    debug!(table = request.table.name, "pool retired mid-request, re-dispatching");
                }
                other => return other,
            }
        }
    }

    async fn execute_external(
        &self,
        pool: &Arc<ExternalPool>,
        request: &Request,
        deadline: Instant,
    ) -> Result<Vec<Row>, DriverError> {
        let store = pool.lease(Some(deadline)).await?;
        match request.run(&*store).await {
            Err(e) if e.is_schema_gap() && request.operation.is_write() => {
                warn!(table = request.table.name, error = %e, "external schema gap, provisioning and retrying");
                store.provision(request.table).await?;
                request.run(&*store).await
            }
            other => other,
        }
    }

    pub fn selector(&self) -> &Arc<EngineSelector> {
        &self.selector
    }

    pub fn embedded(&self) -> &EmbeddedStore {
        &self.embedded
    }
}

/// A validated request bound to its table descriptor.
struct Request {
    table: &'static TableSchema,
    operation: Operation,
    id: Option<Value>,
    tenant: Option<String>,
    values: Row,
}

impl Request {
    fn build(table: &'static TableSchema, operation: Operation, params: Params) -> Result<Self, DriverError> {
        let Params { id, tenant, mut values } = params;
        // A tenant only means something on scoped tables.
        let tenant = tenant.filter(|_| table.is_scoped());
        if let Some(scope) = table.scope_column {
            check_scope(scope, &values, tenant.as_deref(), operation)?;
        }

        match operation {
            Operation::Create => {
                if let (Some(id), false) = (&id, values.contains_key(table.primary_key)) {
                    values.insert(table.primary_key.to_string(), id.clone());
                }
                fill_defaults(table, &mut values, tenant.as_deref());
            }
            Operation::Update | Operation::Delete if id.is_none() => {
                return Err(DriverError::InvalidInput(format!("{operation} requires an id")));
            }
            _ => {}
        }

        Ok(Self {
            table,
            operation,
            id,
            tenant,
            values,
        })
    }

    fn filter(&self) -> Filter {
        Filter {
            id: self.id.clone(),
            scope: self.tenant.clone(),
        }
    }

    /// Scoped reads and clears need an id or a tenant.
    fn is_unscoped_bulk(&self) -> bool {
        self.table.is_scoped() && self.id.is_none() && self.tenant.is_none()
    }

    async fn run(&self, store: &dyn TableStore) -> Result<Vec<Row>, DriverError> {
        match self.operation {
            Operation::Create => Ok(vec![store.insert(self.table, self.values.clone()).await?]),
            Operation::Read if self.is_unscoped_bulk() => Ok(Vec::new()),
            Operation::Read => store.select(self.table, self.filter()).await,
            Operation::Update => store.update(self.table, self.filter(), self.values.clone()).await,
            Operation::Delete => store.delete(self.table, self.filter()).await,
            Operation::Clear if self.is_unscoped_bulk() => Ok(Vec::new()),
            Operation::Clear => {
                let filter = Filter {
                    id: None,
                    scope: self.tenant.clone(),
                };
                store.delete(self.table, filter).await?;
                Ok(Vec::new())
            }
        }
    }
}

/// A payload may only name the tenant the request is scoped to.
///
/// Without a tenant, creates may set the scope column but updates may not
/// move a row between tenants.
fn check_scope(scope: &str, values: &Row, tenant: Option<&str>, operation: Operation) -> Result<(), DriverError> {
    let Some(supplied) = values.get(scope) else {
        return Ok(());
    };
    match tenant {
        Some(tenant) if supplied.as_str() == Some(tenant) => Ok(()),
        Some(tenant) => Err(DriverError::InvalidInput(format!(
            "{scope} {supplied} does not match tenant {tenant}"
        ))),
        None if operation == Operation::Update => Err(DriverError::InvalidInput(format!(
            "changing {scope} requires a tenant"
        ))),
        None => Ok(()),
    }
}

/// Fill `id`, `created_at` and the scope column when the payload omits them.
fn fill_defaults(table: &TableSchema, values: &mut Row, tenant: Option<&str>) {
    if table.primary_key == "id" && !values.contains_key("id") {
        values.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
    }
    if table.has_column("created_at") && !values.contains_key("created_at") {
        values.insert("created_at".to_string(), Value::String(Utc::now().to_rfc3339()));
    }
    if let (Some(scope), Some(tenant)) = (table.scope_column, tenant) {
        values
            .entry(scope.to_string())
            .or_insert_with(|| Value::String(tenant.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::registry::{EXPENSES, ROUTERS, SALES, SETTINGS, USERS};
    use crate::engine::EngineConfig;
    use serde_json::json;

    fn external_snapshot() -> ActiveEngine {
        let store: Arc<dyn TableStore> = Arc::new(EmbeddedStore::open_in_memory().unwrap());
        ActiveEngine {
            backend: crate::engine::Backend::External(ExternalPool::new(
                store,
                2,
                2,
                Duration::from_millis(50),
            )),
            config: EngineConfig::external("db", "app", "billing"),
            fallback_reason: None,
        }
    }

    #[test]
    fn test_critical_tables_route_embedded() {
        let active = external_snapshot();
        for table in [&USERS, &SETTINGS] {
            assert!(!route(table, &active).is_external(), "{}", table.name);
        }
    }

    #[test]
    fn test_migratable_tables_follow_engine() {
        let active = external_snapshot();
        assert!(route(&SALES, &active).is_external());
        assert!(route(&EXPENSES, &active).is_external());
        assert!(!route(&ROUTERS, &active).is_external());
    }

    #[test]
    fn test_retired_pool_routes_embedded() {
        let active = external_snapshot();
        if let crate::engine::Backend::External(pool) = &active.backend {
            pool.retire();
        }
        assert!(!route(&SALES, &active).is_external());
    }

    #[test]
    fn test_create_fills_defaults() {
        let request = Request::build(
            &SALES,
            Operation::Create,
            Params::new()
                .with_tenant("r1")
                .with_values(json!({"amount": 10}).as_object().cloned().unwrap()),
        )
        .unwrap();
        assert!(request.values["id"].as_str().is_some_and(|id| Uuid::parse_str(id).is_ok()));
        assert!(request.values.contains_key("created_at"));
        assert_eq!(request.values["router_id"], json!("r1"));
    }

    #[test]
    fn test_create_keeps_supplied_values() {
        let request = Request::build(
            &SALES,
            Operation::Create,
            Params::new()
                .with_tenant("r1")
                .with_values(json!({"id": "s1", "router_id": "r1", "amount": 1}).as_object().cloned().unwrap()),
        )
        .unwrap();
        assert_eq!(request.values["id"], json!("s1"));
        assert_eq!(request.values["router_id"], json!("r1"));
    }

    #[test]
    fn test_scope_column_must_match_tenant() {
        let foreign = || json!({"router_id": "r9", "amount": 1}).as_object().cloned().unwrap();
        let err = Request::build(
            &SALES,
            Operation::Create,
            Params::new().with_tenant("r1").with_values(foreign()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DriverError::InvalidInput(_)));

        assert!(Request::build(
            &SALES,
            Operation::Update,
            Params::new().with_id("s1").with_tenant("r1").with_values(foreign()),
        )
        .is_err());
        assert!(Request::build(
            &SALES,
            Operation::Update,
            Params::new().with_id("s1").with_values(foreign()),
        )
        .is_err());

        // No tenant on create: the payload is the only scope there is.
        let request = Request::build(&SALES, Operation::Create, Params::new().with_values(foreign())).unwrap();
        assert_eq!(request.values["router_id"], json!("r9"));
    }

    #[test]
    fn test_update_requires_id() {
        assert!(Request::build(&SALES, Operation::Update, Params::new()).is_err());
        assert!(Request::build(&SALES, Operation::Delete, Params::new().with_tenant("r1")).is_err());
    }

    #[test]
    fn test_tenant_ignored_on_unscoped_table() {
        let request = Request::build(&EXPENSES, Operation::Read, Params::new().with_tenant("r1")).unwrap();
        assert_eq!(request.filter(), Filter::all());
    }

    #[test]
    fn test_operation_round_trip_names() {
        for op in [
            Operation::Create,
            Operation::Read,
            Operation::Update,
            Operation::Delete,
            Operation::Clear,
        ] {
            assert_eq!(op.to_string().parse::<Operation>().unwrap(), op);
        }
        assert!(!Operation::Read.is_write());
        assert!(Operation::Clear.is_write());
    }
}
