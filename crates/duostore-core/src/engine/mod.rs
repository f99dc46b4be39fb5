//! Engine selection: persisted configuration, the selector and the external
//! pool gate.

pub mod config;
pub mod pool;
pub mod selector;

pub use config::{EngineConfig, EngineKind, DEFAULT_EXTERNAL_PORT};
pub use pool::{ExternalPool, PoolLease};
pub use selector::{
    ActiveEngine, Backend, Connector, EngineSelector, EngineStatus, ExternalStatus,
    PostgresConnector, ReloadOutcome,
};
