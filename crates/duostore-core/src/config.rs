//! Storage configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default embedded database file.
pub const DEFAULT_DATA_PATH: &str = "./duostore.db";

/// Default number of external connections.
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Default number of callers allowed to wait for an external connection.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Default wait for an external connection, in seconds.
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;

/// Default per-request deadline, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default SQLite busy timeout, in seconds.
pub const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 5;

/// Default rows per bulk-copy page.
pub const DEFAULT_BULK_BATCH_SIZE: usize = 500;

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the embedded database file.
    pub data_path: PathBuf,

    /// Fixed size of the external connection pool.
    pub pool_size: u32,

    /// Callers allowed to wait for an external connection. Further callers
    /// are rejected immediately.
    pub queue_depth: usize,

    /// How long a caller waits for an external connection.
    pub acquire_timeout: Duration,

    /// Deadline applied to dispatches that do not carry their own.
    pub request_timeout: Duration,

    /// SQLite busy timeout.
    pub busy_timeout: Duration,

    /// Rows per page during bulk migration.
    pub bulk_batch_size: usize,
}

impl StorageConfig {
    /// Create a configuration for the given database file.
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            pool_size: DEFAULT_POOL_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            busy_timeout: Duration::from_secs(DEFAULT_BUSY_TIMEOUT_SECS),
            bulk_batch_size: DEFAULT_BULK_BATCH_SIZE,
        }
    }

    /// Set the external pool size.
    pub fn with_pool_size(mut self, size: u32) -> Self {
        self.pool_size = size.max(1);
        self
    }

    /// Set the wait-queue depth.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set the acquire timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the default request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the SQLite busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Set the bulk-copy page size.
    pub fn with_bulk_batch_size(mut self, size: usize) -> Self {
        self.bulk_batch_size = size.max(1);
        self
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_PATH)
    }
}
