//! Command-line arguments.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};

use duostore_core::config::{
    DEFAULT_ACQUIRE_TIMEOUT_SECS, DEFAULT_BULK_BATCH_SIZE, DEFAULT_DATA_PATH, DEFAULT_POOL_SIZE,
    DEFAULT_QUEUE_DEPTH, DEFAULT_REQUEST_TIMEOUT_SECS,
};
use duostore_core::engine::DEFAULT_EXTERNAL_PORT;
use duostore_core::{EngineConfig, EngineKind, StorageConfig};

/// Duostore administration.
#[derive(Parser, Debug)]
#[command(name = "duostore")]
#[command(version, about = "Duostore storage administration", long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub storage: StorageArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Storage settings shared by every subcommand.
#[derive(ClapArgs, Debug)]
pub struct StorageArgs {
    /// Path to the embedded database file.
    #[arg(short, long, default_value = DEFAULT_DATA_PATH)]
    pub data_path: PathBuf,

    /// External connection pool size.
    #[arg(long, default_value_t = DEFAULT_POOL_SIZE)]
    pub pool_size: u32,

    /// Callers allowed to wait for an external connection.
    #[arg(long, default_value_t = DEFAULT_QUEUE_DEPTH)]
    pub queue_depth: usize,

    /// Seconds to wait for an external connection.
    #[arg(long, default_value_t = DEFAULT_ACQUIRE_TIMEOUT_SECS)]
    pub acquire_timeout: u64,

    /// Request timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Rows per page when copying tables.
    #[arg(long, default_value_t = DEFAULT_BULK_BATCH_SIZE)]
    pub batch_size: usize,
}

impl StorageArgs {
    /// Convert command-line arguments to storage configuration.
    pub fn into_config(self) -> StorageConfig {
        StorageConfig::new(self.data_path)
            .with_pool_size(self.pool_size)
            .with_queue_depth(self.queue_depth)
            .with_acquire_timeout(Duration::from_secs(self.acquire_timeout))
            .with_request_timeout(Duration::from_secs(self.timeout))
            .with_bulk_batch_size(self.batch_size)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply pending migrations.
    Migrate {
        /// List pending steps without applying them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the active engine and external pool health.
    Status,

    /// Persist a new engine configuration and switch to it.
    SetEngine {
        /// `embedded` or `external`.
        engine: EngineKind,

        #[arg(long, default_value = "")]
        host: String,

        #[arg(long, default_value_t = DEFAULT_EXTERNAL_PORT)]
        port: u16,

        #[arg(long, default_value = "")]
        user: String,

        #[arg(long, default_value = "")]
        password: String,

        #[arg(long, default_value = "")]
        database: String,
    },

    /// Copy tables from the embedded engine to the external engine.
    Copy {
        /// Tables to copy.
        #[arg(required = true)]
        tables: Vec<String>,
    },

    /// Read rows.
    Get {
        table: String,

        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        tenant: Option<String>,
    },

    /// Create a row from a JSON object.
    Put {
        table: String,

        /// Column values, e.g. '{"amount": 100}'.
        json: String,

        #[arg(long)]
        tenant: Option<String>,
    },
}

/// Build an engine configuration from `set-engine` arguments.
pub fn engine_config(
    engine: EngineKind,
    host: String,
    port: u16,
    user: String,
    password: String,
    database: String,
) -> EngineConfig {
    match engine {
        EngineKind::Embedded => EngineConfig::embedded(),
        EngineKind::External => EngineConfig::external(host, user, database)
            .with_port(port)
            .with_password(password),
    }
}
