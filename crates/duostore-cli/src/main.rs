//! Duostore Command-Line Administration
//!
//! Runs migrations, inspects and switches the storage engine, copies tables
//! to the external engine and performs one-off reads and writes.

mod config;

use clap::Parser;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{engine_config, Args, Command};
use duostore_core::migration::MIGRATIONS;
use duostore_core::{MigrationRunner, Operation, Params, Storage, StorageConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duostore=info,duostore_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.storage.into_config();

    if let Command::Migrate { dry_run: true } = args.command {
        return print_pending(&config);
    }

    let storage = Storage::initialize(config).await?;
    let result = execute(&storage, args.command).await;
    storage.close().await;
    result
}

async fn execute(storage: &Storage, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Migrate { .. } => {
            let boot = storage.boot_report();
            println!("{}", serde_json::to_string_pretty(&boot.migrations)?);
            println!("{}", serde_json::to_string_pretty(&boot.repair)?);
        }
        Command::Status => {
            let status = storage.engine_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::SetEngine {
            engine,
            host,
            port,
            user,
            password,
            database,
        } => {
            let config = engine_config(engine, host, port, user, password, database);
            let outcome = storage.apply_engine_config(config).await?;
            tracing::info!(?outcome, "engine configuration applied");
        }
        Command::Copy { tables } => {
            let report = storage.run_bulk_migration(&tables).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            let failed: Vec<&str> = report.failed().collect();
            if !failed.is_empty() {
                return Err(format!("copy failed for: {}", failed.join(", ")).into());
            }
        }
        Command::Get { table, id, tenant } => {
            let mut params = Params::new();
            if let Some(id) = id {
                params = params.with_id(id);
            }
            if let Some(tenant) = tenant {
                params = params.with_tenant(tenant);
            }
            let rows = storage.dispatch(&table, Operation::Read, params).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Put { table, json, tenant } => {
            let Value::Object(values) = serde_json::from_str::<Value>(&json)? else {
                return Err("row must be a JSON object".into());
            };
            let mut params = Params::new().with_values(values);
            if let Some(tenant) = tenant {
                params = params.with_tenant(tenant);
            }
            let rows = storage.dispatch(&table, Operation::Create, params).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

/// List pending migration steps without applying them.
fn print_pending(config: &StorageConfig) -> Result<(), Box<dyn std::error::Error>> {
    let pending = if config.data_path.exists() {
        let conn = rusqlite::Connection::open(&config.data_path)?;
        MigrationRunner::new().pending(&conn)?
    } else {
        println!("database does not exist; every step is pending");
        MIGRATIONS.iter().collect()
    };
    if pending.is_empty() {
        println!("schema up to date");
    }
    for step in pending {
        println!("{:>3}  {}", step.ordinal, step.description);
    }
    Ok(())
}
