//! Beacon CLI
//!
//! Inspect and administer a Beacon telemetry store from the command line.

mod commands;

use anyhow::{Context, Result};
use beacon_store::{StorageConfig, StorageCoordinator};
use beacon_types::{EntityKind, RecordId};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "beaconctl")]
#[command(author, version, about = "Beacon - telemetry storage administration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true, env = "BEACON_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file, overriding the configuration
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Fallback snapshot file, overriding the configuration
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,

    /// Skip the primary engine and use the fallback store
    #[arg(long, global = true)]
    fallback: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert records from a JSON Lines file
    Ingest {
        /// Entity kind (captured_call, logged_error, token_event, script_asset)
        kind: EntityKind,
        /// One JSON object per line
        file: PathBuf,
    },

    /// Print one page of records, newest first
    Query {
        kind: EntityKind,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        #[arg(short, long, default_value_t = 0)]
        offset: usize,

        /// Only captured calls with this url
        #[arg(long, conflicts_with_all = ["severity", "domain"])]
        url: Option<String>,

        /// Only logged errors with this severity
        #[arg(long, conflicts_with = "domain")]
        severity: Option<String>,

        /// Only script assets from this domain
        #[arg(long)]
        domain: Option<String>,
    },

    /// Record count per entity
    Counts,

    /// Active engine and approximate size
    Info,

    /// Delete one record
    Delete { kind: EntityKind, id: RecordId },

    /// Delete expired records, then cap every entity
    Prune {
        /// Maximum record age, e.g. 90s, 30m, 24h or 7d
        #[arg(long, value_parser = commands::parse_age)]
        max_age: std::time::Duration,

        /// Records kept per entity
        #[arg(long)]
        max_records: u64,
    },

    /// Delete every record of one entity
    Clear { kind: EntityKind },

    /// Run the retention pruner until interrupted
    Retain {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
}

async fn open(cli: &Cli) -> Result<StorageCoordinator> {
    let mut config =
        StorageConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(database) = &cli.database {
        config.primary.database_path = Some(database.clone());
    }
    if let Some(snapshot) = &cli.snapshot {
        config.fallback.snapshot_path = Some(snapshot.clone());
    }
    if cli.fallback {
        config.primary.enabled = false;
    }
    // One-shot commands must not prune behind the caller's back; `retain` starts it
    config.retention.enabled = false;
    StorageCoordinator::open(config)
        .await
        .context("Failed to open storage")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose {
            "beacon_cli=debug,beacon_store=debug"
        } else {
            "beacon_cli=info,beacon_store=warn"
        })
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let coordinator = open(&cli).await?;
    info!("Using {} engine", coordinator.engine_kind());

    let result = match cli.command {
        Commands::Ingest { kind, file } => commands::ingest::run(&coordinator, kind, &file).await,
        Commands::Query {
            kind,
            limit,
            offset,
            url,
            severity,
            domain,
        } => match commands::inspect::filter(url, severity, domain) {
            Ok(filter) => commands::inspect::query(&coordinator, kind, filter, limit, offset).await,
            Err(e) => Err(e),
        },
        Commands::Counts => commands::inspect::counts(&coordinator).await,
        Commands::Info => commands::inspect::info(&coordinator).await,
        Commands::Delete { kind, id } => commands::admin::delete(&coordinator, kind, id).await,
        Commands::Prune {
            max_age,
            max_records,
        } => commands::admin::prune(&coordinator, max_age, max_records).await,
        Commands::Clear { kind } => commands::admin::clear(&coordinator, kind).await,
        Commands::Retain { once } => commands::admin::retain(&coordinator, once).await,
    };

    // Flush and release even when the command failed
    let closed = coordinator.close().await;

    if let Err(ref e) = result {
        error!("Command failed: {:#}", e);
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
    closed.context("Failed to close storage")?;

    result
}
