//! Relay Sync
//!
//! Command-line front end for the sync engine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use syncd::config::{default_config_path, Config};
use syncd::schema::{Collection, DataEvent};
use syncd::{FileManager, ImportSummary, SyncContext};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Relay Sync - keeps Relay data files and their cache consistent.
#[derive(Parser, Debug)]
#[command(name = "relay-sync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Data root, overriding configuration and environment
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Load every collection and print entry counts
    Sync,

    /// Keep the cache in sync and log lifecycle events until Ctrl-C
    Watch,

    /// Import contacts from a CSV file
    ImportContacts {
        /// CSV file to read
        csv: PathBuf,
    },

    /// Import servers from a CSV file
    ImportServers {
        /// CSV file to read
        csv: PathBuf,
    },

    /// Export contacts as CSV to a path under the data root
    ExportContacts {
        /// Destination, relative to the data root
        file: PathBuf,
    },

    /// Export servers as CSV to a path under the data root
    ExportServers {
        /// Destination, relative to the data root
        file: PathBuf,
    },

    /// Replace all data with generated samples (development mode only)
    Seed {
        /// Number of contacts and servers to generate
        #[arg(long, default_value = "50")]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides, then the command line
    let overrides = config.apply_env_overrides();
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }

    // Validate configuration
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;

    let _log_guard = init_tracing(&config, cli.verbose)?;
    tracing::info!(config = %config_path.display(), "Relay sync starting");
    for env_override in &overrides {
        env_override.log();
    }

    let manager = Arc::new(FileManager::new(SyncContext::new(config)));

    match cli.command {
        Commands::Sync => {
            let clean = manager.sync().await?;
            print_counts(&manager);
            if !clean {
                anyhow::bail!("Some data files could not be loaded, see the log for details");
            }
        }
        Commands::Watch => run_watch(&manager).await?,
        Commands::ImportContacts { csv } => {
            manager.read_and_emit().await;
            let summary = manager
                .import_contacts_csv(&csv)
                .await
                .with_context(|| format!("Failed to import {}", csv.display()))?;
            print_import("contacts", &summary);
        }
        Commands::ImportServers { csv } => {
            manager.read_and_emit().await;
            let summary = manager
                .import_servers_csv(&csv)
                .await
                .with_context(|| format!("Failed to import {}", csv.display()))?;
            print_import("servers", &summary);
        }
        Commands::ExportContacts { file } => {
            manager.read_and_emit().await;
            let receipt = manager
                .export_contacts_csv(&file)
                .await
                .with_context(|| format!("Failed to export to {}", file.display()))?;
            println!("Wrote {} bytes to {}", receipt.bytes, receipt.path.display());
        }
        Commands::ExportServers { file } => {
            manager.read_and_emit().await;
            let receipt = manager
                .export_servers_csv(&file)
                .await
                .with_context(|| format!("Failed to export to {}", file.display()))?;
            println!("Wrote {} bytes to {}", receipt.bytes, receipt.path.display());
        }
        Commands::Seed { count } => {
            manager.read_and_emit().await;
            manager.generate_dummy_data(count).await?;
            print_counts(&manager);
        }
    }

    manager.destroy();
    Ok(())
}

/// Install the global subscriber.
///
/// Logs go to stderr, and also to a daily rolling file when `log_dir` is
/// configured. The returned guard flushes the file writer on drop.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.storage.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match &config.storage.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "relay-sync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Run the engine until Ctrl-C.
async fn run_watch(manager: &Arc<FileManager>) -> anyhow::Result<()> {
    let subscription = manager.cache().subscribe(|event| match event {
        DataEvent::ReloadStarted => tracing::info!("Reload started"),
        DataEvent::ReloadCompleted { success } => tracing::info!(success, "Reload completed"),
        DataEvent::DataUpdated(snapshot) => tracing::debug!(
            contacts = snapshot.contacts.len(),
            servers = snapshot.servers.len(),
            on_call = snapshot.on_call.len(),
            "Data updated"
        ),
        DataEvent::DataError(error) => tracing::warn!("Data error: {}", error),
    });

    manager.start().await?;
    print_counts(manager);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Received shutdown signal");

    subscription.unsubscribe();
    manager.destroy();
    Ok(())
}

fn print_counts(manager: &FileManager) {
    let snapshot = manager.get_cached_data();
    for collection in Collection::ALL {
        println!("{:<12} {}", collection.as_str(), snapshot.count(collection));
    }
}

fn print_import(kind: &str, summary: &ImportSummary) {
    println!("Imported {} {}", summary.imported, kind);
    for row in &summary.skipped {
        println!("  skipped line {}: {}", row.line, row.reason);
    }
}
