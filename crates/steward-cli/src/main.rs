//! Steward CLI
//!
//! Drives the reconciliation engine from a JSON observation file and keeps
//! snapshots in SQLite.
//!
//! # Usage
//! ```bash
//! steward --server ts3.example.com watch --source account.json [--verbose]
//! steward snapshot --json
//! steward history 12345 --hours 48
//! steward export --output backup.json
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

use steward_core::alerts::format_hours;
use steward_core::source::JsonFileSource;
use steward_core::store::{window_hours, SqliteSnapshotStore};
use steward_core::{AccountSnapshot, Engine, EngineConfig, EntityId, SnapshotStore};

const DEFAULT_DB: &str = ".steward/steward.db";

/// Steward - account state reconciliation and predictive alerts
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Game server host (overrides the config file)
    #[arg(long)]
    server: Option<String>,

    /// SQLite database path (overrides the config file)
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        #[arg(default_value = "steward.toml")]
        path: PathBuf,
    },

    /// Run the refresh loop against a JSON observation file
    Watch {
        /// File holding a serialized wide observation
        #[arg(short, long, value_name = "FILE")]
        source: PathBuf,

        /// Refresh once, print, and exit
        #[arg(long)]
        once: bool,
    },

    /// Print the latest stored snapshot
    Snapshot {
        /// Output JSON for integrations
        #[arg(long)]
        json: bool,
    },

    /// Show the stored history of one village
    History {
        entity: String,

        #[arg(long, default_value = "24")]
        hours: i64,

        #[arg(long)]
        json: bool,
    },

    /// Drop entity history and game events older than the retention window
    Prune {
        /// Retention in hours (defaults to the configured window)
        #[arg(long)]
        hours: Option<i64>,
    },

    /// Dump the latest snapshot, entity history and game events as JSON
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_target(false)
            .init();
    }

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Init { path } => {
            config.to_file(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
        Commands::Watch { source, once } => watch_source(config, &source, once).await?,
        Commands::Snapshot { json } => {
            let store = open_store(&config)?;
            match store.get_latest(&config.account_id())? {
                Some(snapshot) if json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
                Some(snapshot) => print_snapshot(&snapshot),
                None if json => println!("{{ \"error\": \"no snapshot stored\" }}"),
                None => println!("No snapshot stored for {} yet.", config.account_id()),
            }
        }
        Commands::History {
            entity,
            hours,
            json,
        } => {
            let window = window_hours(hours).context("invalid --hours")?;
            let store = open_store(&config)?;
            let history = store.get_entity_history(
                &config.account_id(),
                &EntityId::new(entity.clone()),
                window,
            )?;
            if json {
                println!("{}", serde_json::to_string_pretty(&history)?);
            } else if history.is_empty() {
                println!("No history for village {} in the last {}h.", entity, hours);
            } else {
                for record in &history {
                    let r = record.resources;
                    println!(
                        "{}  wood {:>8.0}  clay {:>8.0}  iron {:>8.0}  crop {:>8.0}  ({})",
                        record.captured_at.format("%Y-%m-%d %H:%M:%S"),
                        r.wood,
                        r.clay,
                        r.iron,
                        r.crop,
                        record.origin
                    );
                }
            }
        }
        Commands::Prune { hours } => {
            let retain = match hours {
                Some(hours) => window_hours(hours).context("invalid --hours")?,
                None => config.retention(),
            };
            let store = open_store(&config)?;
            let removed = store.prune(retain)?;
            let stats = store.stats()?;
            println!(
                "Pruned {} records; {} history records remain across {} villages, {} game events.",
                removed, stats.history_records, stats.tracked_entities, stats.game_events
            );
        }
        Commands::Export { output } => {
            let store = open_store(&config)?;
            let export = store.export(&config.account_id())?;
            let json = serde_json::to_string_pretty(&export)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("writing export to '{}'", path.display()))?;
                    println!(
                        "Exported {} history records and {} events to {}",
                        export.history.len(),
                        export.events.len(),
                        path.display()
                    );
                }
                None => println!("{}", json),
            }
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) if path.exists() => EngineConfig::from_file(path)
            .with_context(|| format!("loading config '{}'", path.display()))?,
        _ => EngineConfig::default(),
    };
    if let Some(server) = &cli.server {
        config = config.with_server_identity(server.clone());
    }
    if let Some(db) = &cli.db {
        config = config.with_database_path(db.clone());
    }
    if config.store.database_path.is_none() {
        config = config.with_database_path(DEFAULT_DB);
    }
    Ok(config)
}

fn open_store(config: &EngineConfig) -> anyhow::Result<SqliteSnapshotStore> {
    let path = config
        .store
        .database_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB));
    SqliteSnapshotStore::open(&path)
}

async fn watch_source(config: EngineConfig, source: &Path, once: bool) -> anyhow::Result<()> {
    let store: Arc<dyn SnapshotStore> = Arc::new(open_store(&config)?);
    let engine = Engine::open(config, Arc::new(JsonFileSource::new(source)), Some(store)).await?;

    if once {
        let snapshot = engine.refresh_now(true).await?;
        print_snapshot(&snapshot);
        engine.flush_persistence().await;
        return Ok(());
    }

    engine.subscribe(|snapshot| print_snapshot(&snapshot));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    println!("Watching {} (Ctrl+C to stop)", source.display());
    engine.run(shutdown_rx).await?;
    Ok(())
}

fn print_snapshot(snapshot: &AccountSnapshot) {
    let totals = &snapshot.totals;
    println!();
    println!(
        "ACCOUNT: {} ({} villages, captured {})",
        snapshot.account_id,
        totals.entity_count,
        snapshot.captured_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "   ├─ Stock       wood {:.0} | clay {:.0} | iron {:.0} | crop {:.0}",
        totals.resources.wood, totals.resources.clay, totals.resources.iron, totals.resources.crop
    );
    println!(
        "   ├─ Production  wood {:.0}/h | clay {:.0}/h | iron {:.0}/h | crop {:.0}/h (net {:.0}/h)",
        totals.production.rates.wood,
        totals.production.rates.clay,
        totals.production.rates.iron,
        totals.production.rates.crop,
        totals.production.crop_net.unwrap_or(0.0)
    );
    let estimate = if totals.population_is_estimate { " (estimated)" } else { "" };
    println!("   ├─ Population  {}{}", totals.population, estimate);
    if let Some(cp) = snapshot.culture_points {
        let next = cp
            .hours_to_next_slot()
            .map(format_hours)
            .unwrap_or_else(|| "-".to_string());
        println!("   ├─ Culture     {:.0} (+{:.0}/day, next village in {})", cp.current, cp.production, next);
    }

    if snapshot.alerts.is_empty() {
        println!("   └─ No alerts");
        return;
    }
    println!("   └─ Alerts");
    for alert in &snapshot.alerts {
        println!("        [{}] {}", alert.severity, alert.message);
    }
}
