//! Outbox CLI - Command line interface for the offline action queue.
//!
//! This tool inspects and manipulates a queue database, and can deliver
//! its contents to an HTTP endpoint once or continuously.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use outbox_common::{PendingAction, Priority};
use outbox_store::SqliteStore;
use outbox_sync::{
    ActionDispatcher, DropReason, HttpEndpoints, PassOutcome, QueueEvent, SkipReason, SyncConfig, SyncEngine,
    SyncMode,
};

#[derive(Parser)]
#[command(name = "outbox")]
#[command(about = "Outbox - Offline action queue")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Queue database (default: <data dir>/outbox/queue.db).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue an action.
    Enqueue {
        /// Action type, e.g. ADD_TO_CART or add-to-cart.
        action_type: String,

        /// JSON payload.
        #[arg(default_value = "{}")]
        payload: String,

        /// Priority: low, medium or high.
        #[arg(short, long, default_value = "medium")]
        priority: Priority,
    },

    /// List pending actions in dispatch order.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Print the number of pending actions.
    Count,

    /// Show queue status.
    Status,

    /// Run one sync pass.
    Sync {
        /// Base URL of the action endpoints.
        #[arg(short, long)]
        endpoint: String,
    },

    /// Remove every pending action without delivering it.
    Clear {
        /// Forget the drop history as well.
        #[arg(long)]
        dropped: bool,
    },

    /// Keep syncing until interrupted.
    Run {
        /// Base URL of the action endpoints.
        #[arg(short, long)]
        endpoint: String,

        /// Seconds between periodic passes (overrides the config).
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref())?;
    let db = match cli.db {
        Some(path) => path,
        None => default_db_path()?,
    };

    match cli.command {
        Commands::Enqueue {
            action_type,
            payload,
            priority,
        } => cmd_enqueue(&db, config, &action_type, &payload, priority).await,

        Commands::List { json } => cmd_list(&db, config, json).await,

        Commands::Count => cmd_count(&db, config).await,

        Commands::Status => cmd_status(&db, config).await,

        Commands::Sync { endpoint } => cmd_sync(&db, config, &endpoint).await,

        Commands::Clear { dropped } => cmd_clear(&db, config, dropped).await,

        Commands::Run { endpoint, interval } => cmd_run(&db, config, &endpoint, interval).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(SyncConfig::default()),
    }
}

fn default_db_path() -> Result<PathBuf> {
    let dir = dirs::data_local_dir().context("No local data directory on this platform")?;
    Ok(dir.join("outbox").join("queue.db"))
}

/// Build an engine over the queue database.
///
/// Without an endpoint the engine has no handlers and never syncs on its own.
fn open_engine(db: &Path, mut config: SyncConfig, endpoint: Option<&str>) -> Result<SyncEngine> {
    let store = SqliteStore::open(db)
        .with_context(|| format!("Failed to open queue at {}", db.display()))?
        .with_drop_history(config.dropped_history);

    let dispatcher = match endpoint {
        Some(url) => {
            let mut endpoints = HttpEndpoints::new(url);
            endpoints.timeout = config.dispatch_timeout;
            ActionDispatcher::http(&endpoints).context("Failed to configure HTTP delivery")?
        }
        None => {
            config.sync_on_enqueue = false;
            ActionDispatcher::new()
        }
    };

    Ok(SyncEngine::builder(Arc::new(store), dispatcher).config(config).build())
}

/// Queue an action.
async fn cmd_enqueue(db: &Path, config: SyncConfig, action_type: &str, payload: &str, priority: Priority) -> Result<()> {
    let payload: serde_json::Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let engine = open_engine(db, config, None)?;

    let id = engine
        .enqueue_named(action_type, payload, priority)
        .await
        .context("Failed to queue action")?;

    println!("{}", id);
    Ok(())
}

/// List pending actions.
async fn cmd_list(db: &Path, config: SyncConfig, json: bool) -> Result<()> {
    let engine = open_engine(db, config, None)?;
    let pending = engine.list_pending().await.context("Failed to read queue")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&pending)?);
    } else if pending.is_empty() {
        println!("Queue is empty.");
    } else {
        for action in &pending {
            print_action(action);
        }
    }

    Ok(())
}

fn print_action(action: &PendingAction) {
    println!(
        "  {}  {:<15} {:<6} retries={}  queued {}",
        action.id,
        action.action_type,
        action.priority,
        action.retry_count,
        action.enqueued_at.format("%Y-%m-%d %H:%M:%S")
    );
}

/// Count pending actions.
async fn cmd_count(db: &Path, config: SyncConfig) -> Result<()> {
    let engine = open_engine(db, config, None)?;
    println!("{}", engine.count_pending().await.context("Failed to read queue")?);
    Ok(())
}

/// Show queue status.
async fn cmd_status(db: &Path, config: SyncConfig) -> Result<()> {
    let engine = open_engine(db, config, None)?;
    let status = engine.status().await.context("Failed to read queue")?;

    println!("Queue Status:");
    println!("  Database: {}", db.display());
    println!("  Pending: {}", status.pending.len());
    println!("  Retrying: {}", status.retrying());
    for priority in [Priority::High, Priority::Medium, Priority::Low] {
        let count = status.pending.iter().filter(|a| a.priority == priority).count();
        println!("    {}: {}", priority, count);
    }
    if let Some(oldest) = status.pending.iter().map(|a| a.enqueued_at).min() {
        println!("  Oldest: {}", oldest);
    }
    if let (Some(report), Some(at)) = (&status.last_pass, status.last_pass_at) {
        println!(
            "  Last pass: {} ({} delivered, {} retrying, {} dropped)",
            at.format("%Y-%m-%d %H:%M:%S"),
            report.delivered,
            report.retried,
            report.dropped
        );
    }

    println!("  Recently dropped: {}", status.recently_dropped.len());
    for dropped in status.recently_dropped.iter().rev() {
        println!(
            "    {}  {:<15} retries={}  {}  {}",
            dropped.id,
            dropped.action_type,
            dropped.retry_count,
            dropped.dropped_at.format("%Y-%m-%d %H:%M:%S"),
            drop_reason(&dropped.reason)
        );
    }

    Ok(())
}

fn drop_reason(reason: &DropReason) -> String {
    match reason {
        DropReason::RetriesExhausted { last_error: Some(e) } => format!("gave up: {}", e),
        DropReason::RetriesExhausted { last_error: None } => "gave up".to_string(),
        DropReason::NoHandler { detail } => format!("undeliverable: {}", detail),
        DropReason::Unreadable { detail } => format!("unreadable: {}", detail),
    }
}

/// Run one pass against an endpoint.
async fn cmd_sync(db: &Path, config: SyncConfig, endpoint: &str) -> Result<()> {
    let engine = open_engine(db, config, Some(endpoint))?;

    match engine.run_pass().await.context("Sync pass failed")? {
        PassOutcome::Completed(report) => {
            println!("Sync completed in {:?}:", report.duration);
            println!("  Delivered: {}", report.delivered);
            println!("  Retrying: {}", report.retried);
            println!("  Dropped: {}", report.dropped);
        }
        PassOutcome::Skipped(SkipReason::Offline) => println!("Offline, nothing sent."),
        PassOutcome::Skipped(SkipReason::AlreadyRunning) => println!("A sync is already running."),
    }

    Ok(())
}

/// Clear the queue.
async fn cmd_clear(db: &Path, config: SyncConfig, dropped: bool) -> Result<()> {
    let engine = open_engine(db, config, None)?;
    let count = engine.count_pending().await.context("Failed to read queue")?;
    engine.clear_all().await.context("Failed to clear queue")?;
    println!("Removed {} pending actions.", count);
    if dropped {
        engine.clear_dropped().await.context("Failed to clear drop history")?;
        println!("Drop history cleared.");
    }
    Ok(())
}

/// Sync continuously until Ctrl-C.
async fn cmd_run(db: &Path, config: SyncConfig, endpoint: &str, interval: Option<u64>) -> Result<()> {
    let mode = match interval {
        Some(0) => anyhow::bail!("Interval must be at least one second"),
        Some(secs) => SyncMode::Periodic {
            interval: Duration::from_secs(secs),
        },
        None => config.sync_mode.clone(),
    };

    let engine = open_engine(db, config, Some(endpoint))?;
    let mut events = engine.subscribe();
    let (scheduler, task) = engine.spawn_scheduler(mode.clone(), None);

    info!("Syncing {} to {} ({:?}), Ctrl-C to stop", db.display(), endpoint, mode);
    scheduler.request_sync().await.context("Initial sync failed")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(QueueEvent::Delivered { id, action_type }) => info!("Delivered {} ({})", id, action_type),
                Some(QueueEvent::Dropped(dropped)) => {
                    warn!("Dropped {} ({}): {}", dropped.id, dropped.action_type, drop_reason(&dropped.reason))
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    info!("Stopping");
    scheduler.shutdown().await;
    task.await.context("Scheduler task failed")?;
    Ok(())
}
