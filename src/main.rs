use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use colored::Colorize;
use eyre::{Context, Result, eyre};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tasksync::{
    Config, Delivery, MutationKind, NetworkMonitor, QueueEntry, QueueStore, SyncClient, SyncMode, SyncStatus, TcpProbe,
    jsonl,
};

#[derive(Parser)]
#[command(name = "tasksync")]
#[command(about = "TaskSync CLI - Offline queue and sync for the task tracker")]
#[command(version = env!("GIT_DESCRIBE"))]
struct Cli {
    /// Config file (default: <config dir>/tasksync/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the queue (overrides store_path in the config)
    #[arg(short, long)]
    store_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show connectivity and pending mutations
    Status,

    /// List queued mutations in replay order
    List,

    /// Record a mutation, delivering it now if the server is reachable
    Enqueue {
        /// create-task, update-task or assign-task
        #[arg(short, long)]
        kind: MutationKind,

        /// JSON object with the task fields
        #[arg(short, long)]
        payload: String,

        /// Queue without trying the server
        #[arg(long)]
        offline: bool,
    },

    /// Deliver queued mutations now
    Sync,

    /// Drop one queued mutation without delivering it
    Discard { id: i64 },

    /// Drop every queued mutation
    Clear,

    /// Write the queue to a JSONL file
    Export { file: PathBuf },

    /// Append mutations from a JSONL file to the queue
    Import { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let store_root = match cli.store_path {
        Some(path) => path,
        None => config.store_root()?,
    };

    match cli.command {
        Commands::Status => {
            let online = probe(&config).await;
            let client = open_client(&config, &store_root, online)?;
            print_status(&client.get_sync_status()?);
            if let Some(reason) = client.queue_error() {
                println!("{} {}", "Queue error:".red(), reason);
            }
        }
        Commands::List => {
            let store = open_store(&store_root)?;
            let entries = store.list_all()?;
            if entries.is_empty() {
                println!("Queue is empty");
            }
            for entry in &entries {
                print_entry(entry);
            }
        }
        Commands::Enqueue { kind, payload, offline } => {
            let payload: serde_json::Value = serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let online = !offline && probe(&config).await;
            let client = open_client(&config, &store_root, online)?;

            match client.enqueue_or_submit(kind, payload).await? {
                Delivery::Delivered { id } => println!("{} entry {} delivered", "Synced:".green(), id),
                Delivery::Queued { id } => println!("{} entry {} will sync when online", "Queued:".yellow(), id),
                Delivery::SubmittedDirect { name } => {
                    println!("{} created {} (offline queue unavailable)", "Submitted:".green(), name)
                }
            }
        }
        Commands::Sync => {
            let client = open_client(&config, &store_root, probe(&config).await)?;
            let pending = client.get_sync_status()?.pending_count;
            if pending == 0 {
                println!("No items to sync");
                return Ok(());
            }

            println!("Syncing {} items...", pending);
            let report = client.request_sync_now().await?;
            let result = report.result;
            if result.failed == 0 {
                println!("{} {} items", "Synced".green(), result.succeeded);
            } else {
                println!(
                    "{} {} of {} items, {} still queued",
                    "Synced".yellow(),
                    result.succeeded,
                    result.attempted,
                    result.failed
                );
            }
        }
        Commands::Discard { id } => {
            let store = open_store(&store_root)?;
            if store.get(id)?.is_none() {
                return Err(eyre!("No queued entry with id {}", id));
            }
            store.remove_by_id(id)?;
            println!("Discarded entry {}", id);
        }
        Commands::Clear => {
            let store = open_store(&store_root)?;
            let removed = store.clear_all()?;
            println!("Cleared {} entries", removed);
        }
        Commands::Export { file } => {
            let store = open_store(&store_root)?;
            let count = jsonl::export_queue(&store, &file)?;
            println!("Exported {} entries to {}", count, file.display());
        }
        Commands::Import { file } => {
            let store = open_store(&store_root)?;
            let count = jsonl::import_queue(&store, &file)?;
            println!("Imported {} entries from {}", count, file.display());
        }
    }

    Ok(())
}

fn open_store(root: &Path) -> Result<QueueStore> {
    QueueStore::open(root).context(format!("Failed to open queue under {}", root.display()))
}

fn open_client(config: &Config, root: &Path, online: bool) -> Result<SyncClient> {
    let remote = config.remote()?;
    Ok(SyncClient::open(root, Arc::new(remote), NetworkMonitor::new(online), config.settings()))
}

/// One reachability sample of the configured server
async fn probe(config: &Config) -> bool {
    match TcpProbe::for_url(&config.server_url, config.settings().submit_timeout) {
        Some(probe) => probe.sample().await,
        None => false,
    }
}

fn print_status(status: &SyncStatus) {
    let line = status.summary();
    let line = match status.mode {
        SyncMode::Offline => line.yellow(),
        SyncMode::OnlineSyncing => line.cyan(),
        SyncMode::OnlineIdle if status.pending_count > 0 => line.green(),
        SyncMode::OnlineIdle => line.normal(),
    };
    println!("{}", line);
}

fn print_entry(entry: &QueueEntry) {
    let when = DateTime::from_timestamp_millis(entry.enqueued_at)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    let subject = entry
        .payload
        .get("subject")
        .or_else(|| entry.payload.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    println!(
        "{:>5}  {}  {:<12}  {}",
        entry.id.to_string().bold(),
        when.dimmed(),
        entry.kind.as_str(),
        subject
    );
}
