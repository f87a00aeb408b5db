// Background delivery worker.
//
// Opens the same queue as the foreground, watches connectivity on its own and
// drains whenever the server comes back. Reads `WorkerCommand` JSON lines on
// stdin and writes `WorkerMessage` JSON lines on stdout; logs go to stderr.

use clap::Parser;
use eyre::{Context, Result, eyre};
use std::path::PathBuf;
use std::sync::Arc;
use tasksync::{BackgroundCoordinator, Config, NetworkMonitor, QueueStore, TcpProbe, WorkerCommand, WorkerMessage, spawn_probe};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "tasksync-worker")]
#[command(about = "TaskSync background worker - delivers queued mutations when the server is reachable")]
#[command(version = env!("GIT_DESCRIBE"))]
struct Cli {
    /// Config file (default: <config dir>/tasksync/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the queue (overrides store_path in the config)
    #[arg(short, long)]
    store_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries messages only
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let store_root = match cli.store_path {
        Some(path) => path,
        None => config.store_root()?,
    };

    let store = QueueStore::open(&store_root).context(format!("Failed to open queue under {}", store_root.display()))?;
    let probe = TcpProbe::for_url(&config.server_url, config.settings().submit_timeout)
        .ok_or_else(|| eyre!("Cannot probe server url {}", config.server_url))?;

    let monitor = NetworkMonitor::new(probe.sample().await);
    let probe_task = spawn_probe(monitor.clone(), probe, config.probe_interval())?;

    let remote = Arc::new(config.remote()?);
    let mut handle = BackgroundCoordinator::new(store, remote, monitor.clone(), &config.settings())
        .spawn()?;
    let messages = handle
        .take_messages()
        .ok_or_else(|| eyre!("Coordinator messages already taken"))?;
    let writer = tokio::spawn(write_messages(messages));

    // Drain whatever is already pending if we start online
    if monitor.is_online() {
        handle.request_sync();
    }
    info!(root = %store_root.display(), "Worker running");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match serde_json::from_str::<WorkerCommand>(&line) {
                    Ok(WorkerCommand::SyncNow) => handle.request_sync(),
                    Ok(WorkerCommand::Shutdown) => break,
                    Err(e) => warn!(error = %e, line = %line, "Ignoring malformed command"),
                },
                Ok(None) => {
                    // The foreground went away; keep delivering
                    debug!("stdin closed");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    handle.shutdown().await;
    probe_task.abort();
    // The coordinator dropped its sender, so the writer drains and exits
    writer.await.context("Message writer failed")??;

    // A pending stdin read would hold up runtime shutdown
    std::process::exit(0)
}

async fn write_messages(mut messages: mpsc::Receiver<WorkerMessage>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(message) = messages.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        if let Err(e) = stdout.write_all(&line).await {
            // Nobody is listening; messages are only hints
            debug!(error = %e, "Could not write message");
            continue;
        }
        stdout.flush().await?;
    }
    Ok(())
}
