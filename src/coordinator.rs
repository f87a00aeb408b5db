//! Background delivery coordinator.
//!
//! Runs the same drain as the foreground, from a context that outlives it.
//! It owns its own [`Reconciler`] over its own store handle, wakes when
//! connectivity comes back or when the foreground asks, and reports each
//! drain with fire-and-forget messages: one [`WorkerMessage::SyncSuccess`]
//! per delivered entry, then a [`WorkerMessage::SyncResult`]. Messages are
//! only hints to refresh; the store stays the source of truth.

use crate::config::SyncSettings;
use crate::entry::EntryId;
use crate::error::{Result, SyncError};
use crate::network::NetworkMonitor;
use crate::reconciler::{Reconciler, RunReport};
use crate::remote::RemoteService;
use crate::store::QueueStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 32;
const MESSAGE_CAPACITY: usize = 256;

/// Foreground to background
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerCommand {
    SyncNow,
    Shutdown,
}

/// Background to foreground
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// One entry was accepted by the server under `name`
    SyncSuccess { entry_id: EntryId, name: String },
    SyncResult { succeeded: usize, remaining: usize },
}

pub struct BackgroundCoordinator {
    reconciler: Reconciler,
    monitor: NetworkMonitor,
    enabled: bool,
}

/// Foreground side of a running coordinator
pub struct CoordinatorHandle {
    commands: mpsc::Sender<WorkerCommand>,
    messages: Option<mpsc::Receiver<WorkerMessage>>,
    task: JoinHandle<()>,
}

impl BackgroundCoordinator {
    /// `store` should be this context's own handle on the shared queue
    pub fn new(store: QueueStore, remote: Arc<dyn RemoteService>, monitor: NetworkMonitor, settings: &SyncSettings) -> Self {
        Self {
            reconciler: Reconciler::new(store, remote, settings.submit_timeout),
            monitor,
            enabled: settings.background_sync,
        }
    }

    /// Start the coordinator on the current runtime.
    ///
    /// Fails with `BackgroundUnavailable` when background delivery is
    /// disabled or there is no runtime to run on; callers then sync from the
    /// foreground only.
    pub fn spawn(self) -> Result<CoordinatorHandle> {
        if !self.enabled {
            return Err(SyncError::BackgroundUnavailable("disabled in configuration".to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::BackgroundUnavailable(e.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_CAPACITY);

        // Subscribe before returning so no transition after spawn is missed
        let transitions = self.monitor.subscribe();
        let task = runtime.spawn(self.run(transitions, command_rx, message_tx));
        info!("Background coordinator registered");

        Ok(CoordinatorHandle {
            commands: command_tx,
            messages: Some(message_rx),
            task,
        })
    }

    async fn run(
        self,
        mut transitions: broadcast::Receiver<crate::network::Transition>,
        mut commands: mpsc::Receiver<WorkerCommand>,
        messages: mpsc::Sender<WorkerMessage>,
    ) {
        loop {
            tokio::select! {
                transition = transitions.recv() => match transition {
                    Ok(t) if t.came_online() => {
                        debug!("Background coordinator woke on reconnect");
                        self.wake(&messages).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Missed transitions may have included a reconnect
                        debug!(skipped, "Coordinator lagged on transitions");
                        if self.monitor.is_online() {
                            self.wake(&messages).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                command = commands.recv() => match command {
                    Some(WorkerCommand::SyncNow) => {
                        debug!("Background coordinator woke on request");
                        self.wake(&messages).await;
                    }
                    Some(WorkerCommand::Shutdown) | None => break,
                },
            }
        }
        info!("Background coordinator stopped");
    }

    async fn wake(&self, messages: &mpsc::Sender<WorkerMessage>) {
        if !self.monitor.is_online() {
            debug!("Offline, skipping background drain");
            return;
        }

        let report: RunReport = match self.reconciler.run_once().await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Background drain failed");
                return;
            }
        };

        let store = self.reconciler.store().clone();
        let remaining = match tokio::task::spawn_blocking(move || store.count()).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                warn!(error = %e, "Could not count remaining entries");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Count task failed");
                return;
            }
        };

        let succeeded = report.result.succeeded;
        for delivered in report.delivered {
            send(
                messages,
                WorkerMessage::SyncSuccess {
                    entry_id: delivered.id,
                    name: delivered.name,
                },
            );
        }
        send(messages, WorkerMessage::SyncResult { succeeded, remaining });
    }
}

/// At-most-once: a lost message only leaves the UI stale
fn send(messages: &mpsc::Sender<WorkerMessage>, message: WorkerMessage) {
    if let Err(e) = messages.try_send(message) {
        debug!(error = %e, "Dropped worker message");
    }
}

impl CoordinatorHandle {
    /// Ask the coordinator to drain now. Fire-and-forget.
    pub fn request_sync(&self) {
        if let Err(e) = self.commands.try_send(WorkerCommand::SyncNow) {
            debug!(error = %e, "Dropped sync-now command");
        }
    }

    /// Take the message receiver; only one consumer can hold it
    pub fn take_messages(&mut self) -> Option<mpsc::Receiver<WorkerMessage>> {
        self.messages.take()
    }

    /// Stop the coordinator and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.commands.send(WorkerCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Background coordinator task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
