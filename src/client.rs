//! Foreground facade over the sync engine.
//!
//! [`SyncClient`] is the single entry point a UI layer talks to: it decides
//! between the queue and the network, answers status queries, and tells
//! subscribers when they should refresh their view of the remote task list.

use crate::config::SyncSettings;
use crate::coordinator::{CoordinatorHandle, WorkerMessage};
use crate::entry::{EntryId, MutationKind, NewEntry, now_ms};
use crate::error::{Result, StoreError, SyncError};
use crate::network::NetworkMonitor;
use crate::reconciler::{Reconciler, RunReport, SyncRunResult, submit_with_timeout};
use crate::remote::{RemoteService, SubmitRequest};
use crate::status::{LastSyncResult, QueueSnapshot, SyncStatus, project};
use crate::store::QueueStore;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 64;

/// Where a mutation ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Queued, then confirmed by the remote service and removed
    Delivered { id: EntryId },
    /// Durably queued; a later drain delivers it
    Queued { id: EntryId },
    /// Queue unavailable; sent straight to the remote service
    SubmittedDirect { name: String },
}

/// Notifications for the rendering layer
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged(SyncStatus),
    /// The server accepted a queued entry, from either context
    EntryDelivered { id: EntryId, name: String },
    /// A foreground drain finished; refresh the task list from the server
    RunFinished(SyncRunResult),
    /// The background coordinator delivered entries
    BackgroundSynced { succeeded: usize, remaining: usize },
}

#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<Inner>,
}

struct Inner {
    /// `None` when the store could not be opened
    reconciler: Option<Reconciler>,
    queue_error: Option<String>,
    remote: Arc<dyn RemoteService>,
    monitor: NetworkMonitor,
    settings: SyncSettings,
    last_result: Mutex<Option<LastSyncResult>>,
    events: broadcast::Sender<SyncEvent>,
    background: Mutex<Option<CoordinatorHandle>>,
}

impl SyncClient {
    /// Open the queue under `store_root`. An unavailable store degrades the
    /// client to online-only instead of failing.
    pub fn open<P: AsRef<Path>>(
        store_root: P,
        remote: Arc<dyn RemoteService>,
        monitor: NetworkMonitor,
        settings: SyncSettings,
    ) -> Self {
        let (reconciler, queue_error) = match QueueStore::open(store_root.as_ref()) {
            Ok(store) => (Some(Reconciler::new(store, remote.clone(), settings.submit_timeout)), None),
            Err(e) => {
                error!(error = %e, "Offline queue unavailable, continuing online-only");
                (None, Some(e.to_string()))
            }
        };
        Self::build(reconciler, queue_error, remote, monitor, settings)
    }

    /// Use an already opened store
    pub fn with_store(store: QueueStore, remote: Arc<dyn RemoteService>, monitor: NetworkMonitor, settings: SyncSettings) -> Self {
        let reconciler = Reconciler::new(store, remote.clone(), settings.submit_timeout);
        Self::build(Some(reconciler), None, remote, monitor, settings)
    }

    fn build(
        reconciler: Option<Reconciler>,
        queue_error: Option<String>,
        remote: Arc<dyn RemoteService>,
        monitor: NetworkMonitor,
        settings: SyncSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                reconciler,
                queue_error,
                remote,
                monitor,
                settings,
                last_result: Mutex::new(None),
                events,
                background: Mutex::new(None),
            }),
        }
    }

    /// Why the queue is disabled, if it is
    pub fn queue_error(&self) -> Option<&str> {
        self.inner.queue_error.as_deref()
    }

    pub fn store(&self) -> Option<&QueueStore> {
        self.inner.reconciler.as_ref().map(Reconciler::store)
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.inner.monitor
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    /// Record a mutation. The store is written before any network attempt,
    /// so nothing is lost if the process dies mid-request.
    pub async fn enqueue_or_submit(&self, kind: MutationKind, payload: Value) -> Result<Delivery> {
        let entry = NewEntry::new(kind, payload);
        entry.validate()?;

        let Some(reconciler) = &self.inner.reconciler else {
            return self.submit_direct(entry).await;
        };

        let store = reconciler.store().clone();
        let id = blocking(move || store.enqueue(entry)).await?;
        debug!(id, %kind, "Mutation queued");
        self.emit_status().await;

        if !self.inner.monitor.is_online() {
            info!(id, "Offline, mutation will sync when back online");
            return Ok(Delivery::Queued { id });
        }

        let report = self.drain(reconciler).await?;
        // A joined run may have taken its snapshot before this entry existed
        if report.coalesced && self.is_pending(reconciler, id).await? {
            self.drain(reconciler).await?;
        }

        if self.is_pending(reconciler, id).await? {
            Ok(Delivery::Queued { id })
        } else {
            Ok(Delivery::Delivered { id })
        }
    }

    async fn submit_direct(&self, entry: NewEntry) -> Result<Delivery> {
        let reason = self.queue_error().unwrap_or("store unavailable").to_string();
        if !self.inner.monitor.is_online() {
            return Err(SyncError::QueueDisabled(format!("offline and {}", reason)));
        }

        let request = SubmitRequest {
            kind: entry.kind,
            payload: &entry.payload,
            client_ref: &entry.client_ref,
        };
        match submit_with_timeout(self.inner.remote.as_ref(), self.inner.settings.submit_timeout, request).await {
            Ok(record) => {
                info!(remote = %record.name, "Submitted directly, queue disabled");
                Ok(Delivery::SubmittedDirect { name: record.name })
            }
            Err(e) => Err(SyncError::QueueDisabled(format!("{} ({})", e, reason))),
        }
    }

    /// Drain now, regardless of what the monitor says
    pub async fn request_sync_now(&self) -> Result<RunReport> {
        match &self.inner.reconciler {
            Some(reconciler) => self.drain(reconciler).await,
            None => {
                debug!("Queue disabled, nothing to sync");
                Ok(RunReport::default())
            }
        }
    }

    async fn drain(&self, reconciler: &Reconciler) -> Result<RunReport> {
        self.emit_status().await;
        let report = reconciler.run_once().await;

        if let Ok(report) = &report
            && !report.coalesced
        {
            let last = LastSyncResult::from_run(&report.result, now_ms());
            *self.inner.last_result.lock().unwrap_or_else(PoisonError::into_inner) = Some(last);
            for delivered in &report.delivered {
                self.emit(SyncEvent::EntryDelivered {
                    id: delivered.id,
                    name: delivered.name.clone(),
                });
            }
            if report.result.attempted > 0 {
                self.emit(SyncEvent::RunFinished(report.result));
            }
        }
        self.emit_status().await;
        report
    }

    async fn is_pending(&self, reconciler: &Reconciler, id: EntryId) -> Result<bool> {
        let store = reconciler.store().clone();
        Ok(blocking(move || store.get(id)).await?.is_some())
    }

    /// Current status, derived from the store and the monitor.
    ///
    /// Counts the queue on the calling thread. This is a short blocking
    /// SQLite read that can wait behind another writer; async code should
    /// use [`SyncClient::sync_status`] instead.
    pub fn get_sync_status(&self) -> Result<SyncStatus> {
        let pending = match &self.inner.reconciler {
            Some(reconciler) => Some(reconciler.store().count()?),
            None => None,
        };
        Ok(self.project_status(pending))
    }

    /// Current status, with the queue counted on the blocking pool
    pub async fn sync_status(&self) -> Result<SyncStatus> {
        let pending = match &self.inner.reconciler {
            Some(reconciler) => {
                let store = reconciler.store().clone();
                Some(blocking(move || store.count()).await?)
            }
            None => None,
        };
        Ok(self.project_status(pending))
    }

    /// `pending` is `None` when the queue is disabled
    fn project_status(&self, pending: Option<usize>) -> SyncStatus {
        let queue = match (&self.inner.reconciler, pending) {
            (Some(reconciler), Some(pending)) => QueueSnapshot {
                pending,
                draining: reconciler.is_running(),
                queue_enabled: true,
            },
            _ => QueueSnapshot {
                pending: 0,
                draining: false,
                queue_enabled: false,
            },
        };
        let last = *self.inner.last_result.lock().unwrap_or_else(PoisonError::into_inner);
        project(queue, self.inner.monitor.state(), last.as_ref())
    }

    pub fn last_sync_result(&self) -> Option<LastSyncResult> {
        *self.inner.last_result.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Listen for status changes; drop the receiver to unsubscribe
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    async fn emit_status(&self) {
        match self.sync_status().await {
            Ok(status) => self.emit(SyncEvent::StatusChanged(status)),
            Err(e) => warn!(error = %e, "Could not compute sync status"),
        }
    }

    /// Hand reconnect drains to a background coordinator. Its messages
    /// become [`SyncEvent::EntryDelivered`] and
    /// [`SyncEvent::BackgroundSynced`] events.
    pub fn attach_background(&self, mut handle: CoordinatorHandle) {
        if let Some(messages) = handle.take_messages() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(self.clone().forward_messages(messages));
                }
                Err(e) => warn!(error = %e, "No runtime, background results will not be forwarded"),
            }
        }
        *self.inner.background.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!("Background coordinator attached");
    }

    pub fn has_background(&self) -> bool {
        self.inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Detach and stop the background coordinator, if any
    pub async fn shutdown_background(&self) {
        let handle = self.inner.background.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    async fn forward_messages(self, mut messages: mpsc::Receiver<WorkerMessage>) {
        while let Some(message) = messages.recv().await {
            match message {
                WorkerMessage::SyncSuccess { entry_id, name } => {
                    debug!(id = entry_id, remote = %name, "Background delivered entry");
                    self.emit(SyncEvent::EntryDelivered { id: entry_id, name });
                }
                WorkerMessage::SyncResult { succeeded, remaining } => {
                    debug!(succeeded, remaining, "Background sync result");
                    self.emit(SyncEvent::BackgroundSynced { succeeded, remaining });
                    self.emit_status().await;
                }
            }
        }
    }

    /// Start the auto-sync loop: drain on reconnect and on a coarse timer
    /// while online with pending entries.
    ///
    /// Fails with `NoRuntime` when called outside a Tokio runtime.
    pub fn start(&self) -> Result<JoinHandle<()>> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime("the auto-sync loop"))?;
        let client = self.clone();
        // Subscribe now so a transition right after start is not missed
        let transitions = self.inner.monitor.subscribe();
        Ok(runtime.spawn(async move { client.auto_sync(transitions).await }))
    }

    async fn auto_sync(self, mut transitions: broadcast::Receiver<crate::network::Transition>) {
        let Some(reconciler) = self.inner.reconciler.clone() else {
            info!("Queue disabled, auto-sync not started");
            return;
        };

        let mut ticker = tokio::time::interval(self.inner.settings.sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                transition = transitions.recv() => match transition {
                    Ok(t) => {
                        self.emit_status().await;
                        if t.came_online() {
                            self.on_reconnect(&reconciler).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Auto-sync lagged on transitions");
                        self.emit_status().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    if self.inner.monitor.is_online() && !reconciler.is_running() {
                        self.on_tick(&reconciler).await;
                    }
                }
            }
        }
        debug!("Auto-sync loop stopped");
    }

    async fn on_reconnect(&self, reconciler: &Reconciler) {
        if self.has_background() {
            debug!("Reconnected, background coordinator will drain");
            return;
        }

        tokio::time::sleep(self.inner.settings.reconnect_delay).await;
        if !self.inner.monitor.is_online() {
            debug!("Went offline again before the reconnect drain");
            return;
        }
        if let Err(e) = self.drain(reconciler).await {
            error!(error = %e, "Reconnect drain failed");
        }
    }

    async fn on_tick(&self, reconciler: &Reconciler) {
        let store = reconciler.store().clone();
        match blocking(move || store.count()).await {
            Ok(0) => {}
            Ok(pending) => {
                debug!(pending, "Periodic sync");
                if let Err(e) = self.drain(reconciler).await {
                    error!(error = %e, "Periodic drain failed");
                }
            }
            Err(e) => warn!(error = %e, "Could not count pending entries"),
        }
    }
}

async fn blocking<T, F>(op: F) -> Result<T>
where
    F: FnOnce() -> std::result::Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| SyncError::TaskJoin(e.to_string()))?
        .map_err(SyncError::from)
}
