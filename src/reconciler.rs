//! Sync reconciler: drains the durable queue against the remote service.
//!
//! Entries are replayed in queue order, one at a time. A failed entry stays
//! queued and the run moves on to the next one; only storage failures abort
//! a run. Within one execution context at most one run is in flight: a
//! caller arriving mid-run shares that run's result. Across contexts the
//! store's drain lock keeps two drains from submitting the same entry.

use crate::entry::{EntryId, QueueEntry};
use crate::error::{Result, StoreError, SubmitError, SyncError};
use crate::remote::{RemoteRecord, RemoteService, SubmitRequest};
use crate::store::QueueStore;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Counts for one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunResult {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// An entry the server accepted during a run, with the name it was given
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredEntry {
    pub id: EntryId,
    pub name: String,
}

/// A run result plus whether this call joined a run already in flight
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub result: SyncRunResult,
    /// Accepted entries in delivery order
    pub delivered: Vec<DeliveredEntry>,
    pub coalesced: bool,
}

type SharedOutcome = std::result::Result<RunReport, String>;
type InflightSlot = Mutex<Option<watch::Receiver<Option<SharedOutcome>>>>;

#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

struct Inner {
    store: QueueStore,
    remote: Arc<dyn RemoteService>,
    submit_timeout: Duration,
    inflight: InflightSlot,
}

/// Clears the in-flight slot even if the leading run is dropped mid-way
struct InflightGuard<'a> {
    slot: &'a InflightSlot,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

enum Role {
    Lead(watch::Sender<Option<SharedOutcome>>),
    Join(watch::Receiver<Option<SharedOutcome>>),
}

impl Reconciler {
    pub fn new(store: QueueStore, remote: Arc<dyn RemoteService>, submit_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                submit_timeout,
                inflight: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &QueueStore {
        &self.inner.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteService> {
        &self.inner.remote
    }

    pub fn submit_timeout(&self) -> Duration {
        self.inner.submit_timeout
    }

    /// A drain is in flight in this context
    pub fn is_running(&self) -> bool {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Drain the queue once, or join the drain already in flight
    pub async fn run_once(&self) -> Result<RunReport> {
        let role = {
            let mut slot = self.inner.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(rx) => Role::Join(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    Role::Lead(tx)
                }
            }
        };

        match role {
            Role::Join(rx) => Self::join(rx).await,
            Role::Lead(tx) => {
                let guard = InflightGuard {
                    slot: &self.inner.inflight,
                };
                let outcome = self.drain().await;
                drop(guard);

                let shared = match &outcome {
                    Ok(report) => Ok(report.clone()),
                    Err(e) => Err(e.to_string()),
                };
                // Joiners may all be gone already
                let _ = tx.send(Some(shared));

                outcome
            }
        }
    }

    async fn join(mut rx: watch::Receiver<Option<SharedOutcome>>) -> Result<RunReport> {
        info!("ConcurrentRunSuppressed: joining the sync run already in flight");

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|shared| (*shared).clone())
            .map_err(|_| SyncError::InflightRunFailed("run abandoned before finishing".to_string()))?;

        match outcome {
            Some(Ok(report)) => Ok(RunReport {
                coalesced: true,
                ..report
            }),
            Some(Err(message)) => Err(SyncError::InflightRunFailed(message)),
            None => Err(SyncError::InflightRunFailed("run finished without a result".to_string())),
        }
    }

    async fn drain(&self) -> Result<RunReport> {
        if self.blocking(|store| store.count()).await? == 0 {
            debug!("Queue empty, nothing to sync");
            return Ok(RunReport::default());
        }

        // Snapshot only once we hold the lock, so entries another context
        // already delivered are not in it
        let lock = self.blocking(|store| store.lock_drain()).await?;
        let snapshot = self.blocking(|store| store.list_all()).await?;

        let mut result = SyncRunResult {
            attempted: snapshot.len(),
            ..SyncRunResult::default()
        };
        let mut delivered = Vec::new();
        info!(pending = snapshot.len(), "Draining queue");

        for entry in &snapshot {
            match self.submit(entry).await {
                Ok(record) => {
                    let id = entry.id;
                    if let Err(e) = self.blocking(move |store| store.remove_by_id(id)).await {
                        error!(id, remote = %record.name, error = %e, "Delivered entry could not be removed");
                        return Err(e);
                    }
                    result.succeeded += 1;
                    debug!(id, remote = %record.name, "Delivered entry");
                    delivered.push(DeliveredEntry { id, name: record.name });
                }
                Err(e) => {
                    result.failed += 1;
                    warn!(id = entry.id, kind = %entry.kind, reason = e.reason(), error = %e, "Delivery failed, entry stays queued");
                }
            }
        }

        drop(lock);
        info!(
            attempted = result.attempted,
            succeeded = result.succeeded,
            failed = result.failed,
            "Sync run finished"
        );
        Ok(RunReport {
            result,
            delivered,
            coalesced: false,
        })
    }

    async fn submit(&self, entry: &QueueEntry) -> std::result::Result<RemoteRecord, SubmitError> {
        submit_with_timeout(self.inner.remote.as_ref(), self.inner.submit_timeout, SubmitRequest::from(entry)).await
    }

    /// Run a store operation on the blocking pool
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&QueueStore) -> std::result::Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.inner.store.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| SyncError::TaskJoin(e.to_string()))?
            .map_err(SyncError::from)
    }
}

/// Submit with an upper bound. A timeout is a failure, never an assumed success.
pub async fn submit_with_timeout(
    remote: &dyn RemoteService,
    timeout: Duration,
    request: SubmitRequest<'_>,
) -> std::result::Result<RemoteRecord, SubmitError> {
    match tokio::time::timeout(timeout, remote.submit(request)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(SubmitError::Timeout(timeout)),
    }
}
