// TaskSync - Offline-first sync engine for a remote task tracker

pub mod client;
pub mod config;
pub mod coordinator;
pub mod entry;
pub mod error;
pub mod jsonl;
pub mod network;
pub mod reconciler;
pub mod remote;
pub mod status;
pub mod store;

#[cfg(test)]
mod testutil;

// Re-export main types for convenience
pub use client::{Delivery, SyncClient, SyncEvent};
pub use config::{Config, SyncSettings};
pub use coordinator::{BackgroundCoordinator, CoordinatorHandle, WorkerCommand, WorkerMessage};
pub use entry::{EntryId, MutationKind, NewEntry, QueueEntry, now_ms};
pub use error::{Result, StoreError, SubmitError, SyncError};
pub use network::{ConnectivityState, NetworkMonitor, TcpProbe, Transition, spawn_probe};
pub use reconciler::{DeliveredEntry, Reconciler, RunReport, SyncRunResult};
pub use remote::{ApiToken, HttpRemote, RemoteRecord, RemoteService, SubmitRequest};
pub use status::{LastSyncResult, SyncMode, SyncStatus};
pub use store::QueueStore;
