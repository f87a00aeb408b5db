// User-visible sync status, derived on demand

use crate::network::ConnectivityState;
use crate::reconciler::SyncRunResult;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    OnlineIdle,
    OnlineSyncing,
    Offline,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::OnlineIdle => write!(f, "online-idle"),
            SyncMode::OnlineSyncing => write!(f, "online-syncing"),
            SyncMode::Offline => write!(f, "offline"),
        }
    }
}

/// Outcome of the most recent finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSyncResult {
    pub succeeded: usize,
    pub failed: usize,
    /// Milliseconds since epoch when the run finished
    pub timestamp: i64,
}

impl LastSyncResult {
    pub fn from_run(result: &SyncRunResult, timestamp: i64) -> Self {
        Self {
            succeeded: result.succeeded,
            failed: result.failed,
            timestamp,
        }
    }
}

/// What the queue looks like right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub pending: usize,
    /// A drain is in flight in this context
    pub draining: bool,
    /// False when local storage is unavailable and queuing is disabled
    pub queue_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub pending_count: usize,
    pub last_sync_result: Option<LastSyncResult>,
    pub mode: SyncMode,
    pub queue_enabled: bool,
}

/// Derive the status. Pure: no I/O, safe to call mid-run.
pub fn project(queue: QueueSnapshot, connectivity: ConnectivityState, last: Option<&LastSyncResult>) -> SyncStatus {
    let mode = match (connectivity.is_online, queue.draining) {
        (false, _) => SyncMode::Offline,
        (true, true) => SyncMode::OnlineSyncing,
        (true, false) => SyncMode::OnlineIdle,
    };

    SyncStatus {
        pending_count: queue.pending,
        last_sync_result: last.copied(),
        mode,
        queue_enabled: queue.queue_enabled,
    }
}

impl SyncStatus {
    /// One-line indicator text
    pub fn summary(&self) -> String {
        let items = |n: usize| if n == 1 { "1 item".to_string() } else { format!("{} items", n) };

        let mut line = match (self.mode, self.pending_count) {
            (SyncMode::Offline, 0) => "Offline mode".to_string(),
            (SyncMode::Offline, n) => format!("Offline mode - {} pending sync", items(n)),
            (SyncMode::OnlineSyncing, n) => format!("Syncing {}...", items(n)),
            (SyncMode::OnlineIdle, 0) => "Online - all changes synced".to_string(),
            (SyncMode::OnlineIdle, n) => format!("Online - {} ready to sync", items(n)),
        };

        if !self.queue_enabled {
            line.push_str(" (offline queue unavailable)");
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(pending: usize, draining: bool) -> QueueSnapshot {
        QueueSnapshot {
            pending,
            draining,
            queue_enabled: true,
        }
    }

    const ONLINE: ConnectivityState = ConnectivityState { is_online: true };
    const OFFLINE: ConnectivityState = ConnectivityState { is_online: false };

    #[test]
    fn test_mode_derivation() {
        assert_eq!(project(queue(0, false), ONLINE, None).mode, SyncMode::OnlineIdle);
        assert_eq!(project(queue(2, true), ONLINE, None).mode, SyncMode::OnlineSyncing);
        // Going offline mid-run reports offline
        assert_eq!(project(queue(2, true), OFFLINE, None).mode, SyncMode::Offline);
    }

    #[test]
    fn test_projection_carries_counts_and_last_result() {
        let last = LastSyncResult {
            succeeded: 1,
            failed: 1,
            timestamp: 42,
        };
        let status = project(queue(1, false), ONLINE, Some(&last));
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.last_sync_result, Some(last));
        assert!(status.queue_enabled);
    }

    #[test]
    fn test_summary_text() {
        assert_eq!(project(queue(3, false), OFFLINE, None).summary(), "Offline mode - 3 items pending sync");
        assert_eq!(project(queue(1, false), ONLINE, None).summary(), "Online - 1 item ready to sync");
        assert_eq!(project(queue(0, false), ONLINE, None).summary(), "Online - all changes synced");

        let disabled = QueueSnapshot {
            pending: 0,
            draining: false,
            queue_enabled: false,
        };
        assert!(project(disabled, OFFLINE, None).summary().ends_with("(offline queue unavailable)"));
    }

    #[test]
    fn test_mode_serialization() {
        assert_eq!(serde_json::to_string(&SyncMode::OnlineSyncing).unwrap(), "\"online-syncing\"");
    }
}
