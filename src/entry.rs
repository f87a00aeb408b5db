// Queue entry data model

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Locally assigned queue entry identifier. Opaque to the remote service.
pub type EntryId = i64;

/// Kind of mutation a queue entry replays against the remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    CreateTask,
    UpdateTask,
    AssignTask,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::CreateTask => "create-task",
            MutationKind::UpdateTask => "update-task",
            MutationKind::AssignTask => "assign-task",
        }
    }

    /// True if the payload must name an existing remote task
    pub fn targets_existing(self) -> bool {
        !matches!(self, MutationKind::CreateTask)
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MutationKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create-task" => Ok(MutationKind::CreateTask),
            "update-task" => Ok(MutationKind::UpdateTask),
            "assign-task" => Ok(MutationKind::AssignTask),
            other => Err(StoreError::InvalidEntry(format!("unknown mutation kind: {}", other))),
        }
    }
}

/// A pending mutation persisted in the durable queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub kind: MutationKind,
    pub payload: Value,
    pub client_ref: String,
    pub enqueued_at: i64,
}

/// A mutation about to be enqueued (no id yet)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub kind: MutationKind,
    pub payload: Value,
    pub client_ref: String,
    pub enqueued_at: i64,
}

impl NewEntry {
    /// Stamp a fresh client reference and enqueue time
    pub fn new(kind: MutationKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            client_ref: uuid::Uuid::now_v7().to_string(),
            enqueued_at: now_ms(),
        }
    }

    /// Check the payload is fully resolved for its kind.
    ///
    /// The entry may outlive the session that created it, so everything the
    /// remote call needs has to be in the payload itself.
    pub fn validate(&self) -> Result<(), StoreError> {
        let fields = self
            .payload
            .as_object()
            .ok_or_else(|| StoreError::InvalidEntry(format!("{} payload must be a JSON object", self.kind)))?;

        if self.client_ref.trim().is_empty() {
            return Err(StoreError::InvalidEntry("client_ref cannot be empty".to_string()));
        }

        if self.kind.targets_existing() {
            match fields.get("name").and_then(Value::as_str) {
                Some(name) if is_resource_name(name) => {}
                _ => {
                    return Err(StoreError::InvalidEntry(format!(
                        "{} payload must carry the target task `name`",
                        self.kind
                    )));
                }
            }
        }

        if self.kind == MutationKind::AssignTask
            && fields.get("custom_assigned_to").and_then(Value::as_str).is_none()
        {
            return Err(StoreError::InvalidEntry(
                "assign-task payload must carry `custom_assigned_to`".to_string(),
            ));
        }

        Ok(())
    }
}

impl From<QueueEntry> for NewEntry {
    fn from(entry: QueueEntry) -> Self {
        Self {
            kind: entry.kind,
            payload: entry.payload,
            client_ref: entry.client_ref,
            enqueued_at: entry.enqueued_at,
        }
    }
}

/// A task name that addresses exactly one remote resource
pub fn is_resource_name(name: &str) -> bool {
    !matches!(name.trim(), "" | "." | "..")
}

/// Helper function to get current timestamp in milliseconds
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_now_ms() {
        let ts = now_ms();
        // Should be reasonable timestamp (after year 2020)
        assert!(ts > 1_600_000_000_000);
    }

    #[test]
    fn test_mutation_kind_serialization() {
        let json = serde_json::to_string(&MutationKind::CreateTask).unwrap();
        assert_eq!(json, "\"create-task\"");

        let kind: MutationKind = serde_json::from_str("\"assign-task\"").unwrap();
        assert_eq!(kind, MutationKind::AssignTask);
        assert_eq!("update-task".parse::<MutationKind>().unwrap(), MutationKind::UpdateTask);
        assert!("delete-task".parse::<MutationKind>().is_err());
    }

    #[test]
    fn test_new_entry_stamps_ref_and_time() {
        let a = NewEntry::new(MutationKind::CreateTask, json!({"subject": "a"}));
        let b = NewEntry::new(MutationKind::CreateTask, json!({"subject": "b"}));
        assert_ne!(a.client_ref, b.client_ref);
        assert!(a.enqueued_at > 0);
    }

    #[test]
    fn test_validate_payload_shape() {
        assert!(NewEntry::new(MutationKind::CreateTask, json!({"subject": "x"})).validate().is_ok());
        assert!(NewEntry::new(MutationKind::CreateTask, json!("x")).validate().is_err());

        let update = NewEntry::new(MutationKind::UpdateTask, json!({"status": "Open"}));
        assert!(update.validate().is_err());
        let update = NewEntry::new(MutationKind::UpdateTask, json!({"name": "TASK-1", "status": "Open"}));
        assert!(update.validate().is_ok());

        let assign = NewEntry::new(MutationKind::AssignTask, json!({"name": "TASK-1"}));
        assert!(assign.validate().is_err());
        let assign = NewEntry::new(
            MutationKind::AssignTask,
            json!({"name": "TASK-1", "custom_assigned_to": "a@example.com"}),
        );
        assert!(assign.validate().is_ok());
    }

    #[test]
    fn test_validate_refuses_dot_segment_names() {
        for name in ["..", ".", "  "] {
            let update = NewEntry::new(MutationKind::UpdateTask, json!({"name": name, "status": "Open"}));
            assert!(update.validate().is_err(), "{:?} accepted", name);
        }
        // Slashes are fine; they are escaped when the request is built
        let update = NewEntry::new(MutationKind::UpdateTask, json!({"name": "a/b", "status": "Open"}));
        assert!(update.validate().is_ok());
    }
}
