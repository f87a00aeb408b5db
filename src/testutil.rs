// Test doubles shared by unit tests

use crate::entry::MutationKind;
use crate::error::SubmitError;
use crate::remote::{RemoteRecord, RemoteService, SubmitRequest};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// A submission as the fake server saw it
#[derive(Debug, Clone)]
pub struct SeenCall {
    pub kind: MutationKind,
    pub payload: Value,
    pub client_ref: String,
}

/// In-memory stand-in for the task server
#[derive(Default)]
pub struct FakeRemote {
    calls: Mutex<Vec<SeenCall>>,
    rejected_subjects: Mutex<HashSet<String>>,
    unreachable: AtomicBool,
    delay_ms: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        let remote = Self::default();
        remote.delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
        remote
    }

    /// Reject any create whose `subject` matches
    pub fn reject_subject(&self, subject: &str) {
        self.rejected_subjects.lock().unwrap().insert(subject.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<SeenCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Subjects in submission order
    pub fn subjects(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|c| c.payload["subject"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

#[async_trait]
impl RemoteService for FakeRemote {
    async fn submit(&self, request: SubmitRequest<'_>) -> Result<RemoteRecord, SubmitError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SubmitError::Network("connection refused".to_string()));
        }

        let number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(SeenCall {
                kind: request.kind,
                payload: request.payload.clone(),
                client_ref: request.client_ref.to_string(),
            });
            calls.len()
        };

        let subject = request.payload["subject"].as_str().unwrap_or_default();
        if self.rejected_subjects.lock().unwrap().contains(subject) {
            return Err(SubmitError::Rejected {
                status: 417,
                body: format!("rejected {}", subject),
            });
        }

        let name = format!("TASK-{:04}", number);
        Ok(RemoteRecord {
            name: name.clone(),
            data: json!({"name": name, "subject": subject}),
        })
    }
}

pub fn create_task(subject: &str) -> crate::entry::NewEntry {
    crate::entry::NewEntry::new(MutationKind::CreateTask, json!({"subject": subject}))
}
