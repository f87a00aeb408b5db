//! Remote task service collaborator.
//!
//! The sync engine only ever talks to the remote service through
//! [`RemoteService::submit`]. [`HttpRemote`] speaks the Frappe-style REST
//! resource API the task tracker exposes.

use crate::entry::{MutationKind, QueueEntry, is_resource_name};
use crate::error::{SubmitError, SyncError};
use async_trait::async_trait;
use serde::Deserialize;
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Header carrying the entry's client reference for server-side de-duplication
pub const CLIENT_REF_HEADER: &str = "X-Client-Ref";

/// One mutation to deliver
#[derive(Debug, Clone, Copy)]
pub struct SubmitRequest<'a> {
    pub kind: MutationKind,
    pub payload: &'a Value,
    pub client_ref: &'a str,
}

impl<'a> From<&'a QueueEntry> for SubmitRequest<'a> {
    fn from(entry: &'a QueueEntry) -> Self {
        Self {
            kind: entry.kind,
            payload: &entry.payload,
            client_ref: &entry.client_ref,
        }
    }
}

/// Record confirmed by the remote service
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    /// Remote document name, e.g. `TASK-2024-00042`
    pub name: String,
    pub data: Value,
}

/// The remote service contract.
///
/// Implementations are NOT assumed idempotent: submitting the same create
/// twice produces two remote tasks.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Deliver one mutation. `Ok` is positive confirmation of persistence.
    async fn submit(&self, request: SubmitRequest<'_>) -> Result<RemoteRecord, SubmitError>;
}

/// Credentials for the `Authorization: token key:secret` scheme
#[derive(Debug, Clone)]
pub struct ApiToken {
    pub key: String,
    pub secret: String,
}

/// REST client for the task tracker
pub struct HttpRemote {
    base_url: Url,
    token: Option<ApiToken>,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ResourceResponse {
    data: Value,
}

const TASK_RESOURCE: [&str; 3] = ["api", "resource", "Task"];

impl HttpRemote {
    /// Create a client for `base_url` (scheme, host and an optional path prefix)
    pub fn new(base_url: &str, token: Option<ApiToken>, timeout: Duration) -> Result<Self, SyncError> {
        let invalid = |reason: String| SyncError::InvalidServerUrl {
            url: base_url.to_string(),
            reason,
        };
        let parsed = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(invalid("not a hierarchical URL".to_string()));
        }

        Ok(Self {
            base_url: parsed,
            token,
            timeout,
            client: reqwest::Client::new(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Base URL with `segments` appended, each percent-encoded as one segment
    fn resource_url(&self, segments: &[&str]) -> Result<Url, SubmitError> {
        let mut url = self.base_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|_| SubmitError::Network(format!("cannot extend {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn endpoint(&self, request: &SubmitRequest<'_>) -> Result<(reqwest::Method, Url), SubmitError> {
        match request.kind {
            MutationKind::CreateTask => Ok((reqwest::Method::POST, self.resource_url(&TASK_RESOURCE)?)),
            MutationKind::UpdateTask | MutationKind::AssignTask => {
                // Validated at enqueue time; a bad name here means a hand-edited store
                let name = request
                    .payload
                    .get("name")
                    .and_then(Value::as_str)
                    .filter(|name| is_resource_name(name))
                    .ok_or_else(|| SubmitError::Rejected {
                        status: 0,
                        body: format!("{} payload has no usable task name", request.kind),
                    })?;
                let [api, resource, doctype] = TASK_RESOURCE;
                Ok((reqwest::Method::PUT, self.resource_url(&[api, resource, doctype, name])?))
            }
        }
    }

    fn body(request: &SubmitRequest<'_>) -> Value {
        let mut body = request.payload.clone();
        if let Some(fields) = body.as_object_mut() {
            match request.kind {
                MutationKind::CreateTask => {
                    fields
                        .entry("doctype")
                        .or_insert_with(|| Value::String("Task".to_string()));
                }
                MutationKind::UpdateTask | MutationKind::AssignTask => {
                    // The name is in the URL
                    fields.remove("name");
                }
            }
        }
        body
    }
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn submit(&self, request: SubmitRequest<'_>) -> Result<RemoteRecord, SubmitError> {
        let (method, url) = self.endpoint(&request)?;
        debug!(%method, %url, kind = %request.kind, client_ref = request.client_ref, "Submitting mutation");

        let mut builder = self
            .client
            .request(method, url)
            .timeout(self.timeout)
            .header(CLIENT_REF_HEADER, request.client_ref)
            .json(&Self::body(&request));

        if let Some(token) = &self.token {
            builder = builder.header(
                reqwest::header::AUTHORIZATION,
                format!("token {}:{}", token.key, token.secret),
            );
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SubmitError::Timeout(self.timeout)
            } else {
                SubmitError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SubmitError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ResourceResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                SubmitError::Timeout(self.timeout)
            } else {
                SubmitError::Network(format!("unreadable response: {}", e))
            }
        })?;

        let name = parsed
            .data
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(RemoteRecord {
            name,
            data: parsed.data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn remote(server: &MockServer) -> HttpRemote {
        HttpRemote::new(
            &format!("{}/", server.uri()),
            Some(ApiToken {
                key: "k".to_string(),
                secret: "s".to_string(),
            }),
            Duration::from_secs(2),
        )
        .unwrap()
    }

    async fn update(remote: &HttpRemote, name: &str) -> Result<RemoteRecord, SubmitError> {
        let payload = json!({"name": name, "status": "Completed"});
        remote
            .submit(SubmitRequest {
                kind: MutationKind::UpdateTask,
                payload: &payload,
                client_ref: "ref-u",
            })
            .await
    }

    #[tokio::test]
    async fn test_create_task_posts_resource() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/resource/Task"))
            .and(header("authorization", "token k:s"))
            .and(header("x-client-ref", "ref-1"))
            .and(body_partial_json(json!({"doctype": "Task", "subject": "Write report"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"name": "TASK-0001", "subject": "Write report"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let payload = json!({"subject": "Write report"});
        let record = remote(&server)
            .submit(SubmitRequest {
                kind: MutationKind::CreateTask,
                payload: &payload,
                client_ref: "ref-1",
            })
            .await
            .unwrap();

        assert_eq!(record.name, "TASK-0001");
        assert_eq!(record.data["subject"], "Write report");
    }

    #[tokio::test]
    async fn test_assign_task_puts_named_resource() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/api/resource/Task/TASK-0007"))
            .and(body_partial_json(json!({"custom_assigned_to": "sam@example.com"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"name": "TASK-0007", "custom_assigned_to": "sam@example.com"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let payload = json!({"name": "TASK-0007", "custom_assigned_to": "sam@example.com"});
        let record = remote(&server)
            .submit(SubmitRequest {
                kind: MutationKind::AssignTask,
                payload: &payload,
                client_ref: "ref-7",
            })
            .await
            .unwrap();

        assert_eq!(record.name, "TASK-0007");
    }

    #[tokio::test]
    async fn test_server_rejection_maps_status() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/resource/Task"))
            .respond_with(ResponseTemplate::new(417).set_body_string("Subject is mandatory"))
            .mount(&server)
            .await;

        let payload = json!({});
        let err = remote(&server)
            .submit(SubmitRequest {
                kind: MutationKind::CreateTask,
                payload: &payload,
                client_ref: "ref-2",
            })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SubmitError::Rejected {
                status: 417,
                body: "Subject is mandatory".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": {"name": "late"}}))
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&server)
            .await;

        let remote = HttpRemote::new(&server.uri(), None, Duration::from_millis(100)).unwrap();
        let payload = json!({"subject": "x"});
        let err = remote
            .submit(SubmitRequest {
                kind: MutationKind::CreateTask,
                payload: &payload,
                client_ref: "ref-3",
            })
            .await
            .unwrap_err();

        assert_eq!(err, SubmitError::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        // Port 9 (discard) on localhost is almost never listening
        let remote = HttpRemote::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
        let payload = json!({"subject": "x"});
        let err = remote
            .submit(SubmitRequest {
                kind: MutationKind::CreateTask,
                payload: &payload,
                client_ref: "ref-4",
            })
            .await
            .unwrap_err();

        assert_eq!(err.reason(), "network");
    }

    #[tokio::test]
    async fn test_task_name_stays_one_path_segment() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"name": "echo"}})))
            .mount(&server)
            .await;

        let remote = remote(&server);
        for name in ["../Project/PROJ-1", "A?x=1", "B#frag", "a/b"] {
            update(&remote, name).await.unwrap();
        }

        let paths: Vec<(String, Option<String>)> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| (r.url.path().to_string(), r.url.query().map(str::to_string)))
            .collect();
        assert_eq!(
            paths,
            vec![
                ("/api/resource/Task/..%2FProject%2FPROJ-1".to_string(), None),
                ("/api/resource/Task/A%3Fx=1".to_string(), None),
                ("/api/resource/Task/B%23frag".to_string(), None),
                ("/api/resource/Task/a%2Fb".to_string(), None),
            ]
        );
    }

    #[tokio::test]
    async fn test_dot_segment_name_is_refused_without_a_request() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"name": "wrong"}})))
            .expect(0)
            .mount(&server)
            .await;

        let remote = remote(&server);
        for name in ["..", ".", " "] {
            let err = update(&remote, name).await.unwrap_err();
            assert_eq!(err.reason(), "server-rejected");
        }
    }

    #[tokio::test]
    async fn test_base_path_prefix_is_kept() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/erp/api/resource/Task"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"name": "TASK-0002"}})))
            .expect(1)
            .mount(&server)
            .await;

        let remote = HttpRemote::new(&format!("{}/erp?debug=1", server.uri()), None, Duration::from_secs(2)).unwrap();
        let payload = json!({"subject": "prefixed"});
        let record = remote
            .submit(SubmitRequest {
                kind: MutationKind::CreateTask,
                payload: &payload,
                client_ref: "ref-p",
            })
            .await
            .unwrap();
        assert_eq!(record.name, "TASK-0002");
    }

    #[test]
    fn test_invalid_base_url_is_refused() {
        assert!(matches!(
            HttpRemote::new("erp.example.com", None, Duration::from_secs(1)),
            Err(SyncError::InvalidServerUrl { .. })
        ));
        assert!(HttpRemote::new("mailto:ops@example.com", None, Duration::from_secs(1)).is_err());
    }
}
