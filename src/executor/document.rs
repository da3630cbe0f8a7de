//! DocumentExecutor: graph traversal endpoint of a document store
//!
//! Talks HTTP to `{endpoint}/dbs/{db}/colls/{graph}`. The collection is
//! provisioned on first use when it does not exist yet. Results are paged via
//! the continuation header and every page is wrapped by the retry policy.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ConnectionProfile;
use crate::error::{GizmoError, GizmoResult};
use crate::executor::{probe_outcome, ExecutorKind, QueryExecutor};
use crate::result::ResultAggregate;
use crate::retry::RetryPolicy;

pub const AUTHORIZATION: &str = "authorization";
pub const CONTINUATION: &str = "x-ms-continuation";
pub const REQUEST_CHARGE: &str = "x-ms-request-charge";
pub const RETRY_AFTER_MS: &str = "x-ms-retry-after-ms";
pub const ACTIVITY_ID: &str = "x-ms-activity-id";
pub const PARTITION_KEY: &str = "x-ms-documentdb-partitionkey";

/// One page of a traversal response
#[derive(Debug, Deserialize)]
struct FeedPage {
    #[serde(rename = "Documents", default)]
    documents: Vec<serde_json::Value>,
}

struct Page {
    documents: Vec<serde_json::Value>,
    charge: f64,
    continuation: Option<String>,
    activity_id: Option<String>,
}

/// HTTP executor for the document store back end
pub struct DocumentExecutor {
    profile: ConnectionProfile,
    base_url: String,
    http_client: RwLock<Option<Client>>,
    retry: RetryPolicy,
    collection: OnceCell<String>,
}

impl DocumentExecutor {
    pub fn new(profile: ConnectionProfile, retry: RetryPolicy) -> GizmoResult<Self> {
        if profile.document_endpoint.trim().is_empty() {
            return Err(GizmoError::Configuration(
                "document_endpoint is required for the document back end".to_string(),
            ));
        }

        let http_client = Client::builder()
            .timeout(Duration::from_secs(profile.request_timeout_secs))
            .build()?;

        Ok(Self {
            base_url: profile.document_endpoint.trim_end_matches('/').to_string(),
            profile,
            http_client: RwLock::new(Some(http_client)),
            retry,
            collection: OnceCell::new(),
        })
    }

    fn client(&self) -> GizmoResult<Client> {
        let guard = self.http_client.read().unwrap_or_else(|p| p.into_inner());
        guard
            .clone()
            .ok_or_else(|| GizmoError::Connection(format!("{} is closed", self.remote_message())))
    }

    fn collection_url(&self) -> String {
        format!("{}{}", self.base_url, self.profile.resource_path())
    }

    /// Create the collection if it is absent. Cached only once it succeeds.
    /// Returns the retries spent provisioning, 0 once cached.
    async fn ensure_collection(&self, retry: &RetryPolicy, cancel: &CancellationToken) -> GizmoResult<u32> {
        let retries = AtomicU32::new(0);
        self.collection
            .get_or_try_init(|| async {
                let out = retry.execute(cancel, |_| self.provision_once()).await?;
                retries.store(out.retries, Ordering::Relaxed);
                Ok::<_, GizmoError>(out.value)
            })
            .await?;
        Ok(retries.into_inner())
    }

    async fn provision_once(&self) -> GizmoResult<String> {
        let client = self.client()?;
        let link = self.profile.resource_path();

        let response = client
            .get(self.collection_url())
            .header(AUTHORIZATION, &self.profile.auth_key)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(link);
        }
        if status != StatusCode::NOT_FOUND {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &headers, &body));
        }

        info!("Creating collection {} at {}", link, self.base_url);
        let mut body = serde_json::json!({ "id": self.profile.graph_id });
        if let Some(pk) = &self.profile.partition_key {
            body["partitionKey"] = serde_json::json!(pk);
        }

        let response = client
            .post(format!("{}/dbs/{}/colls", self.base_url, self.profile.database_id))
            .header(AUTHORIZATION, &self.profile.auth_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            Ok(link)
        } else {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            Err(status_error(status, &headers, &body))
        }
    }

    async fn fetch_page(&self, query: &str, continuation: Option<&str>) -> GizmoResult<Page> {
        let client = self.client()?;
        let mut request = client
            .post(format!("{}/gremlin", self.collection_url()))
            .header(AUTHORIZATION, &self.profile.auth_key)
            .json(&serde_json::json!({ "query": query }));

        if let Some(pk) = &self.profile.partition_key {
            request = request.header(PARTITION_KEY, pk);
        }
        if let Some(token) = continuation {
            request = request.header(CONTINUATION, token);
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &headers, &body));
        }

        let page: FeedPage = response.json().await?;
        Ok(Page {
            documents: page.documents,
            charge: header_str(&headers, REQUEST_CHARGE)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            continuation: header_str(&headers, CONTINUATION).filter(|c| !c.is_empty()),
            activity_id: header_str(&headers, ACTIVITY_ID),
        })
    }

    async fn run(&self, query: &str, retry: &RetryPolicy, cancel: &CancellationToken) -> GizmoResult<ResultAggregate> {
        let started = Instant::now();
        let mut retries = self.ensure_collection(retry, cancel).await?;

        let mut records = Vec::new();
        let mut charge = 0.0;
        let mut pages = 0u32;
        let mut continuation: Option<String> = None;
        let mut activity_id: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(GizmoError::Cancelled);
            }

            let token = continuation.take();
            let out = retry
                .execute(cancel, |_| self.fetch_page(query, token.as_deref()))
                .await
                .map_err(|e| {
                    let page_retries = e.retries();
                    e.into_terminal(retries + page_retries)
                })?;

            retries += out.retries;
            pages += 1;
            let page = out.value;
            charge += page.charge;
            records.extend(page.documents);
            if page.activity_id.is_some() {
                activity_id = page.activity_id;
            }

            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        let elapsed = started.elapsed();
        debug!("{} pages, {} records in {:?}", pages, records.len(), elapsed);

        let mut attributes = BTreeMap::new();
        attributes.insert(REQUEST_CHARGE.to_string(), serde_json::json!(charge));
        attributes.insert("pages".to_string(), serde_json::json!(pages));
        attributes.insert("elapsed_ms".to_string(), serde_json::json!(elapsed.as_millis() as u64));
        if let Some(id) = activity_id {
            attributes.insert(ACTIVITY_ID.to_string(), serde_json::json!(id));
        }

        Ok(ResultAggregate::new(query, records, elapsed, charge, retries, attributes))
    }
}

#[async_trait]
impl QueryExecutor for DocumentExecutor {
    async fn test_connection(&self, cancel: &CancellationToken) -> bool {
        let outcome = self.run(&self.profile.probe_query, &RetryPolicy::none(), cancel).await;
        probe_outcome(&self.remote_message(), outcome)
    }

    async fn execute_query(&self, query: &str, cancel: &CancellationToken) -> GizmoResult<ResultAggregate> {
        self.run(query, &self.retry, cancel).await
    }

    fn remote_message(&self) -> String {
        format!("document: {}@{}", self.profile.resource_path(), self.base_url)
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Document
    }

    async fn close(&self) {
        let mut guard = self.http_client.write().unwrap_or_else(|p| p.into_inner());
        if guard.take().is_some() {
            debug!("Closed {}", self.remote_message());
        }
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

/// Map a non-success response onto the retry taxonomy
fn status_error(status: StatusCode, headers: &HeaderMap, body: &str) -> GizmoError {
    let detail = error_detail(body);
    match status {
        StatusCode::TOO_MANY_REQUESTS => GizmoError::Throttled {
            message: format!("{} {}", status, detail),
            retry_after: header_str(headers, RETRY_AFTER_MS)
                .and_then(|v| v.parse::<f64>().ok())
                .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok()),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::SERVICE_UNAVAILABLE => {
            GizmoError::Transient(format!("{} {}", status, detail))
        }
        _ => GizmoError::remote(format!("{} {}", status, detail)),
    }
}

fn error_detail(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "error", "code"] {
            if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }
    body.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_throttle_maps_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER_MS, HeaderValue::from_static("250"));
        let err = status_error(StatusCode::TOO_MANY_REQUESTS, &headers, r#"{"message": "slow down"}"#);
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_millis(250)));
        assert!(err.to_string().contains("slow down"));
    }

    #[test]
    fn test_unusable_retry_after_is_ignored() {
        for value in ["inf", "NaN", "-5", "1e400", "soon"] {
            let mut headers = HeaderMap::new();
            headers.insert(RETRY_AFTER_MS, HeaderValue::from_static(value));
            let err = status_error(StatusCode::TOO_MANY_REQUESTS, &headers, "");
            assert!(err.is_retryable());
            assert_eq!(err.retry_after(), None, "{} should be ignored", value);
        }
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        let headers = HeaderMap::new();
        for status in [StatusCode::UNAUTHORIZED, StatusCode::BAD_REQUEST, StatusCode::NOT_FOUND] {
            let err = status_error(status, &headers, "nope");
            assert!(!err.is_retryable(), "{} should not retry", status);
            assert!(matches!(err, GizmoError::RemoteExecution { retries: 0, .. }));
        }
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, &headers, "").is_retryable());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let profile = ConnectionProfile {
            document_endpoint: "http://127.0.0.1:1/".to_string(),
            database_id: "db".to_string(),
            graph_id: "g".to_string(),
            ..Default::default()
        };
        let executor = DocumentExecutor::new(profile, RetryPolicy::default()).unwrap();
        assert_eq!(executor.remote_message(), "document: /dbs/db/colls/g@http://127.0.0.1:1");

        executor.close().await;
        executor.close().await;

        let err = executor
            .execute_query("RETURN 1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GizmoError::Connection(_)));
    }
}
