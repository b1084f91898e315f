//! Backend client: how a gateway hands relayed work to the Pulse service.
//!
//! `RelayBackend` is the seam the node talks through. `HttpBackend` speaks the
//! service's JSON API; `MemoryBackend` answers in-process for tests and for
//! running a node without a server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use pulse_core::{Location, QueryKind};
use serde::{Deserialize, Serialize};

/// A query forwarded to the backend, either by its author or by a relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayQueryRequest {
    pub query_id: String,
    pub query_text: String,
    pub query_type: QueryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_location: Option<Location>,
    pub original_device: String,
    /// Device that actually reached the backend. Equals `original_device`
    /// when the author was online.
    pub relayed_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sos_data: Option<serde_json::Value>,
}

/// An incident report headed for the backend store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncidentReport {
    pub report_id: String,
    pub report_type: String,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<u8>,
    pub device_id: String,
}

/// Result of asking the backend about a query it was handed earlier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Completed(String),
    Pending,
    Failed(String),
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned status {0}")]
    Status(u16),
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
}

#[async_trait]
pub trait RelayBackend: Send + Sync {
    /// Process a query and return the answer text.
    async fn submit_query(&self, request: RelayQueryRequest) -> Result<String, BackendError>;

    /// Look up the outcome of a previously submitted query.
    async fn check_query(&self, query_id: &str) -> Result<CheckOutcome, BackendError>;

    /// Store an incident report.
    async fn store_report(&self, report: IncidentReport) -> Result<(), BackendError>;
}

// ── HTTP ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct QueryReply {
    #[serde(default)]
    success: bool,
    response: Option<String>,
    error: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckReply {
    status: Option<String>,
    response: Option<String>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StoreReply {
    #[serde(default)]
    success: bool,
    error: Option<String>,
}

#[derive(Serialize)]
struct StoreBody<'a> {
    #[serde(flatten)]
    report: &'a IncidentReport,
    status: &'static str,
}

pub struct HttpBackend {
    client: reqwest::Client,
    /// Includes the `/api` prefix, e.g. `http://127.0.0.1:8080/api`.
    base_url: String,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_err(&self, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout(self.timeout)
        } else {
            BackendError::Http(e)
        }
    }
}

#[async_trait]
impl RelayBackend for HttpBackend {
    async fn submit_query(&self, request: RelayQueryRequest) -> Result<String, BackendError> {
        let resp = self
            .client
            .post(self.url("/relay/query"))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;

        let status = resp.status();
        let reply: QueryReply = match resp.json().await {
            Ok(r) => r,
            Err(_) if !status.is_success() => return Err(BackendError::Status(status.as_u16())),
            Err(e) => return Err(self.map_err(e)),
        };

        match reply {
            QueryReply {
                success: true,
                response: Some(text),
                ..
            } => Ok(text),
            QueryReply { error, message, .. } => {
                let reason = message
                    .or(error)
                    .unwrap_or_else(|| format!("status {}", status.as_u16()));
                Err(BackendError::Rejected(reason))
            }
        }
    }

    async fn check_query(&self, query_id: &str) -> Result<CheckOutcome, BackendError> {
        let url = reqwest::Url::parse_with_params(&self.url("/relay/check"), &[("query_id", query_id)])
            .map_err(|e| BackendError::InvalidUrl(e.to_string()))?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(CheckOutcome::NotFound);
        }
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }

        let reply: CheckReply = resp.json().await.map_err(|e| self.map_err(e))?;
        Ok(match (reply.status.as_deref(), reply.response) {
            (Some("completed"), Some(text)) => CheckOutcome::Completed(text),
            (Some("failed"), _) => {
                CheckOutcome::Failed(reply.error_message.unwrap_or_else(|| "unknown error".into()))
            }
            (Some("not_found"), _) => CheckOutcome::NotFound,
            _ => CheckOutcome::Pending,
        })
    }

    async fn store_report(&self, report: IncidentReport) -> Result<(), BackendError> {
        let body = StoreBody {
            report: &report,
            status: "synced",
        };
        let resp = self
            .client
            .post(self.url("/incidents/store"))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }
        let reply: StoreReply = resp.json().await.map_err(|e| self.map_err(e))?;
        if reply.success {
            Ok(())
        } else {
            Err(BackendError::Rejected(
                reply.error.unwrap_or_else(|| "store refused".into()),
            ))
        }
    }
}

// ── In-memory ────────────────────────────────────────────────────────────────

/// In-process backend. Answers every query with `answer: <text>` and records
/// what it was asked.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    queries: Vec<RelayQueryRequest>,
    reports: Vec<IncidentReport>,
    checks: HashMap<String, CheckOutcome>,
    failing: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every call fail with `Rejected`.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Preset the outcome `check_query` reports for `query_id`.
    pub fn set_check(&self, query_id: &str, outcome: CheckOutcome) {
        self.lock().checks.insert(query_id.to_string(), outcome);
    }

    pub fn queries(&self) -> Vec<RelayQueryRequest> {
        self.lock().queries.clone()
    }

    pub fn reports(&self) -> Vec<IncidentReport> {
        self.lock().reports.clone()
    }

    pub fn answer_for(text: &str) -> String {
        format!("answer: {}", text)
    }
}

#[async_trait]
impl RelayBackend for MemoryBackend {
    async fn submit_query(&self, request: RelayQueryRequest) -> Result<String, BackendError> {
        let mut state = self.lock();
        if state.failing {
            return Err(BackendError::Rejected("backend offline".into()));
        }
        let answer = Self::answer_for(&request.query_text);
        state
            .checks
            .insert(request.query_id.clone(), CheckOutcome::Completed(answer.clone()));
        state.queries.push(request);
        Ok(answer)
    }

    async fn check_query(&self, query_id: &str) -> Result<CheckOutcome, BackendError> {
        let state = self.lock();
        if state.failing {
            return Err(BackendError::Rejected("backend offline".into()));
        }
        Ok(state
            .checks
            .get(query_id)
            .cloned()
            .unwrap_or(CheckOutcome::NotFound))
    }

    async fn store_report(&self, report: IncidentReport) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.failing {
            return Err(BackendError::Rejected("backend offline".into()));
        }
        state.reports.push(report);
        Ok(())
    }
}
