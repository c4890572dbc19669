use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::auth::CredentialManager;
use crate::config::{PollSettings, ViyaConfig};
use crate::driver::job::{BackendKind, JobHandle, JobOutcome, JobResult, JobState, TrialInput};
use crate::driver::BackendDriver;
use crate::error::{BenchError, Result};
use crate::poll::{first_available, PollOutcome};

/// Context names preferred over whatever the server lists first.
pub const CONTEXT_PRIORITY: [&str; 3] = [
    "SAS Job Execution compute context",
    "Job Execution compute context",
    "default",
];

const CAS_SERVER_ID: &str = "cas-shared-default";

/// A named execution context jobs are routed through.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ComputeContext {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize)]
struct ContextList {
    #[serde(default)]
    items: Vec<ComputeContext>,
}

#[derive(Debug, Default, Deserialize)]
struct JobDocument {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<JobError>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct JobError {
    #[serde(default)]
    message: Option<String>,
}

impl JobDocument {
    fn failure_message(&self) -> Option<String> {
        self.error
            .as_ref()
            .and_then(|e| e.message.clone())
            .or_else(|| self.message.clone())
    }
}

/// Status endpoints, tried in this order on every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusEndpoint {
    /// `GET /jobExecution/jobs/{id}/state`, plain text
    StateText,
    /// `GET /jobExecution/jobs/{id}`, JSON document
    JobDocument,
}

const STATUS_ENDPOINTS: [StatusEndpoint; 2] = [StatusEndpoint::StateText, StatusEndpoint::JobDocument];

/// Driver for the job execution service. The CAS and compute variants
/// differ only in the program they send and the job environment.
pub struct RemoteDriver {
    kind: BackendKind,
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<CredentialManager>,
    program_path: PathBuf,
    environment: Value,
    poll: PollSettings,
    context_names: Vec<String>,
    context: OnceCell<ComputeContext>,
}

impl RemoteDriver {
    /// CASL program routed to the shared CAS server.
    pub fn cas(
        config: &ViyaConfig,
        credentials: Arc<CredentialManager>,
        program: impl Into<PathBuf>,
        poll: PollSettings,
    ) -> Result<Self> {
        Self::new(
            BackendKind::Cas,
            config,
            credentials,
            program.into(),
            poll,
            json!({ "casServerId": CAS_SERVER_ID }),
        )
    }

    /// Base SAS program on a compute server.
    pub fn compute(
        config: &ViyaConfig,
        credentials: Arc<CredentialManager>,
        program: impl Into<PathBuf>,
        poll: PollSettings,
    ) -> Result<Self> {
        Self::new(
            BackendKind::Compute,
            config,
            credentials,
            program.into(),
            poll,
            json!({}),
        )
    }

    fn new(
        kind: BackendKind,
        config: &ViyaConfig,
        credentials: Arc<CredentialManager>,
        program_path: PathBuf,
        poll: PollSettings,
        environment: Value,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            kind,
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
            program_path,
            environment,
            poll,
            context_names: CONTEXT_PRIORITY.iter().map(|s| s.to_string()).collect(),
            context: OnceCell::new(),
        })
    }

    pub fn program_path(&self) -> &Path {
        &self.program_path
    }

    pub async fn list_contexts(&self) -> Result<Vec<ComputeContext>> {
        let token = self.credentials.get_valid_token().await?;
        let response = self
            .http
            .get(format!("{}/compute/contexts", self.base_url))
            .bearer_auth(&token)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| self.submission_error(None, format!("listing contexts: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.submission_error(
                Some(status.as_u16()),
                format!("listing contexts: {}", body.trim()),
            ));
        }

        let list: ContextList = response
            .json()
            .await
            .map_err(|e| self.submission_error(None, format!("malformed context list: {e}")))?;
        Ok(list.items)
    }

    /// Resolve the execution context once; later calls reuse it.
    pub async fn resolve_context(&self) -> Result<&ComputeContext> {
        self.context
            .get_or_try_init(|| async {
                let contexts = self.list_contexts().await?;
                let chosen = select_context(&contexts, &self.context_names)
                    .cloned()
                    .ok_or(BenchError::NoContext(self.kind))?;
                tracing::info!(
                    backend = %self.kind,
                    context = %chosen.name,
                    context_id = %chosen.id,
                    available = contexts.len(),
                    "Execution context resolved"
                );
                Ok::<_, BenchError>(chosen)
            })
            .await
    }

    async fn program_code(&self, setup_code: &str) -> Result<String> {
        let program = tokio::fs::read_to_string(&self.program_path)
            .await
            .map_err(|e| {
                self.submission_error(
                    None,
                    format!("cannot read program {}: {e}", self.program_path.display()),
                )
            })?;
        Ok(format!("{setup_code}\n\n{program}"))
    }

    fn job_url(&self, job_id: &str) -> String {
        format!("{}/jobExecution/jobs/{}", self.base_url, job_id)
    }

    /// One status endpoint. `Ok(None)` means the endpoint does not know the job (404).
    async fn check_status(
        &self,
        token: &str,
        job_id: &str,
        endpoint: StatusEndpoint,
    ) -> Result<Option<JobState>> {
        let (url, accept) = match endpoint {
            StatusEndpoint::StateText => (format!("{}/state", self.job_url(job_id)), "text/plain"),
            StatusEndpoint::JobDocument => (self.job_url(job_id), "application/json"),
        };

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .header(header::ACCEPT, accept)
            .send()
            .await
            .map_err(|e| self.poll_error(None, e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            tracing::debug!(backend = %self.kind, job_id, ?endpoint, "Status endpoint returned 404, trying next");
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.poll_error(Some(status.as_u16()), body.trim().to_string()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| self.poll_error(None, e.to_string()))?;
        Ok(Some(parse_state_body(&body)))
    }

    fn submission_error(&self, status: Option<u16>, message: String) -> BenchError {
        BenchError::Submission {
            backend: self.kind,
            status,
            message,
        }
    }

    fn poll_error(&self, status: Option<u16>, message: String) -> BenchError {
        BenchError::Poll {
            backend: self.kind,
            status,
            message,
        }
    }
}

#[async_trait]
impl BackendDriver for RemoteDriver {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn poll_settings(&self) -> PollSettings {
        self.poll
    }

    async fn submit(&self, input: &TrialInput) -> Result<JobHandle> {
        let context_id = self.resolve_context().await?.id.clone();
        let code = self.program_code(&input.setup_code).await?;
        let token = self.credentials.get_valid_token().await?;

        let body = json!({
            "name": format!("{}_benchmark_{}", self.kind, input.parameter_value),
            "arguments": { "_contextId": context_id },
            "jobDefinition": {
                "type": "Compute",
                "code": code,
                "parameters": [],
                "environment": self.environment,
            },
        });

        let submitted_at = Instant::now();
        let response = self
            .http
            .post(format!("{}/jobExecution/jobs", self.base_url))
            .bearer_auth(&token)
            .header(header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.submission_error(None, e.to_string()))?;

        let status = response.status();
        if !matches!(status.as_u16(), 200 | 201 | 202) {
            let text = response.text().await.unwrap_or_default();
            return Err(self.submission_error(Some(status.as_u16()), text.trim().to_string()));
        }

        let document: JobDocument = response
            .json()
            .await
            .map_err(|e| self.submission_error(Some(status.as_u16()), format!("malformed response: {e}")))?;
        let job_id = document.id.ok_or_else(|| {
            self.submission_error(Some(status.as_u16()), "response has no job id".to_string())
        })?;

        tracing::debug!(
            backend = %self.kind,
            job_id = %job_id,
            initial_state = document.state.as_deref().unwrap_or("unknown"),
            "Submission accepted"
        );
        Ok(JobHandle::new(self.kind, job_id, submitted_at))
    }

    async fn poll_state(&self, handle: &JobHandle) -> Result<JobState> {
        let token = self.credentials.get_valid_token().await?;
        let state = first_available(&STATUS_ENDPOINTS, |endpoint| {
            self.check_status(&token, &handle.job_id, *endpoint)
        })
        .await?;

        state.ok_or_else(|| {
            self.poll_error(
                Some(StatusCode::NOT_FOUND.as_u16()),
                format!("no status endpoint knows job {}", handle.job_id),
            )
        })
    }

    async fn fetch_result(&self, handle: &JobHandle, polled: PollOutcome) -> Result<JobResult> {
        let mut result = JobResult::new(self.kind, &handle.job_id, polled.outcome, polled.elapsed_ms());

        if polled.outcome == JobOutcome::TimedOut {
            result.message = Some(format!(
                "no terminal state within {}s",
                self.poll.timeout.as_secs()
            ));
            return Ok(result);
        }

        let token = self.credentials.get_valid_token().await?;
        let response = self
            .http
            .get(self.job_url(&handle.job_id))
            .bearer_auth(&token)
            .header(header::ACCEPT, "application/json")
            .send()
            .await;

        // The timing is already known; missing details only cost the message.
        let body = match response {
            Ok(response) if response.status().is_success() => response.text().await.ok(),
            Ok(response) => {
                tracing::warn!(backend = %self.kind, job_id = %handle.job_id, status = response.status().as_u16(), "Could not fetch job details");
                None
            }
            Err(e) => {
                tracing::warn!(backend = %self.kind, job_id = %handle.job_id, error = %e, "Could not fetch job details");
                None
            }
        };

        if let Some(body) = body {
            if !result.is_completed() {
                result.message = serde_json::from_str::<JobDocument>(&body)
                    .ok()
                    .and_then(|doc| doc.failure_message());
            }
            result.raw_output = Some(body);
        }
        Ok(result)
    }
}

/// Pick the first context whose name matches a priority entry
/// (case-insensitive, in priority order), else the first listed context.
pub fn select_context<'a>(
    contexts: &'a [ComputeContext],
    priority: &[String],
) -> Option<&'a ComputeContext> {
    priority
        .iter()
        .find_map(|wanted| {
            contexts
                .iter()
                .find(|ctx| ctx.name.eq_ignore_ascii_case(wanted))
        })
        .or_else(|| contexts.first())
}

/// Parse a status body: plain text, a JSON string, or a JSON object with
/// a `state` or `status` field.
pub fn parse_state_body(body: &str) -> JobState {
    let trimmed = body.trim();
    if trimmed.starts_with('{') {
        return match serde_json::from_str::<JobDocument>(trimmed) {
            Ok(doc) => doc
                .state
                .or(doc.status)
                .map(|s| JobState::from_wire(&s))
                .unwrap_or(JobState::Unknown),
            Err(_) => JobState::Unknown,
        };
    }
    JobState::from_wire(trimmed)
}
