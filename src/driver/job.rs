use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Identity of one of the three interchangeable backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// CASL program on the CAS cluster
    Cas,
    /// Base SAS program on a Viya compute server
    Compute,
    /// Base SAS program on a local installation
    Local,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Cas, BackendKind::Compute, BackendKind::Local];

    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::Cas => "CASL on CAS",
            BackendKind::Compute => "Base SAS on Viya",
            BackendKind::Local => "Base SAS Local",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Cas => write!(f, "cas"),
            BackendKind::Compute => write!(f, "compute"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cas" | "casl" | "casl_cas" => Ok(BackendKind::Cas),
            "compute" | "viya" | "base_viya" => Ok(BackendKind::Compute),
            "local" | "base_local" => Ok(BackendKind::Local),
            other => Err(format!(
                "unknown backend '{other}', expected one of: cas, compute, local"
            )),
        }
    }
}

/// State reported by a single status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl JobState {
    /// Parse the state vocabulary used by the job execution service.
    pub fn from_wire(s: &str) -> Self {
        match s.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "pending" | "queued" | "submitted" | "running" => JobState::Running,
            "completed" | "complete" | "success" => JobState::Completed,
            // a server-side timeout is a failure of the job, not of our deadline
            "failed" | "error" | "timedout" => JobState::Failed,
            "canceled" | "cancelled" => JobState::Cancelled,
            _ => JobState::Unknown,
        }
    }

    pub fn terminal(&self) -> Option<JobOutcome> {
        match self {
            JobState::Completed => Some(JobOutcome::Completed),
            JobState::Failed => Some(JobOutcome::Failed),
            JobState::Cancelled => Some(JobOutcome::Cancelled),
            JobState::Running | JobState::Unknown => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal().is_some()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
            JobState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Terminal classification of a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobOutcome::Completed => write!(f, "completed"),
            JobOutcome::Failed => write!(f, "failed"),
            JobOutcome::Cancelled => write!(f, "cancelled"),
            JobOutcome::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Opaque handle returned by submission and used as the key for polling.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub backend: BackendKind,
    pub job_id: String,
    /// Taken before the submission call, so elapsed time includes submission latency
    pub submitted_at: Instant,
}

impl JobHandle {
    pub fn new(backend: BackendKind, job_id: impl Into<String>, submitted_at: Instant) -> Self {
        Self {
            backend,
            job_id: job_id.into(),
            submitted_at,
        }
    }
}

/// Final, immutable result of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub backend: BackendKind,
    pub job_id: String,
    pub state: JobOutcome,
    pub elapsed_ms: u64,
    pub exit_code: Option<i32>,
    /// Failure detail reported by the backend
    pub message: Option<String>,
    pub raw_output: Option<String>,
}

impl JobResult {
    pub fn new(backend: BackendKind, job_id: impl Into<String>, state: JobOutcome, elapsed_ms: u64) -> Self {
        Self {
            backend,
            job_id: job_id.into(),
            state,
            elapsed_ms,
            exit_code: None,
            message: None,
            raw_output: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == JobOutcome::Completed
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed_ms as f64 / 1000.0
    }
}

/// Everything a driver needs to run one trial.
#[derive(Debug, Clone)]
pub struct TrialInput {
    pub parameter_value: u64,
    /// Content of the config artifact after this trial's rewrite
    pub setup_code: Arc<str>,
}

impl TrialInput {
    pub fn new(parameter_value: u64, setup_code: impl Into<Arc<str>>) -> Self {
        Self {
            parameter_value,
            setup_code: setup_code.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_round_trips_through_display() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
        assert_eq!("CASL_CAS".parse::<BackendKind>().unwrap(), BackendKind::Cas);
        assert!("gpu".parse::<BackendKind>().is_err());
    }

    #[test]
    fn job_state_from_wire_accepts_both_spellings() {
        assert_eq!(JobState::from_wire("canceled"), JobState::Cancelled);
        assert_eq!(JobState::from_wire("cancelled"), JobState::Cancelled);
        assert_eq!(JobState::from_wire(" Completed\n"), JobState::Completed);
        assert_eq!(JobState::from_wire("pending"), JobState::Running);
        assert_eq!(JobState::from_wire("\"failed\""), JobState::Failed);
        assert_eq!(JobState::from_wire("exploded"), JobState::Unknown);
    }

    #[test]
    fn only_finished_states_are_terminal() {
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Unknown.is_terminal());
        assert_eq!(JobState::Failed.terminal(), Some(JobOutcome::Failed));
        assert_eq!(JobState::Cancelled.terminal(), Some(JobOutcome::Cancelled));
    }

    #[test]
    fn job_result_elapsed_secs() {
        let result = JobResult::new(BackendKind::Local, "local-1", JobOutcome::Completed, 2_500);
        assert!(result.is_completed());
        assert!((result.elapsed_secs() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_json::to_string(&JobOutcome::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
    }
}
