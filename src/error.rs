use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::BackendKind;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("No compute context available for {0}")]
    NoContext(BackendKind),

    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("{backend} job submission failed (HTTP {status:?}): {message}")]
    Submission {
        backend: BackendKind,
        status: Option<u16>,
        message: String,
    },

    #[error("{backend} status check failed (HTTP {status:?}): {message}")]
    Poll {
        backend: BackendKind,
        status: Option<u16>,
        message: String,
    },

    #[error("{backend} job did not finish within {timeout_secs}s")]
    Timeout {
        backend: BackendKind,
        timeout_secs: u64,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config artifact error: {0}")]
    Artifact(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BenchError {
    /// Errors that abort the whole benchmark run instead of a single backend.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BenchError::Auth(_) | BenchError::Artifact(_) | BenchError::Interrupted
        )
    }

    /// Resolution failures disable a driver for every remaining trial.
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            BenchError::NoContext(_) | BenchError::ExecutableNotFound(_)
        )
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            BenchError::NoContext(_) | BenchError::ExecutableNotFound(_) => FailureKind::Resolution,
            BenchError::Submission { .. } => FailureKind::Submission,
            BenchError::Poll { .. } => FailureKind::Poll,
            BenchError::Timeout { .. } => FailureKind::Timeout,
            BenchError::Auth(_) => FailureKind::Auth,
            _ => FailureKind::Execution,
        }
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Auth,
    Resolution,
    Submission,
    Poll,
    Timeout,
    Execution,
    Panicked,
}

/// A local driver error captured as a value inside a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverFailure {
    pub backend: BackendKind,
    pub parameter_value: u64,
    pub kind: FailureKind,
    pub message: String,
}

impl DriverFailure {
    pub fn from_error(backend: BackendKind, parameter_value: u64, err: &BenchError) -> Self {
        Self {
            backend,
            parameter_value,
            kind: err.failure_kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for DriverFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (parameter {}): {}",
            self.backend, self.parameter_value, self.message
        )
    }
}
