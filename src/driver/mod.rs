//! Backend drivers: one capability trait, three variants.

pub mod job;
pub mod local;
pub mod remote;

use async_trait::async_trait;

pub use job::{BackendKind, JobHandle, JobOutcome, JobResult, JobState, TrialInput};
pub use local::LocalDriver;
pub use remote::{ComputeContext, RemoteDriver};

use crate::config::PollSettings;
use crate::error::Result;
use crate::poll::{poll_until_terminal, PollOutcome};

/// Submit, poll and collect a job on one backend.
#[async_trait]
pub trait BackendDriver: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn poll_settings(&self) -> PollSettings;

    /// Start a job for this trial and return its handle.
    async fn submit(&self, input: &TrialInput) -> Result<JobHandle>;

    /// One status check.
    async fn poll_state(&self, handle: &JobHandle) -> Result<JobState>;

    /// Collect the final result once the poll loop has finished.
    async fn fetch_result(&self, handle: &JobHandle, polled: PollOutcome) -> Result<JobResult>;

    /// Full job lifecycle: submit, poll until terminal or timeout, collect.
    async fn run(&self, input: &TrialInput) -> Result<JobResult> {
        let handle = self.submit(input).await?;
        tracing::info!(
            backend = %handle.backend,
            job_id = %handle.job_id,
            parameter = input.parameter_value,
            "Job submitted"
        );

        let polled = poll_until_terminal(handle.submitted_at, self.poll_settings(), || {
            self.poll_state(&handle)
        })
        .await?;

        let result = self.fetch_result(&handle, polled).await?;
        tracing::info!(
            backend = %result.backend,
            job_id = %result.job_id,
            state = %result.state,
            elapsed_ms = result.elapsed_ms,
            "Job finished"
        );
        Ok(result)
    }
}
