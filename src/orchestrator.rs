use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::artifact::{ArtifactGuard, ConfigArtifact};
use crate::driver::{BackendDriver, BackendKind, JobResult, TrialInput};
use crate::error::{BenchError, DriverFailure, FailureKind, Result};
use crate::report;

/// Per-trial lifecycle. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrialPhase {
    Idle,
    ConfigMutated,
    Dispatched,
    Collecting,
    ConfigRestored,
}

impl TrialPhase {
    fn advance(&mut self, next: TrialPhase, parameter: u64) {
        debug_assert!(next > *self, "trial phase moved backwards: {self:?} -> {next:?}");
        tracing::debug!(parameter, from = ?*self, to = ?next, "Trial phase");
        *self = next;
    }
}

/// What one backend produced in one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BackendOutcome {
    Finished(JobResult),
    /// No usable result; the failure says why
    Absent(DriverFailure),
}

impl BackendOutcome {
    pub fn result(&self) -> Option<&JobResult> {
        match self {
            BackendOutcome::Finished(result) => Some(result),
            BackendOutcome::Absent(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&DriverFailure> {
        match self {
            BackendOutcome::Finished(_) => None,
            BackendOutcome::Absent(failure) => Some(failure),
        }
    }

    /// Elapsed seconds, only for a job that completed successfully.
    pub fn completed_secs(&self) -> Option<f64> {
        self.result()
            .filter(|r| r.is_completed())
            .map(JobResult::elapsed_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkTrial {
    pub parameter_value: u64,
    pub results: BTreeMap<BackendKind, BackendOutcome>,
}

impl BenchmarkTrial {
    pub fn new(parameter_value: u64) -> Self {
        Self {
            parameter_value,
            results: BTreeMap::new(),
        }
    }

    pub fn get(&self, backend: BackendKind) -> Option<&BackendOutcome> {
        self.results.get(&backend)
    }

    /// Seconds per backend for jobs that completed.
    pub fn completed_times(&self) -> BTreeMap<BackendKind, f64> {
        self.results
            .iter()
            .filter_map(|(kind, outcome)| outcome.completed_secs().map(|secs| (*kind, secs)))
            .collect()
    }
}

/// Receives the trial list after every trial.
pub trait TrialSink: Send {
    fn record(&mut self, trials: &[BenchmarkTrial]) -> Result<()>;
}

/// Runs trials one after another, each fanned out to every driver at once.
pub struct BenchmarkOrchestrator {
    drivers: Vec<Arc<dyn BackendDriver>>,
    artifact: ConfigArtifact,
    pause_between_trials: Duration,
    sinks: Vec<Box<dyn TrialSink>>,
}

impl BenchmarkOrchestrator {
    pub fn new(drivers: Vec<Arc<dyn BackendDriver>>, artifact: ConfigArtifact) -> Self {
        Self {
            drivers,
            artifact,
            pause_between_trials: Duration::from_secs(5),
            sinks: Vec::new(),
        }
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause_between_trials = pause;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn TrialSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Run one trial per parameter value.
    ///
    /// The artifact is backed up once before the first trial and restored
    /// on every exit path. Cancelling `shutdown` stops the run before the
    /// next trial; the trials finished so far are returned.
    ///
    /// # Errors
    ///
    /// Authentication and artifact failures abort the run. Every other
    /// driver error is recorded in its trial.
    pub async fn run(
        &mut self,
        parameter_values: &[u64],
        shutdown: &CancellationToken,
    ) -> Result<Vec<BenchmarkTrial>> {
        let guard = self.artifact.begin().await?;
        let outcome = self.run_trials(&guard, parameter_values, shutdown).await;
        let restored = guard.finish().await;

        match (outcome, restored) {
            (Ok(trials), Ok(())) => Ok(trials),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(restore_err)) => {
                tracing::error!(error = %restore_err, "Config artifact restore failed after run error");
                Err(e)
            }
        }
    }

    async fn run_trials(
        &mut self,
        guard: &ArtifactGuard,
        parameter_values: &[u64],
        shutdown: &CancellationToken,
    ) -> Result<Vec<BenchmarkTrial>> {
        let mut trials = Vec::with_capacity(parameter_values.len());
        let mut disabled: HashMap<BackendKind, DriverFailure> = HashMap::new();

        for (index, &value) in parameter_values.iter().enumerate() {
            if shutdown.is_cancelled() {
                tracing::warn!(completed = trials.len(), "Shutdown requested, skipping remaining trials");
                break;
            }

            tracing::info!(
                trial = index + 1,
                of = parameter_values.len(),
                parameter = value,
                "Starting trial"
            );
            let trial = self.run_trial(guard, value, &mut disabled).await?;
            report::log_trial(&trial);
            trials.push(trial);

            for sink in &mut self.sinks {
                if let Err(e) = sink.record(&trials) {
                    tracing::warn!(error = %e, "Failed to record trial");
                }
            }

            let last = index + 1 == parameter_values.len();
            if !last && !self.pause_between_trials.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.pause_between_trials) => {}
                    _ = shutdown.cancelled() => {
                        tracing::warn!(completed = trials.len(), "Shutdown requested, skipping remaining trials");
                        break;
                    }
                }
            }
        }

        Ok(trials)
    }

    async fn run_trial(
        &self,
        guard: &ArtifactGuard,
        value: u64,
        disabled: &mut HashMap<BackendKind, DriverFailure>,
    ) -> Result<BenchmarkTrial> {
        let mut phase = TrialPhase::Idle;
        let mut trial = BenchmarkTrial::new(value);

        // Fully written before any driver starts.
        let setup_code = guard.set_parameter(value).await?;
        phase.advance(TrialPhase::ConfigMutated, value);

        let input = TrialInput::new(value, setup_code);
        let mut tasks = JoinSet::new();
        let mut task_backends = HashMap::new();
        for driver in &self.drivers {
            let kind = driver.kind();
            if let Some(failure) = disabled.get(&kind) {
                tracing::debug!(backend = %kind, parameter = value, "Driver disabled, skipping");
                trial.results.insert(
                    kind,
                    BackendOutcome::Absent(DriverFailure {
                        parameter_value: value,
                        ..failure.clone()
                    }),
                );
                continue;
            }

            let driver = Arc::clone(driver);
            let input = input.clone();
            let handle = tasks.spawn(async move { driver.run(&input).await });
            task_backends.insert(handle.id(), kind);
        }
        phase.advance(TrialPhase::Dispatched, value);

        phase.advance(TrialPhase::Collecting, value);
        let mut fatal: Option<BenchError> = None;
        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, result)) => (id, result),
                Err(join_err) => {
                    let id = join_err.id();
                    let Some(kind) = task_backends.get(&id).copied() else {
                        tracing::error!(error = %join_err, "Untracked driver task failed");
                        continue;
                    };
                    tracing::error!(backend = %kind, parameter = value, error = %join_err, "Driver task panicked");
                    trial.results.insert(
                        kind,
                        BackendOutcome::Absent(DriverFailure {
                            backend: kind,
                            parameter_value: value,
                            kind: FailureKind::Panicked,
                            message: join_err.to_string(),
                        }),
                    );
                    continue;
                }
            };

            let Some(kind) = task_backends.get(&id).copied() else {
                tracing::error!("Result from untracked driver task");
                continue;
            };

            match outcome {
                Ok(result) => {
                    trial.results.insert(kind, BackendOutcome::Finished(result));
                }
                Err(e) => {
                    let failure = DriverFailure::from_error(kind, value, &e);
                    if e.is_fatal() {
                        tracing::error!(backend = %kind, parameter = value, error = %e, "Fatal driver error");
                        fatal.get_or_insert(e);
                    } else if e.is_resolution() {
                        tracing::warn!(backend = %kind, parameter = value, error = %e, "Backend unavailable, disabled for remaining trials");
                        disabled.insert(kind, failure.clone());
                    } else {
                        tracing::warn!(backend = %kind, parameter = value, error = %e, "Backend failed in this trial");
                    }
                    trial.results.insert(kind, BackendOutcome::Absent(failure));
                }
            }
        }

        guard.restore_original().await?;
        phase.advance(TrialPhase::ConfigRestored, value);

        match fatal {
            Some(e) => Err(e),
            None => Ok(trial),
        }
    }
}
