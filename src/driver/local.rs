use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{LocalConfig, PollSettings};
use crate::driver::job::{BackendKind, JobHandle, JobOutcome, JobResult, JobState, TrialInput};
use crate::driver::BackendDriver;
use crate::error::{BenchError, Result};
use crate::poll::PollOutcome;

/// Lines of stderr kept in a failure message.
const STDERR_TAIL_LINES: usize = 20;

/// How a local process ended.
#[derive(Debug, Clone)]
enum LocalOutcome {
    Exited {
        exit_code: Option<i32>,
        success: bool,
        stdout: String,
        stderr: String,
        elapsed: Duration,
    },
    /// Killed after the hard timeout
    TimedOut { elapsed: Duration },
    WaitFailed { error: String, elapsed: Duration },
}

impl LocalOutcome {
    fn state(&self) -> JobState {
        match self {
            LocalOutcome::Exited { success: true, .. } => JobState::Completed,
            // `timed_out` is not a poll state; fetch_result reports it precisely.
            LocalOutcome::Exited { .. } | LocalOutcome::TimedOut { .. } | LocalOutcome::WaitFailed { .. } => {
                JobState::Failed
            }
        }
    }
}

/// Runs the program with a locally installed SAS executable.
///
/// Each submission spawns a child process watched by its own task; the
/// task enforces the hard timeout and publishes the outcome on a watch
/// channel keyed by job id.
pub struct LocalDriver {
    config: LocalConfig,
    runs: Mutex<HashMap<String, watch::Receiver<Option<LocalOutcome>>>>,
}

impl LocalDriver {
    pub fn new(config: LocalConfig) -> Self {
        Self {
            config,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Probe the install locations in order, then `command_name` on `PATH`.
    pub fn resolve_executable(&self) -> Result<PathBuf> {
        if let Some(found) = self.config.candidate_paths.iter().find(|p| p.is_file()) {
            return Ok(found.clone());
        }
        if let Some(found) = search_path(&self.config.command_name) {
            return Ok(found);
        }
        Err(BenchError::ExecutableNotFound(format!(
            "'{}' is not on PATH and none of {} install locations exist",
            self.config.command_name,
            self.config.candidate_paths.len()
        )))
    }

    fn check_program(&self) -> Result<()> {
        let program = self.in_working_dir(&self.config.program);
        if program.is_file() {
            Ok(())
        } else {
            Err(BenchError::ExecutableNotFound(format!(
                "program file {} does not exist",
                program.display()
            )))
        }
    }

    fn in_working_dir(&self, path: &Path) -> PathBuf {
        match &self.config.working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub fn render_args(&self) -> Vec<String> {
        let program = self.config.program.display().to_string();
        let log = self.config.log_path.display().to_string();
        let print = self.config.print_path.display().to_string();
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{program}", &program)
                    .replace("{log}", &log)
                    .replace("{print}", &print)
            })
            .collect()
    }

    fn receiver(&self, job_id: &str) -> Result<watch::Receiver<Option<LocalOutcome>>> {
        let runs = self
            .runs
            .lock()
            .map_err(|_| poll_error("run table lock poisoned".to_string()))?;
        runs.get(job_id)
            .cloned()
            .ok_or_else(|| poll_error(format!("unknown local job {job_id}")))
    }

    /// Wait for the process to end and classify it.
    async fn collect(&self, handle: &JobHandle) -> Result<JobResult> {
        let mut rx = self.receiver(&handle.job_id)?;
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| poll_error(format!("watcher for {} exited without a result", handle.job_id)))?
            .clone();

        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(&handle.job_id);
        }

        let Some(outcome) = outcome else {
            return Err(poll_error(format!("no outcome recorded for {}", handle.job_id)));
        };
        Ok(self.classify(&handle.job_id, outcome))
    }

    fn classify(&self, job_id: &str, outcome: LocalOutcome) -> JobResult {
        match outcome {
            LocalOutcome::Exited {
                exit_code,
                success,
                stdout,
                stderr,
                elapsed,
            } => {
                let state = if success {
                    JobOutcome::Completed
                } else {
                    JobOutcome::Failed
                };
                let mut result = JobResult::new(BackendKind::Local, job_id, state, millis(elapsed));
                result.exit_code = exit_code;
                if !success {
                    let tail = tail_lines(&stderr, STDERR_TAIL_LINES);
                    result.message = Some(if tail.is_empty() {
                        format!("exit code {exit_code:?}")
                    } else {
                        format!("exit code {exit_code:?}: {tail}")
                    });
                }
                if !stdout.is_empty() {
                    result.raw_output = Some(stdout);
                }
                result
            }
            LocalOutcome::TimedOut { elapsed } => {
                let mut result =
                    JobResult::new(BackendKind::Local, job_id, JobOutcome::TimedOut, millis(elapsed));
                result.message = Some(format!(
                    "killed after {}s wall-clock limit",
                    self.config.timeout.as_secs()
                ));
                result
            }
            LocalOutcome::WaitFailed { error, elapsed } => {
                let mut result =
                    JobResult::new(BackendKind::Local, job_id, JobOutcome::Failed, millis(elapsed));
                result.message = Some(error);
                result
            }
        }
    }
}

#[async_trait]
impl BackendDriver for LocalDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn poll_settings(&self) -> PollSettings {
        PollSettings::new(self.config.timeout, Duration::from_secs(1))
    }

    async fn submit(&self, input: &TrialInput) -> Result<JobHandle> {
        let executable = self.resolve_executable()?;
        self.check_program()?;

        if let Some(parent) = self
            .in_working_dir(&self.config.log_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(dir = %parent.display(), error = %e, "Could not create log directory");
            }
        }

        let args = self.render_args();
        tracing::info!(
            backend = %BackendKind::Local,
            executable = %executable.display(),
            parameter = input.parameter_value,
            "Starting local process"
        );

        let mut command = Command::new(&executable);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let submitted_at = Instant::now();
        let child = command.spawn().map_err(|e| BenchError::Submission {
            backend: BackendKind::Local,
            status: None,
            message: format!("failed to start {}: {e}", executable.display()),
        })?;

        let job_id = format!("local-{}", Uuid::new_v4());
        let (tx, rx) = watch::channel(None);
        self.runs
            .lock()
            .map_err(|_| poll_error("run table lock poisoned".to_string()))?
            .insert(job_id.clone(), rx);

        let timeout = self.config.timeout;
        let watched_id = job_id.clone();
        tokio::spawn(async move {
            // Dropping the wait future on timeout drops the child, which kills it.
            let outcome = match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(Ok(output)) => LocalOutcome::Exited {
                    exit_code: output.status.code(),
                    success: output.status.success(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    elapsed: submitted_at.elapsed(),
                },
                Ok(Err(e)) => LocalOutcome::WaitFailed {
                    error: e.to_string(),
                    elapsed: submitted_at.elapsed(),
                },
                Err(_) => {
                    tracing::warn!(job_id = %watched_id, timeout_secs = timeout.as_secs(), "Local process timed out, killing it");
                    LocalOutcome::TimedOut {
                        elapsed: submitted_at.elapsed(),
                    }
                }
            };
            let _ = tx.send(Some(outcome));
        });

        Ok(JobHandle::new(BackendKind::Local, job_id, submitted_at))
    }

    async fn poll_state(&self, handle: &JobHandle) -> Result<JobState> {
        let rx = self.receiver(&handle.job_id)?;
        let state = match rx.borrow().as_ref() {
            Some(outcome) => outcome.state(),
            None => JobState::Running,
        };
        Ok(state)
    }

    async fn fetch_result(&self, handle: &JobHandle, _polled: PollOutcome) -> Result<JobResult> {
        self.collect(handle).await
    }

    /// The process watcher already enforces the deadline, so there is
    /// nothing to poll: wait for its outcome directly.
    async fn run(&self, input: &TrialInput) -> Result<JobResult> {
        let handle = self.submit(input).await?;
        let result = self.collect(&handle).await?;
        tracing::info!(
            backend = %result.backend,
            job_id = %result.job_id,
            state = %result.state,
            exit_code = ?result.exit_code,
            elapsed_ms = result.elapsed_ms,
            "Job finished"
        );
        Ok(result)
    }
}

fn poll_error(message: String) -> BenchError {
    BenchError::Poll {
        backend: BackendKind::Local,
        status: None,
        message,
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Locate `name` on `PATH`. A name containing a path separator is checked as given.
fn search_path(name: &str) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.components().count() > 1 {
        return direct.is_file().then(|| direct.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
