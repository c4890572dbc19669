//! Bounded polling shared by every driver.
//!
//! - [`poll_until_terminal`] repeats a status check until the job reaches a
//!   terminal state or the deadline passes. Once the deadline has passed it
//!   performs exactly one last check and reports `timed_out` whatever that
//!   check returns.
//! - [`first_available`] walks an ordered list of candidate endpoints. A
//!   candidate that answers "not here" (`Ok(None)`, e.g. HTTP 404) hands over
//!   to the next one. Any error stops the walk.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::PollSettings;
use crate::driver::{JobOutcome, JobState};
use crate::error::Result;

/// Terminal state observed by the poll loop and the time since submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub outcome: JobOutcome,
    pub elapsed: Duration,
}

impl PollOutcome {
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Poll until a terminal state is seen or `settings.timeout` has elapsed
/// since `submitted_at`.
///
/// # Errors
///
/// A failing status check before the deadline aborts the loop and is returned
/// as-is. Errors from the single check after the deadline are only logged.
pub async fn poll_until_terminal<F, Fut>(
    submitted_at: Instant,
    settings: PollSettings,
    mut poll: F,
) -> Result<PollOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<JobState>>,
{
    let mut attempts: u32 = 0;
    loop {
        if submitted_at.elapsed() >= settings.timeout {
            attempts += 1;
            match poll().await {
                Ok(state) => {
                    tracing::debug!(attempts, state = %state, "Final status check after deadline")
                }
                Err(e) => {
                    tracing::warn!(attempts, error = %e, "Final status check after deadline failed")
                }
            }
            return Ok(PollOutcome {
                outcome: JobOutcome::TimedOut,
                elapsed: submitted_at.elapsed(),
            });
        }

        attempts += 1;
        let state = poll().await?;
        tracing::debug!(attempts, state = %state, "Job state");

        if let Some(outcome) = state.terminal() {
            return Ok(PollOutcome {
                outcome,
                elapsed: submitted_at.elapsed(),
            });
        }

        tokio::time::sleep(settings.interval).await;
    }
}

/// Evaluate `candidates` in order. The first `Ok(Some(_))` wins; `Ok(None)`
/// moves on to the next candidate.
///
/// Returns `Ok(None)` when every candidate declined.
pub async fn first_available<'a, C, T, F, Fut>(candidates: &'a [C], mut attempt: F) -> Result<Option<T>>
where
    F: FnMut(&'a C) -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    for candidate in candidates {
        if let Some(value) = attempt(candidate).await? {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::BackendKind;
    use crate::error::BenchError;
    use std::cell::Cell;

    fn settings(timeout_secs: u64, interval_secs: u64) -> PollSettings {
        PollSettings::new(
            Duration::from_secs(timeout_secs),
            Duration::from_secs(interval_secs),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_terminal_state() {
        let calls = Cell::new(0u32);
        let started = Instant::now();

        let outcome = poll_until_terminal(started, settings(60, 5), || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                Ok(if n < 3 {
                    JobState::Running
                } else {
                    JobState::Completed
                })
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome.outcome, JobOutcome::Completed);
        assert_eq!(calls.get(), 3);
        assert_eq!(outcome.elapsed, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_exactly_one_extra_attempt() {
        let calls = Cell::new(0u32);
        let started = Instant::now();

        let outcome = poll_until_terminal(started, settings(10, 3), || {
            calls.set(calls.get() + 1);
            async { Ok(JobState::Running) }
        })
        .await
        .unwrap();

        // checks at t=0,3,6,9 are inside the deadline, the one at t=12 is the extra one
        assert_eq!(outcome.outcome, JobOutcome::TimedOut);
        assert_eq!(calls.get(), 5);
        assert_eq!(outcome.elapsed, Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn final_attempt_result_is_ignored() {
        let calls = Cell::new(0u32);
        let started = Instant::now();

        let outcome = poll_until_terminal(started, settings(4, 5), || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n == 1 {
                    Ok(JobState::Running)
                } else {
                    Ok(JobState::Completed)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome.outcome, JobOutcome::TimedOut);
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_is_measured_from_submission() {
        let started = Instant::now();
        tokio::time::advance(Duration::from_secs(2)).await;

        let outcome = poll_until_terminal(started, settings(60, 1), || async {
            Ok(JobState::Failed)
        })
        .await
        .unwrap();

        assert_eq!(outcome.outcome, JobOutcome::Failed);
        assert_eq!(outcome.elapsed, Duration::from_secs(2));
        assert_eq!(outcome.elapsed_ms(), 2_000);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_error_aborts_the_loop() {
        let started = Instant::now();
        let err = poll_until_terminal(started, settings(60, 1), || async {
            Err(BenchError::Poll {
                backend: BackendKind::Cas,
                status: Some(500),
                message: "internal".into(),
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, BenchError::Poll { status: Some(500), .. }));
    }

    #[tokio::test]
    async fn first_available_skips_declined_candidates() {
        let tried = std::sync::Mutex::new(Vec::new());
        let candidates = ["a", "b", "c"];

        let found = first_available(&candidates, |c| {
            tried.lock().unwrap().push(*c);
            let answer = if *c == "b" { Some(42) } else { None };
            async move { Ok(answer) }
        })
        .await
        .unwrap();

        assert_eq!(found, Some(42));
        assert_eq!(*tried.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn first_available_stops_on_error() {
        let candidates = [1, 2];
        let result: Result<Option<u8>> = first_available(&candidates, |c| {
            let c = *c;
            async move {
                if c == 1 {
                    Err(BenchError::Config("boom".into()))
                } else {
                    Ok(Some(2))
                }
            }
        })
        .await;

        assert!(matches!(result, Err(BenchError::Config(_))));
    }

    #[tokio::test]
    async fn first_available_all_declined() {
        let candidates = [1, 2, 3];
        let found: Option<u8> = first_available(&candidates, |_| async { Ok(None) })
            .await
            .unwrap();
        assert!(found.is_none());
    }
}
