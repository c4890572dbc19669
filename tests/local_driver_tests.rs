//! Local driver tests run `/bin/sh` as the "SAS executable" with the
//! program file holding the shell script.
#![cfg(unix)]

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use viya_bench::config::LocalConfig;
use viya_bench::driver::{BackendDriver, BackendKind, JobOutcome, JobState, LocalDriver, TrialInput};
use viya_bench::error::BenchError;

/// Config whose executable is `/bin/sh` and whose program is `script`.
fn shell_config(dir: &TempDir, script: &str) -> LocalConfig {
    let program = dir.path().join("base_local_simulation.sas");
    std::fs::write(&program, script).unwrap();

    LocalConfig {
        candidate_paths: vec![dir.path().join("missing-sas"), PathBuf::from("/bin/sh")],
        command_name: "viya-bench-no-such-sas".to_string(),
        program,
        log_path: dir.path().join("results").join("local.log"),
        print_path: dir.path().join("results").join("local.lst"),
        args: vec!["{program}".to_string(), "{log}".to_string(), "{print}".to_string()],
        working_dir: None,
        timeout: Duration::from_secs(10),
    }
}

fn input() -> TrialInput {
    TrialInput::new(100, "%let iter = 100;")
}

#[tokio::test]
async fn test_successful_process_completes() {
    let dir = tempfile::tempdir().unwrap();
    let driver = LocalDriver::new(shell_config(&dir, "echo done\nexit 0\n"));

    let result = driver.run(&input()).await.unwrap();

    assert_eq!(result.backend, BackendKind::Local);
    assert_eq!(result.state, JobOutcome::Completed);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.raw_output.as_deref(), Some("done\n"));
    assert!(result.message.is_none());
    assert!(result.job_id.starts_with("local-"));
}

#[tokio::test]
async fn test_nonzero_exit_is_failed() {
    let dir = tempfile::tempdir().unwrap();
    let driver = LocalDriver::new(shell_config(&dir, "echo 'ERROR: license expired' >&2\nexit 3\n"));

    let result = driver.run(&input()).await.unwrap();

    assert_eq!(result.state, JobOutcome::Failed);
    assert_eq!(result.exit_code, Some(3));
    let message = result.message.unwrap();
    assert!(message.contains("3"));
    assert!(message.contains("license expired"));
}

#[tokio::test]
async fn test_hard_timeout_kills_process() {
    let dir = tempfile::tempdir().unwrap();
    let config = LocalConfig {
        timeout: Duration::from_millis(200),
        ..shell_config(&dir, "sleep 5\n")
    };
    let driver = LocalDriver::new(config);

    let started = std::time::Instant::now();
    let result = driver.run(&input()).await.unwrap();

    assert_eq!(result.state, JobOutcome::TimedOut);
    assert!(result.exit_code.is_none());
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_arguments_follow_template() {
    let dir = tempfile::tempdir().unwrap();
    let seen = dir.path().join("args.txt");
    let script = format!("echo \"$@\" > {}\n", seen.display());
    let config = shell_config(&dir, &script);
    let log = config.log_path.clone();
    let driver = LocalDriver::new(config);

    let result = driver.run(&input()).await.unwrap();
    assert_eq!(result.state, JobOutcome::Completed);

    // $0 is the program, the remaining template entries are passed through
    let args = std::fs::read_to_string(&seen).unwrap();
    assert!(args.contains(&log.display().to_string()));
    assert!(args.contains("local.lst"));
    // the log directory is created before the process starts
    assert!(log.parent().unwrap().is_dir());
}

#[tokio::test]
async fn test_poll_state_then_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let driver = LocalDriver::new(shell_config(&dir, "sleep 0.3\nexit 1\n"));

    let handle = driver.submit(&input()).await.unwrap();
    assert_eq!(driver.poll_state(&handle).await.unwrap(), JobState::Running);

    let result = viya_bench::poll::poll_until_terminal(
        handle.submitted_at,
        driver.poll_settings(),
        || driver.poll_state(&handle),
    )
    .await
    .unwrap();
    assert_eq!(result.outcome, JobOutcome::Failed);

    let final_result = driver.fetch_result(&handle, result).await.unwrap();
    assert_eq!(final_result.exit_code, Some(1));

    // the handle is forgotten once collected
    assert!(matches!(
        driver.poll_state(&handle).await,
        Err(BenchError::Poll { .. })
    ));
}

#[tokio::test]
async fn test_missing_executable_is_resolution_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = LocalConfig {
        candidate_paths: vec![dir.path().join("sas")],
        ..shell_config(&dir, "exit 0\n")
    };

    let err = LocalDriver::new(config).run(&input()).await.unwrap_err();

    assert!(matches!(err, BenchError::ExecutableNotFound(_)));
    assert!(err.is_resolution());
}

#[tokio::test]
async fn test_missing_program_is_resolution_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = shell_config(&dir, "exit 0\n").with_program(dir.path().join("nope.sas"));

    let err = LocalDriver::new(config).run(&input()).await.unwrap_err();
    assert!(matches!(err, BenchError::ExecutableNotFound(ref m) if m.contains("nope.sas")));
}
