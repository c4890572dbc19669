//! Trial analysis, run summary and result persistence.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::driver::BackendKind;
use crate::error::Result;
use crate::orchestrator::{BenchmarkTrial, TrialSink};

/// Fastest and slowest backend of one trial, over completed jobs only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialAnalysis {
    pub parameter_value: u64,
    pub fastest: Option<(BackendKind, f64)>,
    pub slowest: Option<(BackendKind, f64)>,
    /// `(t / fastest - 1) * 100` for every completed backend except the fastest
    pub slowdown_pct: BTreeMap<BackendKind, f64>,
    /// Slowest over fastest, when at least two backends completed
    pub speed_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendAverage {
    pub backend: BackendKind,
    pub mean_secs: f64,
    pub completed_trials: usize,
    /// Mean over the lowest mean of all backends
    pub relative_to_leader: f64,
}

/// How much a backend's time grew from one trial to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingStep {
    pub backend: BackendKind,
    pub from_parameter: u64,
    pub to_parameter: u64,
    pub factor: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub trials: Vec<TrialAnalysis>,
    pub averages: Vec<BackendAverage>,
    pub scaling: Vec<ScalingStep>,
}

pub fn analyze_trial(trial: &BenchmarkTrial) -> TrialAnalysis {
    let times = trial.completed_times();
    let fastest = times
        .iter()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(k, t)| (*k, *t));
    let slowest = times
        .iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(k, t)| (*k, *t));

    let mut slowdown_pct = BTreeMap::new();
    let mut speed_ratio = None;
    if let (Some((fast_kind, fast)), Some((_, slow))) = (fastest, slowest) {
        if times.len() >= 2 && fast > 0.0 {
            for (kind, t) in &times {
                if *kind != fast_kind {
                    slowdown_pct.insert(*kind, (t / fast - 1.0) * 100.0);
                }
            }
            speed_ratio = Some(slow / fast);
        }
    }

    TrialAnalysis {
        parameter_value: trial.parameter_value,
        fastest,
        slowest,
        slowdown_pct,
        speed_ratio,
    }
}

/// Log the trial's timings and, with two or more completions, who won and by how much.
pub fn log_trial(trial: &BenchmarkTrial) {
    for (kind, outcome) in &trial.results {
        match (outcome.result(), outcome.failure()) {
            (Some(result), _) => tracing::info!(
                backend = %kind,
                parameter = trial.parameter_value,
                state = %result.state,
                elapsed_ms = result.elapsed_ms,
                "Trial result"
            ),
            (None, Some(failure)) => tracing::warn!(
                backend = %kind,
                parameter = trial.parameter_value,
                kind = ?failure.kind,
                message = %failure.message,
                "Trial result absent"
            ),
            (None, None) => {}
        }
    }

    let analysis = analyze_trial(trial);
    if let (Some((fastest, secs)), Some(_)) = (analysis.fastest, analysis.speed_ratio) {
        tracing::info!(parameter = trial.parameter_value, fastest = %fastest, secs, "Fastest backend");
        for (kind, pct) in &analysis.slowdown_pct {
            tracing::info!(parameter = trial.parameter_value, backend = %kind, slowdown_pct = %format!("{pct:.1}"), "Slower than fastest");
        }
    }
}

pub fn summarize(trials: &[BenchmarkTrial]) -> RunSummary {
    let analyses = trials.iter().map(analyze_trial).collect();

    let mut per_backend: BTreeMap<BackendKind, Vec<f64>> = BTreeMap::new();
    for trial in trials {
        for (kind, secs) in trial.completed_times() {
            per_backend.entry(kind).or_default().push(secs);
        }
    }

    let means: Vec<(BackendKind, f64, usize)> = per_backend
        .iter()
        .map(|(kind, times)| (*kind, times.iter().sum::<f64>() / times.len() as f64, times.len()))
        .collect();
    let leader = means
        .iter()
        .map(|(_, mean, _)| *mean)
        .min_by(f64::total_cmp)
        .unwrap_or(0.0);
    let averages = means
        .into_iter()
        .map(|(backend, mean_secs, completed_trials)| BackendAverage {
            backend,
            mean_secs,
            completed_trials,
            relative_to_leader: if leader > 0.0 { mean_secs / leader } else { 1.0 },
        })
        .collect();

    let mut scaling = Vec::new();
    for pair in trials.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let prev_times = prev.completed_times();
        for (kind, t_next) in next.completed_times() {
            if let Some(t_prev) = prev_times.get(&kind).filter(|t| **t > 0.0) {
                scaling.push(ScalingStep {
                    backend: kind,
                    from_parameter: prev.parameter_value,
                    to_parameter: next.parameter_value,
                    factor: t_next / t_prev,
                });
            }
        }
    }

    RunSummary {
        trials: analyses,
        averages,
        scaling,
    }
}

/// Plain-text table of seconds per backend and trial, followed by the summary.
pub fn render_table(backends: &[BackendKind], trials: &[BenchmarkTrial]) -> String {
    let summary = summarize(trials);
    let mut out = String::new();

    let _ = write!(out, "{:>12}", "iterations");
    for kind in backends {
        let _ = write!(out, " {:>18}", kind.label());
    }
    out.push('\n');

    for trial in trials {
        let _ = write!(out, "{:>12}", trial.parameter_value);
        for kind in backends {
            let cell = match trial.get(*kind) {
                Some(outcome) => match (outcome.completed_secs(), outcome.result()) {
                    (Some(secs), _) => format!("{secs:.2}s"),
                    (None, Some(result)) => result.state.to_string(),
                    (None, None) => "absent".to_string(),
                },
                None => "-".to_string(),
            };
            let _ = write!(out, " {cell:>18}");
        }
        out.push('\n');
    }

    if !summary.averages.is_empty() {
        out.push_str("\naverage time per backend:\n");
        for avg in &summary.averages {
            let _ = writeln!(
                out,
                "  {:<18} {:>10.2}s  x{:.2} vs fastest  ({} trials)",
                avg.backend.label(),
                avg.mean_secs,
                avg.relative_to_leader,
                avg.completed_trials
            );
        }
    }

    if !summary.scaling.is_empty() {
        out.push_str("\nscaling between trials:\n");
        for step in &summary.scaling {
            let _ = writeln!(
                out,
                "  {:<18} {} -> {}: x{:.2}",
                step.backend.label(),
                step.from_parameter,
                step.to_parameter,
                step.factor
            );
        }
    }
    out
}

#[derive(Debug, Serialize)]
struct ResultSnapshot<'a> {
    timestamp: DateTime<Utc>,
    n_values: &'a [u32],
    iterations: Vec<u64>,
    /// Seconds per backend in trial order, `null` when the job did not complete
    results: BTreeMap<BackendKind, Vec<Option<f64>>>,
    summary: RunSummary,
    trials: &'a [BenchmarkTrial],
}

/// Rewrites one timestamped JSON file after every trial.
pub struct JsonReportWriter {
    path: PathBuf,
    started_at: DateTime<Utc>,
    n_values: Vec<u32>,
    backends: Vec<BackendKind>,
}

impl JsonReportWriter {
    pub fn new(results_dir: impl AsRef<Path>, n_values: Vec<u32>, backends: Vec<BackendKind>) -> Self {
        let started_at = Utc::now();
        let path = results_dir
            .as_ref()
            .join(format!("viya_benchmark_{}.json", started_at.format("%Y%m%d_%H%M%S")));
        Self {
            path,
            started_at,
            n_values,
            backends,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn snapshot<'a>(&'a self, trials: &'a [BenchmarkTrial]) -> ResultSnapshot<'a> {
        let results = self
            .backends
            .iter()
            .map(|kind| {
                let column = trials
                    .iter()
                    .map(|t| t.get(*kind).and_then(|o| o.completed_secs()))
                    .collect();
                (*kind, column)
            })
            .collect();

        ResultSnapshot {
            timestamp: self.started_at,
            n_values: &self.n_values,
            iterations: trials.iter().map(|t| t.parameter_value).collect(),
            results,
            summary: summarize(trials),
            trials,
        }
    }
}

impl TrialSink for JsonReportWriter {
    fn record(&mut self, trials: &[BenchmarkTrial]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(&self.snapshot(trials))?;
        std::fs::write(&self.path, body)?;
        tracing::debug!(path = %self.path.display(), trials = trials.len(), "Results saved");
        Ok(())
    }
}
