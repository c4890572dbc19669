use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BenchError, Result};

/// Endpoint and client id used only when `--allow-demo-defaults` is given.
pub const DEMO_BASE_URL: &str = "https://demo.viya.example.com";
pub const DEMO_CLIENT_ID: &str = "viya_bench_demo";

/// Connection settings for the SAS Viya deployment.
#[derive(Debug, Clone)]
pub struct ViyaConfig {
    /// Deployment root, e.g. `https://viya.example.com`
    pub base_url: String,
    pub client_id: String,
    /// Credentials presented to the token endpoint via HTTP Basic Auth
    pub username: String,
    pub password: String,
    pub scope: String,
    /// Where access/refresh tokens are persisted between runs
    pub token_file: PathBuf,
    /// Per-request timeout for every HTTP call
    pub request_timeout: Duration,
}

impl Default for ViyaConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            client_id: String::new(),
            username: String::new(),
            password: String::new(),
            scope: "openid".to_string(),
            token_file: PathBuf::from("data/sas_tokens.json"),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ViyaConfig {
    pub fn new(base_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_token_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_file = path.into();
        self
    }

    /// Build a config from optional sources. Missing endpoint values are only
    /// replaced by the demo defaults when `allow_demo_defaults` is set.
    pub fn resolve(
        base_url: Option<String>,
        client_id: Option<String>,
        allow_demo_defaults: bool,
    ) -> Result<Self> {
        let base_url = match base_url.filter(|s| !s.trim().is_empty()) {
            Some(url) => url,
            None if allow_demo_defaults => {
                tracing::warn!(base_url = DEMO_BASE_URL, "SAS_BASE_URL not set, using demo default");
                DEMO_BASE_URL.to_string()
            }
            None => {
                return Err(BenchError::Config(
                    "SAS_BASE_URL is not set (pass --allow-demo-defaults to use the demo endpoint)"
                        .to_string(),
                ))
            }
        };
        let client_id = match client_id.filter(|s| !s.trim().is_empty()) {
            Some(id) => id,
            None if allow_demo_defaults => {
                tracing::warn!(client_id = DEMO_CLIENT_ID, "SAS_CLIENT_ID not set, using demo default");
                DEMO_CLIENT_ID.to_string()
            }
            None => {
                return Err(BenchError::Config(
                    "SAS_CLIENT_ID is not set (pass --allow-demo-defaults to use the demo client)"
                        .to_string(),
                ))
            }
        };
        Ok(Self::new(base_url, client_id))
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(BenchError::Config("base URL is empty".to_string()));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(BenchError::Config(format!(
                "base URL must start with http:// or https://, got {}",
                self.base_url
            )));
        }
        if self.client_id.is_empty() {
            return Err(BenchError::Config("client id is empty".to_string()));
        }
        if self.username.is_empty() || self.password.is_empty() {
            return Err(BenchError::Config(
                "SAS_USERNAME and SAS_PASSWORD are required for the token endpoint".to_string(),
            ));
        }
        Ok(())
    }

    pub fn token_url(&self) -> String {
        format!("{}/SASLogon/oauth/token", self.base_url)
    }

    pub fn authorize_url(&self) -> String {
        format!("{}/SASLogon/oauth/authorize", self.base_url)
    }
}

/// Bounded polling for remote job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Overall deadline measured from submission
    pub timeout: Duration,
    /// Sleep between two status checks
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1800),
            interval: Duration::from_secs(5),
        }
    }
}

impl PollSettings {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Configuration for running programs with a locally installed SAS.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Install locations probed in order before falling back to `command_name`
    pub candidate_paths: Vec<PathBuf>,
    /// Bare command resolved through `PATH`
    pub command_name: String,
    pub program: PathBuf,
    pub log_path: PathBuf,
    pub print_path: PathBuf,
    /// Argument template; `{program}`, `{log}` and `{print}` are substituted
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Hard wall-clock limit, the process is killed when exceeded
    pub timeout: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            candidate_paths: vec![
                PathBuf::from(r"C:\Program Files\SASHome\SASFoundation\9.4\sas.exe"),
                PathBuf::from(r"C:\Program Files\SAS\SASFoundation\9.4\sas.exe"),
                PathBuf::from(r"C:\Program Files (x86)\SASHome\SASFoundation\9.4\sas.exe"),
                PathBuf::from(r"C:\SAS9.4\sas.exe"),
                PathBuf::from("/usr/local/SASHome/SASFoundation/9.4/sas"),
                PathBuf::from("/opt/sas/SASHome/SASFoundation/9.4/sas"),
            ],
            command_name: "sas".to_string(),
            program: PathBuf::from("programs/base_local_simulation.sas"),
            log_path: PathBuf::from("results/base_local_simulation.log"),
            print_path: PathBuf::from("results/base_local_simulation.lst"),
            args: [
                "-sysin",
                "{program}",
                "-log",
                "{log}",
                "-print",
                "{print}",
                "-nosplash",
                "-noterminal",
                "-nologo",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            working_dir: None,
            timeout: Duration::from_secs(1800),
        }
    }
}

impl LocalConfig {
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// The shared parameter file rewritten before every trial.
#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    pub path: PathBuf,
    /// Name of the assignment to rewrite, e.g. `iter` in `%let iter = 10;`
    pub parameter_name: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("config/setup.sas"),
            parameter_name: "iter".to_string(),
        }
    }
}

/// Program files submitted to the remote backends.
#[derive(Debug, Clone)]
pub struct ProgramPaths {
    pub cas: PathBuf,
    pub compute: PathBuf,
}

impl Default for ProgramPaths {
    fn default() -> Self {
        Self {
            cas: PathBuf::from("programs/casl_simulation.sas"),
            compute: PathBuf::from("programs/base_simulation.sas"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub viya: ViyaConfig,
    pub poll: PollSettings,
    pub local: LocalConfig,
    pub artifact: ArtifactConfig,
    pub programs: ProgramPaths,
    /// Exponents; each trial runs `10^n` iterations
    pub n_values: Vec<u32>,
    pub pause_between_trials: Duration,
    pub results_dir: PathBuf,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            viya: ViyaConfig::default(),
            poll: PollSettings::default(),
            local: LocalConfig::default(),
            artifact: ArtifactConfig::default(),
            programs: ProgramPaths::default(),
            n_values: vec![0, 1, 2, 3, 4],
            pause_between_trials: Duration::from_secs(5),
            results_dir: PathBuf::from("results"),
        }
    }
}

impl BenchConfig {
    pub fn new(viya: ViyaConfig) -> Self {
        Self {
            viya,
            ..Default::default()
        }
    }

    /// Iteration counts derived from `n_values`.
    pub fn iteration_counts(&self) -> Result<Vec<u64>> {
        iteration_counts(&self.n_values)
    }
}

/// Convert exponents into `10^n` iteration counts.
pub fn iteration_counts(n_values: &[u32]) -> Result<Vec<u64>> {
    n_values
        .iter()
        .map(|&n| {
            10u64
                .checked_pow(n)
                .ok_or_else(|| BenchError::Config(format!("10^{n} iterations overflows u64")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viya_config_default() {
        let cfg = ViyaConfig::default();
        assert_eq!(cfg.scope, "openid");
        assert_eq!(cfg.token_file, PathBuf::from("data/sas_tokens.json"));
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn viya_config_new_trims_trailing_slash() {
        let cfg = ViyaConfig::new("https://viya.example.com/", "cli");
        assert_eq!(cfg.base_url, "https://viya.example.com");
        assert_eq!(cfg.token_url(), "https://viya.example.com/SASLogon/oauth/token");
        assert_eq!(
            cfg.authorize_url(),
            "https://viya.example.com/SASLogon/oauth/authorize"
        );
    }

    #[test]
    fn resolve_requires_opt_in_for_demo_defaults() {
        assert!(matches!(
            ViyaConfig::resolve(None, Some("cli".into()), false),
            Err(BenchError::Config(_))
        ));
        assert!(matches!(
            ViyaConfig::resolve(Some("https://x".into()), None, false),
            Err(BenchError::Config(_))
        ));

        let cfg = ViyaConfig::resolve(None, None, true).unwrap();
        assert_eq!(cfg.base_url, DEMO_BASE_URL);
        assert_eq!(cfg.client_id, DEMO_CLIENT_ID);
    }

    #[test]
    fn resolve_prefers_explicit_values() {
        let cfg = ViyaConfig::resolve(Some("https://viya.local".into()), Some("cli".into()), true)
            .unwrap();
        assert_eq!(cfg.base_url, "https://viya.local");
        assert_eq!(cfg.client_id, "cli");
    }

    #[test]
    fn validate_checks_credentials_and_scheme() {
        let cfg = ViyaConfig::new("https://viya.local", "cli");
        assert!(cfg.validate().is_err());

        let cfg = cfg.with_user("alice", "secret");
        assert!(cfg.validate().is_ok());

        let bad = ViyaConfig::new("viya.local", "cli").with_user("a", "b");
        assert!(bad.validate().is_err());
    }

    #[test]
    fn poll_settings_default() {
        let poll = PollSettings::default();
        assert_eq!(poll.timeout, Duration::from_secs(1800));
        assert_eq!(poll.interval, Duration::from_secs(5));
    }

    #[test]
    fn local_config_default_template() {
        let cfg = LocalConfig::default();
        assert_eq!(cfg.command_name, "sas");
        assert_eq!(cfg.args[0], "-sysin");
        assert_eq!(cfg.args[1], "{program}");
        assert!(cfg.args.contains(&"-nologo".to_string()));
        assert_eq!(cfg.timeout, Duration::from_secs(1800));
    }

    #[test]
    fn bench_config_iteration_counts() {
        let cfg = BenchConfig::default();
        assert_eq!(
            cfg.iteration_counts().unwrap(),
            vec![1, 10, 100, 1_000, 10_000]
        );
        assert_eq!(cfg.artifact.parameter_name, "iter");
        assert_eq!(cfg.pause_between_trials, Duration::from_secs(5));
    }

    #[test]
    fn iteration_counts_overflow_is_an_error() {
        assert!(iteration_counts(&[20]).is_err());
        assert_eq!(iteration_counts(&[19]).unwrap(), vec![10u64.pow(19)]);
    }
}
