use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use viya_bench::artifact::ConfigArtifact;
use viya_bench::auth::{CredentialManager, CredentialStatus, OAuthClient, TokenStore};
use viya_bench::config::{
    ArtifactConfig, BenchConfig, LocalConfig, PollSettings, ProgramPaths, ViyaConfig,
};
use viya_bench::driver::{
    BackendDriver, BackendKind, JobOutcome, JobResult, LocalDriver, RemoteDriver, TrialInput,
};
use viya_bench::orchestrator::BenchmarkOrchestrator;
use viya_bench::report::{render_table, summarize, JsonReportWriter};
use viya_bench::shutdown::install_shutdown_handler;
use viya_bench::BenchError;

/// Authorization codes shorter than this are rejected before hitting the token endpoint.
const MIN_AUTH_CODE_LEN: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "viya-bench")]
#[command(version)]
#[command(about = "Benchmark CASL on CAS, Base SAS on Viya and local Base SAS")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the benchmark across all selected backends
    Run(RunArgs),

    /// Credential management
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },

    /// Submit a single job with the current setup file and wait for it
    Submit(SubmitArgs),
}

// =============================================================================
// Connection Arguments (shared by every command)
// =============================================================================

#[derive(Parser, Debug)]
struct ConnectionArgs {
    /// SAS Viya deployment URL
    #[arg(long, env = "SAS_BASE_URL", global = true)]
    base_url: Option<String>,

    /// OAuth client id
    #[arg(long, env = "SAS_CLIENT_ID", global = true)]
    client_id: Option<String>,

    /// User presented to the token endpoint
    #[arg(long, env = "SAS_USERNAME", global = true)]
    username: Option<String>,

    #[arg(long, env = "SAS_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    #[arg(long, env = "SAS_SCOPE", default_value = "openid", global = true)]
    scope: String,

    /// Where tokens are cached between runs
    #[arg(long, env = "SAS_TOKEN_FILE", default_value = "data/sas_tokens.json", global = true)]
    token_file: PathBuf,

    /// Per-request HTTP timeout in seconds
    #[arg(long, default_value = "30", global = true)]
    request_timeout: u64,

    /// Fall back to the demo endpoint and client id when none is configured.
    /// Only meant for trying the tool out.
    #[arg(long, env = "VIYA_ALLOW_DEMO_DEFAULTS", global = true)]
    allow_demo_defaults: bool,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

impl ConnectionArgs {
    fn viya_config(&self) -> Result<ViyaConfig, BenchError> {
        let mut viya = ViyaConfig::resolve(
            self.base_url.clone(),
            self.client_id.clone(),
            self.allow_demo_defaults,
        )?
        .with_user(
            self.username.clone().unwrap_or_default(),
            self.password.clone().unwrap_or_default(),
        )
        .with_token_file(&self.token_file);
        viya.scope = self.scope.clone();
        viya.request_timeout = Duration::from_secs(self.request_timeout);
        viya.validate()?;
        Ok(viya)
    }
}

// =============================================================================
// Benchmark Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct BackendArgs {
    /// Parameter file rewritten before each trial
    #[arg(long, default_value = "config/setup.sas")]
    setup_file: PathBuf,

    /// Name of the assignment holding the iteration count
    #[arg(long, default_value = "iter")]
    parameter: String,

    #[arg(long, default_value = "programs/casl_simulation.sas")]
    cas_program: PathBuf,

    #[arg(long, default_value = "programs/base_simulation.sas")]
    compute_program: PathBuf,

    #[arg(long, default_value = "programs/base_local_simulation.sas")]
    local_program: PathBuf,

    /// Overall deadline for a remote job, in seconds
    #[arg(long, default_value = "1800")]
    poll_timeout: u64,

    /// Seconds between two status checks
    #[arg(long, default_value = "5")]
    poll_interval: u64,

    /// Wall-clock limit for the local SAS process, in seconds
    #[arg(long, default_value = "1800")]
    local_timeout: u64,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Exponents; trial n runs 10^n iterations
    #[arg(long, value_delimiter = ',', default_value = "0,1,2,3,4")]
    n_values: Vec<u32>,

    /// Restrict the run to these backends (cas, compute, local)
    #[arg(long, value_delimiter = ',')]
    only: Vec<BackendKind>,

    /// Pause between trials, in seconds
    #[arg(long, default_value = "5")]
    pause: u64,

    #[arg(long, default_value = "results")]
    results_dir: PathBuf,

    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Parser, Debug)]
struct SubmitArgs {
    /// Backend to submit to (cas, compute, local)
    #[arg(long)]
    backend: BackendKind,

    #[command(flatten)]
    settings: BackendArgs,
}

// =============================================================================
// Auth Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum AuthCommands {
    /// Authorize in a browser and exchange the resulting code for tokens
    Login {
        /// Authorization code; read from stdin when omitted
        #[arg(long)]
        code: Option<String>,
    },
    /// Show the cached credential
    Status,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct AuthStatusOutput {
    token_file: String,
    status: String,
    expires_at: Option<String>,
    refresh_expires_at: Option<String>,
    has_refresh_token: bool,
}

#[derive(Serialize)]
struct RunOutput<'a> {
    results_file: String,
    interrupted: bool,
    summary: viya_bench::report::RunSummary,
    trials: &'a [viya_bench::orchestrator::BenchmarkTrial],
}

// =============================================================================
// Helper Functions
// =============================================================================

fn bench_config(viya: ViyaConfig, args: &BackendArgs) -> BenchConfig {
    BenchConfig {
        poll: PollSettings::new(
            Duration::from_secs(args.poll_timeout),
            Duration::from_secs(args.poll_interval),
        ),
        local: LocalConfig::default()
            .with_program(&args.local_program)
            .with_timeout(Duration::from_secs(args.local_timeout)),
        artifact: ArtifactConfig {
            path: args.setup_file.clone(),
            parameter_name: args.parameter.clone(),
        },
        programs: ProgramPaths {
            cas: args.cas_program.clone(),
            compute: args.compute_program.clone(),
        },
        ..BenchConfig::new(viya)
    }
}

/// Connection settings are only required when a remote backend takes part.
fn viya_config_for(
    connection: &ConnectionArgs,
    backends: &[BackendKind],
) -> Result<ViyaConfig, BenchError> {
    if backends.iter().any(|kind| *kind != BackendKind::Local) {
        connection.viya_config()
    } else {
        Ok(ViyaConfig::default())
    }
}

async fn credential_manager(viya: &ViyaConfig) -> Result<Arc<CredentialManager>, BenchError> {
    let oauth = Arc::new(OAuthClient::new(viya)?);
    let manager = CredentialManager::new(oauth).with_store(TokenStore::new(&viya.token_file));
    if !manager.load().await? {
        tracing::warn!(token_file = %viya.token_file.display(), "No saved tokens, run `viya-bench auth login` first");
    }
    Ok(Arc::new(manager))
}

async fn build_drivers(
    config: &BenchConfig,
    backends: &[BackendKind],
) -> Result<Vec<Arc<dyn BackendDriver>>, BenchError> {
    let needs_remote = backends.iter().any(|kind| *kind != BackendKind::Local);
    let credentials = if needs_remote {
        let manager = credential_manager(&config.viya).await?;
        // Fail before touching the setup file if no token can be had.
        manager.get_valid_token().await?;
        Some(manager)
    } else {
        None
    };

    let mut drivers: Vec<Arc<dyn BackendDriver>> = Vec::with_capacity(backends.len());
    for kind in backends {
        let driver: Arc<dyn BackendDriver> = match (kind, &credentials) {
            (BackendKind::Cas, Some(credentials)) => Arc::new(RemoteDriver::cas(
                &config.viya,
                Arc::clone(credentials),
                &config.programs.cas,
                config.poll,
            )?),
            (BackendKind::Compute, Some(credentials)) => Arc::new(RemoteDriver::compute(
                &config.viya,
                Arc::clone(credentials),
                &config.programs.compute,
                config.poll,
            )?),
            (BackendKind::Local, _) => Arc::new(LocalDriver::new(config.local.clone())),
            (remote, None) => {
                return Err(BenchError::Config(format!("{remote} backend needs credentials")))
            }
        };
        drivers.push(driver);
    }
    Ok(drivers)
}

fn selected_backends(only: &[BackendKind]) -> Vec<BackendKind> {
    let mut backends: Vec<BackendKind> = if only.is_empty() {
        BackendKind::ALL.to_vec()
    } else {
        only.to_vec()
    };
    backends.sort();
    backends.dedup();
    backends
}

fn print_job_result(result: &JobResult, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
        OutputFormat::Table => {
            println!("Backend:   {}", result.backend.label());
            println!("Job ID:    {}", result.job_id);
            println!("State:     {}", result.state);
            println!("Elapsed:   {:.2}s", result.elapsed_secs());
            if let Some(exit_code) = result.exit_code {
                println!("Exit Code: {}", exit_code);
            }
            if let Some(message) = &result.message {
                println!("Message:   {}", message);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_run(connection: &ConnectionArgs, args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let backends = selected_backends(&args.only);
    let viya = viya_config_for(connection, &backends)?;
    let config = BenchConfig {
        n_values: args.n_values.clone(),
        pause_between_trials: Duration::from_secs(args.pause),
        results_dir: args.results_dir.clone(),
        ..bench_config(viya, &args.backend)
    };
    let iterations = config.iteration_counts()?;

    tracing::info!(
        backends = ?backends,
        iterations = ?iterations,
        setup_file = %config.artifact.path.display(),
        "Starting benchmark"
    );

    let drivers = build_drivers(&config, &backends).await?;
    let writer = JsonReportWriter::new(&config.results_dir, config.n_values.clone(), backends.clone());
    let results_file = writer.path().display().to_string();

    let mut orchestrator =
        BenchmarkOrchestrator::new(drivers, ConfigArtifact::new(&config.artifact)?)
            .with_pause(config.pause_between_trials)
            .with_sink(Box::new(writer));

    let shutdown = install_shutdown_handler();
    let trials = orchestrator.run(&iterations, &shutdown).await?;
    let interrupted = shutdown.is_cancelled();

    match connection.output {
        OutputFormat::Json => {
            let output = RunOutput {
                results_file: results_file.clone(),
                interrupted,
                summary: summarize(&trials),
                trials: &trials,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("{}", render_table(&backends, &trials));
            if !trials.is_empty() {
                println!("Results saved to {}", results_file);
            }
        }
    }

    if interrupted {
        return Err(BenchError::Interrupted.into());
    }
    Ok(())
}

async fn handle_submit(connection: &ConnectionArgs, args: SubmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let viya = viya_config_for(connection, &[args.backend])?;
    let config = bench_config(viya, &args.settings);

    let artifact = ConfigArtifact::new(&config.artifact)?;
    let setup_code = tokio::fs::read_to_string(artifact.path())
        .await
        .map_err(|e| BenchError::Artifact(format!("reading {}: {e}", artifact.path().display())))?;
    let parameter = artifact
        .current_value(&setup_code)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or_default();

    let mut drivers = build_drivers(&config, &[args.backend]).await?;
    let Some(driver) = drivers.pop() else {
        return Err(BenchError::Config("no driver for the selected backend".to_string()).into());
    };

    let result = driver.run(&TrialInput::new(parameter, setup_code)).await?;
    print_job_result(&result, &connection.output)?;

    if result.state == JobOutcome::TimedOut {
        return Err(BenchError::Timeout {
            backend: result.backend,
            timeout_secs: driver.poll_settings().timeout.as_secs(),
        }
        .into());
    }
    Ok(())
}

async fn handle_auth_login(connection: &ConnectionArgs, code: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let viya = connection.viya_config()?;
    let oauth = Arc::new(OAuthClient::new(&viya)?);

    let code = match code {
        Some(code) => code,
        None => {
            println!("Open this URL in a browser and sign in:");
            println!();
            println!("  {}", oauth.authorization_url()?);
            println!();
            println!("Paste the authorization code:");
            BufReader::new(tokio::io::stdin())
                .lines()
                .next_line()
                .await?
                .unwrap_or_default()
        }
    };

    let code = code.trim();
    if code.len() < MIN_AUTH_CODE_LEN {
        return Err(BenchError::Auth(format!(
            "authorization code is too short ({} characters)",
            code.len()
        ))
        .into());
    }

    let manager =
        CredentialManager::new(oauth).with_store(TokenStore::new(&viya.token_file));
    let credential = manager.authenticate_with_code(code).await?;
    println!("Authenticated. Access token valid until {}", credential.expires_at);
    println!("Tokens saved to {}", viya.token_file.display());
    Ok(())
}

async fn handle_auth_status(connection: &ConnectionArgs) -> Result<(), Box<dyn std::error::Error>> {
    let viya = connection.viya_config()?;
    let manager = credential_manager(&viya).await?;
    let snapshot = manager.snapshot().await;
    let status = manager.status().await;

    match connection.output {
        OutputFormat::Json => {
            let output = AuthStatusOutput {
                token_file: viya.token_file.display().to_string(),
                status: status.map_or_else(|| "absent".to_string(), |s| s.to_string()),
                expires_at: snapshot.as_ref().map(|c| c.expires_at.to_rfc3339()),
                refresh_expires_at: snapshot
                    .as_ref()
                    .and_then(|c| c.refresh_expires_at)
                    .map(|t| t.to_rfc3339()),
                has_refresh_token: snapshot.as_ref().is_some_and(|c| c.refresh_token.is_some()),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => match (snapshot, status) {
            (Some(credential), Some(status)) => {
                println!("Token file:    {}", viya.token_file.display());
                println!("Status:        {}", status);
                println!("Access token:  {}", credential.token_preview());
                println!("Expires at:    {}", credential.expires_at);
                if let Some(at) = credential.refresh_expires_at {
                    println!("Refresh until: {}", at);
                }
                if status == CredentialStatus::Expired {
                    println!("Run `viya-bench auth login` to sign in again.");
                }
            }
            _ => {
                println!("No stored credential in {}", viya.token_file.display());
                println!("Run `viya-bench auth login` to sign in.");
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Run(run_args) => {
            handle_run(&args.connection, run_args).await?;
        }
        Commands::Submit(submit_args) => {
            handle_submit(&args.connection, submit_args).await?;
        }
        Commands::Auth { command } => match command {
            AuthCommands::Login { code } => {
                handle_auth_login(&args.connection, code).await?;
            }
            AuthCommands::Status => {
                handle_auth_status(&args.connection).await?;
            }
        },
    }

    Ok(())
}
