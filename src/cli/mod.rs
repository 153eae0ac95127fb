//! Command-line interface for egsa-deploy.
//!
//! Provides commands for deploying a commit, inspecting run history and
//! checking a pipeline's target without deploying.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config;
use crate::core::{EventStore, Orchestrator, Pipeline};
use crate::domain::environment::generate_secret_key;
use crate::domain::{DeploymentRun, Phase, RunState, Trigger};

/// egsa-deploy - Event-sourced deployment orchestrator for the EGSA tracker
#[derive(Parser, Debug)]
#[command(name = "egsa-deploy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Test, ship and verify a commit
    Deploy {
        /// Pipeline name (pipelines/<name>.yaml) or path to a pipeline file
        pipeline: String,

        /// Commit to deploy
        #[arg(long, env = "GITHUB_SHA")]
        commit: String,

        /// Branch the commit was pushed to (default: the tracked branch)
        #[arg(long, env = "GITHUB_REF_NAME")]
        branch: Option<String>,

        /// Skip the outcome notification
        #[arg(long)]
        no_notify: bool,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show the event log and captured output of a run
    Logs {
        /// Run ID (UUID)
        run_id: String,

        /// Only show output of this phase (e.g. remote_sync)
        #[arg(short, long)]
        phase: Option<String>,
    },

    /// Probe the application without deploying
    Verify {
        pipeline: String,
    },

    /// Check the target host is reachable over SSH
    Check {
        pipeline: String,
    },

    /// Preview the environment file a deploy would write (secrets redacted)
    Env {
        pipeline: String,
    },

    /// Validate a pipeline definition
    Validate {
        pipeline: String,
    },

    /// Generate a new Django SECRET_KEY
    SecretKey,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Deploy {
                pipeline,
                commit,
                branch,
                no_notify,
            } => deploy(&pipeline, commit, branch, no_notify).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Logs { run_id, phase } => show_logs(&run_id, phase.as_deref()).await,
            Commands::Verify { pipeline } => verify(&pipeline).await,
            Commands::Check { pipeline } => check(&pipeline).await,
            Commands::Env { pipeline } => preview_env(&pipeline),
            Commands::Validate { pipeline } => validate(&pipeline),
            Commands::SecretKey => {
                println!("{}", generate_secret_key());
                Ok(())
            }
            Commands::Config => show_config(),
        }
    }
}

/// Deploy a commit and exit non-zero unless it was verified live
async fn deploy(
    pipeline_name: &str,
    commit: String,
    branch: Option<String>,
    no_notify: bool,
) -> Result<()> {
    let pipeline = load_pipeline(pipeline_name)?;
    let branch = branch.unwrap_or_else(|| pipeline.branch.clone());
    let trigger = Trigger::new(commit, branch);

    let mut orchestrator = Orchestrator::for_pipeline(&pipeline)?;
    if no_notify {
        orchestrator = orchestrator.without_notifiers();
    }

    let run = orchestrator.deploy(&pipeline, trigger).await?;

    match &run.state {
        RunState::Succeeded => {
            let process = run
                .process
                .as_ref()
                .map(|p| format!(" (pid {}, port {})", p.pid, p.port))
                .unwrap_or_default();
            eprintln!(
                "\n[Run {} succeeded: {} live on {}{}]",
                run.id,
                run.trigger.short_commit(),
                run.host,
                process
            );
        }
        RunState::Failed { phase, kind, error } => {
            eprintln!("\n[Run {} failed at {} ({}): {}]", run.id, phase, kind, error);
            std::process::exit(1);
        }
        other => {
            eprintln!("\n[Run {} in state: {:?}]", run.id, other);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn parse_run_id(run_id: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id).with_context(|| format!("Invalid run ID: {}", run_id))
}

/// Show the status of a run
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let run = EventStore::load_run_in(&config::runs_dir()?, run_id).await?;

    print_run(&run);
    Ok(())
}

fn print_run(run: &DeploymentRun) {
    println!("Run ID:   {}", run.id);
    println!("Pipeline: {}", run.pipeline_name);
    println!("Host:     {}", run.host);
    println!("Commit:   {} ({})", run.trigger.commit, run.trigger.branch);
    println!("State:    {}", run.state.label());
    println!("Stage:    {}", run.stage());
    println!("Started:  {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Finished: {}", completed);
    }
    if let RunState::Failed { phase, kind, error } = &run.state {
        println!("Failure:  {} at {}: {}", kind, phase, error);
    }
    if let Some(process) = &run.process {
        println!(
            "Process:  pid {} on port {} (log {})",
            process.pid, process.port, process.log_path
        );
    }
    if let Some(fingerprint) = &run.environment_fingerprint {
        println!("Env:      {}", fingerprint);
    }
    if let Some(notified) = run.notified {
        println!("Notified: {}", if notified { "yes" } else { "failed" });
    }
    if let Some(log) = &run.log_path {
        println!("Log:      {}", log.display());
    }

    println!("\nPhases:");
    for (phase, status) in &run.phase_statuses {
        println!("  {:<28} {:?}", phase.as_str(), status);
    }
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let runs = EventStore::recent_runs_in(&config::runs_dir()?, limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!(
        "{:<38} {:<12} {:<9} {:<10} {:<20}",
        "RUN ID", "PIPELINE", "COMMIT", "STATE", "STARTED"
    );
    println!("{}", "-".repeat(92));

    for run in runs {
        println!(
            "{:<38} {:<12} {:<9} {:<10} {:<20}",
            run.id,
            run.pipeline_name,
            run.trigger.short_commit(),
            run.state.label(),
            run.started_at.format("%Y-%m-%d %H:%M:%S").to_string()
        );
    }

    Ok(())
}

/// Show events and captured phase output
async fn show_logs(run_id_str: &str, phase: Option<&str>) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let runs_dir = config::runs_dir()?;
    // Fails for unknown runs before the store would create a directory
    EventStore::load_run_in(&runs_dir, run_id).await?;
    let store = EventStore::open_in(&runs_dir, run_id).await?;

    let phases = match phase {
        Some(name) => {
            let phase = Phase::parse(name).with_context(|| {
                let known: Vec<&str> = Phase::ALL.iter().map(|p| p.as_str()).collect();
                format!("Unknown phase '{}'. Known phases: {}", name, known.join(", "))
            })?;
            vec![phase]
        }
        None => {
            for event in store.replay().await? {
                let mut line = format!(
                    "{} {:<26} {}",
                    event.timestamp.format("%H:%M:%S"),
                    format!("{:?}", event.event_type),
                    event.payload_summary
                );
                if let Some(error) = &event.error {
                    line.push_str(&format!(" | {}", error));
                }
                println!("{}", line);
            }
            store.phases_with_output().await?
        }
    };

    for phase in phases {
        match store.load_phase_output(phase).await? {
            Some(output) => {
                println!("\n--- {} ---", phase);
                print!("{}", output);
            }
            None => println!("\n--- {} --- (no output)", phase),
        }
    }

    Ok(())
}

/// Probe the endpoint using the pipeline's polling policy
async fn verify(pipeline_name: &str) -> Result<()> {
    let pipeline = load_pipeline(pipeline_name)?;
    let orchestrator = Orchestrator::for_pipeline(&pipeline)?;

    match orchestrator.verify_only(&pipeline).await {
        Ok(summary) => {
            println!("{}", summary);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}

/// Check SSH reachability of the target
async fn check(pipeline_name: &str) -> Result<()> {
    let pipeline = load_pipeline(pipeline_name)?;
    let orchestrator = Orchestrator::for_pipeline(&pipeline)?;

    orchestrator.check_remote().await?;
    println!(
        "{}@{}:{} is reachable",
        pipeline.target.user, pipeline.target.host, pipeline.target.ssh_port
    );

    Ok(())
}

/// Print the environment file with secret values masked
fn preview_env(pipeline_name: &str) -> Result<()> {
    let pipeline = load_pipeline(pipeline_name)?;
    let snapshot = pipeline
        .resolve_environment()
        .context("Environment is incomplete")?;
    let limits = &pipeline.safety_limits;

    println!("# {} ({} keys, fingerprint {})", pipeline.env_file(), snapshot.len(), snapshot.fingerprint());
    for (key, value) in snapshot.redacted(|k| limits.is_secret_key(k)) {
        println!("{}={}", key, value);
    }

    Ok(())
}

fn validate(pipeline_name: &str) -> Result<()> {
    let pipeline = load_pipeline(pipeline_name)?;
    println!("Pipeline '{}' is valid", pipeline.name);
    println!("  Target:  {}@{}:{}", pipeline.target.user, pipeline.target.host, pipeline.target.ssh_port);
    println!("  Branch:  {}", pipeline.branch);
    println!("  App dir: {}", pipeline.app.app_dir);
    println!("  Probe:   {}", pipeline.probe_url());
    println!("  Phases:");
    for phase in Phase::ALL {
        println!(
            "    {:<28} timeout {}s",
            phase.as_str(),
            pipeline.safety_limits.phase_timeout(phase).as_secs()
        );
    }
    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("egsa-deploy configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Runs:      {}", cfg.runs_dir().display());
    println!("  Pipelines: {}", cfg.pipelines.display());
    println!();
    println!(
        "Default webhook: {}",
        cfg.webhook_url.as_deref().unwrap_or("(none)")
    );

    Ok(())
}

/// Load and validate a pipeline by name or path
fn load_pipeline(name: &str) -> Result<Pipeline> {
    let path = config::pipeline_path(name)?;

    if !path.exists() {
        anyhow::bail!(
            "Pipeline '{}' not found at {}",
            name,
            path.display()
        );
    }

    let pipeline = Pipeline::from_file(&path)?;
    pipeline.validate()?;
    Ok(pipeline)
}
