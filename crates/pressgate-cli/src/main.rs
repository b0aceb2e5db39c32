//! Pressgate - build and deploy a static document site
//!
//! The `pressgate` command drives the pipeline for one trigger or a stream of
//! triggers, and inspects the artifacts and deployments it produced.
//!
//! ## Commands
//!
//! - `run`: handle one trigger event
//! - `listen`: handle newline-delimited JSON trigger events from stdin
//! - `fingerprint`: print the dependency fingerprint
//! - `artifacts`: list or show published artifacts
//! - `status`: show the live deployment and its history
//! - `rollback`: repoint the live site to the previous deployment

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};

use pressgate_core::{
    render_run_summary_md, write_run_record, ArtifactId, ArtifactStore, DeployAction, DeployGate,
    HostingEndpoint, Orchestrator, PipelineConfig, RunOutcome, TerminalState, TriggerEvent,
    TriggerKind, CONFIG_FILE_NAME,
};

#[derive(Parser)]
#[command(name = "pressgate")]
#[command(version = pressgate_core::VERSION)]
#[command(about = "Cached build and gated deployment for static document sites", long_about = None)]
struct Cli {
    /// Path to the pipeline config
    #[arg(short, long, global = true, env = "PRESSGATE_CONFIG", default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Enable verbose output (PRESSGATE_LOG or RUST_LOG take precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle one trigger event
    Run {
        /// Trigger kind: push, pull-request or manual
        #[arg(long, default_value = "push")]
        event: TriggerKind,

        #[arg(long)]
        branch: String,

        #[arg(long)]
        commit: String,

        /// Treat the branch as the main branch
        #[arg(long, conflicts_with = "not_main")]
        main: bool,

        /// Treat the branch as not the main branch
        #[arg(long)]
        not_main: bool,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Handle newline-delimited JSON trigger events from stdin, concurrently
    Listen,

    /// Print the dependency fingerprint of the configured manifests
    Fingerprint,

    /// Inspect published artifacts
    Artifacts {
        #[command(subcommand)]
        action: ArtifactsAction,
    },

    /// Show the live deployment and deployment history
    Status,

    /// Repoint the live site to the previous deployment
    Rollback,
}

#[derive(Subcommand)]
enum ArtifactsAction {
    /// List artifacts, oldest first
    List,
    /// Show one artifact as JSON
    Show { id: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Trigger as read by `listen`. `is_main` falls back to comparing the branch
/// with the configured main branch.
#[derive(Debug, Deserialize)]
struct ListenEvent {
    kind: TriggerKind,
    branch: String,
    commit: String,
    #[serde(default)]
    is_main: Option<bool>,
}

fn resolve_is_main(config: &PipelineConfig, branch: &str, main: bool, not_main: bool) -> bool {
    if main {
        true
    } else if not_main {
        false
    } else {
        config.is_main_branch(branch)
    }
}

fn parse_listen_line(config: &PipelineConfig, line: &str) -> Result<TriggerEvent> {
    let raw: ListenEvent = serde_json::from_str(line).context("invalid trigger event")?;
    let is_main = raw.is_main.unwrap_or_else(|| config.is_main_branch(&raw.branch));
    Ok(TriggerEvent::new(raw.kind, raw.branch, raw.commit, is_main))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    pressgate_core::init_tracing(cli.json, level);

    let config = PipelineConfig::load_or_default(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;

    match cli.command {
        Commands::Run {
            event,
            branch,
            commit,
            main,
            not_main,
            output,
        } => {
            let is_main = resolve_is_main(&config, &branch, main, not_main);
            let trigger = TriggerEvent::new(event, branch, commit, is_main);
            cmd_run(&config, trigger, output).await
        }
        Commands::Listen => cmd_listen(&config).await,
        Commands::Fingerprint => cmd_fingerprint(&config),
        Commands::Artifacts { action } => match action {
            ArtifactsAction::List => cmd_artifacts_list(&config).await,
            ArtifactsAction::Show { id } => cmd_artifacts_show(&config, &id).await,
        },
        Commands::Status => cmd_status(&config).await,
        Commands::Rollback => cmd_rollback(&config).await,
    }
}

fn open(config: &PipelineConfig) -> Result<Orchestrator> {
    Orchestrator::from_config(config, Arc::new(DeployGate::new())).context("failed to open pipeline state")
}

fn print_outcome(outcome: &RunOutcome) {
    let mark = match outcome.terminal {
        TerminalState::Deployed | TerminalState::CheckPassed => "✓",
        TerminalState::SkippedSuperseded => "↷",
        TerminalState::Failed => "✗",
    };
    println!(
        "{} {:?} run={} {}@{}",
        mark, outcome.terminal, outcome.run_id, outcome.event.branch, outcome.event.commit
    );
    if let Some(fp) = &outcome.fingerprint {
        println!(
            "  fingerprint: {} (cache {})",
            fp.short(),
            if outcome.cache_hit { "hit" } else { "miss" }
        );
    }
    if let Some(id) = &outcome.artifact_id {
        println!("  artifact:    {}", id);
    }
    if outcome.stale {
        println!("  stale:       a newer push arrived on {}", outcome.event.branch);
    }
    println!("  duration:    {}ms", outcome.duration_ms);
    if let Some(diag) = &outcome.diagnostics {
        println!("\n{}", diag.trim_end());
    }
}

fn record(runs_dir: &Path, outcome: &RunOutcome) {
    match write_run_record(runs_dir, outcome) {
        Ok(path) => info!(run_id = %outcome.run_id, path = %path.display(), "run record written"),
        Err(e) => warn!(run_id = %outcome.run_id, error = %e, "failed to write run record"),
    }
}

async fn cmd_run(config: &PipelineConfig, trigger: TriggerEvent, output: OutputFormat) -> Result<ExitCode> {
    let orch = open(config)?;
    let outcome = orch.handle(trigger).await;
    record(&config.runs_dir(), &outcome);

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Text => print_outcome(&outcome),
    }
    if let Ok(summary_path) = std::env::var("GITHUB_STEP_SUMMARY") {
        append_summary(Path::new(&summary_path), &outcome);
    }

    Ok(if outcome.terminal == TerminalState::Failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn append_summary(path: &Path, outcome: &RunOutcome) {
    use std::io::Write;
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(render_run_summary_md(outcome).as_bytes()));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "failed to append run summary");
    }
}

async fn cmd_listen(config: &PipelineConfig) -> Result<ExitCode> {
    let orch = Arc::new(open(config)?);
    let reader = BufReader::new(tokio::io::stdin());
    let outcomes = listen(orch, config, reader).await?;
    let failed = outcomes
        .iter()
        .filter(|o| o.terminal == TerminalState::Failed)
        .count();
    info!(handled = outcomes.len(), failed, "event stream closed");
    Ok(ExitCode::SUCCESS)
}

/// Spawn one task per trigger line; wait for all of them at end of input.
/// Each outcome is printed as one JSON line as soon as its run finishes.
async fn listen<R>(orch: Arc<Orchestrator>, config: &PipelineConfig, reader: R) -> Result<Vec<RunOutcome>>
where
    R: AsyncBufRead + Unpin,
{
    let runs_dir = config.runs_dir();
    let mut lines = reader.lines();
    let mut tasks = Vec::new();

    while let Some(line) = lines.next_line().await.context("failed to read trigger stream")? {
        if line.trim().is_empty() {
            continue;
        }
        let trigger = match parse_listen_line(config, &line) {
            Ok(trigger) => trigger,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "skipping malformed trigger");
                continue;
            }
        };
        let orch = orch.clone();
        let runs_dir = runs_dir.clone();
        tasks.push(tokio::spawn(async move {
            let outcome = orch.handle(trigger).await;
            record(&runs_dir, &outcome);
            match serde_json::to_string(&outcome) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!(run_id = %outcome.run_id, error = %e, "failed to serialize outcome"),
            }
            outcome
        }));
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    for joined in futures::future::join_all(tasks).await {
        outcomes.push(joined.context("run task panicked")?);
    }
    Ok(outcomes)
}

fn cmd_fingerprint(config: &PipelineConfig) -> Result<ExitCode> {
    let manifest = pressgate_core::DependencyManifest::load(&config.pipeline.manifests)?;
    println!("{}", manifest.fingerprint());
    for path in manifest.paths() {
        println!("  {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_artifacts_list(config: &PipelineConfig) -> Result<ExitCode> {
    let store = pressgate_core::FsArtifactStore::new(config.artifacts_dir())?;
    let artifacts = store.list().await?;
    if artifacts.is_empty() {
        println!("No artifacts published");
        return Ok(ExitCode::SUCCESS);
    }
    for a in artifacts {
        println!(
            "{} {} {} files={} digest={}",
            a.created_at.to_rfc3339(),
            a.id,
            a.producing_run,
            a.file_count,
            &a.content_digest[..a.content_digest.len().min(12)]
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_artifacts_show(config: &PipelineConfig, id: &str) -> Result<ExitCode> {
    let store = pressgate_core::FsArtifactStore::new(config.artifacts_dir())?;
    let artifact = store
        .retrieve(&ArtifactId(id.to_string()))
        .await
        .with_context(|| format!("artifact {id}"))?;
    println!("{}", serde_json::to_string_pretty(&artifact)?);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_status(config: &PipelineConfig) -> Result<ExitCode> {
    let host = pressgate_core::DirectoryHost::new(&config.deploy.site_dir)?;
    match host.current().await? {
        Some(live) => println!(
            "Live {} (run {}) since {}",
            live.artifact_id,
            live.producing_run,
            live.deployed_at.to_rfc3339()
        ),
        None => println!("Nothing deployed yet"),
    }

    let history = host.history().await?;
    if !history.is_empty() {
        println!("\nHistory:");
    }
    for d in history {
        let action = match d.action {
            DeployAction::Promote => "promote ",
            DeployAction::Rollback => "rollback",
        };
        println!("  {} {} {}", d.deployed_at.to_rfc3339(), action, d.artifact_id);
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_rollback(config: &PipelineConfig) -> Result<ExitCode> {
    let orch = open(config)?;
    let deployment = orch.rollback().await.context("rollback failed")?;
    println!("✓ Rolled back to {} (run {})", deployment.artifact_id, deployment.producing_run);
    Ok(ExitCode::SUCCESS)
}
