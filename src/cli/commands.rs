//! CLI command definitions for dayforge.
//!
//! `run` starts the supervised orchestrator in the foreground. The other
//! commands work on the state directory directly, so they are safe to use
//! while a `run` process is active.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::adapters::Adapters;
use crate::metrics::init_metrics;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::day::StageKind;
use crate::recovery::{CheckpointStore, FileCheckpointStore, Supervisor, SupervisorExit};
use crate::scheduler::clock::SystemTimeSource;
use crate::storage::{ControlInbox, DayArchive};

/// Default configuration file.
const DEFAULT_CONFIG: &str = "dayforge.yaml";

/// Daily data pipeline orchestrator.
#[derive(Parser)]
#[command(name = "dayforge")]
#[command(about = "Run a crash-safe daily data pipeline on a fixed schedule")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG, global = true, env = "DAYFORGE_CONFIG")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the orchestrator until interrupted.
    Run,

    /// Show the current pipeline day from the checkpoint.
    Status(StatusArgs),

    /// Ask the running orchestrator to run a stage now.
    Trigger(TriggerArgs),

    /// List archived pipeline days.
    History(HistoryArgs),

    /// Validate the configuration file and exit.
    CheckConfig,
}

/// Arguments for `dayforge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Print the full checkpoint as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `dayforge trigger`.
#[derive(Parser, Debug)]
pub struct TriggerArgs {
    /// Stage to run (acquiring, transforming, uploading, report_generating, notifying).
    pub stage: String,
}

/// Arguments for `dayforge history`.
#[derive(Parser, Debug)]
pub struct HistoryArgs {
    /// Show only the most recent N days.
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,

    /// Print archived days as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<ExitCode> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// Returns the process exit code. Errors (bad configuration, unreadable
/// state) exit with 1.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Run => run_orchestrator(&cli.config).await,
        Commands::Status(args) => {
            run_status_command(&cli.config, args).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Trigger(args) => {
            run_trigger_command(&cli.config, args).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::History(args) => {
            run_history_command(&cli.config, args).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::CheckConfig => {
            run_check_config_command(&cli.config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<PipelineConfig> {
    PipelineConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

// ============================================================================
// run
// ============================================================================

async fn run_orchestrator(config_path: &Path) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;
    init_metrics().context("Failed to initialize metrics")?;

    let adapters = Adapters::from_config(&config.adapters)
        .context("Failed to build adapters from configuration")?;
    let store = Arc::new(FileCheckpointStore::new(config.checkpoint_path()));

    info!(
        state_dir = %config.state_dir.display(),
        threshold = config.threshold,
        slots = config.schedule_slots.len(),
        "Starting dayforge"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let supervisor = Supervisor::new(config, adapters, store, Arc::new(SystemTimeSource));
    let exit = supervisor.run(shutdown_rx).await;
    match &exit {
        SupervisorExit::Clean => info!("dayforge stopped"),
        other => warn!(exit = ?other, code = other.exit_code(), "dayforge stopped abnormally"),
    }
    Ok(ExitCode::from(exit.exit_code()))
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, only Ctrl-C will stop dayforge");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// ============================================================================
// status / trigger / history / check-config
// ============================================================================

async fn run_status_command(config_path: &Path, args: StatusArgs) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let store = FileCheckpointStore::new(config.checkpoint_path());
    let Some(checkpoint) = store
        .load()
        .await
        .with_context(|| format!("Failed to read {}", store.path().display()))?
    else {
        println!("No checkpoint in {}", config.state_dir.display());
        return Ok(());
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        return Ok(());
    }

    let day = &checkpoint.day;
    println!("Date:            {}", day.date);
    println!("Stage:           {}", day.stage);
    println!(
        "Units:           {} / {}{}",
        day.units_acquired,
        config.threshold,
        if day.threshold_met { " (threshold met)" } else { "" }
    );
    if let Some(ref artifact) = day.transform_artifact_ref {
        println!("Artifact:        {}", artifact);
    }
    println!("Uploaded:        {}", day.upload_completed);
    if let Some(ref report) = day.report_artifact_ref {
        println!("Report:          {}", report);
    }
    if !day.notifications_sent.is_empty() {
        let sent: Vec<&str> = day.notifications_sent.iter().map(String::as_str).collect();
        println!("Notifications:   {}", sent.join(", "));
    }
    for (stage, count) in &day.retry_counts {
        println!("Retries:         {} x{}", stage, count);
    }
    if let Some(ref err) = day.last_error {
        println!("Last error:      {}", err);
    }
    println!("Crashes:         {}", checkpoint.crash.crash_count);
    println!("Updated:         {}", day.updated_at.to_rfc3339());
    Ok(())
}

async fn run_trigger_command(config_path: &Path, args: TriggerArgs) -> anyhow::Result<()> {
    let stage: StageKind = args.stage.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let config = load_config(config_path)?;
    let inbox = ControlInbox::new(config.control_dir());
    let request = inbox
        .submit(stage)
        .await
        .with_context(|| format!("Failed to queue trigger in {}", inbox.dir().display()))?;

    println!("Queued trigger for {} ({})", stage, request.id);
    println!(
        "The running orchestrator picks it up within {}s; check its log for the outcome.",
        config.control_poll_interval_secs
    );
    Ok(())
}

async fn run_history_command(config_path: &Path, args: HistoryArgs) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let archive = DayArchive::new(config.archive_dir());
    let mut days = archive
        .list()
        .await
        .with_context(|| format!("Failed to read archive {}", archive.dir().display()))?;

    if let Some(limit) = args.limit {
        let skip = days.len().saturating_sub(limit);
        days.drain(..skip);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&days)?);
        return Ok(());
    }

    if days.is_empty() {
        println!("No archived days in {}", archive.dir().display());
        return Ok(());
    }
    for day in &days {
        println!("{}", day.summary());
    }
    Ok(())
}

fn run_check_config_command(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    Adapters::from_config(&config.adapters).context("Adapter configuration is incomplete")?;

    println!("Configuration OK: {}", config_path.display());
    for slot in &config.schedule_slots {
        println!("  slot {} {}", slot.time.format("%H:%M"), slot.tag);
    }
    println!("  threshold {}", config.threshold);
    println!("  daily reset {}", config.daily_reset_time.format("%H:%M"));
    println!("  state dir {}", config.state_dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trigger() {
        let cli = Cli::try_parse_from(["dayforge", "trigger", "uploading"]).unwrap();
        match cli.command {
            Commands::Trigger(args) => assert_eq!(args.stage, "uploading"),
            _ => panic!("expected trigger"),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "dayforge",
            "status",
            "--json",
            "--config",
            "/etc/dayforge.yaml",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Status(StatusArgs { json: true })));
        assert_eq!(cli.config, PathBuf::from("/etc/dayforge.yaml"));
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_check_config_subcommand_name() {
        let cli = Cli::try_parse_from(["dayforge", "check-config"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckConfig));
    }

    #[tokio::test]
    async fn test_trigger_rejects_unknown_stage() {
        let err = run_trigger_command(
            Path::new("missing.yaml"),
            TriggerArgs {
                stage: "deploying".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Unknown stage"));
    }
}
