//! CLI entry point for the transfer tool.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};
use transfer_core::job::{JobStore, ProgressRecord, UploadPayload};
use transfer_core::provider::{
    CapabilityRegistry, DEFAULT_API_BASE, GithubProvider, ProviderCapability, default_targets,
    load_targets,
};
use transfer_core::{Database, EngineSettings, JobRunner, JobStatus, TransferOptions};

mod app_config;
mod cli;

use app_config::FileConfig;
use cli::{Cli, Command};

const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HTTP_READ_TIMEOUT_SECS: u64 = 120;
const DATABASE_FILE_NAME: &str = "jobs.db";
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Exit code when a job finished but some files failed fixity.
const EXIT_PARTIAL: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();
    init_tracing(&cli);
    info!("Transfer starting");

    let file_config = app_config::load_config(cli.config.as_deref())?;
    let settings = engine_settings(&cli, &file_config)?;
    tokio::fs::create_dir_all(&settings.jobs_dir)
        .await
        .with_context(|| format!("Failed to create jobs directory '{}'", settings.jobs_dir.display()))?;

    let db_path = cli
        .db
        .clone()
        .or_else(|| file_config.database_path.clone())
        .unwrap_or_else(|| settings.jobs_dir.join(DATABASE_FILE_NAME));
    let db = Database::new(&db_path)
        .await
        .with_context(|| format!("Failed to open job database '{}'", db_path.display()))?;
    debug!(path = %db_path.display(), "job database ready");

    let registry = Arc::new(build_registry(&cli, &file_config)?);
    let runner = JobRunner::start(registry, JobStore::new(db), settings)?;
    let quiet = cli.quiet;
    let outcome = run_command(&runner, cli.command, quiet).await;
    runner.shutdown().await;
    outcome
}

fn init_tracing(cli: &Cli) {
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Records go to stdout; logs stay on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn engine_settings(cli: &Cli, file_config: &FileConfig) -> Result<EngineSettings> {
    let mut settings = EngineSettings::default();
    file_config.apply_to(&mut settings);
    if let Some(jobs_dir) = &cli.jobs_dir {
        settings.jobs_dir.clone_from(jobs_dir);
    }
    settings.validate()?;
    Ok(settings)
}

fn build_registry(cli: &Cli, file_config: &FileConfig) -> Result<CapabilityRegistry> {
    let targets = match cli.targets.as_ref().or(file_config.targets_file.as_ref()) {
        Some(path) => load_targets(path)?,
        None => default_targets()?,
    };
    let github = GithubProvider::with_options(
        file_config.github_api_url.as_deref().unwrap_or(DEFAULT_API_BASE),
        file_config
            .http_connect_timeout_secs
            .unwrap_or(DEFAULT_HTTP_CONNECT_TIMEOUT_SECS),
        file_config
            .http_read_timeout_secs
            .unwrap_or(DEFAULT_HTTP_READ_TIMEOUT_SECS),
    )?;
    let capabilities: Vec<Arc<dyn ProviderCapability>> = vec![Arc::new(github)];
    Ok(CapabilityRegistry::build(targets, capabilities)?)
}

async fn run_command(runner: &JobRunner, command: Command, quiet: bool) -> Result<ExitCode> {
    let ticket_id = match command {
        Command::Download(args) => {
            runner
                .download(&args.source, &args.token, &args.resource_id)
                .await?
        }
        Command::Upload(args) => {
            let payload = match args.archive {
                Some(archive) => UploadPayload::Archive(archive),
                None => UploadPayload::Directory(args.dir.unwrap_or_default()),
            };
            runner
                .upload(
                    &args.destination,
                    &args.token,
                    args.resource_id.as_deref(),
                    payload,
                    args.on_duplicate,
                )
                .await?
        }
        Command::Transfer(args) => {
            let options = TransferOptions {
                destination_resource_id: args.destination_resource_id,
                duplicate_action: args.on_duplicate,
            };
            runner
                .transfer(
                    &args.source,
                    &args.destination,
                    &args.source_token,
                    &args.destination_token,
                    &args.resource_id,
                    options,
                )
                .await?
        }
        Command::Status(args) => {
            let record = runner
                .status(&args.ticket_id)
                .await?
                .with_context(|| format!("Unknown ticket: {}", args.ticket_id))?;
            print_record(&record)?;
            return Ok(exit_code(&record));
        }
        Command::List(args) => {
            let nodes = runner.list_resources(&args.provider, &args.token).await?;
            println!("{}", serde_json::to_string_pretty(&nodes)?);
            return Ok(ExitCode::SUCCESS);
        }
    };

    info!(ticket_id = %ticket_id, "Job submitted");
    let record = wait_for_terminal(runner, &ticket_id, quiet).await?;
    print_record(&record)?;
    Ok(exit_code(&record))
}

async fn wait_for_terminal(runner: &JobRunner, ticket_id: &str, quiet: bool) -> Result<ProgressRecord> {
    let spinner = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new_spinner()
    };
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));

    loop {
        let record = runner
            .status(ticket_id)
            .await?
            .with_context(|| format!("Ticket {ticket_id} is no longer in the job store"))?;
        if record.status.is_terminal() {
            spinner.finish_and_clear();
            return Ok(record);
        }
        spinner.set_message(progress_line(&record));
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Summarizes the most advanced phase that has started.
fn progress_line(record: &ProgressRecord) -> String {
    let active = record
        .phases
        .iter()
        .rev()
        .find(|(_, progress)| progress.total_files.is_some() || progress.files_finished > 0);
    match active {
        Some((phase, progress)) => {
            let total = progress
                .total_files
                .map_or_else(|| "?".to_string(), |total| total.to_string());
            format!(
                "[{}/{}] {:?}: {}",
                progress.files_finished, total, phase, record.message
            )
        }
        None => record.message.clone(),
    }
}

fn print_record(record: &ProgressRecord) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

fn exit_code(record: &ProgressRecord) -> ExitCode {
    match record.status {
        JobStatus::Finished => {
            let fixity_failures = record
                .result
                .as_ref()
                .is_some_and(|outcome| !outcome.failed_fixity.is_empty());
            if fixity_failures {
                ExitCode::from(EXIT_PARTIAL)
            } else {
                ExitCode::SUCCESS
            }
        }
        JobStatus::Failed => ExitCode::FAILURE,
        // A non-terminal record means the job is still running elsewhere.
        JobStatus::InProgress => ExitCode::SUCCESS,
    }
}
