//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use transfer_core::DuplicateAction;

/// Move research resources between data-repository providers.
///
/// Every action runs as a background job with a ticket; the CLI waits for
/// the job to finish and prints its final progress record as JSON.
#[derive(Parser, Debug)]
#[command(name = "transfer")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (defaults to $XDG_CONFIG_HOME/transfer/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Provider targets file (JSON); the built-in list is used when absent
    #[arg(long, global = true)]
    pub targets: Option<PathBuf>,

    /// Job database path
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Directory for job staging areas and download archives
    #[arg(long, global = true)]
    pub jobs_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download a resource into a local zip with fixity information
    Download(DownloadArgs),
    /// Upload a local directory or zip to a provider
    Upload(UploadArgs),
    /// Transfer a resource from one provider to another
    Transfer(TransferArgs),
    /// Print the progress record of a ticket
    Status(StatusArgs),
    /// List every resource visible to a token
    List(ListArgs),
}

/// Arguments for `download`.
#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// Source provider name
    #[arg(long)]
    pub source: String,

    /// Resource to download
    #[arg(long)]
    pub resource_id: String,

    /// Source provider token
    #[arg(long, env = "TRANSFER_SOURCE_TOKEN", hide_env_values = true)]
    pub token: String,
}

/// Arguments for `upload`.
#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Destination provider name
    #[arg(long)]
    pub destination: String,

    /// Existing destination container; omit to create new top-level resources
    #[arg(long)]
    pub resource_id: Option<String>,

    /// Directory to upload
    #[arg(long, conflicts_with = "archive", required_unless_present = "archive")]
    pub dir: Option<PathBuf>,

    /// Zip to extract and upload
    #[arg(long)]
    pub archive: Option<PathBuf>,

    /// What to do when a file with the same title exists (ignore, update, rename)
    #[arg(long)]
    pub on_duplicate: Option<DuplicateAction>,

    /// Destination provider token
    #[arg(long, env = "TRANSFER_DESTINATION_TOKEN", hide_env_values = true)]
    pub token: String,
}

/// Arguments for `transfer`.
#[derive(Args, Debug)]
pub struct TransferArgs {
    /// Source provider name
    #[arg(long)]
    pub source: String,

    /// Destination provider name
    #[arg(long)]
    pub destination: String,

    /// Resource to transfer
    #[arg(long)]
    pub resource_id: String,

    /// Existing destination container; omit to create a new top-level resource
    #[arg(long)]
    pub destination_resource_id: Option<String>,

    /// What to do when a file with the same title exists (ignore, update, rename)
    #[arg(long)]
    pub on_duplicate: Option<DuplicateAction>,

    /// Source provider token
    #[arg(long, env = "TRANSFER_SOURCE_TOKEN", hide_env_values = true)]
    pub source_token: String,

    /// Destination provider token
    #[arg(long, env = "TRANSFER_DESTINATION_TOKEN", hide_env_values = true)]
    pub destination_token: String,
}

/// Arguments for `status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Ticket id printed when the job was submitted
    pub ticket_id: String,
}

/// Arguments for `list`.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Provider name
    #[arg(long)]
    pub provider: String,

    /// Provider token
    #[arg(long, env = "TRANSFER_SOURCE_TOKEN", hide_env_values = true)]
    pub token: String,
}
