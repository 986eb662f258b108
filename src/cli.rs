use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rigger")]
#[command(author = "Rigger Contributors")]
#[command(version)]
#[command(about = "Idempotent, dependency-ordered host provisioning", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Manifest to load [default: /etc/rigger/manifest.toml]
    #[arg(long, global = true)]
    pub manifest: Option<PathBuf>,

    /// Directory holding the state record and lock
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate the manifest and show what apply would do
    Plan {
        /// Limit to these steps and their dependencies
        #[arg(long, value_name = "STEP")]
        only: Vec<String>,

        /// Show content diffs for steps that would run
        #[arg(long)]
        diff: bool,
    },

    /// Converge the host to the manifest
    Apply {
        /// Limit to these steps and their dependencies
        #[arg(long, value_name = "STEP")]
        only: Vec<String>,

        /// Run up to N independent steps at once
        #[arg(short, long, value_name = "N")]
        jobs: Option<usize>,

        /// Default per-step timeout in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Show the recorded state of every step
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage generated secrets
    #[command(subcommand)]
    Secrets(SecretsCommand),

    /// Forget recorded completion so steps re-run
    Reset {
        /// Step to forget; all steps when omitted
        step: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum SecretsCommand {
    /// List declared and stored secrets (values are never shown)
    List,

    /// Regenerate a secret
    Rotate {
        /// Secret name
        name: String,

        /// Allow replacing an existing secret
        #[arg(long)]
        force: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}
