mod cli;
mod commands;
mod manifest;
mod paths;
mod progress;
mod steps;
mod template;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command, SecretsCommand};
use converge::RunState;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub manifest: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

const EXIT_SUCCESS: u8 = 0;
/// Run aborted, or the command failed
const EXIT_FAILURE: u8 = 1;
/// Manifest or step graph invalid; nothing was changed
const EXIT_INVALID: u8 = 2;
/// Every step settled but some tolerated failures occurred
const EXIT_PARTIAL: u8 = 3;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        manifest: cli.manifest,
        state_dir: cli.state_dir,
    };

    match run(&ctx, cli.command) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            ui::error(&format!("{:#}", e));
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn run(ctx: &Context, command: Command) -> Result<u8> {
    match command {
        Command::Plan { only, diff } => {
            commands::plan::run(ctx, &commands::plan::PlanArgs { only, diff })?;
        }
        Command::Apply { only, jobs, timeout } => {
            let args = commands::apply::ApplyArgs { only, jobs, timeout };
            return Ok(match commands::apply::run(ctx, &args)? {
                RunState::Completed => EXIT_SUCCESS,
                RunState::Partial => EXIT_PARTIAL,
                RunState::Aborted { .. } | RunState::Cancelled => EXIT_FAILURE,
            });
        }
        Command::Status { json } => commands::status::run(ctx, json)?,
        Command::Secrets(cmd) => match cmd {
            SecretsCommand::List => commands::secrets::list(ctx)?,
            SecretsCommand::Rotate { name, force, yes } => {
                commands::secrets::rotate(ctx, &name, force, yes)?;
            }
        },
        Command::Reset { step, yes } => commands::reset::run(ctx, step.as_deref(), yes)?,
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "rigger", &mut io::stdout());
        }
    }
    Ok(EXIT_SUCCESS)
}

/// Errors found before any step ran exit with a distinct code
fn exit_code_for(err: &anyhow::Error) -> u8 {
    let invalid = err.chain().any(|cause| {
        cause.downcast_ref::<manifest::ManifestError>().is_some()
            || cause
                .downcast_ref::<converge::Error>()
                .is_some_and(converge::Error::is_planning)
    });
    if invalid { EXIT_INVALID } else { EXIT_FAILURE }
}
