//! `rigger apply`: converge the host

use anyhow::{Context as _, Result};
use converge::{CancelToken, ExecuteOptions, RunMode, RunReport, RunState, StateStore};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::thread;
use std::time::Duration;

use super::Session;
use crate::progress::RunProgress;
use crate::{Context, ui};

pub struct ApplyArgs {
    pub only: Vec<String>,
    pub jobs: Option<usize>,
    pub timeout: Option<u64>,
}

pub fn run(ctx: &Context, args: &ApplyArgs) -> Result<RunState> {
    let session = Session::open(ctx)?;
    let plan = session.plan(&args.only, false)?;

    let mut store = StateStore::open_locked(&session.state_dir)
        .with_context(|| format!("Failed to open state in {}", session.state_dir.display()))?;

    let cancel = CancelToken::new();
    install_signal_handlers(cancel.clone())?;

    let opts = ExecuteOptions {
        mode: RunMode::Apply,
        default_timeout: args
            .timeout
            .map_or_else(|| session.manifest.default_timeout(), Duration::from_secs),
        jobs: args.jobs.unwrap_or(session.manifest.settings.jobs).max(1),
        cancel,
    };

    if !ctx.quiet {
        ui::header(&format!("Applying {}", session.manifest_path.display()));
        ui::kv("Steps", &plan.len().to_string());
        if opts.jobs > 1 {
            ui::kv("Jobs", &opts.jobs.to_string());
        }
        println!();
    }

    let mut progress = RunProgress::new(ctx.verbose > 0);
    let report = converge::execute(&plan, &mut store, &opts, &mut progress)?;
    summarize(&report);
    Ok(report.state)
}

/// First SIGINT/SIGTERM cancels the run; a second one exits immediately
fn install_signal_handlers(cancel: CancelToken) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;
    thread::spawn(move || {
        for sig in signals.forever() {
            if cancel.is_cancelled() {
                std::process::exit(if sig == SIGTERM { 143 } else { 130 });
            }
            ui::warn("Interrupted: finishing the current step, press Ctrl-C again to exit now");
            cancel.cancel();
        }
    });
    Ok(())
}

fn summarize(report: &RunReport) {
    println!();
    let counts = format!(
        "{} succeeded, {} unchanged, {} failed",
        report.succeeded(),
        report.skipped(),
        report.failed()
    );
    match &report.state {
        RunState::Completed => ui::success(&format!("Converged: {}", counts)),
        RunState::Partial => ui::warn(&format!("Completed with failures: {}", counts)),
        RunState::Aborted { step } => {
            ui::error(&format!("Aborted at '{}': {}", step, counts));
            if let Some(error) = report.result(step).and_then(|r| r.error.as_ref()) {
                ui::error(&format!("{}: {}", step, error));
            }
        }
        RunState::Cancelled => ui::warn(&format!("Cancelled: {}", counts)),
    }
    if !report.not_started.is_empty() {
        ui::dim(&format!("Not started: {}", report.not_started.join(", ")));
    }
}
