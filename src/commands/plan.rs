//! `rigger plan`: validate the manifest and show what `apply` would do

use anyhow::Result;
use colored::Colorize;
use converge::{ExecuteOptions, NoProgress, StateStore, StepStatus};

use super::Session;
use crate::{Context, ui};

pub struct PlanArgs {
    pub only: Vec<String>,
    pub diff: bool,
}

pub fn run(ctx: &Context, args: &PlanArgs) -> Result<()> {
    let session = Session::open(ctx)?;
    let plan = session.plan(&args.only, true)?;

    if !ctx.quiet {
        ui::header(&format!("Plan for {}", session.manifest_path.display()));
    }

    let mut store = StateStore::open_read_only(&session.state_dir)?;
    let opts = ExecuteOptions {
        default_timeout: session.manifest.default_timeout(),
        ..ExecuteOptions::dry_run()
    };
    let report = converge::execute(&plan, &mut store, &opts, &mut NoProgress)?;

    for result in &report.results {
        let Some(step) = plan.get(&result.name) else {
            continue;
        };
        match result.status {
            StepStatus::Skipped if !ctx.quiet => {
                println!("  {} {}", ui::status_marker(result.status), result.name.dimmed());
            }
            StepStatus::WouldRun => {
                println!(
                    "  {} {} {}",
                    ui::status_marker(result.status),
                    result.name.bold(),
                    format!("({}) {}", step.kind(), step.description()).dimmed()
                );
                if args.diff {
                    print_diff(step.as_ref());
                }
            }
            StepStatus::Failed => {
                let message = result.error.as_ref().map(ToString::to_string).unwrap_or_default();
                println!("  {} {} {}", ui::status_marker(result.status), result.name, message.red());
            }
            _ => {}
        }
    }

    if !ctx.quiet {
        println!();
        ui::kv("Steps", &report.total().to_string());
        ui::kv("Would run", &report.would_run().to_string());
        ui::kv("Up to date", &report.skipped().to_string());
    }
    if report.would_run() == 0 && report.failed() == 0 {
        ui::success("Nothing to do");
    }
    Ok(())
}

fn print_diff(step: &dyn converge::Step) {
    match step.diff() {
        Ok(Some(diff)) => {
            for line in diff.lines() {
                let line = if line.starts_with('+') && !line.starts_with("+++") {
                    line.green()
                } else if line.starts_with('-') && !line.starts_with("---") {
                    line.red()
                } else {
                    line.dimmed()
                };
                println!("      {}", line);
            }
        }
        Ok(None) => {}
        Err(e) => ui::dim(&format!("    (no preview: {:#})", e)),
    }
}
