//! Progress display for runs
//!
//! A bar tracks the plan while a status line is printed for every settled
//! step. indicatif hides the bar when stderr is not a terminal.

use colored::Colorize;
use converge::{ProgressCallback, RunMode, RunReport, StepError, StepResult, StepStatus};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::ui;

/// Spinner for a single long operation
pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

pub fn finish_success(pb: &ProgressBar, msg: &str) {
    pb.finish_and_clear();
    ui::success(msg);
}

pub fn finish_error(pb: &ProgressBar, msg: &str) {
    pb.finish_and_clear();
    ui::error(msg);
}

/// Terminal progress for [`converge::execute`]
pub struct RunProgress {
    bar: ProgressBar,
    mode: RunMode,
    /// Print lines for skipped steps too
    verbose: bool,
}

impl RunProgress {
    pub fn new(verbose: bool) -> Self {
        Self {
            bar: ProgressBar::hidden(),
            mode: RunMode::Apply,
            verbose,
        }
    }

    fn line(&self, result: &StepResult) -> String {
        let mut line = format!(
            "  {} {} {}",
            ui::status_marker(result.status),
            result.name,
            ui::format_duration(result.duration).dimmed()
        );
        if result.attempts > 1 {
            line.push_str(&format!(" {}", format!("({} attempts)", result.attempts).dimmed()));
        }
        if let Some(error) = &result.error {
            line.push_str(&format!("\n      {}", error.to_string().red()));
        }
        line
    }
}

impl ProgressCallback for RunProgress {
    fn on_run_start(&mut self, total: usize, mode: RunMode) {
        self.mode = mode;
        if mode == RunMode::DryRun {
            return;
        }
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        self.bar = bar;
    }

    fn on_step_start(&mut self, name: &str, _description: &str) {
        self.bar.set_message(name.to_string());
    }

    fn on_retry(&mut self, name: &str, attempt: u32, max_attempts: u32, error: &StepError, delay: Duration) {
        let msg = format!(
            "{} failed (attempt {}/{}): {}; retrying in {}",
            name,
            attempt,
            max_attempts,
            error,
            ui::format_duration(delay)
        );
        self.bar.suspend(|| ui::warn(&msg));
    }

    fn on_step_complete(&mut self, result: &StepResult) {
        self.bar.inc(1);
        if result.status == StepStatus::Skipped && !self.verbose {
            return;
        }
        let line = self.line(result);
        self.bar.suspend(|| println!("{}", line));
    }

    fn on_run_complete(&mut self, report: &RunReport) {
        self.bar.finish_and_clear();
        if self.mode == RunMode::Apply && report.results.is_empty() {
            ui::dim("No steps were evaluated");
        }
    }
}
