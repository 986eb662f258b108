//! Apply context, cancellation and progress callbacks
//!
//! These keep the engine free of any particular UI or signal handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::types::{RunMode, RunReport, StepError, StepResult};

/// Shared cancellation flag
///
/// Cloning yields a handle to the same flag. The flag can be handed to
/// `signal_hook::flag::register` via [`CancelToken::flag`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying flag, for registering with a signal handler
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Context passed to a step's apply function
#[derive(Debug, Clone)]
pub struct ApplyContext {
    /// Name of the step being applied
    pub step: String,
    /// 1-indexed attempt number
    pub attempt: u32,
    /// Point in time after which the step counts as timed out
    pub deadline: Instant,
    pub cancel: CancelToken,
}

impl ApplyContext {
    pub fn new(step: &str, timeout: Duration) -> Self {
        Self {
            step: step.to_string(),
            attempt: 1,
            deadline: Instant::now() + timeout,
            cancel: CancelToken::new(),
        }
    }

    /// Time left before the deadline
    ///
    /// External commands should be bounded by this so a timed-out step does
    /// not leave its child process running.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Progress callback for runs
///
/// Implement this trait to receive progress updates during execution.
/// When steps of a wave run in parallel, `on_step_start` is called for every
/// step of the wave before any of them completes.
pub trait ProgressCallback: Send {
    /// Called once before the first step
    fn on_run_start(&mut self, total: usize, mode: RunMode);

    /// Called when a step is about to be evaluated
    fn on_step_start(&mut self, name: &str, description: &str);

    /// Called before sleeping between two apply attempts
    fn on_retry(&mut self, name: &str, attempt: u32, max_attempts: u32, error: &StepError, delay: Duration);

    /// Called when a step settles
    fn on_step_complete(&mut self, result: &StepResult);

    /// Called once the run reached a terminal state
    fn on_run_complete(&mut self, report: &RunReport);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_run_start(&mut self, _total: usize, _mode: RunMode) {}
    fn on_step_start(&mut self, _name: &str, _description: &str) {}
    fn on_retry(&mut self, _: &str, _: u32, _: u32, _: &StepError, _: Duration) {}
    fn on_step_complete(&mut self, _result: &StepResult) {}
    fn on_run_complete(&mut self, _report: &RunReport) {}
}
