//! Core types for step execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::context::CancelToken;

/// What the executor does when a step's apply fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Halt the whole run immediately
    #[default]
    Abort,
    /// Record the failure and keep going; hard dependents are not run
    SkipOnError,
    /// Attempt up to `max` times with exponential backoff, then abort
    RetryThenAbort { max: u32, backoff: Duration },
}

impl FailurePolicy {
    /// Total number of apply attempts this policy allows
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::RetryThenAbort { max, .. } => (*max).max(1),
            _ => 1,
        }
    }

    /// Whether a final failure under this policy stops the run
    pub fn aborts(&self) -> bool {
        !matches!(self, Self::SkipOnError)
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => write!(f, "abort"),
            Self::SkipOnError => write!(f, "skip-on-error"),
            Self::RetryThenAbort { max, backoff } => {
                write!(f, "retry(max={}, backoff={:?})", max, backoff)
            }
        }
    }
}

/// Whether a run mutates the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunMode {
    #[default]
    Apply,
    /// Evaluate decisions only; apply functions are never invoked
    DryRun,
}

/// Result of a read-only probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeOutcome {
    /// The step's postcondition already holds
    Satisfied,
    /// The postcondition does not hold
    Unsatisfied,
    /// The probe could not tell; treated as unsatisfied
    Unknown,
}

impl ProbeOutcome {
    pub fn from_bool(satisfied: bool) -> Self {
        if satisfied {
            Self::Satisfied
        } else {
            Self::Unsatisfied
        }
    }

    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied)
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Satisfied => write!(f, "satisfied"),
            Self::Unsatisfied => write!(f, "unsatisfied"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Final status of one step in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Recorded as done and confirmed by the probe
    Skipped,
    Succeeded,
    Failed,
    /// Dry run: the step would be applied
    WouldRun,
}

impl StepStatus {
    /// Whether dependents may rely on this step's postcondition
    pub fn is_settled_ok(&self) -> bool {
        matches!(self, Self::Skipped | Self::Succeeded)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped => write!(f, "skipped"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::WouldRun => write!(f, "would run"),
        }
    }
}

/// Category of a step failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The step's inputs could not be read or fingerprinted
    Input,
    /// The side-effecting action failed
    Apply,
    /// Apply returned but the probe says the postcondition does not hold
    Verification,
    /// The step exceeded its allotted duration
    Timeout,
    /// A hard dependency failed, so the step was never started
    DependencyFailed,
    /// The run was cancelled during the step's retry backoff
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Input => "input",
            Self::Apply => "apply",
            Self::Verification => "verification",
            Self::Timeout => "timeout",
            Self::DependencyFailed => "dependency-failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Failure detail attached to a step result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
    /// Exit code of the external tool, when one failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit code {})", code)?;
        }
        Ok(())
    }
}

/// Outcome of executing one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// Number of apply invocations (0 when skipped)
    pub attempts: u32,
}

impl StepResult {
    pub(crate) fn new(name: &str, status: StepStatus, started_at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            status,
            error: None,
            started_at,
            duration: Duration::ZERO,
            attempts: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, StepStatus::Failed)
    }
}

/// Terminal state of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Every step ended skipped or succeeded (or would run, in a dry run)
    Completed,
    /// Every step settled but some tolerated failures occurred
    Partial,
    /// A step failed under an aborting policy
    Aborted { step: String },
    /// The operator interrupted the run
    Cancelled,
}

impl RunState {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. } | Self::Cancelled)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Partial => write!(f, "completed with failures"),
            Self::Aborted { step } => write!(f, "aborted at '{}'", step),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Everything a run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub state: RunState,
    /// Results in execution order
    pub results: Vec<StepResult>,
    /// Steps that were never started because the run stopped
    pub not_started: Vec<String>,
}

impl RunReport {
    pub fn count(&self, status: StepStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn skipped(&self) -> usize {
        self.count(StepStatus::Skipped)
    }

    pub fn succeeded(&self) -> usize {
        self.count(StepStatus::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(StepStatus::Failed)
    }

    pub fn would_run(&self) -> usize {
        self.count(StepStatus::WouldRun)
    }

    /// Find the result for a named step
    pub fn result(&self, name: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.name == name)
    }

    /// Total number of steps in the plan
    pub fn total(&self) -> usize {
        self.results.len() + self.not_started.len()
    }
}

/// Options for a run
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub mode: RunMode,
    /// Timeout for steps that don't declare their own
    pub default_timeout: Duration,
    /// Number of steps of the same wave that may run at once
    pub jobs: usize,
    /// Checked before every step and during retry backoff
    pub cancel: CancelToken,
}

impl ExecuteOptions {
    pub fn dry_run() -> Self {
        Self {
            mode: RunMode::DryRun,
            ..Default::default()
        }
    }
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::Apply,
            default_timeout: Duration::from_secs(60 * 60),
            jobs: 1,
            cancel: CancelToken::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_attempts() {
        assert_eq!(FailurePolicy::Abort.max_attempts(), 1);
        assert_eq!(FailurePolicy::SkipOnError.max_attempts(), 1);
        let retry = FailurePolicy::RetryThenAbort {
            max: 3,
            backoff: Duration::from_secs(1),
        };
        assert_eq!(retry.max_attempts(), 3);
        assert!(retry.aborts());
        assert!(!FailurePolicy::SkipOnError.aborts());
    }

    #[test]
    fn test_retry_zero_still_attempts_once() {
        let retry = FailurePolicy::RetryThenAbort {
            max: 0,
            backoff: Duration::ZERO,
        };
        assert_eq!(retry.max_attempts(), 1);
    }

    #[test]
    fn test_step_error_display() {
        let mut err = StepError::new(ErrorKind::Apply, "psql failed");
        assert_eq!(err.to_string(), "apply: psql failed");
        err.exit_code = Some(2);
        assert_eq!(err.to_string(), "apply: psql failed (exit code 2)");
    }
}
