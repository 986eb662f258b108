//! Error types for planning, state handling and apply failures.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::{ErrorKind, StepError};

/// Errors raised by the engine itself.
///
/// Per-step failures during a run are not returned as errors; they are
/// captured in the step's [`StepResult`](crate::StepResult) and governed by
/// its failure policy.
#[derive(Debug, Error)]
pub enum Error {
    /// A step names a dependency that was never declared
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        /// Step declaring the dependency
        step: String,
        /// Name that did not resolve
        dependency: String,
    },

    /// The dependency relation contains a cycle
    #[error("cyclic dependency: {}", format_cycle(.members))]
    CyclicDependency {
        /// Steps on the cycle, each depending on the next
        members: Vec<String>,
    },

    /// Two steps share a name
    #[error("duplicate step name '{name}'")]
    DuplicateStep { name: String },

    /// A target given on the command line is not a declared step
    #[error("unknown step '{name}'")]
    UnknownStep { name: String },

    /// Inspecting the host failed
    #[error("probe for '{step}' failed: {message}")]
    Probe { step: String, message: String },

    /// The side-effecting action failed
    #[error("apply of '{step}' failed: {message}")]
    Apply {
        step: String,
        message: String,
        exit_code: Option<i32>,
    },

    /// A step exceeded its allotted duration
    #[error("step '{step}' timed out after {after:?}")]
    Timeout { step: String, after: Duration },

    /// Another run holds the state lock
    #[error("another run holds the state lock at {}", .path.display())]
    LockContention { path: PathBuf },

    /// The state record could not be read or written
    #[error("state record {}: {message}", .path.display())]
    State { path: PathBuf, message: String },

    /// The operator interrupted the run while the step waited to retry
    #[error("cancelled before retrying '{step}'")]
    Cancelled { step: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is detected while planning, before any side effect
    pub fn is_planning(&self) -> bool {
        matches!(
            self,
            Self::UnknownDependency { .. }
                | Self::CyclicDependency { .. }
                | Self::DuplicateStep { .. }
                | Self::UnknownStep { .. }
        )
    }
}

fn format_cycle(members: &[String]) -> String {
    let mut parts: Vec<&str> = members.iter().map(String::as_str).collect();
    if let Some(first) = members.first() {
        parts.push(first);
    }
    parts.join(" -> ")
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Step-level errors land in the step's result instead of stopping the run
impl From<Error> for StepError {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Apply { .. } => ErrorKind::Apply,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            _ => ErrorKind::Input,
        };
        match err {
            Error::Apply {
                message, exit_code, ..
            } => StepError {
                kind,
                message,
                exit_code,
            },
            other => StepError::new(kind, other.to_string()),
        }
    }
}

/// Failure of an external tool invoked by an apply function.
///
/// Apply functions return `anyhow::Result`; when the chain contains an
/// `ApplyError`, its exit code is carried into the step's result.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApplyError {
    pub message: String,
    pub exit_code: Option<i32>,
}

impl ApplyError {
    pub fn new(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }

    /// Find the first `ApplyError` in an error chain
    pub fn find(err: &anyhow::Error) -> Option<&ApplyError> {
        err.chain().find_map(|e| e.downcast_ref::<ApplyError>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display() {
        let err = Error::CyclicDependency {
            members: vec!["a".into(), "b".into(), "c".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency: a -> b -> c -> a");
        assert!(err.is_planning());
    }

    #[test]
    fn test_find_apply_error_in_chain() {
        let err = anyhow::Error::new(ApplyError::new("exit 3", Some(3))).context("migrate");
        let found = ApplyError::find(&err).unwrap();
        assert_eq!(found.exit_code, Some(3));
    }

    #[test]
    fn test_step_error_from_engine_error() {
        let apply = StepError::from(Error::Apply {
            step: "migrate".into(),
            message: "psql exited".into(),
            exit_code: Some(2),
        });
        assert_eq!(apply.kind, ErrorKind::Apply);
        assert_eq!(apply.message, "psql exited");
        assert_eq!(apply.exit_code, Some(2));

        let timeout = StepError::from(Error::Timeout {
            step: "slow".into(),
            after: Duration::from_secs(3),
        });
        assert_eq!(timeout.kind, ErrorKind::Timeout);
        assert_eq!(timeout.message, "step 'slow' timed out after 3s");

        let cancelled = StepError::from(Error::Cancelled { step: "db".into() });
        assert_eq!(cancelled.kind, ErrorKind::Cancelled);
    }
}
