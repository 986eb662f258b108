//! Error types for host operations.
//!
//! Errors are categorized so callers can tell the operator what to do
//! about a failure.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Categories of host errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network-related errors (DNS, mirrors, HTTP)
    Network,
    /// Package, unit or file not found
    NotFound,
    /// Permission denied (usually: not running as root)
    Permission,
    /// A command or request exceeded its deadline
    Timeout,
    /// A required program is not installed
    MissingProgram,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Classify a failed command by its standard error.
    pub fn from_stderr(stderr: &str) -> Self {
        let stderr_lower = stderr.to_lowercase();

        if stderr_lower.contains("could not resolve")
            || stderr_lower.contains("temporary failure resolving")
            || stderr_lower.contains("connection refused")
            || stderr_lower.contains("connection timed out")
            || stderr_lower.contains("failed to fetch")
            || stderr_lower.contains("failed to download metadata")
            || stderr_lower.contains("curl error")
        {
            return Self::Network;
        }

        if stderr_lower.contains("permission denied")
            || stderr_lower.contains("operation not permitted")
            || stderr_lower.contains("are you root")
            || stderr_lower.contains("must be run as root")
        {
            return Self::Permission;
        }

        Self::Other
    }

    /// Actionable advice for the operator, if there is any.
    pub fn advice(&self) -> Option<&'static str> {
        match self {
            Self::Network => Some("check network access and package mirrors, then run again"),
            Self::NotFound => Some("verify the package, unit or path name"),
            Self::Permission => Some("run as root"),
            Self::Timeout => Some("raise the step timeout or check what the command waits on"),
            Self::MissingProgram => Some("install the program or add it to a packages step"),
            Self::Other => None,
        }
    }
}

/// Errors that can occur while inspecting or changing the host.
#[derive(Debug, Error)]
pub enum Error {
    /// Network-related error (connection, DNS, HTTP status)
    #[error("network error: {message}")]
    Network {
        /// Detailed error message
        message: String,
        /// HTTP status, when the server answered
        status: Option<u16>,
    },

    /// Package, unit or file not found
    #[error("not found: {name}")]
    NotFound {
        /// What could not be found
        name: String,
    },

    /// Program not found in PATH
    #[error("'{program}' not found in PATH")]
    ProgramNotFound {
        /// Name of the missing program
        program: String,
    },

    /// Command ran and exited unsuccessfully
    #[error("'{command}' failed{}: {stderr}", .code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
    CommandFailed {
        /// Command line, without stdin
        command: String,
        /// Exit code; `None` if killed by a signal
        code: Option<i32>,
        /// Standard error output (trimmed)
        stderr: String,
    },

    /// Command exceeded its deadline and was killed
    #[error("'{command}' timed out after {}s", .after.as_secs())]
    Timeout {
        /// Command line
        command: String,
        /// The deadline that was exceeded
        after: Duration,
    },

    /// Archive could not be unpacked
    #[error("archive error for {}: {message}", .path.display())]
    Archive {
        /// Destination of the extraction
        path: PathBuf,
        /// What went wrong
        message: String,
    },

    /// Operation not supported on this host
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error category, used to advise the operator.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Network { .. } => ErrorCategory::Network,
            Error::NotFound { .. } => ErrorCategory::NotFound,
            Error::Timeout { .. } => ErrorCategory::Timeout,
            Error::ProgramNotFound { .. } => ErrorCategory::MissingProgram,
            Error::CommandFailed { stderr, .. } => ErrorCategory::from_stderr(stderr),
            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => ErrorCategory::Permission,
            _ => ErrorCategory::Other,
        }
    }

    /// Exit code of the failed command, if any
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::CommandFailed { code, .. } => *code,
            _ => None,
        }
    }

    /// Create an error from the output of a failed command.
    ///
    /// The exit code is always kept; [`Error::category`] looks at stderr.
    pub fn from_output(command: &str, code: Option<i32>, stderr: &str) -> Self {
        Error::CommandFailed {
            command: command.to_string(),
            code,
            stderr: stderr.trim().to_string(),
        }
    }
}

/// Result type for host operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_output_network_keeps_exit_code() {
        let err = Error::from_output(
            "apt-get install -y redis",
            Some(100),
            "E: Failed to fetch http://deb.debian.org/... Temporary failure resolving 'deb.debian.org'",
        );
        assert_eq!(err.category(), ErrorCategory::Network);
        assert_eq!(err.exit_code(), Some(100));
        assert!(err.to_string().contains("exit code 100"));
    }

    #[test]
    fn test_from_output_permission_keeps_exit_code() {
        let err = Error::from_output(
            "apt-get install -y redis",
            Some(100),
            "E: Could not open lock file /var/lib/dpkg/lock-frontend - open (13: Permission denied)\nE: are you root?",
        );
        assert_eq!(err.category(), ErrorCategory::Permission);
        assert_eq!(err.category().advice(), Some("run as root"));
        assert_eq!(err.exit_code(), Some(100));
    }

    #[test]
    fn test_from_output_keeps_exit_code() {
        let err = Error::from_output("psql", Some(3), "ERROR:  syntax error at or near \"SELEC\"");
        assert_eq!(err.category(), ErrorCategory::Other);
        assert_eq!(err.category().advice(), None);
        assert_eq!(err.exit_code(), Some(3));
        assert!(err.to_string().contains("exit code 3"));
    }

    #[test]
    fn test_killed_command_has_no_code() {
        let err = Error::from_output("sleep 100", None, "");
        assert_eq!(err.exit_code(), None);
        assert!(!err.to_string().contains("exit code"));
    }
}
