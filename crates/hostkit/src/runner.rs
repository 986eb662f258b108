//! Command execution abstraction.
//!
//! The [`CommandRunner`] trait is the single seam between provisioning logic
//! and the host's processes, allowing:
//! - Real execution via [`SystemRunner`]
//! - Scripted responses in tests via [`ScriptedRunner`]

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

use crate::error::{Error, Result};

/// A command to run: argv plus optional stdin, environment and deadline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Bytes written to the child's stdin. Never logged.
    pub stdin: Option<Vec<u8>>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Build from an argv list; `None` if it is empty
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).args(args))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Kill the command if it runs longer than `timeout`
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Command line for logs and error messages
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs commands on the host.
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output.
    ///
    /// A non-zero exit is not an error here; only failing to start the
    /// command or exceeding its timeout is.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run a command and turn a non-zero exit into an error.
    fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(spec)?;
        if !output.success() {
            return Err(Error::from_output(&spec.display(), output.code, &output.stderr));
        }
        Ok(output)
    }
}

/// Runner that spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let command_line = spec.display();
        log::debug!("Executing: {}", command_line);

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ProgramNotFound {
                program: spec.program.clone(),
            },
            _ => Error::Io(e),
        })?;

        // Feed stdin and drain pipes on their own threads so a chatty child
        // never blocks on a full pipe while we wait on it.
        let writer = match (child.stdin.take(), spec.stdin.clone()) {
            (Some(mut pipe), Some(input)) => Some(thread::spawn(move || {
                let _ = pipe.write_all(&input);
            })),
            _ => None,
        };
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match spec.timeout {
            Some(timeout) => match child.wait_timeout(timeout)? {
                Some(status) => status,
                None => {
                    log::warn!("'{}' timed out after {:?}, killing it", command_line, timeout);
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::Timeout {
                        command: command_line,
                        after: timeout,
                    });
                }
            },
            None => child.wait()?,
        };

        if let Some(writer) = writer {
            let _ = writer.join();
        }
        let output = CommandOutput {
            code: status.code(),
            stdout: collect(stdout),
            stderr: collect(stderr),
        };

        for line in output.stderr.lines() {
            log::trace!("[{}] {}", spec.program, line);
        }
        Ok(output)
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Runner that records commands and answers from a script.
///
/// Responses are matched by command-line prefix, most recently added first.
/// Unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    responses: Mutex<Vec<(String, CommandOutput)>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `output`
    pub fn on(self, prefix: &str, output: CommandOutput) -> Self {
        self.respond(prefix, output);
        self
    }

    /// Add or replace a response after construction
    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.retain(|(p, _)| p != prefix);
            responses.push((prefix.to_string(), output));
        }
    }

    /// Command lines run so far
    pub fn calls(&self) -> Vec<String> {
        self.specs().iter().map(CommandSpec::display).collect()
    }

    /// Full specs of the commands run so far
    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.display();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(spec.clone());
        }
        let responses = self
            .responses
            .lock()
            .map_err(|_| Error::Unsupported("scripted runner poisoned".to_string()))?;
        Ok(responses
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput::ok("")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_display() {
        let spec = CommandSpec::new("systemctl").args(["enable", "--now", "redis"]);
        assert_eq!(spec.display(), "systemctl enable --now redis");
        assert!(CommandSpec::from_argv(&[]).is_none());
    }

    #[test]
    fn test_system_runner_captures_output() {
        let output = SystemRunner
            .run(&CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 4"]))
            .unwrap();
        assert_eq!(output.code, Some(4));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn test_system_runner_stdin() {
        let output = SystemRunner
            .run(&CommandSpec::new("cat").stdin("secret input"))
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "secret input");
    }

    #[test]
    fn test_system_runner_timeout_kills() {
        let started = std::time::Instant::now();
        let err = SystemRunner
            .run(&CommandSpec::new("sleep").arg("5").timeout(Some(Duration::from_millis(100))))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_missing_program() {
        let err = SystemRunner
            .run(&CommandSpec::new("definitely-not-a-real-program-rigger"))
            .unwrap_err();
        assert!(matches!(err, Error::ProgramNotFound { .. }));
    }

    #[test]
    fn test_run_checked_reports_exit_code() {
        let runner = ScriptedRunner::new().on("false", CommandOutput::failed(1, "nope"));
        let err = runner.run_checked(&CommandSpec::new("false")).unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
    }

    #[test]
    fn test_scripted_runner_latest_response_wins() {
        let runner = ScriptedRunner::new().on("systemctl is-active", CommandOutput::failed(3, ""));
        assert!(!runner.run(&CommandSpec::new("systemctl").args(["is-active", "x"])).unwrap().success());

        runner.respond("systemctl is-active", CommandOutput::ok("active"));
        assert!(runner.run(&CommandSpec::new("systemctl").args(["is-active", "x"])).unwrap().success());
        assert_eq!(runner.calls().len(), 2);
    }
}
