//! systemd service management through `systemctl`.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::runner::{CommandRunner, CommandSpec};

/// Service manager bound to a command runner
pub struct Systemd<'a> {
    runner: &'a dyn CommandRunner,
    timeout: Option<Duration>,
}

impl<'a> Systemd<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            timeout: None,
        }
    }

    /// Bound every `systemctl` invocation by `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn systemctl<const N: usize>(&self, args: [&str; N]) -> CommandSpec {
        CommandSpec::new("systemctl").args(args).timeout(self.timeout)
    }

    pub fn is_active(&self, unit: &str) -> Result<bool> {
        Ok(self.runner.run(&self.systemctl(["is-active", "--quiet", unit]))?.success())
    }

    pub fn is_enabled(&self, unit: &str) -> Result<bool> {
        Ok(self.runner.run(&self.systemctl(["is-enabled", "--quiet", unit]))?.success())
    }

    /// Whether systemd knows the unit (installed by a package or a unit file)
    pub fn unit_exists(&self, unit: &str) -> Result<bool> {
        let output = self
            .runner
            .run(&self.systemctl(["list-unit-files", "--no-legend", "--plain", unit]))?;
        Ok(output.success() && output.stdout.lines().any(|l| !l.trim().is_empty()))
    }

    /// Enable and start; a unit that is already running is left as is
    pub fn enable_now(&self, unit: &str) -> Result<()> {
        self.checked(["enable", "--now", unit])
    }

    pub fn start(&self, unit: &str) -> Result<()> {
        self.checked(["start", unit])
    }

    pub fn restart(&self, unit: &str) -> Result<()> {
        self.checked(["restart", unit])
    }

    /// Reload configuration without restarting
    ///
    /// Falls back to a restart when the unit is not running yet, since
    /// `reload` on a stopped unit fails.
    pub fn reload(&self, unit: &str) -> Result<()> {
        if self.is_active(unit)? {
            self.checked(["reload", unit])
        } else {
            log::debug!("{} is not running; starting it instead of reloading", unit);
            self.checked(["start", unit])
        }
    }

    pub fn daemon_reload(&self) -> Result<()> {
        self.checked(["daemon-reload"])
    }

    fn checked<const N: usize>(&self, args: [&str; N]) -> Result<()> {
        let spec = self.systemctl(args);
        let output = self.runner.run(&spec)?;
        if output.success() {
            return Ok(());
        }
        if output.stderr.contains("not found") || output.stderr.contains("does not exist") {
            return Err(Error::NotFound {
                name: args.last().copied().unwrap_or_default().to_string(),
            });
        }
        Err(Error::from_output(&spec.display(), output.code, &output.stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, ScriptedRunner};

    #[test]
    fn test_is_active() {
        let runner = ScriptedRunner::new()
            .on("systemctl is-active --quiet redis", CommandOutput::ok(""))
            .on("systemctl is-active --quiet registry", CommandOutput::failed(3, ""));
        let systemd = Systemd::new(&runner);
        assert!(systemd.is_active("redis").unwrap());
        assert!(!systemd.is_active("registry").unwrap());
    }

    #[test]
    fn test_unit_exists() {
        let runner = ScriptedRunner::new()
            .on(
                "systemctl list-unit-files --no-legend --plain nginx.service",
                CommandOutput::ok("nginx.service enabled enabled\n"),
            )
            .on("systemctl list-unit-files --no-legend --plain ghost.service", CommandOutput::ok("\n"));
        let systemd = Systemd::new(&runner);
        assert!(systemd.unit_exists("nginx.service").unwrap());
        assert!(!systemd.unit_exists("ghost.service").unwrap());
    }

    #[test]
    fn test_reload_running_unit() {
        let runner = ScriptedRunner::new().on("systemctl is-active", CommandOutput::ok(""));
        Systemd::new(&runner).reload("nginx").unwrap();
        assert_eq!(
            runner.calls(),
            vec!["systemctl is-active --quiet nginx", "systemctl reload nginx"]
        );
    }

    #[test]
    fn test_reload_stopped_unit_starts_it() {
        let runner = ScriptedRunner::new().on("systemctl is-active", CommandOutput::failed(3, ""));
        Systemd::new(&runner).reload("nginx").unwrap();
        assert_eq!(runner.calls()[1], "systemctl start nginx");
    }

    #[test]
    fn test_missing_unit() {
        let runner = ScriptedRunner::new().on(
            "systemctl enable",
            CommandOutput::failed(1, "Failed to enable unit: Unit file ghost.service does not exist."),
        );
        let err = Systemd::new(&runner).enable_now("ghost.service").unwrap_err();
        assert!(matches!(err, Error::NotFound { name } if name == "ghost.service"));
    }

    #[test]
    fn test_timeout_applied() {
        let runner = ScriptedRunner::new();
        Systemd::new(&runner)
            .with_timeout(Some(Duration::from_secs(30)))
            .daemon_reload()
            .unwrap();
        assert_eq!(runner.specs()[0].timeout, Some(Duration::from_secs(30)));
    }
}
