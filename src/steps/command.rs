//! Arbitrary commands, guarded by `creates` or `unless`

use anyhow::{Context, Result, bail};
use converge::{ApplyContext, Fingerprint, ProbeOutcome, Step, StepHeader};
use hostkit::CommandSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::{Host, host_error};

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSpec {
    pub argv: Vec<String>,

    /// Path that exists once the command has run
    #[serde(default)]
    pub creates: Option<String>,

    /// Command whose success means the work is already done
    #[serde(default)]
    pub unless: Option<Vec<String>>,

    /// Run as this user through `runuser`
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub cwd: Option<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub stdin: Option<String>,
}

impl ExecSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.argv.is_empty() {
            return Err("argv is empty".to_string());
        }
        if self.unless.as_ref().is_some_and(Vec::is_empty) {
            return Err("unless is empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct CommandStep {
    header: StepHeader,
    spec: ExecSpec,
    host: Arc<Host>,
}

impl CommandStep {
    pub fn new(header: StepHeader, spec: ExecSpec, host: Arc<Host>) -> Self {
        Self { header, spec, host }
    }

    fn command(&self, argv: &[String]) -> Result<CommandSpec> {
        let templates = &self.host.templates;
        let argv = templates.render_all(argv)?;
        let mut spec = match &self.spec.user {
            Some(user) => CommandSpec::new("runuser").args(["-u", user.as_str(), "--"]).args(argv),
            None => match CommandSpec::from_argv(&argv) {
                Some(spec) => spec,
                None => bail!("empty command"),
            },
        };
        for (key, value) in &self.spec.env {
            spec = spec.env(key.as_str(), templates.render(value)?);
        }
        if let Some(cwd) = &self.spec.cwd {
            spec = spec.current_dir(self.host.resolve(&templates.render(cwd)?));
        }
        Ok(spec)
    }
}

impl Step for CommandStep {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    fn kind(&self) -> &'static str {
        "command"
    }

    fn description(&self) -> String {
        self.header
            .description
            .clone()
            .unwrap_or_else(|| format!("Run {}", self.spec.argv.join(" ")))
    }

    fn fingerprint(&self) -> Result<Fingerprint> {
        let templates = &self.host.templates;
        let mut builder = Fingerprint::builder(self.kind())
            .json("params", &self.spec)?
            .json("argv", &templates.render_all(&self.spec.argv)?)?;
        if let Some(stdin) = &self.spec.stdin {
            builder = builder.field("stdin", &templates.render(stdin)?);
        }
        Ok(builder.finish())
    }

    /// Without `creates` or `unless` the command runs once per fingerprint
    fn probe(&self) -> Result<ProbeOutcome> {
        if let Some(creates) = &self.spec.creates {
            let path = self.host.resolve(&self.host.templates.render(creates)?);
            return Ok(ProbeOutcome::from_bool(path.exists()));
        }
        if let Some(unless) = &self.spec.unless {
            let spec = self.command(unless)?.timeout(Some(PROBE_TIMEOUT));
            let output = self.host.runner.run(&spec).map_err(host_error)?;
            return Ok(ProbeOutcome::from_bool(output.success()));
        }
        Ok(ProbeOutcome::Satisfied)
    }

    fn apply(&self, ctx: &ApplyContext) -> Result<()> {
        let guarded = self.spec.creates.is_some() || self.spec.unless.is_some();
        if guarded && matches!(self.probe(), Ok(ProbeOutcome::Satisfied)) {
            log::info!("{}: guard already satisfied, not running", self.header.name);
            return Ok(());
        }

        let mut spec = self.command(&self.spec.argv)?.timeout(Some(ctx.remaining()));
        if let Some(stdin) = &self.spec.stdin {
            spec = spec.stdin(self.host.templates.render(stdin)?.into_bytes());
        }
        let output = self
            .host
            .runner
            .run_checked(&spec)
            .map_err(host_error)
            .with_context(|| format!("Command of '{}' failed", self.header.name))?;
        if !output.stdout.trim().is_empty() {
            log::debug!("{}: {}", self.header.name, output.stdout.trim());
        }
        Ok(())
    }
}
