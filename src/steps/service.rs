//! systemd units: enabled, running, and restarted when their config changes

use anyhow::{Context, Result};
use converge::{ApplyContext, Fingerprint, ProbeOutcome, Step, StepHeader};
use hostkit::Systemd;
use hostkit::fsutil::read_if_exists;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{Host, host_error};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub unit: String,

    /// Enable at boot as well as start
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Run `systemctl daemon-reload` first, for freshly written unit files
    #[serde(default)]
    pub daemon_reload: bool,

    /// Files whose content is part of this step's inputs; a change restarts
    /// the running unit
    #[serde(default)]
    pub restart_on: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ServiceSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.unit.trim().is_empty() {
            return Err("unit is empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ServiceStep {
    header: StepHeader,
    spec: ServiceSpec,
    host: Arc<Host>,
}

impl ServiceStep {
    pub fn new(header: StepHeader, spec: ServiceSpec, host: Arc<Host>) -> Self {
        Self { header, spec, host }
    }

    fn systemd(&self, ctx: Option<&ApplyContext>) -> Systemd<'_> {
        Systemd::new(self.host.runner.as_ref()).with_timeout(ctx.map(ApplyContext::remaining))
    }

    fn unit(&self) -> Result<String> {
        Ok(self.host.templates.render(&self.spec.unit)?)
    }
}

impl Step for ServiceStep {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    fn kind(&self) -> &'static str {
        "service"
    }

    fn description(&self) -> String {
        self.header
            .description
            .clone()
            .unwrap_or_else(|| format!("Run {}", self.spec.unit))
    }

    fn fingerprint(&self) -> Result<Fingerprint> {
        let mut builder = Fingerprint::builder(self.kind()).json("params", &self.spec)?;
        for file in &self.spec.restart_on {
            let path = self.host.resolve(&self.host.templates.render(file)?);
            let content = read_if_exists(&path)
                .map_err(host_error)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            builder = match content {
                Some(bytes) => builder.bytes(file, &bytes),
                None => builder.field(file, "<absent>"),
            };
        }
        Ok(builder.finish())
    }

    fn probe(&self) -> Result<ProbeOutcome> {
        let unit = self.unit()?;
        let systemd = self.systemd(None);
        let active = systemd.is_active(&unit).map_err(host_error)?;
        let enabled = !self.spec.enable || systemd.is_enabled(&unit).map_err(host_error)?;
        Ok(ProbeOutcome::from_bool(active && enabled))
    }

    fn apply(&self, ctx: &ApplyContext) -> Result<()> {
        let unit = self.unit()?;
        let systemd = self.systemd(Some(ctx));

        if self.spec.daemon_reload {
            systemd.daemon_reload().map_err(host_error)?;
        }

        let was_active = systemd.is_active(&unit).map_err(host_error)?;
        if self.spec.enable {
            systemd
                .enable_now(&unit)
                .map_err(host_error)
                .with_context(|| format!("Failed to enable {}", unit))?;
        } else if !was_active {
            systemd
                .start(&unit)
                .map_err(host_error)
                .with_context(|| format!("Failed to start {}", unit))?;
        }

        // Already running on old inputs
        if was_active && !self.spec.restart_on.is_empty() {
            log::info!("Restarting {} to pick up changed configuration", unit);
            systemd
                .restart(&unit)
                .map_err(host_error)
                .with_context(|| format!("Failed to restart {}", unit))?;
        }
        Ok(())
    }
}
