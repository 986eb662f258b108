//! OS packages through apt or dnf

use anyhow::{Context, Result};
use converge::{ApplyContext, Fingerprint, ProbeOutcome, Step, StepHeader};
use hostkit::PackageManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{Host, host_error};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagesSpec {
    pub packages: Vec<String>,
    /// Refresh the package index before installing
    #[serde(default)]
    pub update: bool,
}

impl PackagesSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.packages.is_empty() {
            return Err("no packages listed".to_string());
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct PackagesStep {
    header: StepHeader,
    spec: PackagesSpec,
    manager: PackageManager,
    host: Arc<Host>,
}

impl PackagesStep {
    pub fn new(header: StepHeader, spec: PackagesSpec, host: Arc<Host>) -> Result<Self> {
        let manager = match host.package_manager {
            Some(manager) => manager,
            None => PackageManager::detect().map_err(host_error)?,
        };
        Ok(Self {
            header,
            spec,
            manager,
            host,
        })
    }

    fn packages(&self) -> Result<Vec<String>> {
        Ok(self.host.templates.render_all(&self.spec.packages)?)
    }

    fn missing(&self) -> Result<Vec<String>> {
        self.manager
            .missing(self.host.runner.as_ref(), &self.packages()?)
            .map_err(host_error)
    }
}

impl Step for PackagesStep {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    fn kind(&self) -> &'static str {
        "packages"
    }

    fn fingerprint(&self) -> Result<Fingerprint> {
        Ok(Fingerprint::builder(self.kind())
            .field("manager", &self.manager.to_string())
            .json("packages", &self.packages()?)?
            .finish())
    }

    fn probe(&self) -> Result<ProbeOutcome> {
        Ok(ProbeOutcome::from_bool(self.missing()?.is_empty()))
    }

    fn apply(&self, ctx: &ApplyContext) -> Result<()> {
        let runner = self.host.runner.as_ref();
        if self.spec.update {
            self.manager
                .update_index(runner, Some(ctx.remaining()))
                .map_err(host_error)
                .context("Failed to refresh the package index")?;
        }

        let missing = self.missing()?;
        if missing.is_empty() {
            log::debug!("All packages of '{}' are installed", self.header.name);
            return Ok(());
        }
        self.manager
            .install(runner, &missing, Some(ctx.remaining()))
            .map_err(host_error)
            .with_context(|| format!("Failed to install {}", missing.join(", ")))
    }

    fn diff(&self) -> Result<Option<String>> {
        let missing = self.missing()?;
        if missing.is_empty() {
            return Ok(None);
        }
        Ok(Some(format!("install {}", missing.join(" "))))
    }
}
