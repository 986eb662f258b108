//! Download a `.tar.gz` and unpack it

use anyhow::{Context, Result};
use converge::{ApplyContext, Fingerprint, ProbeOutcome, Step, StepHeader};
use hostkit::{archive, http};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use super::{Host, host_error};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSpec {
    pub url: String,
    pub dest: String,

    #[serde(default)]
    pub strip_components: usize,

    /// Path that exists once unpacked; defaults to `dest`
    #[serde(default)]
    pub creates: Option<String>,
}

impl ArchiveSpec {
    pub fn validate(&self) -> Result<(), String> {
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(format!("unsupported url '{}'", self.url));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ArchiveStep {
    header: StepHeader,
    spec: ArchiveSpec,
    host: Arc<Host>,
}

impl ArchiveStep {
    pub fn new(header: StepHeader, spec: ArchiveSpec, host: Arc<Host>) -> Self {
        Self { header, spec, host }
    }

    fn dest(&self) -> Result<PathBuf> {
        Ok(self.host.resolve(&self.host.templates.render(&self.spec.dest)?))
    }

    fn marker(&self) -> Result<PathBuf> {
        match &self.spec.creates {
            Some(creates) => Ok(self.host.resolve(&self.host.templates.render(creates)?)),
            None => self.dest(),
        }
    }
}

impl Step for ArchiveStep {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    fn kind(&self) -> &'static str {
        "archive"
    }

    fn description(&self) -> String {
        self.header
            .description
            .clone()
            .unwrap_or_else(|| format!("Unpack {} into {}", self.spec.url, self.spec.dest))
    }

    fn fingerprint(&self) -> Result<Fingerprint> {
        Ok(Fingerprint::builder(self.kind())
            .json("params", &self.spec)?
            .field("url", &self.host.templates.render(&self.spec.url)?)
            .finish())
    }

    fn probe(&self) -> Result<ProbeOutcome> {
        Ok(ProbeOutcome::from_bool(self.marker()?.exists()))
    }

    fn apply(&self, ctx: &ApplyContext) -> Result<()> {
        let url = self.host.templates.render(&self.spec.url)?;
        let dest = self.dest()?;

        let data = http::download(&url, ctx.remaining())
            .map_err(host_error)
            .with_context(|| format!("Failed to download {}", url))?;
        let count = archive::extract_tar_gz(&data, &dest, self.spec.strip_components)
            .map_err(host_error)
            .with_context(|| format!("Failed to unpack {}", url))?;
        log::info!("Unpacked {} entries into {}", count, dest.display());
        Ok(())
    }
}
