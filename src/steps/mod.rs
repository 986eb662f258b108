//! Concrete step kinds
//!
//! Every manifest `kind` maps to a type implementing [`converge::Step`]:
//! - Inputs are fingerprinted from the step's manifest parameters plus any
//!   rendered content
//! - Probes only read (files, `systemctl is-active`, `dpkg-query`, SQL
//!   queries, HTTP status)
//! - Side effects happen in `apply`, through the host's [`CommandRunner`]

use anyhow::{Context, Result};
use converge::{ApplyError, SharedStep, StepHeader};
use hostkit::{CommandRunner, PackageManager};
use keystore::SecretStore;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::manifest::{Manifest, StepKind};
use crate::template::Templates;

pub mod alternatives;
pub mod archive;
pub mod command;
pub mod file;
pub mod http_check;
pub mod overlay;
pub mod packages;
pub mod secret;
pub mod service;
pub mod sql;

/// Everything a step needs to reach the host
pub struct Host {
    pub runner: Arc<dyn CommandRunner>,
    pub secrets: Arc<SecretStore>,
    pub templates: Templates,
    /// `None` until a manifest needs one and none is configured
    pub package_manager: Option<PackageManager>,
    /// Directory relative paths in the manifest resolve against
    pub base_dir: PathBuf,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("secrets", &self.secrets.dir())
            .field("package_manager", &self.package_manager)
            .field("base_dir", &self.base_dir)
            .finish_non_exhaustive()
    }
}

impl Host {
    /// Resolve a manifest path against the manifest's directory
    pub fn resolve(&self, path: &str) -> PathBuf {
        resolve(&self.base_dir, path)
    }
}

pub(crate) fn resolve(base_dir: &Path, path: &str) -> PathBuf {
    let expanded = crate::paths::expand(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    }
}

/// Build the engine steps declared by a manifest
pub fn build(manifest: &Manifest, host: &Arc<Host>) -> Result<Vec<SharedStep>> {
    manifest
        .steps
        .iter()
        .map(|decl| {
            build_kind(manifest.header(decl), &decl.kind, host)
                .with_context(|| format!("Failed to set up step '{}'", decl.name))
        })
        .collect()
}

pub(crate) fn build_kind(header: StepHeader, kind: &StepKind, host: &Arc<Host>) -> Result<SharedStep> {
    let host = Arc::clone(host);
    let step: SharedStep = match kind {
        StepKind::Packages(spec) => Arc::new(packages::PackagesStep::new(header, spec.clone(), host)?),
        StepKind::Service(spec) => Arc::new(service::ServiceStep::new(header, spec.clone(), host)),
        StepKind::File(spec) => Arc::new(file::FileStep::new(header, spec.clone(), host)?),
        StepKind::Overlay(spec) => Arc::new(overlay::OverlayStep::new(header, spec.clone(), host)?),
        StepKind::Sql(spec) => Arc::new(sql::SqlStep::new(header, spec.clone(), host)),
        StepKind::Command(spec) => Arc::new(command::CommandStep::new(header, spec.clone(), host)),
        StepKind::Secret(spec) => Arc::new(secret::SecretStep::new(header, spec.clone(), host)),
        StepKind::Archive(spec) => Arc::new(archive::ArchiveStep::new(header, spec.clone(), host)),
        StepKind::HttpCheck(spec) => Arc::new(http_check::HttpCheckStep::new(header, spec.clone(), host)),
        StepKind::Alternatives(spec) => {
            Arc::new(alternatives::AlternativesStep::new(header, spec.clone(), &host)?)
        }
    };
    Ok(step)
}

/// Wrap a host failure so the executor sees the tool's exit code
pub(crate) fn host_error(err: hostkit::Error) -> anyhow::Error {
    let code = err.exit_code();
    let message = match err.category().advice() {
        Some(advice) => format!("{} (hint: {})", err, advice),
        None => err.to_string(),
    };
    anyhow::Error::new(ApplyError::new(message, code))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use converge::ApplyContext;
    use hostkit::ScriptedRunner;
    use std::collections::BTreeMap;
    use std::time::Duration;

    /// Host backed by a scripted runner and a temp directory
    pub fn host(runner: &Arc<ScriptedRunner>, dir: &Path) -> Arc<Host> {
        host_with_vars(runner, dir, BTreeMap::new())
    }

    pub fn host_with_vars(
        runner: &Arc<ScriptedRunner>,
        dir: &Path,
        vars: BTreeMap<String, String>,
    ) -> Arc<Host> {
        let runner: Arc<dyn CommandRunner> = runner.clone();
        let secrets = Arc::new(SecretStore::new(dir.join("secrets"), Arc::clone(&runner)));
        Arc::new(Host {
            runner,
            templates: Templates::new(vars, Arc::clone(&secrets)),
            secrets,
            package_manager: Some(PackageManager::Apt),
            base_dir: dir.to_path_buf(),
        })
    }

    pub fn ctx(step: &str) -> ApplyContext {
        ApplyContext::new(step, Duration::from_secs(30))
    }
}
