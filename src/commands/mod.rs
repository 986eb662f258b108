//! Subcommand implementations
//!
//! Every command starts from a [`Session`]: the loaded manifest, the
//! resolved state directory and the host collaborators the steps use.

use anyhow::{Context as _, Result};
use converge::{ExecutionPlan, SharedStep};
use hostkit::{CommandRunner, SystemRunner};
use keystore::SecretStore;
use std::path::PathBuf;
use std::sync::Arc;

use crate::Context;
use crate::manifest::Manifest;
use crate::paths;
use crate::steps::{self, Host};
use crate::template::Templates;

pub mod apply;
pub mod plan;
pub mod reset;
pub mod secrets;
pub mod status;

/// A loaded manifest and the paths it resolves to
pub struct Session {
    pub manifest: Manifest,
    pub manifest_path: PathBuf,
    pub state_dir: PathBuf,
    pub secrets: Arc<SecretStore>,
    pub runner: Arc<dyn CommandRunner>,
}

impl Session {
    pub fn open(ctx: &Context) -> Result<Self> {
        let manifest_path = paths::manifest_path(ctx.manifest.as_deref());
        let manifest = Manifest::load(&manifest_path)?;
        let state_dir = paths::state_dir(ctx.state_dir.as_deref(), manifest.settings.state_dir.as_deref())?;
        let secrets_dir = paths::secrets_dir(&state_dir, manifest.settings.secrets_dir.as_deref());
        log::debug!(
            "Manifest {}, state {}, secrets {}",
            manifest_path.display(),
            state_dir.display(),
            secrets_dir.display()
        );

        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let secrets = Arc::new(SecretStore::new(secrets_dir, Arc::clone(&runner)));
        Ok(Self {
            manifest,
            manifest_path,
            state_dir,
            secrets,
            runner,
        })
    }

    /// Host collaborators for building steps
    ///
    /// `lenient` renders secrets that do not exist yet as placeholders, for
    /// runs that must not generate anything.
    pub fn host(&self, lenient: bool) -> Arc<Host> {
        let templates = Templates::new(self.manifest.vars.clone(), Arc::clone(&self.secrets)).lenient(lenient);
        Arc::new(Host {
            runner: Arc::clone(&self.runner),
            secrets: Arc::clone(&self.secrets),
            templates,
            package_manager: self.manifest.settings.package_manager,
            base_dir: self.manifest.base_dir.clone(),
        })
    }

    pub fn steps(&self, lenient: bool) -> Result<Vec<SharedStep>> {
        steps::build(&self.manifest, &self.host(lenient))
    }

    /// Plan the whole manifest, or only `targets` and their dependencies
    pub fn plan(&self, targets: &[String], lenient: bool) -> Result<ExecutionPlan> {
        let steps = self.steps(lenient)?;
        let plan = if targets.is_empty() {
            converge::plan(steps)
        } else {
            converge::plan_subset(steps, targets)
        };
        plan.with_context(|| format!("Invalid step graph in {}", self.manifest_path.display()))
    }
}

/// Ask before a destructive action unless `yes` was given
pub(crate) fn confirm(prompt: &str, yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("Failed to read confirmation")
}
