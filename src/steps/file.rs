//! Managed files rendered from templates
//!
//! The file is written atomically. With `validate`, the new content is
//! checked by an external command (e.g. `nginx -t`) and rolled back if the
//! check fails. With `reload`, the named unit is reloaded, not restarted,
//! after a change.

use anyhow::{Context, Result, bail};
use converge::{ApplyContext, Fingerprint, ProbeOutcome, Step, StepHeader};
use hostkit::fsutil::{mode_of, read_if_exists, write_atomic};
use hostkit::{CommandSpec, Systemd};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Host, host_error, resolve};
use crate::template;

const DEFAULT_MODE: u32 = 0o644;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: String,

    /// Inline template
    #[serde(default)]
    pub content: Option<String>,

    /// Template file, relative to the manifest
    #[serde(default)]
    pub source: Option<String>,

    /// Octal permission bits, e.g. "0640"
    #[serde(default)]
    pub mode: Option<String>,

    /// `user` or `user:group`
    #[serde(default)]
    pub owner: Option<String>,

    /// Unit to reload whenever the file is applied
    #[serde(default)]
    pub reload: Option<String>,

    /// Command that must accept the new file, or it is rolled back
    #[serde(default)]
    pub validate: Option<Vec<String>>,
}

impl FileSpec {
    pub fn validate(&self) -> Result<(), String> {
        match (&self.content, &self.source) {
            (Some(_), Some(_)) => return Err("set either content or source, not both".to_string()),
            (None, None) => return Err("one of content or source is required".to_string()),
            _ => {}
        }
        if let Some(mode) = &self.mode {
            parse_mode(mode)?;
        }
        if self.validate.as_ref().is_some_and(Vec::is_empty) {
            return Err("validate command is empty".to_string());
        }
        Ok(())
    }

    /// Raw template text of `source`, if it is set and readable
    pub fn template_source(&self, base_dir: &Path) -> Option<String> {
        let source = self.source.as_ref()?;
        fs::read_to_string(resolve(base_dir, source)).ok()
    }
}

fn parse_mode(mode: &str) -> Result<u32, String> {
    u32::from_str_radix(mode.trim_start_matches("0o"), 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| format!("invalid mode '{}'", mode))
}

#[derive(Debug)]
pub struct FileStep {
    header: StepHeader,
    spec: FileSpec,
    mode: Option<u32>,
    host: Arc<Host>,
}

impl FileStep {
    pub fn new(header: StepHeader, spec: FileSpec, host: Arc<Host>) -> Result<Self> {
        let mode = spec.mode.as_deref().map(parse_mode).transpose().map_err(anyhow::Error::msg)?;
        let step = Self {
            header,
            spec,
            mode,
            host,
        };
        // A source that does not exist yet may come from an earlier step
        if step.spec.source.is_some()
            && let Ok(template) = step.template()
        {
            step.host.templates.check_vars(&template)?;
        }
        Ok(step)
    }

    fn path(&self) -> Result<PathBuf> {
        Ok(self.host.resolve(&self.host.templates.render(&self.spec.path)?))
    }

    fn template(&self) -> Result<String> {
        if let Some(content) = &self.spec.content {
            return Ok(content.clone());
        }
        let Some(source) = &self.spec.source else {
            bail!("file step has neither content nor source");
        };
        let path = self.host.resolve(source);
        fs::read_to_string(&path).with_context(|| format!("Failed to read template {}", path.display()))
    }

    fn render(&self) -> Result<String> {
        Ok(self.host.templates.render(&self.template()?)?)
    }

    fn owner_matches(&self, path: &Path) -> Result<bool> {
        let Some(owner) = &self.spec.owner else {
            return Ok(true);
        };
        let output = self
            .host
            .runner
            .run_checked(&CommandSpec::new("stat").args(["-c", "%U:%G"]).arg(path.display().to_string()))
            .map_err(host_error)?;
        let actual = output.stdout.trim();
        Ok(if owner.contains(':') {
            actual == owner
        } else {
            actual.split(':').next() == Some(owner.as_str())
        })
    }

    fn restore(&self, path: &Path, previous: Option<&(Vec<u8>, u32)>) -> Result<()> {
        match previous {
            Some((content, mode)) => write_atomic(path, content, Some(*mode)).map_err(host_error),
            None => fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

impl Step for FileStep {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    fn kind(&self) -> &'static str {
        "file"
    }

    fn description(&self) -> String {
        self.header
            .description
            .clone()
            .unwrap_or_else(|| format!("Write {}", self.spec.path))
    }

    fn fingerprint(&self) -> Result<Fingerprint> {
        Ok(Fingerprint::builder(self.kind())
            .json("params", &self.spec)?
            .field("rendered", &self.render()?)
            .finish())
    }

    fn probe(&self) -> Result<ProbeOutcome> {
        let path = self.path()?;
        let Some(current) = read_if_exists(&path).map_err(host_error)? else {
            return Ok(ProbeOutcome::Unsatisfied);
        };
        if current != self.render()?.as_bytes() {
            return Ok(ProbeOutcome::Unsatisfied);
        }
        if let Some(mode) = self.mode
            && mode_of(&path).map_err(host_error)? != Some(mode)
        {
            return Ok(ProbeOutcome::Unsatisfied);
        }
        Ok(ProbeOutcome::from_bool(self.owner_matches(&path)?))
    }

    fn apply(&self, ctx: &ApplyContext) -> Result<()> {
        let path = self.path()?;
        let rendered = self.render()?;

        let previous = match read_if_exists(&path).map_err(host_error)? {
            Some(content) => {
                let mode = mode_of(&path).map_err(host_error)?.unwrap_or(DEFAULT_MODE);
                Some((content, mode))
            }
            None => None,
        };
        let mode = self
            .mode
            .or(previous.as_ref().map(|(_, m)| *m))
            .unwrap_or(DEFAULT_MODE);

        write_atomic(&path, rendered.as_bytes(), Some(mode))
            .map_err(host_error)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        if let Some(owner) = &self.spec.owner {
            self.host
                .runner
                .run_checked(
                    &CommandSpec::new("chown")
                        .args([owner.as_str()])
                        .arg(path.display().to_string())
                        .timeout(Some(ctx.remaining())),
                )
                .map_err(host_error)?;
        }

        if let Some(argv) = &self.spec.validate {
            let argv = self.host.templates.render_all(argv)?;
            let Some(spec) = CommandSpec::from_argv(&argv) else {
                bail!("validate command is empty");
            };
            if let Err(e) = self.host.runner.run_checked(&spec.timeout(Some(ctx.remaining()))) {
                log::warn!("{} rejected by validation, rolling back", path.display());
                self.restore(&path, previous.as_ref())?;
                return Err(host_error(e)).context(format!("{} failed validation", path.display()));
            }
        }

        // Apply only runs while the step is not done, so a reload that failed
        // earlier is repeated even though the content is already in place
        if let Some(unit) = &self.spec.reload {
            Systemd::new(self.host.runner.as_ref())
                .with_timeout(Some(ctx.remaining()))
                .reload(unit)
                .map_err(host_error)
                .with_context(|| format!("Failed to reload {}", unit))?;
        }
        Ok(())
    }

    fn diff(&self) -> Result<Option<String>> {
        let path = self.path()?;
        let rendered = self.render()?;
        let current = read_if_exists(&path).map_err(host_error)?;
        let current = current.as_deref().map(String::from_utf8_lossy).unwrap_or_default();
        if current == rendered {
            return Ok(None);
        }

        if !template::secret_refs(&self.template()?).is_empty() {
            return Ok(Some(format!(
                "{} changes ({} lines; contains secrets, diff hidden)",
                path.display(),
                rendered.lines().count()
            )));
        }

        let name = path.display().to_string();
        Ok(Some(
            TextDiff::from_lines(current.as_ref(), rendered.as_str())
                .unified_diff()
                .header(&name, &name)
                .to_string(),
        ))
    }
}
