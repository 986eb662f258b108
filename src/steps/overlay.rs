//! Regex substitutions on an artifact the host did not generate
//!
//! Used to patch files shipped by packages or archives. The step counts as
//! applied once none of its patterns match any more, so a replacement must
//! not match its own pattern.

use anyhow::{Context, Result, bail};
use converge::{ApplyContext, Fingerprint, ProbeOutcome, Step, StepHeader};
use hostkit::fsutil::{mode_of, read_if_exists, write_atomic};
use regex::Regex;
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::path::PathBuf;
use std::sync::Arc;

use super::{Host, host_error};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlaySpec {
    pub path: String,
    pub replacements: Vec<Replacement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    pub pattern: String,
    /// May use `$1`-style capture references
    pub replacement: String,
}

impl OverlaySpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.replacements.is_empty() {
            return Err("no replacements".to_string());
        }
        for r in &self.replacements {
            let re = Regex::new(&r.pattern).map_err(|e| format!("invalid pattern '{}': {}", r.pattern, e))?;
            if re.is_match(&r.replacement) {
                return Err(format!(
                    "replacement '{}' matches its own pattern; the overlay could never be detected as applied",
                    r.replacement
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct OverlayStep {
    header: StepHeader,
    spec: OverlaySpec,
    patterns: Vec<(Regex, String)>,
    host: Arc<Host>,
}

impl OverlayStep {
    pub fn new(header: StepHeader, spec: OverlaySpec, host: Arc<Host>) -> Result<Self> {
        let patterns = spec
            .replacements
            .iter()
            .map(|r| {
                Regex::new(&r.pattern)
                    .map(|re| (re, r.replacement.clone()))
                    .with_context(|| format!("Invalid pattern '{}'", r.pattern))
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            header,
            spec,
            patterns,
            host,
        })
    }

    fn path(&self) -> Result<PathBuf> {
        Ok(self.host.resolve(&self.host.templates.render(&self.spec.path)?))
    }

    fn read(&self) -> Result<Option<String>> {
        let path = self.path()?;
        let Some(bytes) = read_if_exists(&path).map_err(host_error)? else {
            return Ok(None);
        };
        let text = String::from_utf8(bytes).with_context(|| format!("{} is not UTF-8", path.display()))?;
        Ok(Some(text))
    }

    fn substitute(&self, text: &str) -> String {
        self.patterns.iter().fold(text.to_string(), |acc, (re, replacement)| {
            re.replace_all(&acc, replacement.as_str()).into_owned()
        })
    }

    fn pending(&self, text: &str) -> bool {
        self.patterns.iter().any(|(re, _)| re.is_match(text))
    }
}

impl Step for OverlayStep {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    fn kind(&self) -> &'static str {
        "overlay"
    }

    fn description(&self) -> String {
        self.header
            .description
            .clone()
            .unwrap_or_else(|| format!("Patch {}", self.spec.path))
    }

    // Parameters only: applying changes the target's content
    fn fingerprint(&self) -> Result<Fingerprint> {
        Ok(Fingerprint::builder(self.kind())
            .json("params", &self.spec)?
            .field("path", &self.path()?.display().to_string())
            .finish())
    }

    fn probe(&self) -> Result<ProbeOutcome> {
        match self.read()? {
            Some(text) => Ok(ProbeOutcome::from_bool(!self.pending(&text))),
            None => Ok(ProbeOutcome::Unsatisfied),
        }
    }

    fn apply(&self, _ctx: &ApplyContext) -> Result<()> {
        let path = self.path()?;
        let Some(text) = self.read()? else {
            bail!("{} does not exist; nothing to patch", path.display());
        };
        if !self.pending(&text) {
            log::debug!("{} already patched", path.display());
            return Ok(());
        }

        let patched = self.substitute(&text);
        let mode = mode_of(&path).map_err(host_error)?;
        write_atomic(&path, patched.as_bytes(), mode)
            .map_err(host_error)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn diff(&self) -> Result<Option<String>> {
        let Some(text) = self.read()? else {
            return Ok(Some(format!("{} does not exist yet", self.path()?.display())));
        };
        if !self.pending(&text) {
            return Ok(None);
        }
        let name = self.path()?.display().to_string();
        let patched = self.substitute(&text);
        Ok(Some(
            TextDiff::from_lines(text.as_str(), patched.as_str())
                .unified_diff()
                .header(&name, &name)
                .to_string(),
        ))
    }
}
