//! Several strategies for the same outcome, tried in declared order
//!
//! Candidates are full step kinds without their own identity. The step is
//! satisfied when any candidate's probe is; applying stops at the first
//! candidate that succeeds and whose probe does not contradict it.

use anyhow::{Result, anyhow};
use converge::{ApplyContext, Fingerprint, ProbeOutcome, SharedStep, Step, StepHeader};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{Host, build_kind};
use crate::manifest::StepKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativesSpec {
    pub candidates: Vec<StepKind>,
}

impl AlternativesSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.candidates.is_empty() {
            return Err("no candidates".to_string());
        }
        for (i, candidate) in self.candidates.iter().enumerate() {
            if matches!(candidate, StepKind::Secret(_)) {
                return Err(format!("candidate {} is a secret; secrets cannot be alternatives", i));
            }
            candidate
                .validate()
                .map_err(|e| format!("candidate {} ({}): {}", i, candidate.name(), e))?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct AlternativesStep {
    header: StepHeader,
    candidates: Vec<SharedStep>,
}

impl AlternativesStep {
    pub fn new(header: StepHeader, spec: AlternativesSpec, host: &Arc<Host>) -> Result<Self> {
        let candidates = spec
            .candidates
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                let mut candidate = StepHeader::new(&format!("{}[{}]", header.name, i));
                candidate.description = header.description.clone();
                build_kind(candidate, kind, host)
            })
            .collect::<Result<_>>()?;
        Ok(Self { header, candidates })
    }
}

impl Step for AlternativesStep {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    fn kind(&self) -> &'static str {
        "alternatives"
    }

    fn description(&self) -> String {
        self.header.description.clone().unwrap_or_else(|| {
            let kinds: Vec<&str> = self.candidates.iter().map(|c| c.kind()).collect();
            format!("One of: {}", kinds.join(", "))
        })
    }

    fn fingerprint(&self) -> Result<Fingerprint> {
        let mut builder = Fingerprint::builder(self.kind());
        for candidate in &self.candidates {
            builder = builder.field(candidate.name(), candidate.fingerprint()?.as_str());
        }
        Ok(builder.finish())
    }

    fn probe(&self) -> Result<ProbeOutcome> {
        let mut outcome = ProbeOutcome::Unsatisfied;
        for candidate in &self.candidates {
            match candidate.probe() {
                Ok(ProbeOutcome::Satisfied) => return Ok(ProbeOutcome::Satisfied),
                Ok(ProbeOutcome::Unsatisfied) => {}
                Ok(ProbeOutcome::Unknown) => outcome = ProbeOutcome::Unknown,
                Err(e) => {
                    log::debug!("Probe of {} failed: {:#}", candidate.name(), e);
                    outcome = ProbeOutcome::Unknown;
                }
            }
        }
        Ok(outcome)
    }

    fn apply(&self, ctx: &ApplyContext) -> Result<()> {
        let mut failures = Vec::new();
        for candidate in &self.candidates {
            if ctx.cancel.is_cancelled() || ctx.remaining().is_zero() {
                break;
            }
            log::info!("Trying {} ({})", candidate.name(), candidate.kind());
            match candidate.apply(ctx) {
                Ok(()) if candidate.probe().ok() != Some(ProbeOutcome::Unsatisfied) => {
                    log::info!("{} succeeded", candidate.name());
                    return Ok(());
                }
                Ok(()) => failures.push(format!("{}: applied but not in effect", candidate.name())),
                Err(e) => {
                    log::warn!("{} failed: {:#}", candidate.name(), e);
                    failures.push(format!("{}: {:#}", candidate.name(), e));
                }
            }
        }
        Err(anyhow!("No candidate succeeded ({})", failures.join("; ")))
    }

    fn diff(&self) -> Result<Option<String>> {
        match self.candidates.first() {
            Some(first) => first.diff(),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::command::ExecSpec;
    use crate::steps::testing;
    use hostkit::{CommandOutput, ScriptedRunner};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn exec(argv: &[&str], unless: &[&str]) -> StepKind {
        StepKind::Command(ExecSpec {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            creates: None,
            unless: Some(unless.iter().map(|s| s.to_string()).collect()),
            user: None,
            cwd: None,
            env: BTreeMap::new(),
            stdin: None,
        })
    }

    fn spec() -> AlternativesSpec {
        AlternativesSpec {
            candidates: vec![
                exec(&["gem", "install", "bundler"], &["gem", "list", "-i", "bundler"]),
                exec(&["apt-get", "install", "-y", "ruby-bundler"], &["which", "bundle"]),
            ],
        }
    }

    #[test]
    fn test_satisfied_if_any_candidate_is() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("gem list", CommandOutput::failed(1, ""))
                .on("which bundle", CommandOutput::ok("/usr/bin/bundle")),
        );
        let host = testing::host(&runner, dir.path());
        let step = AlternativesStep::new(StepHeader::new("bundler"), spec(), &host).unwrap();
        assert_eq!(step.probe().unwrap(), ProbeOutcome::Satisfied);
    }

    #[test]
    fn test_falls_back_to_next_candidate() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("gem list", CommandOutput::failed(1, ""))
                .on("which bundle", CommandOutput::failed(1, ""))
                .on("gem install", CommandOutput::failed(2, "network unreachable")),
        );
        let host = testing::host(&runner, dir.path());
        let step = AlternativesStep::new(StepHeader::new("bundler"), spec(), &host).unwrap();
        assert_eq!(step.probe().unwrap(), ProbeOutcome::Unsatisfied);

        // Bundler appeared through another route; the second candidate's guard holds
        runner.respond("which bundle", CommandOutput::ok("/usr/bin/bundle"));
        step.apply(&testing::ctx("bundler")).unwrap();
        let calls = runner.calls();
        assert!(calls.iter().any(|c| c.starts_with("gem install")));
        assert!(!calls.iter().any(|c| c.starts_with("apt-get install")));
    }

    #[test]
    fn test_all_candidates_fail() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("gem list", CommandOutput::failed(1, ""))
                .on("which bundle", CommandOutput::failed(1, ""))
                .on("gem install", CommandOutput::failed(2, ""))
                .on("apt-get install", CommandOutput::failed(100, "")),
        );
        let host = testing::host(&runner, dir.path());
        let step = AlternativesStep::new(StepHeader::new("bundler"), spec(), &host).unwrap();
        let err = step.apply(&testing::ctx("bundler")).unwrap_err();
        assert!(err.to_string().starts_with("No candidate succeeded"));
    }

    #[test]
    fn test_fingerprint_follows_candidates() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let host = testing::host(&runner, dir.path());
        let a = AlternativesStep::new(StepHeader::new("x"), spec(), &host).unwrap();
        let mut other = spec();
        other.candidates.reverse();
        let b = AlternativesStep::new(StepHeader::new("x"), other, &host).unwrap();
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn test_validate() {
        assert!(AlternativesSpec { candidates: vec![] }.validate().is_err());
        assert!(spec().validate().is_ok());
    }
}
