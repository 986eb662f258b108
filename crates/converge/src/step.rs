//! Step trait for idempotent provisioning work
//!
//! A Step is a unit of work with a read-only probe that says whether the
//! work is already done, and an apply function that does it.

use crate::context::ApplyContext;
use crate::fingerprint::Fingerprint;
use crate::types::{FailurePolicy, ProbeOutcome};
use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Declaration shared by every step: identity, ordering and policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepHeader {
    /// Unique name within the manifest
    pub name: String,
    /// Human-readable description; defaults to the name
    pub description: Option<String>,
    /// Hard dependencies: this step needs their postconditions
    pub depends_on: Vec<String>,
    /// Soft dependencies: ordering only
    pub after: Vec<String>,
    pub policy: FailurePolicy,
    /// Overrides the run's default timeout
    pub timeout: Option<Duration>,
}

impl StepHeader {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            depends_on: Vec::new(),
            after: Vec::new(),
            policy: FailurePolicy::Abort,
            timeout: None,
        }
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.depends_on = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn after(mut self, names: &[&str]) -> Self {
        self.after = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// All dependency names, hard first, without duplicates
    pub fn all_dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = Vec::with_capacity(self.depends_on.len() + self.after.len());
        for name in self.depends_on.iter().chain(self.after.iter()) {
            if !deps.contains(&name.as_str()) {
                deps.push(name);
            }
        }
        deps
    }
}

/// Core trait for provisioning steps
///
/// Every step kind implements this trait, which provides:
/// - Identity and ordering (through its [`StepHeader`])
/// - A fingerprint of its inputs
/// - A side-effect-free probe
/// - An apply function that converges the host
///
/// # Contract
///
/// `probe` must be read-only, safe to call repeatedly, and must not assume
/// that any other step ran in this process. An `Err` from `probe` is treated
/// as [`ProbeOutcome::Unknown`].
///
/// `apply` must be idempotent: running it when the effect is already in
/// place must succeed without changing anything.
pub trait Step: Send + Sync + fmt::Debug {
    fn header(&self) -> &StepHeader;

    /// Step kind, e.g. "packages", "service", "file"
    fn kind(&self) -> &'static str;

    /// Content hash of everything this step's effect depends on
    fn fingerprint(&self) -> Result<Fingerprint>;

    /// Inspect whether the step's postcondition already holds
    fn probe(&self) -> Result<ProbeOutcome>;

    /// Produce the step's effect
    fn apply(&self, ctx: &ApplyContext) -> Result<()>;

    fn name(&self) -> &str {
        &self.header().name
    }

    fn description(&self) -> String {
        self.header()
            .description
            .clone()
            .unwrap_or_else(|| self.header().name.clone())
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.header().policy
    }

    fn timeout(&self) -> Option<Duration> {
        self.header().timeout
    }

    /// Human-readable preview of the change `apply` would make
    ///
    /// Used by dry runs; `None` when the step has nothing better to show
    /// than its description.
    fn diff(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// A step shared between the plan and worker threads
pub type SharedStep = Arc<dyn Step>;
