//! # Converge
//!
//! An engine for idempotent, dependency-ordered provisioning.
//!
//! A provisioning run is a set of [`Step`]s. Each step declares the steps it
//! depends on, a read-only probe that tells whether its effect is already in
//! place, an apply function that produces the effect, and a failure policy.
//! The planner orders the steps, the executor runs them, and the state record
//! remembers what completed so an interrupted run resumes where it stopped.
//!
//! ## Core Concepts
//!
//! - **Step**: atomic unit of provisioning work with a probe and an apply
//! - **Fingerprint**: content hash of a step's inputs; a changed fingerprint
//!   makes a previously completed step run again
//! - **ExecutionPlan**: topologically sorted steps, ties broken by
//!   declaration order
//! - **StateStore**: durable, locked record of completed steps
//! - **Executor**: runs a plan, applying probes, timeouts and failure policies
//!
//! ## Example
//!
//! ```ignore
//! use converge::{
//!     ApplyContext, ExecuteOptions, Fingerprint, NoProgress, ProbeOutcome,
//!     StateStore, Step, StepHeader, execute, plan,
//! };
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct Touch { header: StepHeader, path: String }
//!
//! impl Step for Touch {
//!     fn header(&self) -> &StepHeader { &self.header }
//!     fn kind(&self) -> &'static str { "touch" }
//!
//!     fn fingerprint(&self) -> anyhow::Result<Fingerprint> {
//!         Ok(Fingerprint::builder("touch").field("path", &self.path).finish())
//!     }
//!
//!     fn probe(&self) -> anyhow::Result<ProbeOutcome> {
//!         Ok(ProbeOutcome::from_bool(std::path::Path::new(&self.path).exists()))
//!     }
//!
//!     fn apply(&self, _ctx: &ApplyContext) -> anyhow::Result<()> {
//!         std::fs::write(&self.path, b"")?;
//!         Ok(())
//!     }
//! }
//!
//! let plan = plan(vec![Arc::new(Touch {
//!     header: StepHeader::new("touch-marker"),
//!     path: "/tmp/marker".into(),
//! })])?;
//!
//! let mut store = StateStore::open_locked("/var/lib/rigger")?;
//! let report = execute(&plan, &mut store, &ExecuteOptions::default(), &mut NoProgress)?;
//! ```

pub mod context;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod planner;
pub mod retry;
pub mod state;
pub mod step;
pub mod types;

// Re-export main types at crate root
pub use context::{ApplyContext, CancelToken, NoProgress, ProgressCallback};
pub use error::{ApplyError, Error, Result};
pub use executor::execute;
pub use fingerprint::{Fingerprint, FingerprintBuilder};
pub use planner::{ExecutionPlan, plan, plan_subset};
pub use retry::Backoff;
pub use state::{StateLock, StateRecord, StateStore, StepRecord};
pub use step::{SharedStep, Step, StepHeader};
pub use types::{
    ErrorKind, ExecuteOptions, FailurePolicy, ProbeOutcome, RunMode, RunReport, RunState,
    StepError, StepResult, StepStatus,
};
