//! # hostkit
//!
//! Host collaborators for provisioning steps on a single Linux machine.
//!
//! This crate provides:
//! - Command execution with timeouts behind the [`CommandRunner`] trait
//! - OS package managers (apt, dnf)
//! - systemd service control
//! - PostgreSQL access through `psql`
//! - Atomic file writes
//! - HTTP health checks, downloads and tarball extraction
//!
//! Everything that touches the host goes through a [`CommandRunner`], so
//! callers can be tested with a [`ScriptedRunner`] instead of a real system.
//!
//! ## Example
//!
//! ```no_run
//! use hostkit::{PackageManager, SystemRunner, Systemd};
//!
//! let runner = SystemRunner;
//! let pm = PackageManager::detect().expect("unsupported distribution");
//! let missing = pm.missing(&runner, &["redis-server".to_string()]).unwrap();
//! pm.install(&runner, &missing, None).unwrap();
//!
//! Systemd::new(&runner).enable_now("redis-server").unwrap();
//! ```

#![warn(clippy::all)]

pub mod archive;
pub mod error;
pub mod fsutil;
pub mod http;
pub mod packages;
pub mod postgres;
pub mod runner;
pub mod systemd;

pub use error::{Error, ErrorCategory, Result};
pub use packages::PackageManager;
pub use postgres::Postgres;
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ScriptedRunner, SystemRunner};
pub use systemd::Systemd;
