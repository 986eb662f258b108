//! # keystore
//!
//! Generate-once storage for credentials and keys.
//!
//! [`SecretStore::get_or_create`] generates a secret the first time a name
//! is requested and returns the persisted material, byte-identical, on every
//! later call. Regeneration only happens through [`SecretStore::rotate`]
//! with an explicit override.
//!
//! ```no_run
//! use hostkit::SystemRunner;
//! use keystore::{Encoding, Generator, SecretStore};
//! use std::sync::Arc;
//!
//! let store = SecretStore::new("/var/lib/rigger/secrets", Arc::new(SystemRunner));
//! let key = store
//!     .get_or_create("secret_key", &Generator::Random { bytes: 32, encoding: Encoding::Hex })
//!     .unwrap();
//! ```

pub mod error;
pub mod generator;
pub mod store;

pub use error::{Error, Result};
pub use generator::{Encoding, Generator};
pub use store::{Secret, SecretInfo, SecretStore, validate_name};
