//! Error types for secret storage.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Names become file names, so they are restricted
    #[error("invalid secret name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("secret '{name}' not found")]
    NotFound { name: String },

    /// Regeneration without the explicit override
    #[error("secret '{name}' already exists; rotating it requires an explicit override")]
    RotationRefused { name: String },

    /// A key id refers to a secret that has not been generated
    #[error("secret '{name}' derives from '{from}', which does not exist yet")]
    MissingSource { name: String, from: String },

    #[error("cannot generate '{name}': {message}")]
    Generation { name: String, message: String },

    /// Metadata present but material unreadable, or vice versa
    #[error("secret '{name}' is corrupt: {message}")]
    Corrupt { name: String, message: String },

    #[error(transparent)]
    Host(#[from] hostkit::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
