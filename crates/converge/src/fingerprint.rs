//! Content fingerprints of step inputs
//!
//! A fingerprint is a BLAKE3 digest over a step's kind and its declared
//! inputs. Fields are length-prefixed so that `("ab", "c")` and `("a", "bc")`
//! never collide.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hex-encoded BLAKE3 digest of a step's inputs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn builder(kind: &str) -> FingerprintBuilder {
        FingerprintBuilder::new(kind)
    }

    /// Fingerprint a serializable value, e.g. a step's manifest parameters
    ///
    /// `serde_json` serializes maps through `Value` with sorted keys, so
    /// equal values give equal fingerprints.
    pub fn of_json<T: Serialize>(kind: &str, value: &T) -> serde_json::Result<Self> {
        Ok(Self::builder(kind).json("params", value)?.finish())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for display
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Incremental fingerprint construction
pub struct FingerprintBuilder {
    hasher: blake3::Hasher,
}

impl FingerprintBuilder {
    pub fn new(kind: &str) -> Self {
        let mut builder = Self {
            hasher: blake3::Hasher::new(),
        };
        builder.update(b"kind", kind.as_bytes());
        builder
    }

    fn update(&mut self, label: &[u8], data: &[u8]) {
        self.hasher.update(&(label.len() as u64).to_le_bytes());
        self.hasher.update(label);
        self.hasher.update(&(data.len() as u64).to_le_bytes());
        self.hasher.update(data);
    }

    pub fn field(mut self, label: &str, value: &str) -> Self {
        self.update(label.as_bytes(), value.as_bytes());
        self
    }

    pub fn bytes(mut self, label: &str, data: &[u8]) -> Self {
        self.update(label.as_bytes(), data);
        self
    }

    /// Add a serializable value in canonical JSON form
    pub fn json<T: Serialize>(self, label: &str, value: &T) -> serde_json::Result<Self> {
        let canonical = serde_json::to_vec(&serde_json::to_value(value)?)?;
        Ok(self.bytes(label, &canonical))
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().to_hex().to_string())
    }
}
