//! On-disk secret store
//!
//! Layout inside the store directory (mode `0700`):
//! - `<name>`: the secret value, byte-exact
//! - `<name>.pub`: the public part, for key pairs
//! - `<name>.json`: metadata (generator, creation time)
//!
//! All files are mode `0600`. The metadata file is written last, so a secret
//! exists exactly when its metadata does.

use chrono::{DateTime, Utc};
use hostkit::CommandRunner;
use hostkit::fsutil::{ensure_dir, read_if_exists, write_atomic};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::generator::Generator;

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// A persisted secret
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub value: String,
    pub public: Option<String>,
    pub created_at: DateTime<Utc>,
    pub generator: Generator,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .field("public", &self.public.as_ref().map(|_| "<present>"))
            .field("created_at", &self.created_at)
            .field("generator", &self.generator)
            .finish()
    }
}

/// Secret metadata, without material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub generator: Generator,
    #[serde(default)]
    pub has_public: bool,
}

/// Generate-once secret storage
pub struct SecretStore {
    dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    create: Mutex<()>,
}

impl SecretStore {
    /// Open the store at `dir`; the directory is created on first write
    pub fn new(dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            dir: dir.into(),
            runner,
            create: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, name: &str) -> (PathBuf, PathBuf, PathBuf) {
        (
            self.dir.join(name),
            self.dir.join(format!("{}.pub", name)),
            self.dir.join(format!("{}.json", name)),
        )
    }

    /// Read a secret without generating it
    pub fn get(&self, name: &str) -> Result<Option<Secret>> {
        validate_name(name)?;
        let (value_path, public_path, meta_path) = self.paths(name);

        let Some(meta) = read_if_exists(&meta_path)? else {
            return Ok(None);
        };
        let corrupt = |message: String| Error::Corrupt {
            name: name.to_string(),
            message,
        };

        let info: SecretInfo =
            serde_json::from_slice(&meta).map_err(|e| corrupt(format!("metadata: {}", e)))?;
        let value = read_if_exists(&value_path)?
            .ok_or_else(|| corrupt("value file is missing".to_string()))?;
        let value = String::from_utf8(value).map_err(|_| corrupt("value is not UTF-8".to_string()))?;

        let public = if info.has_public {
            let bytes = read_if_exists(&public_path)?
                .ok_or_else(|| corrupt("public part is missing".to_string()))?;
            Some(String::from_utf8(bytes).map_err(|_| corrupt("public part is not UTF-8".to_string()))?)
        } else {
            None
        };

        Ok(Some(Secret {
            name: info.name,
            value,
            public,
            created_at: info.created_at,
            generator: info.generator,
        }))
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        Ok(self.paths(name).2.exists())
    }

    /// Return the persisted secret, generating it on first use
    ///
    /// An existing secret is returned as stored even if `generator` differs
    /// from the one that created it.
    pub fn get_or_create(&self, name: &str, generator: &Generator) -> Result<Secret> {
        let _guard = self.create.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = self.get(name)? {
            if &existing.generator != generator {
                log::warn!(
                    "Secret '{}' was generated as {}; keeping it although {} is declared",
                    name,
                    existing.generator,
                    generator
                );
            }
            return Ok(existing);
        }

        log::info!("Generating secret '{}' ({})", name, generator);
        self.generate(name, generator)
    }

    /// Regenerate a secret
    ///
    /// Refused for an existing secret unless `force` is set, since services
    /// may have cached the old value.
    pub fn rotate(&self, name: &str, generator: &Generator, force: bool) -> Result<Secret> {
        let _guard = self.create.lock().unwrap_or_else(|e| e.into_inner());

        if self.exists(name)? && !force {
            return Err(Error::RotationRefused {
                name: name.to_string(),
            });
        }
        log::warn!("Rotating secret '{}' ({})", name, generator);
        self.generate(name, generator)
    }

    /// Metadata for every stored secret, sorted by name
    pub fn list(&self) -> Result<Vec<SecretInfo>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut infos = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            match serde_json::from_slice::<SecretInfo>(&bytes) {
                Ok(info) => infos.push(info),
                Err(e) => log::warn!("Ignoring unreadable metadata {}: {}", path.display(), e),
            }
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    fn generate(&self, name: &str, generator: &Generator) -> Result<Secret> {
        validate_name(name)?;
        let source = match generator.source() {
            Some(from) => self.get(from)?,
            None => None,
        };
        let material = generator.generate(name, self.runner.as_ref(), source.as_ref())?;

        ensure_dir(&self.dir, DIR_MODE)?;
        let (value_path, public_path, meta_path) = self.paths(name);
        write_atomic(&value_path, material.value.as_bytes(), Some(FILE_MODE))?;
        if let Some(public) = &material.public {
            write_atomic(&public_path, public.as_bytes(), Some(FILE_MODE))?;
        }

        let info = SecretInfo {
            name: name.to_string(),
            created_at: Utc::now(),
            generator: generator.clone(),
            has_public: material.public.is_some(),
        };
        let meta = serde_json::to_vec_pretty(&info).map_err(|e| Error::Generation {
            name: name.to_string(),
            message: format!("serializing metadata: {}", e),
        })?;
        write_atomic(&meta_path, &meta, Some(FILE_MODE))?;

        Ok(Secret {
            name: info.name,
            value: material.value,
            public: material.public,
            created_at: info.created_at,
            generator: info.generator,
        })
    }
}

/// Check that `name` can be used as a secret name
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason| {
        Err(Error::InvalidName {
            name: name.to_string(),
            reason,
        })
    };
    if name.is_empty() {
        return invalid("empty");
    }
    if name.starts_with('-') {
        return invalid("must not start with '-'");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return invalid("only letters, digits, '_' and '-' are allowed");
    }
    Ok(())
}
