//! Durable record of completed steps
//!
//! The record lives in a state directory next to an exclusive lock file:
//!
//! ```text
//! <state_dir>/state.json   step name -> status, fingerprint, timestamps
//! <state_dir>/state.lock   held with flock(LOCK_EX) for the whole run
//! ```
//!
//! The record is rewritten atomically (temp file + rename) after every
//! step, so an interrupted run leaves a record that only lists steps whose
//! apply/probe cycle completed.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::types::{StepError, StepResult, StepStatus};

const RECORD_FILE: &str = "state.json";
const LOCK_FILE: &str = "state.lock";
const RECORD_VERSION: u32 = 1;

// ============================================================================
// Record Structures
// ============================================================================

/// Persisted mapping from step name to its last known outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub version: u32,

    /// Last time any entry changed
    pub last_updated: DateTime<Utc>,

    #[serde(default)]
    pub steps: BTreeMap<String, StepRecord>,
}

/// Last known outcome of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,

    /// Fingerprint of the inputs the status refers to
    pub fingerprint: Fingerprint,

    pub updated_at: DateTime<Utc>,

    /// Last time the step's apply succeeded
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,

    /// Apply attempts made by the run that wrote this entry
    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl StepRecord {
    /// Whether the step counts as done for the given inputs
    pub fn is_done_for(&self, fingerprint: &Fingerprint) -> bool {
        self.status.is_settled_ok() && &self.fingerprint == fingerprint
    }
}

impl Default for StateRecord {
    fn default() -> Self {
        Self {
            version: RECORD_VERSION,
            last_updated: Utc::now(),
            steps: BTreeMap::new(),
        }
    }
}

impl StateRecord {
    pub fn get(&self, name: &str) -> Option<&StepRecord> {
        self.steps.get(name)
    }

    /// Fold a step result into the record
    ///
    /// A skip keeps the previous success timestamp; a failure keeps it too,
    /// so `status` shows when the step last worked.
    pub fn record(&mut self, result: &StepResult, fingerprint: &Fingerprint) {
        let now = Utc::now();
        let previous_success = self.steps.get(&result.name).and_then(|r| r.last_success_at);

        let last_success_at = match result.status {
            StepStatus::Succeeded => Some(now),
            _ => previous_success,
        };

        self.steps.insert(
            result.name.clone(),
            StepRecord {
                status: result.status,
                fingerprint: fingerprint.clone(),
                updated_at: now,
                last_success_at,
                attempts: result.attempts,
                error: result.error.clone(),
            },
        );
        self.last_updated = now;
    }

    /// Forget a step so the next run applies it again
    pub fn forget(&mut self, name: &str) -> bool {
        let removed = self.steps.remove(name).is_some();
        if removed {
            self.last_updated = Utc::now();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.steps.clear();
        self.last_updated = Utc::now();
    }
}

// ============================================================================
// Lock
// ============================================================================

/// Exclusive lock on a state directory
///
/// Held with `flock(LOCK_EX)` for as long as the value lives; released when
/// the file handle is closed on drop.
pub struct StateLock {
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl StateLock {
    /// Try to take the lock without blocking
    ///
    /// # Errors
    /// [`Error::LockContention`] if another process holds it.
    pub fn try_acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                log::debug!("Acquired state lock at {}", path.display());
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(Error::LockContention { path })
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        log::debug!("Released state lock at {}", self.path.display());
    }
}

// ============================================================================
// Store
// ============================================================================

/// The state record plus where (and whether) it is persisted
pub struct StateStore {
    path: Option<PathBuf>,
    record: StateRecord,
    lock: Option<StateLock>,
}

impl StateStore {
    /// Lock the state directory and load its record
    ///
    /// Used by runs that write: the lock is held until the store is dropped.
    pub fn open_locked(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let lock = StateLock::try_acquire(dir)?;
        let path = dir.join(RECORD_FILE);
        let record = load_record(&path)?;
        Ok(Self {
            path: Some(path),
            record,
            lock: Some(lock),
        })
    }

    /// Load the record without locking; the store refuses to save
    pub fn open_read_only(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(RECORD_FILE);
        let record = load_record(&path)?;
        Ok(Self {
            path: Some(path),
            record,
            lock: None,
        })
    }

    /// A store that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            record: StateRecord::default(),
            lock: None,
        }
    }

    pub fn record(&self) -> &StateRecord {
        &self.record
    }

    /// Path of the record file, if persisted
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Record a settled step and persist immediately
    pub fn commit(&mut self, result: &StepResult, fingerprint: &Fingerprint) -> Result<()> {
        self.record.record(result, fingerprint);
        self.save()
    }

    /// Forget one step (or all, with `None`) and persist
    pub fn forget(&mut self, name: Option<&str>) -> Result<bool> {
        let changed = match name {
            Some(name) => self.record.forget(name),
            None => {
                let had_any = !self.record.steps.is_empty();
                self.record.clear();
                had_any
            }
        };
        if changed {
            self.save()?;
        }
        Ok(changed)
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if self.lock.is_none() {
            return Err(Error::State {
                path: path.clone(),
                message: "refusing to write without holding the state lock".to_string(),
            });
        }

        let content = serde_json::to_vec_pretty(&self.record).map_err(|e| Error::State {
            path: path.clone(),
            message: format!("failed to serialize: {}", e),
        })?;
        write_atomic(path, &content)?;
        log::trace!("Saved state record to {}", path.display());
        Ok(())
    }
}

/// Load a record, or return an empty one if the file doesn't exist
fn load_record(path: &Path) -> Result<StateRecord> {
    if !path.exists() {
        log::debug!("State record {} does not exist, starting fresh", path.display());
        return Ok(StateRecord::default());
    }

    let content = fs::read(path)?;
    let record: StateRecord = serde_json::from_slice(&content).map_err(|e| Error::State {
        path: path.to_path_buf(),
        message: format!("failed to parse: {}", e),
    })?;

    if record.version > RECORD_VERSION {
        return Err(Error::State {
            path: path.to_path_buf(),
            message: format!(
                "written by a newer version (record version {}, supported {})",
                record.version, RECORD_VERSION
            ),
        });
    }

    log::debug!("Loaded {} step entries from {}", record.steps.len(), path.display());
    Ok(record)
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
