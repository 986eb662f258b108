//! Centralized path resolution for rigger
//!
//! # Environment Variables
//!
//! - `RIGGER_MANIFEST` - Manifest file (default `/etc/rigger/manifest.toml`)
//! - `RIGGER_STATE_DIR` - Directory holding `state.json` and `state.lock`
//! - `RIGGER_SECRETS_DIR` - Secret store directory
//! - `RIGGER_VAR_<NAME>` - Override manifest variable `<name>`
//!
//! # Path Resolution Priority
//!
//! For state_dir():
//! 1. `--state-dir` flag
//! 2. `RIGGER_STATE_DIR` environment variable
//! 3. `settings.state_dir` in the manifest
//! 4. `/var/lib/rigger` when running as root
//! 5. `XDG_STATE_HOME/rigger` (if set)
//! 6. `~/.local/state/rigger`
//!
//! For secrets_dir():
//! 1. `RIGGER_SECRETS_DIR` environment variable
//! 2. `settings.secrets_dir` in the manifest
//! 3. `<state_dir>/secrets`

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable for the manifest path
pub const ENV_MANIFEST: &str = "RIGGER_MANIFEST";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "RIGGER_STATE_DIR";

/// Environment variable for secrets directory override
pub const ENV_SECRETS_DIR: &str = "RIGGER_SECRETS_DIR";

/// Prefix of manifest variable overrides
pub const ENV_VAR_PREFIX: &str = "RIGGER_VAR_";

/// Environment lookup; [`process_env`] outside of tests
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Read a variable from the process environment
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

const DEFAULT_MANIFEST: &str = "/etc/rigger/manifest.toml";
const SYSTEM_STATE_DIR: &str = "/var/lib/rigger";

/// Get the manifest path
pub fn manifest_path(flag: Option<&Path>) -> PathBuf {
    manifest_path_with(flag, &process_env)
}

fn manifest_path_with(flag: Option<&Path>, env: EnvLookup<'_>) -> PathBuf {
    if let Some(path) = flag {
        return path.to_path_buf();
    }

    if let Some(path) = env(ENV_MANIFEST) {
        let path = expand(&path);
        log::debug!("Using manifest from {}: {}", ENV_MANIFEST, path.display());
        return path;
    }

    PathBuf::from(DEFAULT_MANIFEST)
}

/// Get the rigger state directory path
///
/// `configured` is the manifest's `settings.state_dir`, if any.
pub fn state_dir(flag: Option<&Path>, configured: Option<&str>) -> Result<PathBuf> {
    state_dir_with(flag, configured, &process_env)
}

fn state_dir_with(flag: Option<&Path>, configured: Option<&str>, env: EnvLookup<'_>) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir.to_path_buf());
    }

    if let Some(dir) = env(ENV_STATE_DIR) {
        let path = expand(&dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return Ok(path);
    }

    if let Some(dir) = configured {
        let path = expand(dir);
        log::debug!("Using state dir from manifest: {}", path.display());
        return Ok(path);
    }

    if is_root() {
        log::debug!("Running as root, using {}", SYSTEM_STATE_DIR);
        return Ok(PathBuf::from(SYSTEM_STATE_DIR));
    }

    if let Some(xdg_state) = env("XDG_STATE_HOME") {
        let path = PathBuf::from(xdg_state).join("rigger");
        log::debug!("Using XDG_STATE_HOME: {}", path.display());
        return Ok(path);
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".local").join("state").join("rigger");
    log::debug!("Using default state dir: {}", path.display());
    Ok(path)
}

/// Get the secret store directory
pub fn secrets_dir(state_dir: &Path, configured: Option<&str>) -> PathBuf {
    secrets_dir_with(state_dir, configured, &process_env)
}

fn secrets_dir_with(state_dir: &Path, configured: Option<&str>, env: EnvLookup<'_>) -> PathBuf {
    if let Some(dir) = env(ENV_SECRETS_DIR) {
        let path = expand(&dir);
        log::debug!("Using secrets dir from {}: {}", ENV_SECRETS_DIR, path.display());
        return path;
    }

    if let Some(dir) = configured {
        return expand(dir);
    }

    state_dir.join("secrets")
}

/// Environment override for manifest variable `name`
///
/// `db-name` and `db.name` both map to `RIGGER_VAR_DB_NAME`.
pub fn var_override(name: &str, env: EnvLookup<'_>) -> Option<String> {
    env(&var_env_name(name))
}

fn var_env_name(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}", ENV_VAR_PREFIX, suffix)
}

/// Expand ~ and environment variables in a path string.
///
/// Unknown variables are left as written.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

// ============================================================================
// Tests
// ============================================================================
