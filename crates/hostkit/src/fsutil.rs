//! Filesystem helpers.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::error::Result;

/// Write `contents` to `path` atomically
///
/// The data goes to a temporary file in the same directory, gets its mode
/// set, and is renamed over the target. Readers see the old or the new
/// content, never a partial file. Missing parent directories are created.
pub fn write_atomic(path: &Path, contents: &[u8], mode: Option<u32>) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    if let Some(mode) = mode {
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    log::debug!("Wrote {} ({} bytes)", path.display(), contents.len());
    Ok(())
}

/// Read a file, or `None` if it does not exist
pub fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Permission bits of a file, or `None` if it does not exist
pub fn mode_of(path: &Path) -> Result<Option<u32>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.permissions().mode() & 0o7777)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Create a directory (and parents) and set its mode
pub fn ensure_dir(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_creates_parents_and_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc/registry/config.yml");
        write_atomic(&path, b"listen: 8080\n", Some(0o640)).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"listen: 8080\n");
        assert_eq!(mode_of(&path).unwrap(), Some(0o640));
    }

    #[test]
    fn test_write_atomic_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        write_atomic(&path, b"old", None).unwrap();
        write_atomic(&path, b"new", None).unwrap();
        assert_eq!(read_if_exists(&path).unwrap(), Some(b"new".to_vec()));

        // No temp files left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_if_exists(&dir.path().join("nope")).unwrap(), None);
        assert_eq!(mode_of(&dir.path().join("nope")).unwrap(), None);
    }

    #[test]
    fn test_ensure_dir() {
        let dir = TempDir::new().unwrap();
        let secrets = dir.path().join("secrets");
        ensure_dir(&secrets, 0o700).unwrap();
        assert_eq!(mode_of(&secrets).unwrap(), Some(0o700));
    }
}
