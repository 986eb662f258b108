//! Tarball extraction.

use flate2::read::GzDecoder;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::Archive;

use crate::error::{Error, Result};

/// Extract a `.tar.gz` held in memory into `dest`
///
/// `strip_components` drops that many leading path components from every
/// entry, like `tar --strip-components`. Entries that would land outside
/// `dest`, directly or through a link, are rejected. Returns the number of
/// entries written.
pub fn extract_tar_gz(data: &[u8], dest: &Path, strip_components: usize) -> Result<usize> {
    extract(GzDecoder::new(data), dest, strip_components)
}

/// Extract an uncompressed tar stream into `dest`
pub fn extract<R: Read>(reader: R, dest: &Path, strip_components: usize) -> Result<usize> {
    let archive_error = |message: String| Error::Archive {
        path: dest.to_path_buf(),
        message,
    };

    fs::create_dir_all(dest)?;
    let root = dest.canonicalize()?;
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);

    let mut written = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        let Some(relative) = strip(&path, strip_components) else {
            continue;
        };
        if !is_contained(&relative) {
            return Err(archive_error(format!(
                "entry '{}' escapes the destination",
                path.display()
            )));
        }

        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            if !resolves_inside(&root, parent)? {
                return Err(archive_error(format!(
                    "entry '{}' passes through a link out of the destination",
                    path.display()
                )));
            }
            fs::create_dir_all(parent)?;
        }
        // Replace links instead of writing through them
        if fs::symlink_metadata(&target).is_ok_and(|m| m.file_type().is_symlink()) {
            fs::remove_file(&target)?;
        }

        let entry_type = entry.header().entry_type();
        if entry_type.is_hard_link() {
            let source = entry
                .link_name()?
                .and_then(|link| strip(&link, strip_components))
                .filter(|source| is_contained(source))
                .map(|source| dest.join(source));
            let source = match source {
                Some(source) if resolves_inside(&root, &source)? => source,
                _ => {
                    return Err(archive_error(format!(
                        "hard link '{}' points outside the destination",
                        path.display()
                    )));
                }
            };
            if fs::symlink_metadata(&target).is_ok() {
                fs::remove_file(&target)?;
            }
            fs::hard_link(&source, &target)?;
            written += 1;
            continue;
        }
        if entry_type.is_symlink() {
            let stays = entry
                .link_name()?
                .is_some_and(|link| symlink_stays_inside(&relative, &link));
            if !stays {
                return Err(archive_error(format!(
                    "symlink '{}' points outside the destination",
                    path.display()
                )));
            }
        }

        entry
            .unpack(&target)
            .map_err(|e| archive_error(format!("unpacking '{}': {}", path.display(), e)))?;
        written += 1;
    }

    log::debug!("Extracted {} entries into {}", written, dest.display());
    Ok(written)
}

fn strip(path: &Path, n: usize) -> Option<PathBuf> {
    let rest: PathBuf = path.components().skip(n).collect();
    if rest.as_os_str().is_empty() {
        None
    } else {
        Some(rest)
    }
}

fn is_contained(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Whether a symlink at `entry` (relative to the root) pointing at `link`
/// resolves below the root
fn symlink_stays_inside(entry: &Path, link: &Path) -> bool {
    let mut depth = entry
        .parent()
        .map_or(0, |p| p.components().filter(|c| matches!(c, Component::Normal(_))).count());
    for component in link.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir if depth > 0 => depth -= 1,
            _ => return false,
        }
    }
    true
}

/// Whether the deepest existing ancestor of `path` really lives under `root`
fn resolves_inside(root: &Path, path: &Path) -> Result<bool> {
    let mut existing = path;
    while fs::symlink_metadata(existing).is_err() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => return Ok(false),
        }
    }
    Ok(existing.canonicalize()?.starts_with(root))
}
