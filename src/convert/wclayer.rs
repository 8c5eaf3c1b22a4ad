//! Windows container layer import into a directory.
//!
//! Each layer is imported into its own fresh directory. Parent layers stay
//! untouched. A whiteout that hides something a parent provides is kept as a
//! marker file in the new layer so the layering driver can apply it. A
//! whiteout that hides nothing in any parent is dropped.

use super::LayerImporter;
use crate::constants::{
    MAX_ENTRIES_PER_LAYER, MAX_LAYER_EXTRACT_SIZE, WHITEOUT_OPAQUE, WHITEOUT_PREFIX,
};
use crate::error::{Error, Result};
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::{debug, trace};

/// Extracts layer tar streams with traversal checks and size limits.
#[derive(Debug, Clone)]
pub struct DirectoryImporter {
    max_size: u64,
    max_entries: usize,
}

impl Default for DirectoryImporter {
    fn default() -> Self {
        Self::with_limits(MAX_LAYER_EXTRACT_SIZE, MAX_ENTRIES_PER_LAYER)
    }
}

impl DirectoryImporter {
    /// Creates an importer with custom limits.
    pub fn with_limits(max_size: u64, max_entries: usize) -> Self {
        Self {
            max_size,
            max_entries,
        }
    }
}

impl LayerImporter for DirectoryImporter {
    fn import(&self, source: &mut dyn Read, root: &Path, parents: &[PathBuf]) -> Result<u64> {
        for parent in parents {
            validate_parent(parent, root)?;
        }
        fs::create_dir_all(root)
            .map_err(|e| Error::conversion(format!("create layer {}", root.display()), e))?;

        let mut archive = Archive::new(source);
        let entries = archive
            .entries()
            .map_err(|e| Error::conversion("read layer archive", e))?;

        let mut total_size = 0u64;
        let mut count = 0usize;
        for entry in entries {
            let mut entry = entry.map_err(|e| Error::conversion("read layer entry", e))?;

            count += 1;
            if count > self.max_entries {
                return Err(Error::LayerTooLarge {
                    what: "entry count",
                    size: count as u64,
                    limit: self.max_entries as u64,
                });
            }

            let path = entry
                .path()
                .map_err(|e| Error::conversion("read entry path", e))?
                .into_owned();
            ensure_relative(&path)?;

            if let Some(name) = path.file_name().and_then(|n| n.to_str())
                && name.starts_with(WHITEOUT_PREFIX)
            {
                let dir = path.parent().unwrap_or(Path::new(""));
                if whiteout_hides_parent_content(root, parents, dir, name)? {
                    trace!(path = %path.display(), "recording whiteout");
                    unpack(&mut entry, root, &path)?;
                }
                continue;
            }

            total_size += entry.size();
            if total_size > self.max_size {
                return Err(Error::LayerTooLarge {
                    what: "size",
                    size: total_size,
                    limit: self.max_size,
                });
            }

            unpack(&mut entry, root, &path)?;
        }

        debug!(root = %root.display(), entries = count, bytes = total_size, "layer extracted");
        Ok(total_size)
    }
}

fn unpack<R: Read>(entry: &mut tar::Entry<'_, R>, root: &Path, path: &Path) -> Result<()> {
    let inside = entry
        .unpack_in(root)
        .map_err(|e| Error::conversion(format!("unpack {}", path.display()), e))?;
    if !inside {
        return Err(Error::PathTraversal {
            path: path.display().to_string(),
        });
    }
    Ok(())
}

/// Rejects absolute paths and any `..` component.
fn ensure_relative(path: &Path) -> Result<()> {
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(Error::PathTraversal {
            path: path.display().to_string(),
        });
    }
    Ok(())
}

fn validate_parent(parent: &Path, root: &Path) -> Result<()> {
    let invalid = |reason: String| Error::InvalidParentLayer {
        path: parent.to_path_buf(),
        reason,
    };
    if parent == root {
        return Err(invalid("same as the destination layer".to_string()));
    }
    match fs::metadata(parent) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(invalid("not a directory".to_string())),
        Err(e) => Err(invalid(e.to_string())),
    }
}

/// Applies a whiteout inside the new layer and reports whether any parent
/// layer holds the hidden path.
fn whiteout_hides_parent_content(
    root: &Path,
    parents: &[PathBuf],
    dir: &Path,
    name: &str,
) -> Result<bool> {
    if name == WHITEOUT_OPAQUE {
        return Ok(parents.iter().any(|p| p.join(dir).is_dir()));
    }

    let hidden = name.strip_prefix(WHITEOUT_PREFIX).unwrap_or_default();
    if hidden.is_empty() {
        return Ok(false);
    }
    let rel = dir.join(hidden);
    ensure_relative(&rel)?;
    ensure_no_symlink_ancestor(root, &rel)?;

    remove_path(&root.join(&rel))?;
    Ok(parents
        .iter()
        .any(|p| p.join(&rel).symlink_metadata().is_ok()))
}

/// Rejects `rel` when a directory above it inside `root` is a symlink.
///
/// Entries unpacked earlier in the same layer may have planted a link that
/// would carry a removal outside the root.
fn ensure_no_symlink_ancestor(root: &Path, rel: &Path) -> Result<()> {
    for ancestor in rel.ancestors().skip(1) {
        if ancestor.as_os_str().is_empty() {
            continue;
        }
        match fs::symlink_metadata(root.join(ancestor)) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(Error::PathTraversal {
                    path: rel.display().to_string(),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::conversion(
                    format!("inspect {}", root.join(ancestor).display()),
                    e,
                ));
            }
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| Error::conversion(format!("remove {}", path.display()), e))
}
