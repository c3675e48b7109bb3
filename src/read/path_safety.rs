//! Path validation for filesystem extraction.
//!
//! Stored names come from untrusted headers. Before anything touches the
//! disk, a name is split on both separators and rejected if it is absolute,
//! carries a drive prefix, or climbs with `..`.

use std::io;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

fn traversal(index: usize, path: &str) -> Error {
    Error::PathTraversal {
        item_index: index,
        path: path.to_string(),
    }
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Resolves a stored item name under `root`.
///
/// Returns `Ok(None)` for names with no usable component (`""`, `"."`,
/// `"./"`), which have nothing to create.
pub(crate) fn validate_path(index: usize, name: &str, root: &Path) -> Result<Option<PathBuf>> {
    if name.starts_with('/') || name.starts_with('\\') || has_drive_prefix(name) {
        return Err(traversal(index, name));
    }

    let mut path = root.to_path_buf();
    let mut depth = 0usize;
    for component in name.split(['/', '\\']) {
        match component {
            "" | "." => {}
            ".." => return Err(traversal(index, name)),
            c if c.contains('\0') => return Err(traversal(index, name)),
            c => {
                path.push(c);
                depth += 1;
            }
        }
    }
    Ok((depth > 0).then_some(path))
}

/// Checks that a symlink stored at `name` pointing to `target` stays under
/// the extraction root.
///
/// The depth of the link inside the archive bounds how many `..`
/// components the target may use.
pub(crate) fn validate_symlink_target(index: usize, name: &str, target: &str) -> Result<()> {
    let escape = || traversal(index, &format!("{} -> {}", name, target));
    if target.starts_with('/') || target.starts_with('\\') || has_drive_prefix(target) {
        return Err(escape());
    }

    let mut parts: Vec<&str> = name
        .split(['/', '\\'])
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    parts.pop();
    let mut depth = parts.len();

    for component in target.split(['/', '\\']) {
        match component {
            "" | "." => {}
            ".." => depth = depth.checked_sub(1).ok_or_else(escape)?,
            _ => depth += 1,
        }
    }
    Ok(())
}

#[cfg(unix)]
pub(crate) fn create_symlink(link: &Path, target: &str) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
pub(crate) fn create_symlink(link: &Path, target: &str) -> io::Result<()> {
    let resolved = link.parent().map(|p| p.join(target));
    if resolved.is_some_and(|p| p.is_dir()) {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}

#[cfg(not(any(unix, windows)))]
pub(crate) fn create_symlink(_link: &Path, _target: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symbolic links are not supported on this platform",
    ))
}
