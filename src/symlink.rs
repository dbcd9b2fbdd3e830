//! symlink install safety (§4.4). grounded on `is_bad_symlink_target` and
//! the checkout symlink-install dance in the original C implementation's
//! `lib/worktree.c`, reworked into safe Rust: the original reopens the
//! existing path with `O_NOFOLLOW` to distinguish "real symlink" from
//! "regular file holding link text" and reads `ELOOP` off that; this
//! version gets the same distinction from `symlink_metadata` without an
//! extra raw open.

use crate::error::WorktreeResult;
use crate::path::{is_child_of, normalize};
use std::ffi::OsStr;
use std::path::Path;

/// linux's `PATH_MAX`; targets at or beyond this length are rejected
/// outright regardless of where they resolve (§4.4).
pub const PATH_MAX: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    AlreadyCorrect,
    Unversioned,
}

/// true if `target`, interpreted relative to the directory containing
/// `on_disk_path`, resolves outside `root_path` or inside `meta_dir`.
pub fn is_bad_symlink_target(
    target: &str,
    on_disk_path: &Path,
    root_path: &Path,
    meta_dir: &Path,
) -> bool {
    if target.len() >= PATH_MAX {
        return true;
    }

    let containing_dir = on_disk_path.parent().unwrap_or(root_path);
    let candidate =
        if Path::new(target).is_absolute() { Path::new(target).to_path_buf() } else { containing_dir.join(target) };
    let resolved = normalize(&candidate);

    if !is_child_of(&resolved, root_path) {
        return true;
    }
    if is_child_of(&resolved, meta_dir) {
        return true;
    }
    false
}

/// `symlink(target, on_disk_path)`, handling the three documented
/// failure cases (§4.4). `is_versioned` tells the caller's `EEXIST`
/// branch whether to report `Unversioned` or attempt a replacement;
/// SymlinkSafety has no index access of its own.
pub fn install_symlink(
    target: &str,
    on_disk_path: &Path,
    is_versioned: bool,
) -> WorktreeResult<InstallOutcome> {
    match std::os::unix::fs::symlink(target, on_disk_path) {
        Ok(()) => Ok(InstallOutcome::Installed),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists =>
            if !is_versioned {
                Ok(InstallOutcome::Unversioned)
            } else {
                replace_existing_symlink(target, on_disk_path)
            },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = on_disk_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::os::unix::fs::symlink(target, on_disk_path)?;
            Ok(InstallOutcome::Installed)
        }
        Err(e) => Err(e.into()),
    }
}

/// the existing path at `on_disk_path` is either a real symlink (possibly
/// already correct) or a regular file holding the link text of a
/// previously bad symlink; either way it is safe to remove and replace.
fn replace_existing_symlink(target: &str, on_disk_path: &Path) -> WorktreeResult<InstallOutcome> {
    let metadata = std::fs::symlink_metadata(on_disk_path)?;
    if metadata.file_type().is_symlink() {
        let existing_target = std::fs::read_link(on_disk_path)?;
        if existing_target.as_os_str() == OsStr::new(target) {
            return Ok(InstallOutcome::AlreadyCorrect);
        }
    }
    std::fs::remove_file(on_disk_path)?;
    std::os::unix::fs::symlink(target, on_disk_path)?;
    Ok(InstallOutcome::Installed)
}
