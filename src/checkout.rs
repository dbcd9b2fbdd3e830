//! `CheckoutEngine` (§4.5): applies a tree to the work tree while
//! respecting local state, driven by `FileIndex::diff_tree`'s three
//! callbacks. adapted from the teacher's `checkout.rs` (`CheckoutCtxt`
//! implementing a tree-entry consumer over `BitTreeIterator`), narrowed to
//! the path-reconciliation job this crate owns — tree walking itself is
//! `FileIndex::diff_tree`.

use crate::error::{WorktreeError, WorktreeResult};
use crate::hash::ObjectId;
use crate::index::{FileIndex, IndexEntry, IndexMode, Stage, TreeDiffCallback};
use crate::linemerge::LineMerger;
use crate::merge::ThreeWayMerger;
use crate::obj::FileMode;
use crate::objstore::{ObjectStore, TreeEntry};
use crate::path::RepoPath;
use crate::status::{StatusCode, StatusWalker};
use crate::symlink::{install_symlink, is_bad_symlink_target};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutReport {
    Exists,
    Update,
    Merge,
    Delete,
    ModeChange,
    CannotUpdate,
    Obstructed,
}

enum PendingOp {
    Update(IndexEntry),
    Remove(RepoPath),
}

pub struct CheckoutEngine<'a> {
    store: &'a dyn ObjectStore,
    merger: &'a dyn LineMerger,
    root: &'a Path,
    meta_dir: &'a Path,
    base_commit_id: ObjectId,
    cancel_cb: &'a dyn Fn() -> bool,
}

impl<'a> CheckoutEngine<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        merger: &'a dyn LineMerger,
        root: &'a Path,
        meta_dir: &'a Path,
        base_commit_id: ObjectId,
        cancel_cb: &'a dyn Fn() -> bool,
    ) -> Self {
        Self { store, merger, root, meta_dir, base_commit_id, cancel_cb }
    }

    /// apply `new_tree` onto `index`, bump the base commit id of every path
    /// now present in the new tree, and return the per-path reports (§4.5).
    pub fn checkout_files(
        &self,
        index: &mut FileIndex,
        new_tree: ObjectId,
        new_base_commit_id: ObjectId,
    ) -> WorktreeResult<Vec<(RepoPath, CheckoutReport)>> {
        // `diff_tree` holds `index` by shared reference for the whole walk,
        // so callback-driven mutations are staged into `pending` and
        // replayed afterward rather than applied in place.
        let snapshot = index.clone();
        let mut applier = CheckoutApplier { engine: self, pending: Vec::new(), reports: Vec::new() };
        snapshot.diff_tree(self.store, new_tree, &mut applier)?;
        let CheckoutApplier { pending, reports, .. } = applier;

        for op in pending {
            match op {
                PendingOp::Update(entry) => index.entry_add(entry),
                PendingOp::Remove(path) => {
                    index.entry_remove(&path);
                }
            }
        }

        self.bump_base_commit_id(index, new_base_commit_id)?;
        Ok(reports)
    }

    /// §4.5 "bump_base_commit_id": every tracked path present in the new
    /// base tree has its `commit_sha1` advanced to the new base commit.
    fn bump_base_commit_id(&self, index: &mut FileIndex, new_base_commit_id: ObjectId) -> WorktreeResult<()> {
        let paths: Vec<RepoPath> = index.paths().cloned().collect();
        for path in paths {
            if self.store.id_by_path(new_base_commit_id, &path)?.is_some() {
                if let Some(entry) = index.entry_get_mut(&path) {
                    entry.commit_sha1 = Some(new_base_commit_id);
                }
            }
        }
        Ok(())
    }

    fn check_cancelled(&self) -> WorktreeResult<()> {
        if (self.cancel_cb)() { Err(WorktreeError::Cancelled) } else { Ok(()) }
    }

    fn on_disk_path(&self, path: &RepoPath) -> PathBuf {
        self.root.join(path.as_str())
    }
}

struct CheckoutApplier<'a, 'b> {
    engine: &'b CheckoutEngine<'a>,
    pending: Vec<PendingOp>,
    reports: Vec<(RepoPath, CheckoutReport)>,
}

impl<'a, 'b> TreeDiffCallback for CheckoutApplier<'a, 'b> {
    /// `update_blob` (§4.5 diff_old_new).
    fn diff_old_new(&mut self, entry: &IndexEntry, te: &TreeEntry) -> WorktreeResult<()> {
        self.engine.check_cancelled()?;
        let on_disk = self.engine.on_disk_path(&entry.path);
        let walker = StatusWalker::new(self.engine.store);
        let (status, metadata) = walker.get_file_status(Some(entry), &on_disk)?;

        if status == StatusCode::Obstructed {
            self.reports.push((entry.path.clone(), CheckoutReport::Obstructed));
            return Ok(());
        }
        if status == StatusCode::Conflict {
            self.reports.push((entry.path.clone(), CheckoutReport::CannotUpdate));
            return Ok(());
        }

        let tree_exec = te.mode.is_executable();
        if entry.commit_sha1 == Some(self.engine.base_commit_id) && entry.mode.executable == tree_exec {
            self.sync_timestamps(entry, metadata.as_ref());
            self.reports.push((entry.path.clone(), CheckoutReport::Exists));
            return Ok(());
        }

        if entry.blob_sha1 == Some(te.oid) {
            self.sync_timestamps(entry, metadata.as_ref());
            self.reports.push((entry.path.clone(), CheckoutReport::Exists));
            return Ok(());
        }

        if status == StatusCode::Delete {
            let mut new_entry = entry.clone();
            new_entry.blob_sha1 = Some(te.oid);
            new_entry.commit_sha1 = Some(self.engine.base_commit_id);
            new_entry.mode = mode_for(te.mode);
            self.pending.push(PendingOp::Update(new_entry));
            self.reports.push((entry.path.clone(), CheckoutReport::Merge));
            return Ok(());
        }

        if status == StatusCode::ModeChange {
            install_mode_change(&on_disk, te.mode)?;
            let mut new_entry = entry.clone();
            new_entry.mode = mode_for(te.mode);
            self.pending.push(PendingOp::Update(new_entry));
            self.reports.push((entry.path.clone(), CheckoutReport::ModeChange));
            return Ok(());
        }

        let mut new_entry = entry.clone();
        let survived = if te.mode.is_link() {
            let target = String::from_utf8_lossy(&self.engine.store.read_blob(te.oid)?).into_owned();
            install_checkout_symlink(&on_disk, self.engine.root, self.engine.meta_dir, &target)?;
            new_entry.mode = IndexMode::symlink();
            false
        } else {
            let three_way = ThreeWayMerger::new(self.engine.store, self.engine.merger);
            let outcome = three_way.merge_file(
                &on_disk,
                entry.blob_sha1,
                te.oid,
                &format!("base commit {}", self.engine.base_commit_id),
                "checkout",
                te.mode.as_u32() & 0o777,
            )?;
            new_entry.mode = mode_for(te.mode);
            !outcome.local_changes_subsumed
        };
        new_entry.blob_sha1 = Some(te.oid);
        new_entry.commit_sha1 = Some(self.engine.base_commit_id);

        if survived {
            // local changes were not fully absorbed by the merge: leave
            // timestamps stale so a later status walk still reports it
            self.reports.push((entry.path.clone(), CheckoutReport::Merge));
        } else {
            if let Ok(metadata) = std::fs::symlink_metadata(&on_disk) {
                new_entry.ctime = crate::time::Timestamp::ctime(&metadata);
                new_entry.mtime = crate::time::Timestamp::mtime(&metadata);
                new_entry.size_low32 = metadata.size() as u32;
            }
            self.reports.push((entry.path.clone(), CheckoutReport::Update));
        }
        self.pending.push(PendingOp::Update(new_entry));
        Ok(())
    }

    /// `delete_blob` (§4.5 diff_old).
    fn diff_old(&mut self, entry: &IndexEntry) -> WorktreeResult<()> {
        self.engine.check_cancelled()?;
        let on_disk = self.engine.on_disk_path(&entry.path);
        let walker = StatusWalker::new(self.engine.store);
        let (status, _) = walker.get_file_status(Some(entry), &on_disk)?;

        match status {
            StatusCode::Modify | StatusCode::Add | StatusCode::Conflict | StatusCode::ModeChange => {
                let mut staged = entry.clone();
                staged.stage = Stage::Add;
                self.pending.push(PendingOp::Update(staged));
                self.reports.push((entry.path.clone(), CheckoutReport::Merge));
            }
            _ => {
                remove_and_prune(&on_disk, self.engine.root)?;
                self.pending.push(PendingOp::Remove(entry.path.clone()));
                self.reports.push((entry.path.clone(), CheckoutReport::Delete));
            }
        }
        Ok(())
    }

    /// directories `mkdir`; blob/symlink entries install fresh with no
    /// prior index row (§4.5 diff_new).
    fn diff_new(&mut self, te: &TreeEntry, path: &RepoPath) -> WorktreeResult<()> {
        self.engine.check_cancelled()?;
        let on_disk = self.engine.on_disk_path(path);

        if te.mode.is_tree() {
            match std::fs::create_dir(&on_disk) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }

        if let Some(parent) = on_disk.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entry = if te.mode.is_link() {
            let target = String::from_utf8_lossy(&self.engine.store.read_blob(te.oid)?).into_owned();
            install_checkout_symlink(&on_disk, self.engine.root, self.engine.meta_dir, &target)?;
            IndexEntry::new(path.clone(), IndexMode::symlink())
        } else {
            let content = self.engine.store.read_blob(te.oid)?;
            std::fs::write(&on_disk, &content)?;
            let mut perms = std::fs::metadata(&on_disk)?.permissions();
            perms.set_mode(te.mode.as_u32() & 0o777);
            std::fs::set_permissions(&on_disk, perms)?;
            IndexEntry::new(path.clone(), mode_for(te.mode))
        };

        entry.blob_sha1 = Some(te.oid);
        entry.commit_sha1 = Some(self.engine.base_commit_id);
        if let Ok(metadata) = std::fs::symlink_metadata(&on_disk) {
            entry.ctime = crate::time::Timestamp::ctime(&metadata);
            entry.mtime = crate::time::Timestamp::mtime(&metadata);
            entry.size_low32 = metadata.size() as u32;
        }
        self.pending.push(PendingOp::Update(entry));
        Ok(())
    }
}

impl<'a, 'b> CheckoutApplier<'a, 'b> {
    fn sync_timestamps(&mut self, entry: &IndexEntry, metadata: Option<&std::fs::Metadata>) {
        let Some(metadata) = metadata else { return };
        let mut updated = entry.clone();
        updated.ctime = crate::time::Timestamp::ctime(metadata);
        updated.mtime = crate::time::Timestamp::mtime(metadata);
        updated.size_low32 = metadata.size() as u32;
        self.pending.push(PendingOp::Update(updated));
    }
}

fn mode_for(file_mode: FileMode) -> IndexMode {
    if file_mode.is_link() { IndexMode::symlink() } else { IndexMode::regular(file_mode.is_executable()) }
}

fn install_mode_change(on_disk: &Path, file_mode: FileMode) -> WorktreeResult<()> {
    let mut perms = std::fs::metadata(on_disk)?.permissions();
    perms.set_mode(file_mode.as_u32() & 0o777);
    std::fs::set_permissions(on_disk, perms)?;
    Ok(())
}

fn install_checkout_symlink(on_disk: &Path, root: &Path, meta_dir: &Path, target: &str) -> WorktreeResult<()> {
    if is_bad_symlink_target(target, on_disk, root, meta_dir) {
        if let Some(parent) = on_disk.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(on_disk, target.as_bytes())?;
        let mut perms = std::fs::metadata(on_disk)?.permissions();
        perms.set_mode(0o644);
        std::fs::set_permissions(on_disk, perms)?;
        return Ok(());
    }
    install_symlink(target, on_disk, true)?;
    Ok(())
}

/// remove the file and `rmdir` now-empty parent directories up to (but
/// excluding) the worktree root, stopping at the first non-empty one
/// (§4.5 diff_old).
fn remove_and_prune(path: &Path, root: &Path) -> WorktreeResult<()> {
    std::fs::remove_file(path)?;
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) {
            break;
        }
        match std::fs::remove_dir(d) {
            Ok(()) => dir = d.parent(),
            Err(_) => break, // ENOTEMPTY or otherwise: stop pruning upward
        }
    }
    Ok(())
}
