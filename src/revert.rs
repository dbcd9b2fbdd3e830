//! Revert (§4.10): discards local modifications to a set of tracked
//! paths by re-installing each one's base blob, or untracking it if it
//! was only ever an uncommitted add. grounded on the teacher's
//! `reset.rs` (`BitIndex::reset` walking entries and rewriting them in
//! place) and `checkout.rs`'s symlink-aware install helpers.

use crate::error::WorktreeResult;
use crate::index::{FileIndex, IndexMode, Stage};
use crate::objstore::ObjectStore;
use crate::path::RepoPath;
use crate::status::{StatusCode, StatusWalker};
use crate::symlink::{install_symlink, is_bad_symlink_target};
use crate::worktree::Worktree;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

pub struct RevertEngine<'a> {
    store: &'a dyn ObjectStore,
}

impl<'a> RevertEngine<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self { store }
    }

    /// revert each of `paths` (§4.10 Revert), returning the status each
    /// one reported before being reverted. paths absent from the index
    /// are skipped rather than erroring, since a caller driving this from
    /// a status listing may race with a concurrent untrack.
    pub fn revert_paths(
        &self,
        worktree: &Worktree,
        index: &mut FileIndex,
        paths: &[RepoPath],
    ) -> WorktreeResult<Vec<(RepoPath, StatusCode)>> {
        let walker = StatusWalker::new(self.store);
        let mut out = Vec::new();

        for path in paths {
            let Some(entry) = index.entry_get(path).cloned() else { continue };
            let on_disk_path = worktree.on_disk_path(path);
            let (status, _) = walker.get_file_status(Some(&entry), &on_disk_path)?;

            match status {
                StatusCode::Add => {
                    index.entry_remove(path);
                }
                StatusCode::Delete
                | StatusCode::Modify
                | StatusCode::ModeChange
                | StatusCode::Conflict
                | StatusCode::Missing => {
                    if let Some(blob_id) = entry.blob_sha1 {
                        self.reinstall(worktree, &on_disk_path, blob_id, &entry.mode)?;
                        index.entry_update(path, &on_disk_path, Some(blob_id), entry.commit_sha1, true)?;
                    }
                }
                _ => {}
            }
            out.push((path.clone(), status));
        }
        Ok(out)
    }

    /// write `blob_id`'s content back to `on_disk_path`, going through the
    /// symlink-safety check when the entry is a symlink (§4.4).
    fn reinstall(
        &self,
        worktree: &Worktree,
        on_disk_path: &Path,
        blob_id: crate::hash::ObjectId,
        mode: &IndexMode,
    ) -> WorktreeResult<()> {
        if let Some(parent) = on_disk_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if mode.file_type.is_symlink() {
            let target = String::from_utf8_lossy(&self.store.read_blob(blob_id)?).into_owned();
            if is_bad_symlink_target(&target, on_disk_path, &worktree.root_path, &worktree.meta_dir()) {
                std::fs::write(on_disk_path, target.as_bytes())?;
                let mut perms = std::fs::metadata(on_disk_path)?.permissions();
                perms.set_mode(0o644);
                std::fs::set_permissions(on_disk_path, perms)?;
            } else {
                let _ = std::fs::remove_file(on_disk_path);
                install_symlink(&target, on_disk_path, true)?;
            }
            return Ok(());
        }

        let content = self.store.read_blob(blob_id)?;
        std::fs::write(on_disk_path, &content)?;
        let mut perms = std::fs::metadata(on_disk_path)?.permissions();
        perms.set_mode(if mode.executable { 0o755 } else { 0o644 });
        std::fs::set_permissions(on_disk_path, perms)?;
        Ok(())
    }
}

/// clear every entry's staging fields without touching the working
/// tree or `blob_sha1`/`commit_sha1` (§4.10 rebase `abort`: the index's
/// view of "committed" content is untouched, only in-progress staging
/// is discarded before the base tree is checked out over it).
pub fn revert_all(index: &mut FileIndex) {
    let paths: Vec<RepoPath> = index.paths().cloned().collect();
    for path in paths {
        index.entry_stage_set(&path, Stage::None);
        index.entry_staged_filetype_set(&path, None);
        if let Some(entry) = index.entry_get_mut(&path) {
            entry.staged_blob_sha1 = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexEntry;
    use crate::objstore::{Signature, Tree};
    use crate::path::RepoPath;
    use crate::refstore::{RefHandle, RefStore};
    use crate::testutil::FakeObjectStore;
    use crate::time::DateTime;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeRefs {
        values: Mutex<HashMap<String, crate::hash::ObjectId>>,
    }

    impl RefStore for FakeRefs {
        fn open(&self, _name: &str, _lock: bool) -> WorktreeResult<Box<dyn RefHandle>> {
            unimplemented!("not exercised by revert tests")
        }
        fn resolve(&self, name: &str) -> WorktreeResult<crate::hash::ObjectId> {
            self.values
                .lock()
                .unwrap()
                .get(name)
                .copied()
                .ok_or_else(|| crate::error::WorktreeError::WorktreeMeta(format!("no such ref {name}")))
        }
        fn try_resolve(&self, name: &str) -> WorktreeResult<Option<crate::hash::ObjectId>> {
            Ok(self.values.lock().unwrap().get(name).copied())
        }
        fn alloc(&self, name: &str, id: crate::hash::ObjectId) -> WorktreeResult<()> {
            self.values.lock().unwrap().insert(name.to_owned(), id);
            Ok(())
        }
        fn alloc_symref(&self, _name: &str, _target: &str) -> WorktreeResult<()> {
            unimplemented!("not exercised by revert tests")
        }
        fn get_symref_target(&self, _name: &str) -> WorktreeResult<Option<String>> {
            Ok(None)
        }
        fn delete(&self, name: &str) -> WorktreeResult<()> {
            self.values.lock().unwrap().remove(name);
            Ok(())
        }
        fn exists(&self, name: &str) -> WorktreeResult<bool> {
            Ok(self.values.lock().unwrap().contains_key(name))
        }
    }

    fn sig() -> Signature {
        Signature { name: "a".into(), email: "a@example.com".into(), time: DateTime::new(0, 0) }
    }

    #[test]
    fn modified_file_is_reverted_to_base_blob() {
        let store = FakeObjectStore::default();
        let blob = store.put_blob(b"base content");
        let empty_tree = store.put_tree(Tree::default());
        let base_commit = store.commit_create(empty_tree, &[], sig(), sig(), "initial").unwrap();

        let refs = FakeRefs::default();
        refs.alloc("refs/heads/main", base_commit).unwrap();

        let repo_dir = tempdir().unwrap();
        let wt_dir = tempdir().unwrap();
        std::fs::write(wt_dir.path().join("a.txt"), b"locally edited").unwrap();

        let store_arc: Arc<dyn ObjectStore> = Arc::new(store);
        let refs_arc: Arc<dyn RefStore> = Arc::new(refs);
        let worktree = Worktree::init(
            wt_dir.path(),
            "refs/heads/main",
            RepoPath::root(),
            repo_dir.path(),
            store_arc.clone(),
            refs_arc,
        )
        .unwrap();

        let mut index = FileIndex::alloc();
        let mut entry = IndexEntry::new(RepoPath::new("a.txt"), IndexMode::regular(false));
        entry.blob_sha1 = Some(blob);
        entry.commit_sha1 = Some(base_commit);
        index.entry_add(entry);

        let engine = RevertEngine::new(store_arc.as_ref());
        let reverted = engine.revert_paths(&worktree, &mut index, &[RepoPath::new("a.txt")]).unwrap();

        assert_eq!(reverted.len(), 1);
        assert_eq!(std::fs::read(wt_dir.path().join("a.txt")).unwrap(), b"base content");
    }

    #[test]
    fn added_path_is_untracked_without_touching_disk() {
        let store = FakeObjectStore::default();
        let empty_tree = store.put_tree(Tree::default());
        let base_commit = store.commit_create(empty_tree, &[], sig(), sig(), "initial").unwrap();
        let refs = FakeRefs::default();
        refs.alloc("refs/heads/main", base_commit).unwrap();

        let repo_dir = tempdir().unwrap();
        let wt_dir = tempdir().unwrap();
        std::fs::write(wt_dir.path().join("new.txt"), b"brand new").unwrap();

        let store_arc: Arc<dyn ObjectStore> = Arc::new(store);
        let refs_arc: Arc<dyn RefStore> = Arc::new(refs);
        let worktree = Worktree::init(
            wt_dir.path(),
            "refs/heads/main",
            RepoPath::root(),
            repo_dir.path(),
            store_arc.clone(),
            refs_arc,
        )
        .unwrap();

        let mut index = FileIndex::alloc();
        index.entry_add(IndexEntry::new(RepoPath::new("new.txt"), IndexMode::regular(false)));

        let engine = RevertEngine::new(store_arc.as_ref());
        engine.revert_paths(&worktree, &mut index, &[RepoPath::new("new.txt")]).unwrap();

        assert!(index.entry_get(&RepoPath::new("new.txt")).is_none());
        assert!(wt_dir.path().join("new.txt").exists());
    }
}
