//! Stage/Unstage (§4.10): a two-phase staging area built directly on
//! the index's `stage`/`staged_blob_sha1` fields rather than a separate
//! structure, mirroring the teacher's `BitIndex` which keeps "staged"
//! state inline on each entry instead of a parallel staging index.

use crate::error::{WorktreeError, WorktreeResult};
use crate::hash::ObjectId;
use crate::index::{FileIndex, IndexEntry, IndexFileType, IndexMode, Stage};
use crate::linemerge::LineMerger;
use crate::merge::ThreeWayMerger;
use crate::obj::FileMode;
use crate::objstore::ObjectStore;
use crate::path::RepoPath;
use crate::status::{StatusCode, StatusWalker};
use crate::worktree::Worktree;

pub struct StageEngine<'a> {
    store: &'a dyn ObjectStore,
    merger: &'a dyn LineMerger,
}

impl<'a> StageEngine<'a> {
    pub fn new(store: &'a dyn ObjectStore, merger: &'a dyn LineMerger) -> Self {
        Self { store, merger }
    }

    /// §4.10 `check_stage_ok`. returns the current status on success,
    /// since `stage_path` needs it to decide add vs. modify vs. delete.
    pub fn check_stage_ok(
        &self,
        worktree: &Worktree,
        index: &FileIndex,
        path: &RepoPath,
    ) -> WorktreeResult<StatusCode> {
        let entry = index.entry_get(path);
        let on_disk_path = worktree.on_disk_path(path);
        let walker = StatusWalker::new(self.store);
        let (status, _) = walker.get_file_status(entry, &on_disk_path)?;

        if status == StatusCode::Conflict {
            return Err(WorktreeError::StageConflict(path.clone()));
        }
        if !matches!(status, StatusCode::Add | StatusCode::Modify | StatusCode::Delete) {
            return Err(WorktreeError::StageNoChange(path.clone()));
        }

        if let Some(entry) = entry {
            let head_id = worktree.refs().resolve(&worktree.head_ref_name)?;
            let is_add = status == StatusCode::Add;
            if worktree.check_out_of_date(path, entry.blob_sha1, head_id, is_add)? {
                return Err(WorktreeError::StageOutOfDate(path.clone()));
            }
        }
        Ok(status)
    }

    /// stage `path`. `patch`, when given, replaces the working file's raw
    /// bytes before hashing — the hunk-selection path (§4.10 "a
    /// patched-content temp file when a hunk-selection callback is
    /// provided").
    pub fn stage_path(
        &self,
        worktree: &Worktree,
        index: &mut FileIndex,
        path: &RepoPath,
        patch: Option<&dyn Fn(&[u8]) -> Vec<u8>>,
    ) -> WorktreeResult<()> {
        let status = self.check_stage_ok(worktree, index, path)?;
        let on_disk_path = worktree.on_disk_path(path);

        if status == StatusCode::Delete {
            index.entry_stage_set(path, Stage::Delete);
            index.entry_staged_filetype_set(path, None);
            if let Some(entry) = index.entry_get_mut(path) {
                entry.staged_blob_sha1 = None;
            }
            return Ok(());
        }

        let raw = std::fs::read(&on_disk_path)?;
        let content = match patch {
            Some(f) => f(&raw),
            None => raw,
        };
        let blob_id = self.store.write_blob(&content)?;
        let metadata = std::fs::symlink_metadata(&on_disk_path)?;
        let file_type = match FileMode::from_metadata(&metadata) {
            FileMode::Link => IndexFileType::Symlink,
            _ => IndexFileType::Regular,
        };

        if index.entry_get(path).is_none() {
            let mode = match file_type {
                IndexFileType::Symlink => IndexMode::symlink(),
                _ => IndexMode::regular(FileMode::from_metadata(&metadata).is_executable()),
            };
            index.entry_add(IndexEntry::new(path.clone(), mode));
        }

        let stage = if status == StatusCode::Add { Stage::Add } else { Stage::Modify };
        index.entry_stage_set(path, stage);
        index.entry_staged_filetype_set(path, Some(file_type));
        if let Some(entry) = index.entry_get_mut(path) {
            entry.staged_blob_sha1 = Some(blob_id);
        }
        Ok(())
    }

    /// unstage `path`, reversing whatever `stage_path` recorded.
    pub fn unstage_path(&self, worktree: &Worktree, index: &mut FileIndex, path: &RepoPath) -> WorktreeResult<()> {
        let stage = index.entry_stage_get(path).filter(|s| *s != Stage::None);
        let Some(stage) = stage else { return Err(WorktreeError::FileNotStaged(path.clone())) };

        match stage {
            Stage::Add => self.clear_stage(index, path),
            Stage::Delete => {
                self.clear_stage(index, path);
                let on_disk_path = worktree.on_disk_path(path);
                if let Some(entry) = index.entry_get_mut(path) {
                    entry.no_file_on_disk = !on_disk_path.exists();
                }
            }
            Stage::Modify => {
                let entry = index
                    .entry_get(path)
                    .cloned()
                    .ok_or_else(|| WorktreeError::FileNotStaged(path.clone()))?;
                let staged_blob = entry
                    .staged_blob_sha1
                    .ok_or_else(|| WorktreeError::FileNotStaged(path.clone()))?;
                let on_disk_path = worktree.on_disk_path(path);
                let st_mode = if entry.mode.executable { 0o755 } else { 0o644 };

                let three_way = ThreeWayMerger::new(self.store, self.merger);
                three_way.merge_file(&on_disk_path, entry.blob_sha1, staged_blob, "index", "working tree", st_mode)?;
                self.clear_stage(index, path);
            }
            Stage::None => unreachable!("filtered above"),
        }
        Ok(())
    }

    fn clear_stage(&self, index: &mut FileIndex, path: &RepoPath) {
        index.entry_stage_set(path, Stage::None);
        index.entry_staged_filetype_set(path, None);
        if let Some(entry) = index.entry_get_mut(path) {
            entry.staged_blob_sha1 = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objstore::Signature;
    use crate::refstore::{RefHandle, RefStore};
    use crate::testutil::{FakeLineMerger, FakeObjectStore};
    use crate::time::DateTime;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeRefs {
        values: Mutex<HashMap<String, ObjectId>>,
    }

    impl RefStore for FakeRefs {
        fn open(&self, _name: &str, _lock: bool) -> WorktreeResult<Box<dyn RefHandle>> {
            unimplemented!("not exercised by stage tests")
        }
        fn resolve(&self, name: &str) -> WorktreeResult<ObjectId> {
            self.values
                .lock()
                .unwrap()
                .get(name)
                .copied()
                .ok_or_else(|| WorktreeError::WorktreeMeta(format!("no such ref {name}")))
        }
        fn try_resolve(&self, name: &str) -> WorktreeResult<Option<ObjectId>> {
            Ok(self.values.lock().unwrap().get(name).copied())
        }
        fn alloc(&self, name: &str, id: ObjectId) -> WorktreeResult<()> {
            self.values.lock().unwrap().insert(name.to_owned(), id);
            Ok(())
        }
        fn alloc_symref(&self, _name: &str, _target: &str) -> WorktreeResult<()> {
            unimplemented!("not exercised by stage tests")
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

    fn setup() -> (FakeObjectStore, ObjectId) {
        let store = FakeObjectStore::default();
        let empty_tree = store.put_tree(crate::objstore::Tree::default());
        let base_commit = store.commit_create(empty_tree, &[], sig(), sig(), "base").unwrap();
        (store, base_commit)
    }

    #[test]
    fn stage_path_records_blob_for_untracked_add() {
        let (store, base_commit) = setup();
        let refs = FakeRefs::default();
        refs.alloc("refs/heads/main", base_commit).unwrap();

        let repo_dir = tempdir().unwrap();
        let wt_dir = tempdir().unwrap();
        std::fs::write(wt_dir.path().join("new.txt"), b"new content").unwrap();

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

        let merger = FakeLineMerger::concat_no_overlap();
        let engine = StageEngine::new(store_arc.as_ref(), &merger);
        engine.stage_path(&worktree, &mut index, &RepoPath::new("new.txt"), None).unwrap();

        let entry = index.entry_get(&RepoPath::new("new.txt")).unwrap();
        assert_eq!(entry.stage, Stage::Add);
        assert!(entry.staged_blob_sha1.is_some());
    }

    #[test]
    fn unstage_add_clears_staging_without_touching_disk() {
        let (store, base_commit) = setup();
        let refs = FakeRefs::default();
        refs.alloc("refs/heads/main", base_commit).unwrap();

        let repo_dir = tempdir().unwrap();
        let wt_dir = tempdir().unwrap();
        std::fs::write(wt_dir.path().join("new.txt"), b"new content").unwrap();

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

        let merger = FakeLineMerger::concat_no_overlap();
        let engine = StageEngine::new(store_arc.as_ref(), &merger);
        let path = RepoPath::new("new.txt");
        engine.stage_path(&worktree, &mut index, &path, None).unwrap();
        engine.unstage_path(&worktree, &mut index, &path).unwrap();

        let entry = index.entry_get(&path).unwrap();
        assert_eq!(entry.stage, Stage::None);
        assert!(entry.staged_blob_sha1.is_none());
        assert_eq!(std::fs::read(wt_dir.path().join("new.txt")).unwrap(), b"new content");
    }
}
