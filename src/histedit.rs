//! the histedit state machine (§3.5, §4.10): identical shape to
//! `rebase` but keyed on its own marker set, plus a `skip_commit`
//! operation that records which commits were dropped rather than
//! replayed. kept as a sibling module to `rebase.rs` rather than a
//! shared generic machine since the two differ in exactly one
//! operation — matching how the teacher keeps `cherrypick.rs` and
//! `reset.rs` as separate thin modules rather than unifying them behind
//! a shared trait.

use crate::checkout::CheckoutEngine;
use crate::commit::CommitBuilder;
use crate::error::{WorktreeError, WorktreeResult};
use crate::hash::ObjectId;
use crate::index::FileIndex;
use crate::linemerge::LineMerger;
use crate::markers;
use crate::merge::MergeDriver;
use crate::objstore::{ObjectStore, Signature};
use crate::path::RepoPath;
use crate::revert;
use crate::worktree::Worktree;
use std::collections::HashSet;

pub struct HisteditState {
    pub tip: ObjectId,
    pub newbase_target: String,
    pub histedit_branch_target: String,
}

pub struct HisteditMachine<'a> {
    store: &'a dyn ObjectStore,
    merger: &'a dyn LineMerger,
}

impl<'a> HisteditMachine<'a> {
    pub fn new(store: &'a dyn ObjectStore, merger: &'a dyn LineMerger) -> Self {
        Self { store, merger }
    }

    pub fn in_progress(worktree: &Worktree) -> bool {
        worktree.head_ref_name == markers::marker(worktree, markers::HISTEDIT_TMP)
    }

    pub fn prepare(
        &self,
        worktree: &mut Worktree,
        index: &mut FileIndex,
        cancel_cb: &dyn Fn() -> bool,
    ) -> WorktreeResult<()> {
        let edited_branch = worktree.head_ref_name.clone();
        let base_commit_id = worktree.base_commit_id;

        let tmp = markers::marker(worktree, markers::HISTEDIT_TMP);
        let newbase = markers::marker(worktree, markers::NEWBASE);
        let histedit_branch = markers::marker(worktree, markers::HISTEDIT_BRANCH);
        let base_commit_marker = markers::marker(worktree, markers::HISTEDIT_BASE_COMMIT);

        let refs = worktree.refs();
        refs.alloc(&tmp, base_commit_id)?;
        refs.alloc_symref(&newbase, &edited_branch)?;
        refs.alloc_symref(&histedit_branch, &edited_branch)?;
        refs.alloc(&base_commit_marker, base_commit_id)?;
        worktree.set_head_ref_name(&tmp)?;

        let base_tree = self.store.read_commit(base_commit_id)?.tree;
        let meta_dir = worktree.meta_dir();
        let engine = CheckoutEngine::new(
            self.store,
            self.merger,
            &worktree.root_path,
            &meta_dir,
            worktree.base_commit_id,
            cancel_cb,
        );
        engine.checkout_files(index, base_tree, base_commit_id)?;
        Ok(())
    }

    pub fn continue_(&self, worktree: &Worktree) -> WorktreeResult<HisteditState> {
        if !Self::in_progress(worktree) {
            return Err(WorktreeError::WorktreeMeta("no histedit in progress".to_owned()));
        }
        let refs = worktree.refs();
        let tip = refs.resolve(&markers::marker(worktree, markers::HISTEDIT_TMP))?;
        let newbase_target = refs
            .get_symref_target(&markers::marker(worktree, markers::NEWBASE))?
            .ok_or_else(|| WorktreeError::WorktreeMeta("missing newbase marker".to_owned()))?;
        let histedit_branch_target = refs
            .get_symref_target(&markers::marker(worktree, markers::HISTEDIT_BRANCH))?
            .ok_or_else(|| WorktreeError::WorktreeMeta("missing histedit-branch marker".to_owned()))?;
        Ok(HisteditState { tip, newbase_target, histedit_branch_target })
    }

    pub fn store_commit_id(&self, worktree: &Worktree, commit_id: ObjectId) -> WorktreeResult<()> {
        let refs = worktree.refs();
        let marker_name = markers::marker(worktree, markers::HISTEDIT_COMMIT);
        match refs.try_resolve(&marker_name)? {
            Some(existing) if existing != commit_id =>
                Err(WorktreeError::HisteditCommitId { expected: existing, found: commit_id }),
            Some(_) => Ok(()),
            None => refs.alloc(&marker_name, commit_id),
        }
    }

    /// §4.10 "`skip_commit` ... records the commit id under
    /// `histedit-commit` and then deletes it (audit log of skipped
    /// commits)": the marker's only purpose is to survive a crash
    /// mid-skip, so it's written and immediately cleared rather than
    /// left as a lasting record.
    pub fn skip_commit(&self, worktree: &Worktree, commit_id: ObjectId) -> WorktreeResult<()> {
        let refs = worktree.refs();
        let marker_name = markers::marker(worktree, markers::HISTEDIT_COMMIT);
        refs.alloc(&marker_name, commit_id)?;
        refs.delete(&marker_name)
    }

    pub fn histedit_merge_files(
        &self,
        worktree: &Worktree,
        index: &mut FileIndex,
        commit_id: ObjectId,
        ancestor_label: &str,
        derived_label: &str,
    ) -> WorktreeResult<Vec<RepoPath>> {
        let commit = self.store.read_commit(commit_id)?;
        let parent_tree = match commit.parents.first() {
            Some(p) => self.store.read_commit(*p)?.tree,
            None => ObjectId::EMPTY_TREE,
        };
        let driver = MergeDriver::new(self.store, self.merger);
        driver.merge_files(
            index,
            &worktree.root_path,
            worktree.base_commit_id,
            parent_tree,
            commit.tree,
            ancestor_label,
            derived_label,
        )
    }

    pub fn histedit_commit(
        &self,
        worktree: &mut Worktree,
        index: &mut FileIndex,
        merged_paths: &[RepoPath],
        original_author: Signature,
        original_committer: Signature,
        message: &str,
    ) -> WorktreeResult<ObjectId> {
        let marker_name = markers::marker(worktree, markers::HISTEDIT_COMMIT);
        if merged_paths.is_empty() {
            worktree.refs().delete(&marker_name)?;
            return Err(WorktreeError::CommitNoChanges);
        }
        let paths: HashSet<RepoPath> = merged_paths.iter().cloned().collect();
        let builder = CommitBuilder::new();
        let commit_id =
            builder.commit_paths(worktree, index, &paths, original_author, original_committer, message)?;
        worktree.refs().delete(&marker_name)?;
        Ok(commit_id)
    }

    pub fn complete(&self, worktree: &mut Worktree) -> WorktreeResult<()> {
        let state = self.continue_(worktree)?;
        let refs = worktree.refs();
        refs.alloc(&state.histedit_branch_target, state.tip)?;
        worktree.set_head_ref_name(&state.histedit_branch_target)?;
        self.delete_markers(worktree)
    }

    pub fn abort(
        &self,
        worktree: &mut Worktree,
        index: &mut FileIndex,
        cancel_cb: &dyn Fn() -> bool,
    ) -> WorktreeResult<()> {
        let state = self.continue_(worktree)?;
        let restored_base = worktree.refs().resolve(&state.newbase_target)?;

        revert::revert_all(index);

        let new_tree = self.store.read_commit(restored_base)?.tree;
        let meta_dir = worktree.meta_dir();
        let engine = CheckoutEngine::new(
            self.store,
            self.merger,
            &worktree.root_path,
            &meta_dir,
            worktree.base_commit_id,
            cancel_cb,
        );
        engine.checkout_files(index, new_tree, restored_base)?;

        worktree.set_head_ref_name(&state.newbase_target)?;
        worktree.set_base_commit_id(restored_base)?;
        self.delete_markers(worktree)
    }

    fn delete_markers(&self, worktree: &Worktree) -> WorktreeResult<()> {
        let refs = worktree.refs();
        refs.delete(&markers::marker(worktree, markers::HISTEDIT_TMP))?;
        refs.delete(&markers::marker(worktree, markers::NEWBASE))?;
        refs.delete(&markers::marker(worktree, markers::HISTEDIT_BRANCH))?;
        refs.delete(&markers::marker(worktree, markers::HISTEDIT_BASE_COMMIT))?;
        let _ = refs.delete(&markers::marker(worktree, markers::HISTEDIT_COMMIT));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objstore::Tree;
    use crate::path::RepoPath;
    use crate::refstore::{RefHandle, RefStore};
    use crate::testutil::{FakeLineMerger, FakeObjectStore};
    use crate::time::DateTime;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeRefs {
        direct: Mutex<HashMap<String, ObjectId>>,
        symrefs: Mutex<HashMap<String, String>>,
    }

    impl RefStore for FakeRefs {
        fn open(&self, _name: &str, _lock: bool) -> WorktreeResult<Box<dyn RefHandle>> {
            unimplemented!("histedit tests drive refs through the free functions only")
        }
        fn resolve(&self, name: &str) -> WorktreeResult<ObjectId> {
            if let Some(target) = self.symrefs.lock().unwrap().get(name).cloned() {
                return self.resolve(&target);
            }
            self.direct
                .lock()
                .unwrap()
                .get(name)
                .copied()
                .ok_or_else(|| WorktreeError::WorktreeMeta(format!("no such ref {name}")))
        }
        fn try_resolve(&self, name: &str) -> WorktreeResult<Option<ObjectId>> {
            Ok(self.resolve(name).ok())
        }
        fn alloc(&self, name: &str, id: ObjectId) -> WorktreeResult<()> {
            self.symrefs.lock().unwrap().remove(name);
            self.direct.lock().unwrap().insert(name.to_owned(), id);
            Ok(())
        }
        fn alloc_symref(&self, name: &str, target: &str) -> WorktreeResult<()> {
            self.direct.lock().unwrap().remove(name);
            self.symrefs.lock().unwrap().insert(name.to_owned(), target.to_owned());
            Ok(())
        }
        fn get_symref_target(&self, name: &str) -> WorktreeResult<Option<String>> {
            Ok(self.symrefs.lock().unwrap().get(name).cloned())
        }
        fn delete(&self, name: &str) -> WorktreeResult<()> {
            self.direct.lock().unwrap().remove(name);
            self.symrefs.lock().unwrap().remove(name);
            Ok(())
        }
        fn exists(&self, name: &str) -> WorktreeResult<bool> {
            Ok(self.direct.lock().unwrap().contains_key(name) || self.symrefs.lock().unwrap().contains_key(name))
        }
    }

    fn sig() -> Signature {
        Signature { name: "a".into(), email: "a@example.com".into(), time: DateTime::new(0, 0) }
    }

    fn no_cancel() -> bool {
        false
    }

    #[test]
    fn skip_commit_leaves_no_lasting_marker() {
        let store = FakeObjectStore::default();
        let empty_tree = store.put_tree(Tree::default());
        let base_commit = store.commit_create(empty_tree, &[], sig(), sig(), "base").unwrap();
        let refs = FakeRefs::default();
        refs.alloc("refs/heads/feature", base_commit).unwrap();

        let repo_dir = tempdir().unwrap();
        let wt_dir = tempdir().unwrap();
        let store_arc: Arc<dyn ObjectStore> = Arc::new(store);
        let refs_arc: Arc<dyn RefStore> = Arc::new(refs);
        let worktree = Worktree::init(
            wt_dir.path(),
            "refs/heads/feature",
            RepoPath::root(),
            repo_dir.path(),
            store_arc.clone(),
            refs_arc,
        )
        .unwrap();

        let merger = FakeLineMerger::concat_no_overlap();
        let machine = HisteditMachine::new(store_arc.as_ref(), &merger);
        let skipped = ObjectId::hash_bytes(b"skipped");
        machine.skip_commit(&worktree, skipped).unwrap();

        let marker_name = markers::marker(&worktree, markers::HISTEDIT_COMMIT);
        assert!(!worktree.refs().exists(&marker_name).unwrap());
    }

    #[test]
    fn prepare_switches_head_to_histedit_tmp() {
        let store = FakeObjectStore::default();
        let empty_tree = store.put_tree(Tree::default());
        let base_commit = store.commit_create(empty_tree, &[], sig(), sig(), "base").unwrap();
        let refs = FakeRefs::default();
        refs.alloc("refs/heads/feature", base_commit).unwrap();

        let repo_dir = tempdir().unwrap();
        let wt_dir = tempdir().unwrap();
        let store_arc: Arc<dyn ObjectStore> = Arc::new(store);
        let refs_arc: Arc<dyn RefStore> = Arc::new(refs);
        let mut worktree = Worktree::init(
            wt_dir.path(),
            "refs/heads/feature",
            RepoPath::root(),
            repo_dir.path(),
            store_arc.clone(),
            refs_arc,
        )
        .unwrap();
        let mut index = FileIndex::alloc();

        let merger = FakeLineMerger::concat_no_overlap();
        let machine = HisteditMachine::new(store_arc.as_ref(), &merger);
        machine.prepare(&mut worktree, &mut index, &no_cancel).unwrap();

        assert!(HisteditMachine::in_progress(&worktree));
    }
}
