//! Integrate (§4.10): fast-forwards the checked-out branch to another
//! branch's tip and checks out the resulting tree. both refs are
//! locked for the duration by going through `RefStore::open` rather
//! than the unlocked `resolve`, grounded on the teacher's `merge.rs`
//! fast-forward path (`BitRepo::merge_ff`) which takes the same
//! precaution before moving a branch pointer.

use crate::checkout::CheckoutEngine;
use crate::error::{WorktreeError, WorktreeResult};
use crate::hash::ObjectId;
use crate::index::FileIndex;
use crate::linemerge::LineMerger;
use crate::objstore::ObjectStore;
use crate::worktree::Worktree;

pub struct IntegrateEngine<'a> {
    store: &'a dyn ObjectStore,
    merger: &'a dyn LineMerger,
}

impl<'a> IntegrateEngine<'a> {
    pub fn new(store: &'a dyn ObjectStore, merger: &'a dyn LineMerger) -> Self {
        Self { store, merger }
    }

    /// fast-forward the worktree's current branch to `from_branch`'s tip.
    pub fn integrate(
        &self,
        worktree: &mut Worktree,
        index: &mut FileIndex,
        from_branch: &str,
        cancel_cb: &dyn Fn() -> bool,
    ) -> WorktreeResult<ObjectId> {
        let current_branch = worktree.head_ref_name.clone();
        if from_branch == current_branch {
            return Err(WorktreeError::SameBranch);
        }

        let refs = worktree.refs();
        let mut current_handle = refs.open(&current_branch, true)?;
        let mut from_handle = refs.open(from_branch, true)?;

        let current_id = current_handle.resolve()?;
        let from_id = from_handle.resolve()?;

        let new_tree = self.store.read_commit(from_id)?.tree;
        let meta_dir = worktree.meta_dir();
        let engine = CheckoutEngine::new(
            self.store,
            self.merger,
            &worktree.root_path,
            &meta_dir,
            worktree.base_commit_id,
            cancel_cb,
        );
        engine.checkout_files(index, new_tree, from_id)?;

        current_handle.change_ref(from_id, Some(current_id))?;
        current_handle.write()?;
        from_handle.unlock();

        worktree.set_base_commit_id(from_id)?;
        Ok(from_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::FileMode;
    use crate::objstore::{Signature, Tree, TreeEntry};
    use crate::path::RepoPath;
    use crate::refstore::{RefHandle, RefStore};
    use crate::testutil::{FakeLineMerger, FakeObjectStore};
    use crate::time::DateTime;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    struct FakeHandle {
        name: String,
        refs: Arc<FakeRefsInner>,
        current: ObjectId,
    }

    impl RefHandle for FakeHandle {
        fn name(&self) -> &str {
            &self.name
        }
        fn resolve(&self) -> WorktreeResult<ObjectId> {
            Ok(self.current)
        }
        fn get_symref_target(&self) -> Option<&str> {
            None
        }
        fn change_ref(&mut self, new: ObjectId, expected_old: Option<ObjectId>) -> WorktreeResult<()> {
            if let Some(expected) = expected_old {
                if expected != self.current {
                    return Err(WorktreeError::WorktreeMeta("cas mismatch".to_owned()));
                }
            }
            self.current = new;
            Ok(())
        }
        fn write(self: Box<Self>) -> WorktreeResult<()> {
            self.refs.values.lock().unwrap().insert(self.name.clone(), self.current);
            self.refs.locked.lock().unwrap().remove(&self.name);
            Ok(())
        }
        fn unlock(self: Box<Self>) {
            self.refs.locked.lock().unwrap().remove(&self.name);
        }
    }

    #[derive(Default)]
    struct FakeRefsInner {
        values: Mutex<HashMap<String, ObjectId>>,
        locked: Mutex<std::collections::HashSet<String>>,
    }

    #[derive(Default)]
    struct FakeRefs(Arc<FakeRefsInner>);

    impl RefStore for FakeRefs {
        fn open(&self, name: &str, _lock: bool) -> WorktreeResult<Box<dyn RefHandle>> {
            let current = self.resolve(name)?;
            self.0.locked.lock().unwrap().insert(name.to_owned());
            Ok(Box::new(FakeHandle { name: name.to_owned(), refs: self.0.clone(), current }))
        }
        fn resolve(&self, name: &str) -> WorktreeResult<ObjectId> {
            self.0
                .values
                .lock()
                .unwrap()
                .get(name)
                .copied()
                .ok_or_else(|| WorktreeError::WorktreeMeta(format!("no such ref {name}")))
        }
        fn try_resolve(&self, name: &str) -> WorktreeResult<Option<ObjectId>> {
            Ok(self.0.values.lock().unwrap().get(name).copied())
        }
        fn alloc(&self, name: &str, id: ObjectId) -> WorktreeResult<()> {
            self.0.values.lock().unwrap().insert(name.to_owned(), id);
            Ok(())
        }
        fn alloc_symref(&self, _name: &str, _target: &str) -> WorktreeResult<()> {
            unimplemented!("not exercised by integrate tests")
        }
        fn get_symref_target(&self, _name: &str) -> WorktreeResult<Option<String>> {
            Ok(None)
        }
        fn delete(&self, name: &str) -> WorktreeResult<()> {
            self.0.values.lock().unwrap().remove(name);
            Ok(())
        }
        fn exists(&self, name: &str) -> WorktreeResult<bool> {
            Ok(self.0.values.lock().unwrap().contains_key(name))
        }
    }

    fn sig() -> Signature {
        Signature { name: "a".into(), email: "a@example.com".into(), time: DateTime::new(0, 0) }
    }

    fn no_cancel() -> bool {
        false
    }

    #[test]
    fn integrate_fast_forwards_and_checks_out_tree() {
        let store = FakeObjectStore::default();
        let empty_tree = store.put_tree(Tree::default());
        let base_commit = store.commit_create(empty_tree, &[], sig(), sig(), "base").unwrap();

        let blob = store.put_blob(b"from feature");
        let feature_tree =
            store.put_tree(Tree { entries: vec![TreeEntry { name: "a.txt".into(), mode: FileMode::Reg, oid: blob }] });
        let feature_commit = store.commit_create(feature_tree, &[base_commit], sig(), sig(), "feature work").unwrap();

        let refs = FakeRefs::default();
        refs.alloc("refs/heads/main", base_commit).unwrap();
        refs.alloc("refs/heads/feature", feature_commit).unwrap();

        let repo_dir = tempdir().unwrap();
        let wt_dir = tempdir().unwrap();
        let store_arc: Arc<dyn ObjectStore> = Arc::new(store);
        let refs_arc: Arc<dyn RefStore> = Arc::new(refs);
        let mut worktree = Worktree::init(
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
        let engine = IntegrateEngine::new(store_arc.as_ref(), &merger);
        let new_id = engine.integrate(&mut worktree, &mut index, "refs/heads/feature", &no_cancel).unwrap();

        assert_eq!(new_id, feature_commit);
        assert_eq!(worktree.base_commit_id, feature_commit);
        assert_eq!(std::fs::read(wt_dir.path().join("a.txt")).unwrap(), b"from feature");
    }

    #[test]
    fn integrate_into_self_is_rejected() {
        let store = FakeObjectStore::default();
        let empty_tree = store.put_tree(Tree::default());
        let base_commit = store.commit_create(empty_tree, &[], sig(), sig(), "base").unwrap();
        let refs = FakeRefs::default();
        refs.alloc("refs/heads/main", base_commit).unwrap();

        let repo_dir = tempdir().unwrap();
        let wt_dir = tempdir().unwrap();
        let store_arc: Arc<dyn ObjectStore> = Arc::new(store);
        let refs_arc: Arc<dyn RefStore> = Arc::new(refs);
        let mut worktree = Worktree::init(
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
        let engine = IntegrateEngine::new(store_arc.as_ref(), &merger);
        let err = engine.integrate(&mut worktree, &mut index, "refs/heads/main", &no_cancel).unwrap_err();
        assert!(matches!(err, WorktreeError::SameBranch));
    }
}
