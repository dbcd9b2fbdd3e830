//! the rebase state machine (§3.5, §4.10): replays the commits on a
//! branch onto a new base one at a time, persisting progress in
//! per-worktree ref markers so `continue`/`abort` survive a crash
//! between commits. adapted from the teacher's `cherrypick.rs`
//! (thin, self-consuming `BitRepo` methods wrapping `merge_with_base`)
//! generalized from a single cherry-pick into the marker-tracked
//! multi-commit loop §4.10 describes.

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

/// the four markers re-opened by `continue_` (§4.10 "Continue re-opens
/// all four").
pub struct RebaseState {
    pub tip: ObjectId,
    pub newbase_target: String,
    pub rebase_branch_target: String,
}

pub struct RebaseMachine<'a> {
    store: &'a dyn ObjectStore,
    merger: &'a dyn LineMerger,
}

impl<'a> RebaseMachine<'a> {
    pub fn new(store: &'a dyn ObjectStore, merger: &'a dyn LineMerger) -> Self {
        Self { store, merger }
    }

    pub fn in_progress(worktree: &Worktree) -> bool {
        worktree.head_ref_name == markers::marker(worktree, markers::REBASE_TMP)
    }

    /// §4.10 `prepare`: create `rebase-tmp` at `onto`'s commit, point
    /// `newbase`/`rebase-branch` back at the branch currently checked out,
    /// switch the head ref to `rebase-tmp`, and check out `onto`'s tree.
    pub fn prepare(
        &self,
        worktree: &mut Worktree,
        index: &mut FileIndex,
        onto_branch: &str,
        cancel_cb: &dyn Fn() -> bool,
    ) -> WorktreeResult<()> {
        let refs = worktree.refs();
        let onto_id = refs.resolve(onto_branch)?;
        let rebased_branch = worktree.head_ref_name.clone();

        let tmp = markers::marker(worktree, markers::REBASE_TMP);
        let newbase = markers::marker(worktree, markers::NEWBASE);
        let rebase_branch = markers::marker(worktree, markers::REBASE_BRANCH);

        refs.alloc(&tmp, onto_id)?;
        refs.alloc_symref(&newbase, &rebased_branch)?;
        refs.alloc_symref(&rebase_branch, &rebased_branch)?;
        worktree.set_head_ref_name(&tmp)?;

        let new_tree = self.store.read_commit(onto_id)?.tree;
        let meta_dir = worktree.meta_dir();
        let engine = CheckoutEngine::new(
            self.store,
            self.merger,
            &worktree.root_path,
            &meta_dir,
            worktree.base_commit_id,
            cancel_cb,
        );
        engine.checkout_files(index, new_tree, onto_id)?;
        worktree.set_base_commit_id(onto_id)?;
        Ok(())
    }

    /// §4.10 `continue`: re-open all four markers and report where the
    /// rebase currently stands. Errors if the worktree is not mid-rebase.
    pub fn continue_(&self, worktree: &Worktree) -> WorktreeResult<RebaseState> {
        if !Self::in_progress(worktree) {
            return Err(WorktreeError::WorktreeMeta("no rebase in progress".to_owned()));
        }
        let refs = worktree.refs();
        let tip = refs.resolve(&markers::marker(worktree, markers::REBASE_TMP))?;
        let newbase_target = refs
            .get_symref_target(&markers::marker(worktree, markers::NEWBASE))?
            .ok_or_else(|| WorktreeError::WorktreeMeta("missing newbase marker".to_owned()))?;
        let rebase_branch_target = refs
            .get_symref_target(&markers::marker(worktree, markers::REBASE_BRANCH))?
            .ok_or_else(|| WorktreeError::WorktreeMeta("missing rebase-branch marker".to_owned()))?;
        Ok(RebaseState { tip, newbase_target, rebase_branch_target })
    }

    /// §4.10 `store_commit_id`: records which upstream commit is being
    /// replayed so a crash-and-retry can confirm it's resuming the same
    /// one rather than silently skipping or repeating work.
    pub fn store_commit_id(&self, worktree: &Worktree, commit_id: ObjectId) -> WorktreeResult<()> {
        let refs = worktree.refs();
        let marker_name = markers::marker(worktree, markers::REBASE_COMMIT);
        match refs.try_resolve(&marker_name)? {
            Some(existing) if existing != commit_id =>
                Err(WorktreeError::RebaseCommitId { expected: existing, found: commit_id }),
            Some(_) => Ok(()),
            None => refs.alloc(&marker_name, commit_id),
        }
    }

    /// §4.10 `rebase_merge_files`: apply `commit_id`'s own change (against
    /// its parent) onto the working copy, returning the paths touched.
    pub fn rebase_merge_files(
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

    /// §4.10 `rebase_commit`: commit only `merged_paths` with the original
    /// commit's author/committer, advance `rebase-tmp`, and clear the
    /// retry marker.
    pub fn rebase_commit(
        &self,
        worktree: &mut Worktree,
        index: &mut FileIndex,
        merged_paths: &[RepoPath],
        original_author: Signature,
        original_committer: Signature,
        message: &str,
    ) -> WorktreeResult<ObjectId> {
        let marker_name = markers::marker(worktree, markers::REBASE_COMMIT);
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

    /// §4.10 `complete`: fast-forward the rebased branch to `rebase-tmp`'s
    /// tip, restore the head ref, and tear down the markers.
    pub fn complete(&self, worktree: &mut Worktree) -> WorktreeResult<()> {
        let state = self.continue_(worktree)?;
        let refs = worktree.refs();
        refs.alloc(&state.rebase_branch_target, state.tip)?;
        worktree.set_head_ref_name(&state.rebase_branch_target)?;
        self.delete_markers(worktree)
    }

    /// §4.10 `abort`: restore the head ref and base commit to where they
    /// stood before `prepare`, discard any in-progress staging, and check
    /// out the restored base's tree.
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
        refs.delete(&markers::marker(worktree, markers::REBASE_TMP))?;
        refs.delete(&markers::marker(worktree, markers::NEWBASE))?;
        refs.delete(&markers::marker(worktree, markers::REBASE_BRANCH))?;
        let _ = refs.delete(&markers::marker(worktree, markers::REBASE_COMMIT));
        Ok(())
    }
}
