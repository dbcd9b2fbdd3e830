//! `MergeDriver` (§4.7): the two-tree merge used by rebase/histedit/
//! integrate to apply an upstream tree-to-tree change onto the working
//! copy. adapted from the teacher's tree-iterator merge-join idiom in
//! `diff.rs` (`DiffTreeIterator`/`TreeIteratorEntry`), generalized to
//! compare two trees directly instead of an index against one tree.

use crate::error::{WorktreeError, WorktreeResult};
use crate::hash::ObjectId;
use crate::index::{FileIndex, IndexEntry, IndexMode};
use crate::linemerge::LineMerger;
use crate::merge::three_way::ThreeWayMerger;
use crate::obj::FileMode;
use crate::objstore::{tree_entry_is_submodule, ObjectStore, Tree, TreeEntry};
use crate::path::RepoPath;
use crate::status::{StatusCode, StatusWalker};
use std::cmp::Ordering;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct TreeDiffEntry {
    pub path: RepoPath,
    pub blob1: Option<(ObjectId, FileMode)>,
    pub blob2: Option<(ObjectId, FileMode)>,
}

enum Side {
    Left,
    Right,
}

fn diff_tree_to_tree(
    store: &dyn ObjectStore,
    tree1: ObjectId,
    tree2: ObjectId,
) -> WorktreeResult<Vec<TreeDiffEntry>> {
    let mut out = Vec::new();
    let t1 = store.read_tree(tree1)?;
    let t2 = store.read_tree(tree2)?;
    diff_trees_at(store, &t1, &t2, &RepoPath::root(), &mut out)?;
    Ok(out)
}

fn diff_trees_at(
    store: &dyn ObjectStore,
    t1: &Tree,
    t2: &Tree,
    prefix: &RepoPath,
    out: &mut Vec<TreeDiffEntry>,
) -> WorktreeResult<()> {
    let mut e1: Vec<&TreeEntry> = t1.entries.iter().collect();
    e1.sort_by(|a, b| RepoPath::path_cmp_explicit(&a.name, a.mode.is_tree(), &b.name, b.mode.is_tree()));
    let mut e2: Vec<&TreeEntry> = t2.entries.iter().collect();
    e2.sort_by(|a, b| RepoPath::path_cmp_explicit(&a.name, a.mode.is_tree(), &b.name, b.mode.is_tree()));

    let mut i = 0usize;
    let mut j = 0usize;
    loop {
        let a = e1.get(i);
        let b = e2.get(j);
        match (a, b) {
            (None, None) => break,
            (Some(a), None) => {
                emit_side(store, prefix, a, Side::Left, out)?;
                i += 1;
            }
            (None, Some(b)) => {
                emit_side(store, prefix, b, Side::Right, out)?;
                j += 1;
            }
            (Some(a), Some(b)) => match RepoPath::path_cmp_explicit(&a.name, a.mode.is_tree(), &b.name, b.mode.is_tree()) {
                Ordering::Less => {
                    emit_side(store, prefix, a, Side::Left, out)?;
                    i += 1;
                }
                Ordering::Greater => {
                    emit_side(store, prefix, b, Side::Right, out)?;
                    j += 1;
                }
                Ordering::Equal => {
                    if a.oid != b.oid || a.mode != b.mode {
                        match (a.mode.is_tree(), b.mode.is_tree()) {
                            (true, true) => {
                                let sub_prefix = prefix.join(&a.name);
                                let ta = store.read_tree(a.oid)?;
                                let tb = store.read_tree(b.oid)?;
                                diff_trees_at(store, &ta, &tb, &sub_prefix, out)?;
                            }
                            (true, false) => {
                                let sub_prefix = prefix.join(&a.name);
                                let ta = store.read_tree(a.oid)?;
                                diff_trees_at(store, &ta, &Tree::default(), &sub_prefix, out)?;
                                out.push(TreeDiffEntry {
                                    path: prefix.join(&b.name),
                                    blob1: None,
                                    blob2: Some((b.oid, b.mode)),
                                });
                            }
                            (false, true) => {
                                let sub_prefix = prefix.join(&b.name);
                                let tb = store.read_tree(b.oid)?;
                                out.push(TreeDiffEntry {
                                    path: prefix.join(&a.name),
                                    blob1: Some((a.oid, a.mode)),
                                    blob2: None,
                                });
                                diff_trees_at(store, &Tree::default(), &tb, &sub_prefix, out)?;
                            }
                            (false, false) => out.push(TreeDiffEntry {
                                path: prefix.join(&a.name),
                                blob1: Some((a.oid, a.mode)),
                                blob2: Some((b.oid, b.mode)),
                            }),
                        }
                    }
                    i += 1;
                    j += 1;
                }
            },
        }
    }
    Ok(())
}

fn emit_side(
    store: &dyn ObjectStore,
    prefix: &RepoPath,
    entry: &TreeEntry,
    side: Side,
    out: &mut Vec<TreeDiffEntry>,
) -> WorktreeResult<()> {
    if tree_entry_is_submodule(entry) {
        return Ok(());
    }
    if entry.mode.is_tree() {
        let sub_prefix = prefix.join(&entry.name);
        let subtree = store.read_tree(entry.oid)?;
        match side {
            Side::Left => diff_trees_at(store, &subtree, &Tree::default(), &sub_prefix, out),
            Side::Right => diff_trees_at(store, &Tree::default(), &subtree, &sub_prefix, out),
        }
    } else {
        out.push(match side {
            Side::Left => TreeDiffEntry {
                path: prefix.join(&entry.name),
                blob1: Some((entry.oid, entry.mode)),
                blob2: None,
            },
            Side::Right => TreeDiffEntry {
                path: prefix.join(&entry.name),
                blob1: None,
                blob2: Some((entry.oid, entry.mode)),
            },
        });
        Ok(())
    }
}

/// pre-flight check (§4.7): refuses a merge if any index entry records a
/// `commit_sha1` other than the worktree base, or currently reports
/// `CONFLICT`.
pub fn check_merge_ok(
    index: &FileIndex,
    base_commit: ObjectId,
    store: &dyn ObjectStore,
    root: &Path,
) -> WorktreeResult<()> {
    let walker = StatusWalker::new(store);
    for entry in index.iter() {
        if let Some(commit) = entry.commit_sha1 {
            if commit != base_commit {
                return Err(WorktreeError::MixedCommits);
            }
        }
        let on_disk = root.join(entry.path.as_str());
        let (status, _) = walker.get_file_status(Some(entry), &on_disk)?;
        if status == StatusCode::Conflict {
            return Err(WorktreeError::Conflicts);
        }
    }
    Ok(())
}

pub struct MergeDriver<'a> {
    store: &'a dyn ObjectStore,
    three_way: ThreeWayMerger<'a>,
}

impl<'a> MergeDriver<'a> {
    pub fn new(store: &'a dyn ObjectStore, merger: &'a dyn LineMerger) -> Self {
        Self { store, three_way: ThreeWayMerger::new(store, merger) }
    }

    /// apply the `tree1 -> tree2` change onto `index`/`root`, returning
    /// the set of paths that were merged (§4.7).
    pub fn merge_files(
        &self,
        index: &mut FileIndex,
        root: &Path,
        base_commit: ObjectId,
        tree1: ObjectId,
        tree2: ObjectId,
        ancestor_label: &str,
        derived_label: &str,
    ) -> WorktreeResult<Vec<RepoPath>> {
        check_merge_ok(index, base_commit, self.store, root)?;
        let diff = diff_tree_to_tree(self.store, tree1, tree2)?;
        let walker = StatusWalker::new(self.store);
        let mut merged_paths = Vec::new();

        for change in diff {
            let on_disk = root.join(change.path.as_str());
            match (change.blob1, change.blob2) {
                (Some((id1, _mode1)), Some((id2, mode2))) => {
                    if id1 == id2 {
                        continue;
                    }
                    let existing = index.entry_get(&change.path).cloned();
                    let (status, _) = walker.get_file_status(existing.as_ref(), &on_disk)?;
                    if status == StatusCode::Delete {
                        merged_paths.push(change.path.clone());
                        continue;
                    }
                    if !matches!(
                        status,
                        StatusCode::NoChange | StatusCode::Modify | StatusCode::Conflict | StatusCode::Add
                    ) {
                        continue;
                    }
                    self.three_way.merge_file(
                        &on_disk,
                        Some(id1),
                        id2,
                        ancestor_label,
                        derived_label,
                        mode2.as_u32() & 0o777,
                    )?;
                    if let Some(entry) = index.entry_get_mut(&change.path) {
                        entry.blob_sha1 = Some(id2);
                    }
                    merged_paths.push(change.path.clone());
                }
                (Some(id1_mode), None) => {
                    let (id1, _) = id1_mode;
                    let existing = index.entry_get(&change.path).cloned();
                    let (status, _) = walker.get_file_status(existing.as_ref(), &on_disk)?;
                    match status {
                        StatusCode::NoChange => {
                            let _ = std::fs::remove_file(&on_disk);
                            index.entry_mark_deleted_from_disk(&change.path);
                            merged_paths.push(change.path.clone());
                        }
                        StatusCode::Add | StatusCode::Modify => {
                            let current = std::fs::read(&on_disk)?;
                            if self.store.write_blob(&current)? == id1 {
                                let _ = std::fs::remove_file(&on_disk);
                                index.entry_mark_deleted_from_disk(&change.path);
                                merged_paths.push(change.path.clone());
                            }
                            // else: local content diverges from the blob being
                            // deleted upstream; keep the file (CANNOT_DELETE)
                        }
                        _ => {} // CANNOT_DELETE: leave the path untouched
                    }
                }
                (None, Some((id2, mode2))) => {
                    let existing = index.entry_get(&change.path).cloned();
                    if let Some(existing) = existing {
                        let (status, _) = walker.get_file_status(Some(&existing), &on_disk)?;
                        if matches!(
                            status,
                            StatusCode::NoChange
                                | StatusCode::Modify
                                | StatusCode::Conflict
                                | StatusCode::Add
                        ) {
                            self.three_way.merge_file(
                                &on_disk,
                                None,
                                id2,
                                ancestor_label,
                                derived_label,
                                mode2.as_u32() & 0o777,
                            )?;
                            merged_paths.push(change.path.clone());
                        }
                    } else {
                        let content = self.store.read_blob(id2)?;
                        if let Some(parent) = on_disk.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::write(&on_disk, &content)?;
                        let mut perms = std::fs::metadata(&on_disk)?.permissions();
                        perms.set_mode(mode2.as_u32() & 0o777);
                        std::fs::set_permissions(&on_disk, perms)?;

                        let mut new_entry =
                            IndexEntry::new(change.path.clone(), IndexMode::regular(mode2.is_executable()));
                        new_entry.blob_sha1 = Some(id2);
                        index.entry_add(new_entry);
                        merged_paths.push(change.path.clone());
                    }
                }
                (None, None) => unreachable!("merge-join never emits an entry with both sides absent"),
            }
        }
        Ok(merged_paths)
    }
}
