//! `CommitBuilder` (§4.6, §3.4 `Commitable`): synthesizes a new root tree
//! from the worktree's local changes and creates a commit on top of the
//! worktree's base commit. adapted from the teacher's `BitRepo::commit`/
//! `write_tree` (walking the index against `HEAD^{tree}` to build a fresh
//! tree object), generalized to operate over this crate's `FileIndex`
//! instead of `BitIndex`'s merge-stage-aware rows.

use crate::error::{WorktreeError, WorktreeResult};
use crate::hash::ObjectId;
use crate::index::{FileIndex, IndexFileType, IndexMode, Stage};
use crate::markers;
use crate::obj::FileMode;
use crate::objstore::{tree_entry_is_submodule, ObjectStore, Signature, Tree, TreeEntry};
use crate::path::RepoPath;
use crate::status::{StatusCode, StatusWalker};
use crate::worktree::Worktree;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// a transient view of one index entry's local change, computed fresh for
/// every commit/rebase/stage operation rather than cached (§3.4).
#[derive(Debug, Clone)]
pub struct Commitable {
    pub path: RepoPath,
    pub in_repo_path: RepoPath,
    pub on_disk_path: PathBuf,
    pub status: StatusCode,
    pub staged_status: Option<StatusCode>,
    pub mode: IndexMode,
    pub blob_id: Option<ObjectId>,
    pub base_blob_id: Option<ObjectId>,
    pub staged_blob_id: Option<ObjectId>,
    pub base_commit_id: Option<ObjectId>,
    pub added: bool,
}

/// walk every tracked path, classify its status, and report it as a
/// `Commitable` (§3.4). entries whose on-disk file vanished without being
/// staged as a delete still get an entry so the caller can decide.
pub fn collect_commitables(worktree: &Worktree, index: &FileIndex) -> WorktreeResult<Vec<Commitable>> {
    let walker = StatusWalker::new(worktree.store());
    let mut out = Vec::new();
    for entry in index.iter() {
        let on_disk_path = worktree.on_disk_path(&entry.path);
        let (status, _) = walker.get_file_status(Some(entry), &on_disk_path)?;
        out.push(Commitable {
            path: entry.path.clone(),
            in_repo_path: worktree.in_repo_path(&entry.path),
            on_disk_path,
            status,
            staged_status: entry.is_staged().then_some(status),
            mode: entry.mode,
            blob_id: entry.blob_sha1,
            base_blob_id: entry.blob_sha1,
            staged_blob_id: entry.staged_blob_sha1,
            base_commit_id: entry.commit_sha1,
            added: entry.blob_sha1.is_none() && entry.stage != Stage::Delete,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone)]
enum TreeChange {
    Blob { path: RepoPath, oid: ObjectId, mode: FileMode },
    Delete { path: RepoPath },
}

impl TreeChange {
    fn path(&self) -> &RepoPath {
        match self {
            Self::Blob { path, .. } => path,
            Self::Delete { path } => path,
        }
    }
}

pub struct CommitBuilder;

impl CommitBuilder {
    pub fn new() -> Self {
        Self
    }

    /// commit every commitable path onto the worktree's base commit
    /// (§4.6). on success the worktree's `base_commit_id` and the passed
    /// `index` are updated in place; the caller persists both.
    pub fn commit_worktree(
        &self,
        worktree: &mut Worktree,
        index: &mut FileIndex,
        author: Signature,
        committer: Signature,
        message: &str,
    ) -> WorktreeResult<ObjectId> {
        self.commit_selected(worktree, index, None, author, committer, message)
    }

    /// like `commit_worktree`, but only paths present in `paths` are
    /// considered commitable — used by rebase/histedit to replay a single
    /// upstream commit's change set without sweeping in unrelated local
    /// edits that happen to coexist in the index (§4.10 `rebase_commit`).
    pub fn commit_paths(
        &self,
        worktree: &mut Worktree,
        index: &mut FileIndex,
        paths: &HashSet<RepoPath>,
        author: Signature,
        committer: Signature,
        message: &str,
    ) -> WorktreeResult<ObjectId> {
        self.commit_selected(worktree, index, Some(paths), author, committer, message)
    }

    fn commit_selected(
        &self,
        worktree: &mut Worktree,
        index: &mut FileIndex,
        paths: Option<&HashSet<RepoPath>>,
        author: Signature,
        committer: Signature,
        message: &str,
    ) -> WorktreeResult<ObjectId> {
        if message.trim().is_empty() {
            return Err(WorktreeError::CommitMsgEmpty);
        }

        let store = worktree.store();
        let refs = worktree.refs();
        let mut head_handle = refs.open(&worktree.head_ref_name, true)?;
        let head_id = head_handle.resolve()?;
        if head_id != worktree.base_commit_id {
            head_handle.unlock()?;
            return Err(WorktreeError::CommitHeadChanged);
        }

        let commitables = match collect_commitables(worktree, index) {
            Ok(c) => c
                .into_iter()
                .filter(|c| match paths {
                    Some(p) => p.contains(&c.path),
                    None => true,
                })
                .collect::<Vec<_>>(),
            Err(e) => {
                head_handle.unlock()?;
                return Err(e);
            }
        };

        for c in &commitables {
            if matches!(c.status, StatusCode::Add | StatusCode::Modify | StatusCode::ModeChange | StatusCode::Delete) {
                let ood = worktree.check_out_of_date(&c.in_repo_path, c.base_blob_id, head_id, c.added);
                match ood {
                    Ok(true) => {
                        head_handle.unlock()?;
                        return Err(WorktreeError::CommitOutOfDate(c.path.clone()));
                    }
                    Ok(false) => {}
                    Err(e) => {
                        head_handle.unlock()?;
                        return Err(e);
                    }
                }
            }
            if c.status == StatusCode::Conflict {
                head_handle.unlock()?;
                return Err(WorktreeError::CommitConflict);
            }
        }

        let mut changes = Vec::new();
        for c in &commitables {
            match c.status {
                StatusCode::Add | StatusCode::Modify | StatusCode::ModeChange => {
                    let oid = match c.staged_blob_id {
                        Some(id) => id,
                        None => {
                            let content = std::fs::read(&c.on_disk_path)?;
                            store.write_blob(&content)?
                        }
                    };
                    changes.push(TreeChange::Blob { path: c.in_repo_path.clone(), oid, mode: file_mode_of(&c.mode) });
                }
                StatusCode::Delete => changes.push(TreeChange::Delete { path: c.in_repo_path.clone() }),
                _ => {}
            }
        }

        if changes.is_empty() {
            head_handle.unlock()?;
            return Err(WorktreeError::CommitNoChanges);
        }

        let base_tree = store.read_commit(worktree.base_commit_id)?.tree;
        let new_tree = synthesize_tree(store, base_tree, &RepoPath::root(), &changes)?;
        let commit_id =
            store.commit_create(new_tree, &[worktree.base_commit_id], author, committer, message)?;

        if let Err(e) = head_handle.change_ref(commit_id, Some(head_id)) {
            head_handle.unlock()?;
            return Err(e);
        }
        head_handle.write()?;

        worktree.set_base_commit_id(commit_id)?;
        worktree.refs().alloc(&markers::marker(worktree, markers::BASE), commit_id)?;

        for c in &commitables {
            match c.status {
                StatusCode::Delete => {
                    index.entry_remove(&c.path);
                }
                StatusCode::Add | StatusCode::Modify | StatusCode::ModeChange => {
                    if let Some(entry) = index.entry_get_mut(&c.path) {
                        let new_blob = changes
                            .iter()
                            .find_map(|ch| match ch {
                                TreeChange::Blob { path, oid, .. } if *path == c.in_repo_path => Some(*oid),
                                _ => None,
                            })
                            .unwrap_or(entry.blob_sha1.unwrap_or(ObjectId::UNKNOWN));
                        entry.blob_sha1 = Some(new_blob);
                        entry.commit_sha1 = Some(commit_id);
                        entry.stage = Stage::None;
                        entry.staged_blob_sha1 = None;
                        entry.staged_file_type = None;
                        entry.no_file_on_disk = false;
                    }
                }
                _ => {}
            }
        }

        Ok(commit_id)
    }
}

impl Default for CommitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn file_mode_of(mode: &IndexMode) -> FileMode {
    match mode.file_type {
        IndexFileType::Symlink | IndexFileType::BadSymlink => FileMode::Link,
        IndexFileType::Regular =>
            if mode.executable {
                FileMode::Exec
            } else {
                FileMode::Reg
            },
    }
}

fn path_is_under(path: &RepoPath, prefix: &RepoPath) -> bool {
    if prefix.is_root() {
        return true;
    }
    path.as_str() == prefix.as_str() || path.as_str().starts_with(&format!("{prefix}/"))
}

fn first_component_after<'a>(path: &'a RepoPath, prefix: &RepoPath) -> &'a str {
    let rest = if prefix.is_root() {
        path.as_str()
    } else {
        path.as_str().strip_prefix(prefix.as_str()).unwrap_or(path.as_str()).trim_start_matches('/')
    };
    rest.split('/').next().unwrap_or(rest)
}

fn is_leaf_at(path: &RepoPath, prefix: &RepoPath) -> bool {
    let rest = if prefix.is_root() {
        path.as_str()
    } else {
        path.as_str().strip_prefix(prefix.as_str()).unwrap_or(path.as_str()).trim_start_matches('/')
    };
    !rest.contains('/')
}

/// recursively synthesize a tree at `prefix`, starting from the tree
/// already recorded at `prefix` in `base_tree` and applying every change
/// under `prefix` (§4.6 `write_tree`/`make_subtree_for_added_blob`/
/// `match_modified_subtree`).
fn synthesize_tree(
    store: &dyn ObjectStore,
    base_tree: ObjectId,
    prefix: &RepoPath,
    changes: &[TreeChange],
) -> WorktreeResult<ObjectId> {
    let base = if base_tree.is_known() { store.read_tree(base_tree)? } else { Tree::default() };

    let mut by_component: BTreeMap<&str, Vec<&TreeChange>> = BTreeMap::new();
    for change in changes {
        if path_is_under(change.path(), prefix) {
            by_component.entry(first_component_after(change.path(), prefix)).or_default().push(change);
        }
    }

    let mut out_entries = Vec::new();
    let mut handled: HashSet<&str> = HashSet::new();

    for entry in &base.entries {
        if tree_entry_is_submodule(entry) {
            out_entries.push(entry.clone());
            continue;
        }
        let matching = by_component.get(entry.name.as_str());
        if entry.mode.is_tree() {
            match matching {
                Some(_) => {
                    let sub_prefix = prefix.join(&entry.name);
                    let new_subtree = synthesize_tree(store, entry.oid, &sub_prefix, changes)?;
                    if new_subtree != ObjectId::EMPTY_TREE {
                        out_entries.push(TreeEntry { name: entry.name.clone(), mode: FileMode::Tree, oid: new_subtree });
                    }
                    handled.insert(entry.name.as_str());
                }
                None => out_entries.push(entry.clone()),
            }
        } else {
            match matching {
                Some(items) => {
                    handled.insert(entry.name.as_str());
                    match items.last() {
                        Some(TreeChange::Delete { .. }) => {} // omit: file deleted
                        Some(TreeChange::Blob { oid, mode, .. }) =>
                            out_entries.push(TreeEntry { name: entry.name.clone(), mode: *mode, oid: *oid }),
                        None => unreachable!(),
                    }
                }
                None => out_entries.push(entry.clone()),
            }
        }
    }

    for (&name, items) in &by_component {
        if handled.contains(name) {
            continue;
        }
        let leaf = items.iter().find(|c| is_leaf_at(c.path(), prefix));
        match leaf {
            Some(TreeChange::Blob { oid, mode, .. }) =>
                out_entries.push(TreeEntry { name: name.to_owned(), mode: *mode, oid: *oid }),
            Some(TreeChange::Delete { .. }) => {} // deleting a path absent from the base tree: no-op
            None => {
                let sub_prefix = prefix.join(name);
                let new_subtree = synthesize_tree(store, ObjectId::UNKNOWN, &sub_prefix, changes)?;
                out_entries.push(TreeEntry { name: name.to_owned(), mode: FileMode::Tree, oid: new_subtree });
            }
        }
    }

    let mut sorted_names: Vec<&str> = out_entries.iter().map(|e| e.name.as_str()).collect();
    sorted_names.sort_unstable();
    for pair in sorted_names.windows(2) {
        if pair[0] == pair[1] {
            return Err(WorktreeError::TreeDupEntry(prefix.join(pair[0])));
        }
    }

    out_entries.sort_by(|a, b| RepoPath::path_cmp_explicit(&a.name, a.mode.is_tree(), &b.name, b.mode.is_tree()));
    store.write_tree(&Tree { entries: out_entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexEntry, IndexMode as IM};
    use crate::objstore::Signature as Sig;
    use crate::refstore::{RefHandle, RefStore};
    use crate::testutil::FakeObjectStore;
    use crate::time::DateTime;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeRefsInner {
        values: Mutex<HashMap<String, ObjectId>>,
    }

    #[derive(Default)]
    struct FakeRefs(Arc<FakeRefsInner>);

    struct FakeRefHandle {
        name: String,
        current: ObjectId,
        refs: Arc<FakeRefsInner>,
    }

    impl RefHandle for FakeRefHandle {
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
            if expected_old != Some(self.current) {
                return Err(WorktreeError::CommitHeadChanged);
            }
            self.current = new;
            Ok(())
        }
        fn write(self: Box<Self>) -> WorktreeResult<()> {
            self.refs.values.lock().unwrap().insert(self.name, self.current);
            Ok(())
        }
        fn unlock(self: Box<Self>) -> WorktreeResult<()> {
            Ok(())
        }
    }

    impl RefStore for FakeRefs {
        fn open(&self, name: &str, _lock: bool) -> WorktreeResult<Box<dyn RefHandle>> {
            let current = self.resolve(name)?;
            Ok(Box::new(FakeRefHandle { name: name.to_owned(), current, refs: self.0.clone() }))
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
            unimplemented!("not exercised by commit tests")
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

    fn sig() -> Sig {
        Sig { name: "tester".into(), email: "t@example.com".into(), time: DateTime::new(1_700_000_000, 0) }
    }

    #[test]
    fn commit_worktree_creates_commit_and_clears_index_stage() {
        let store = FakeObjectStore::default();
        let empty_tree = store.put_tree(Tree::default());
        let base_commit = store.commit_create(empty_tree, &[], sig(), sig(), "initial").unwrap();

        let refs = FakeRefs::default();
        refs.alloc("refs/heads/main", base_commit).unwrap();

        let repo_dir = tempdir().unwrap();
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let store_arc: std::sync::Arc<dyn ObjectStore> = std::sync::Arc::new(store);
        let refs_arc: std::sync::Arc<dyn RefStore> = std::sync::Arc::new(refs);
        let mut worktree = Worktree::init(
            dir.path(),
            "refs/heads/main",
            RepoPath::root(),
            repo_dir.path(),
            store_arc.clone(),
            refs_arc,
        )
        .unwrap();

        let mut index = FileIndex::alloc();
        index.entry_add(IndexEntry::new(RepoPath::new("a.txt"), IM::regular(false)));

        let builder = CommitBuilder::new();
        let commit_id = builder.commit_worktree(&mut worktree, &mut index, sig(), sig(), "add a.txt").unwrap();

        assert_ne!(commit_id, base_commit);
        assert_eq!(worktree.base_commit_id, commit_id);
        let entry = index.entry_get(&RepoPath::new("a.txt")).unwrap();
        assert!(entry.blob_sha1.is_some());
        assert_eq!(entry.commit_sha1, Some(commit_id));
    }

    #[test]
    fn empty_message_is_rejected() {
        let store = FakeObjectStore::default();
        let empty_tree = store.put_tree(Tree::default());
        let base_commit = store.commit_create(empty_tree, &[], sig(), sig(), "initial").unwrap();
        let refs = FakeRefs::default();
        refs.alloc("refs/heads/main", base_commit).unwrap();

        let repo_dir = tempdir().unwrap();
        let dir = tempdir().unwrap();
        let store_arc: std::sync::Arc<dyn ObjectStore> = std::sync::Arc::new(store);
        let refs_arc: std::sync::Arc<dyn RefStore> = std::sync::Arc::new(refs);
        let mut worktree = Worktree::init(
            dir.path(),
            "refs/heads/main",
            RepoPath::root(),
            repo_dir.path(),
            store_arc,
            refs_arc,
        )
        .unwrap();
        let mut index = FileIndex::alloc();

        let builder = CommitBuilder::new();
        let err = builder.commit_worktree(&mut worktree, &mut index, sig(), sig(), "   ").unwrap_err();
        assert!(matches!(err, WorktreeError::CommitMsgEmpty));
    }
}
