//! per-path status classification (§3.6, §4.2 `get_file_status`).
//! adapted from the teacher's `has_changes`/`has_changes_inner` stat-compare
//! heuristic in `diff.rs`, generalized from its 3-way `Changed::{Yes,No,Maybe}`
//! hash-confirm dance (which relies on a cached object id as a trump card)
//! into a direct content re-hash check, since an index entry here never
//! carries a "maybe" hash the way a freshly-converted tree entry does.

use crate::error::WorktreeResult;
use crate::hash::ObjectId;
use crate::index::index_entry::IndexEntry;
use crate::index::{DirDiffCallback, FileIndex, Stage};
use crate::objstore::ObjectStore;
use crate::path::RepoPath;
use crate::time::Timestamp;
use log::{debug, trace};
use std::fs::Metadata;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

/// §3.6: one status octet per reported path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    NoChange,
    Add,
    Exists,
    Modify,
    ModeChange,
    Delete,
    Conflict,
    Merge,
    Update,
    Revert,
    Missing,
    Unversioned,
    /// path exists on disk but is not a regular file/symlink while the tree says it should be
    Obstructed,
    BadSymlink,
    BumpBase,
    BaseRefErr,
    CannotDelete,
    CannotUpdate,
    Nonexistent,
}

const COMPARE_BLOCK_SIZE: usize = 8192;

pub struct StatusWalker<'a> {
    store: &'a dyn ObjectStore,
}

impl<'a> StatusWalker<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self { store }
    }

    /// compute `(status, stat)` for one path against its (possibly absent)
    /// index entry, per the numbered algorithm in §4.2.
    pub fn get_file_status(
        &self,
        entry: Option<&IndexEntry>,
        path: &Path,
    ) -> WorktreeResult<(StatusCode, Option<Metadata>)> {
        let metadata = match std::fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let code = match entry {
                    Some(entry) if !entry.no_file_on_disk => StatusCode::Missing,
                    _ => StatusCode::Delete,
                };
                trace!("get_file_status({}): absent from disk -> {:?}", path.display(), code);
                return Ok((code, None));
            }
            Err(e) => return Err(e.into()),
        };

        let file_type = metadata.file_type();
        if !file_type.is_file() && !file_type.is_symlink() {
            return Ok((StatusCode::Obstructed, Some(metadata)));
        }

        let entry = match entry {
            Some(entry) => entry,
            None => return Ok((StatusCode::NoChange, Some(metadata))),
        };

        if entry.no_file_on_disk {
            return Ok((StatusCode::Delete, Some(metadata)));
        }

        if entry.blob_sha1.is_none() && entry.stage != Stage::Add {
            return Ok((StatusCode::Add, Some(metadata)));
        }

        if !stat_info_differs(entry, &metadata) {
            debug!("{}: unchanged by stat comparison", path.display());
            return Ok((StatusCode::NoChange, Some(metadata)));
        }

        let entry_is_link = entry.mode.file_type.is_symlink();
        if entry_is_link != file_type.is_symlink() {
            return Ok((StatusCode::Modify, Some(metadata)));
        }

        let base_blob = if entry.stage != Stage::Delete {
            entry.staged_blob_sha1.or(entry.blob_sha1)
        } else {
            entry.blob_sha1
        };
        let Some(blob_id) = base_blob else {
            return Ok((StatusCode::Add, Some(metadata)));
        };

        let mut status = if file_type.is_symlink() {
            self.compare_symlink(blob_id, path)?
        } else {
            self.compare_regular_file(blob_id, path, entry.mode.executable, &metadata)?
        };

        if status == StatusCode::Modify && has_conflict_markers(path)? {
            debug!("{}: conflict markers found, upgrading MODIFY to CONFLICT", path.display());
            status = StatusCode::Conflict;
        }

        Ok((status, Some(metadata)))
    }

    fn compare_symlink(&self, blob_id: ObjectId, path: &Path) -> WorktreeResult<StatusCode> {
        let target = std::fs::read_link(path)?;
        let blob = self.store.read_blob(blob_id)?;
        if target.as_os_str().as_bytes() == blob.as_slice() {
            Ok(StatusCode::NoChange)
        } else {
            Ok(StatusCode::Modify)
        }
    }

    fn compare_regular_file(
        &self,
        blob_id: ObjectId,
        path: &Path,
        entry_executable: bool,
        metadata: &Metadata,
    ) -> WorktreeResult<StatusCode> {
        let blob_size = self.store.blob_size(blob_id)?;
        if blob_size != metadata.size() {
            return Ok(StatusCode::Modify);
        }

        let mut file = std::fs::File::open(path)?;
        let mut file_buf = vec![0u8; COMPARE_BLOCK_SIZE];
        let mut blob_buf = vec![0u8; COMPARE_BLOCK_SIZE];
        let mut offset = 0u64;
        loop {
            let n_file = file.read(&mut file_buf)?;
            let n_blob = self.store.blob_read_block(blob_id, offset, &mut blob_buf)?;
            if n_file != n_blob || file_buf[..n_file] != blob_buf[..n_blob] {
                return Ok(StatusCode::Modify);
            }
            if n_file == 0 {
                break;
            }
            offset += n_file as u64;
        }

        let disk_executable = metadata.permissions().mode() & 0o111 != 0;
        if disk_executable != entry_executable {
            Ok(StatusCode::ModeChange)
        } else {
            Ok(StatusCode::NoChange)
        }
    }

    /// §4.11 full-tree status walk: merge-joins the index against `root`
    /// via `FileIndex::diff_dir`, classifying each tracked path with
    /// `get_file_status` and each untracked path as `UNVERSIONED`.
    pub fn status(&self, root: &Path, index: &FileIndex) -> WorktreeResult<WorktreeStatus> {
        struct Collector<'w, 's> {
            walker: &'w StatusWalker<'s>,
            root: &'w Path,
            entries: Vec<WorktreeStatusEntry>,
        }

        impl DirDiffCallback for Collector<'_, '_> {
            fn diff_old_new(&mut self, entry: &IndexEntry, on_disk_path: &Path) -> WorktreeResult<()> {
                let (status, _) = self.walker.get_file_status(Some(entry), on_disk_path)?;
                self.entries.push(WorktreeStatusEntry {
                    path: entry.path.clone(),
                    status,
                    staged_status: staged_status_of(entry),
                });
                Ok(())
            }

            fn diff_old(&mut self, entry: &IndexEntry) -> WorktreeResult<()> {
                let on_disk_path = self.root.join(entry.path.as_str());
                let (status, _) = self.walker.get_file_status(Some(entry), &on_disk_path)?;
                self.entries.push(WorktreeStatusEntry {
                    path: entry.path.clone(),
                    status,
                    staged_status: staged_status_of(entry),
                });
                Ok(())
            }

            fn diff_new(&mut self, path: &RepoPath, _on_disk_path: &Path) -> WorktreeResult<()> {
                if is_under_meta_dir(path) {
                    return Ok(());
                }
                self.entries.push(WorktreeStatusEntry {
                    path: path.clone(),
                    status: StatusCode::Unversioned,
                    staged_status: None,
                });
                Ok(())
            }
        }

        let mut collector = Collector { walker: self, root, entries: Vec::new() };
        index.diff_dir(root, &mut collector)?;
        collector.entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(WorktreeStatus { entries: collector.entries })
    }
}

/// the worktree's own meta directory is never a candidate for tracking,
/// so a full-tree status walk must not surface it as untracked content.
fn is_under_meta_dir(path: &RepoPath) -> bool {
    let meta = crate::worktree::META_DIR_NAME;
    path.as_str() == meta || path.as_str().starts_with(&format!("{meta}/"))
}

/// §4.11: the index's own bookkeeping already distinguishes what's
/// staged, so the staged status is read off `stage` directly rather than
/// recomputed by another working-tree comparison.
fn staged_status_of(entry: &IndexEntry) -> Option<StatusCode> {
    match entry.stage {
        Stage::None => None,
        Stage::Add => Some(StatusCode::Add),
        Stage::Modify => Some(StatusCode::Modify),
        Stage::Delete => Some(StatusCode::Delete),
    }
}

/// one path's combined working-tree and staged status (§4.11).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeStatusEntry {
    pub path: RepoPath,
    pub status: StatusCode,
    pub staged_status: Option<StatusCode>,
}

/// a full-tree status report (§4.11), grounded on the teacher's
/// `status.rs` `BitStatus`/`BitStatusEntry` shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeStatus {
    pub entries: Vec<WorktreeStatusEntry>,
}

fn stat_info_differs(entry: &IndexEntry, metadata: &Metadata) -> bool {
    let executable = metadata.permissions().mode() & 0o111 != 0;
    entry.ctime != Timestamp::ctime(metadata)
        || entry.mtime != Timestamp::mtime(metadata)
        || entry.size_low32 != metadata.size() as u32
        || entry.mode.executable != executable
}

fn has_conflict_markers(path: &Path) -> WorktreeResult<bool> {
    let content = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return Ok(false), // binary/non-utf8 content cannot carry marker lines
    };
    let mut seen_start = false;
    let mut seen_sep = false;
    for line in content.lines() {
        if !seen_start {
            seen_start = line.starts_with("<<<<<<<");
        } else if !seen_sep {
            seen_sep = line.starts_with("=======");
        } else if line.starts_with(">>>>>>>") {
            return Ok(true);
        }
    }
    Ok(false)
}

/// rewrite an entry's cached timestamps after a full content compare
/// confirmed `NO_CHANGE` despite `stat_info_differs` returning true, so
/// future walks take the fast stat-only path (§4.2 `sync_timestamps`).
pub fn sync_timestamps(index: &mut FileIndex, path: &RepoPath, metadata: &Metadata) {
    if let Some(entry) = index.entry_get_mut(path) {
        entry.ctime = Timestamp::ctime(metadata);
        entry.mtime = Timestamp::mtime(metadata);
        entry.size_low32 = metadata.size() as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexMode;
    use crate::objstore::{BlobWriter, Commit, Signature, Tree};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeStore {
        blobs: Mutex<HashMap<ObjectId, Vec<u8>>>,
    }

    impl FakeStore {
        fn put(&self, content: &[u8]) -> ObjectId {
            let id = ObjectId::hash_bytes(content);
            self.blobs.lock().unwrap().insert(id, content.to_vec());
            id
        }
    }

    impl ObjectStore for FakeStore {
        fn read_blob(&self, id: ObjectId) -> WorktreeResult<Vec<u8>> {
            Ok(self.blobs.lock().unwrap().get(&id).cloned().unwrap_or_default())
        }

        fn blob_read_block(&self, id: ObjectId, offset: u64, buf: &mut [u8]) -> WorktreeResult<usize> {
            let blobs = self.blobs.lock().unwrap();
            let content = blobs.get(&id).cloned().unwrap_or_default();
            let offset = offset as usize;
            if offset >= content.len() {
                return Ok(0);
            }
            let n = (content.len() - offset).min(buf.len());
            buf[..n].copy_from_slice(&content[offset..offset + n]);
            Ok(n)
        }

        fn blob_size(&self, id: ObjectId) -> WorktreeResult<u64> {
            Ok(self.blobs.lock().unwrap().get(&id).map(Vec::len).unwrap_or(0) as u64)
        }

        fn write_blob(&self, content: &[u8]) -> WorktreeResult<ObjectId> {
            Ok(self.put(content))
        }

        fn blob_file_create(&self, _dir: &Path) -> WorktreeResult<Box<dyn BlobWriter>> {
            unimplemented!("not exercised by status tests")
        }

        fn read_tree(&self, _id: ObjectId) -> WorktreeResult<Tree> {
            unimplemented!("not exercised by status tests")
        }

        fn write_tree(&self, _tree: &Tree) -> WorktreeResult<ObjectId> {
            unimplemented!("not exercised by status tests")
        }

        fn read_commit(&self, _id: ObjectId) -> WorktreeResult<Commit> {
            unimplemented!("not exercised by status tests")
        }

        fn commit_create(
            &self,
            _tree: ObjectId,
            _parents: &[ObjectId],
            _author: Signature,
            _committer: Signature,
            _message: &str,
        ) -> WorktreeResult<ObjectId> {
            unimplemented!("not exercised by status tests")
        }

        fn id_by_path(&self, _commit: ObjectId, _path: &RepoPath) -> WorktreeResult<Option<ObjectId>> {
            unimplemented!("not exercised by status tests")
        }
    }

    #[test]
    fn missing_file_with_tracked_entry_is_missing() {
        let store = FakeStore::default();
        let walker = StatusWalker::new(&store);
        let entry = IndexEntry::new(RepoPath::new("a.txt"), IndexMode::regular(false));
        let (status, _) = walker.get_file_status(Some(&entry), Path::new("/no/such/path")).unwrap();
        assert_eq!(status, StatusCode::Missing);
    }

    #[test]
    fn unmodified_file_reports_no_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let store = FakeStore::default();
        let blob_id = store.put(b"hello");

        let metadata = std::fs::symlink_metadata(&path).unwrap();
        let mut entry = IndexEntry::new(RepoPath::new("a.txt"), IndexMode::regular(false));
        entry.blob_sha1 = Some(blob_id);
        entry.ctime = Timestamp::ctime(&metadata);
        entry.mtime = Timestamp::mtime(&metadata);
        entry.size_low32 = metadata.size() as u32;

        let walker = StatusWalker::new(&store);
        let (status, _) = walker.get_file_status(Some(&entry), &path).unwrap();
        assert_eq!(status, StatusCode::NoChange);
    }

    #[test]
    fn modified_content_is_detected_despite_matching_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"wello").unwrap();
        let store = FakeStore::default();
        let blob_id = store.put(b"hello");

        let mut entry = IndexEntry::new(RepoPath::new("a.txt"), IndexMode::regular(false));
        entry.blob_sha1 = Some(blob_id);
        // force past the stat fast-path so content comparison runs
        entry.mtime = Timestamp::new(1, 0);

        let walker = StatusWalker::new(&store);
        let (status, _) = walker.get_file_status(Some(&entry), &path).unwrap();
        assert_eq!(status, StatusCode::Modify);
    }

    #[test]
    fn untracked_path_reports_no_change_for_caller_to_reclassify() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("untracked.txt");
        std::fs::write(&path, b"x").unwrap();
        let store = FakeStore::default();
        let walker = StatusWalker::new(&store);
        let (status, _) = walker.get_file_status(None, &path).unwrap();
        assert_eq!(status, StatusCode::NoChange);
    }
}
