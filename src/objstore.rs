//! the object store collaborator (§6.4): loose-object I/O, pack parsing and
//! delta reconstruction are out of scope for this crate. every operation
//! this crate needs from the store is expressed here as a narrow trait;
//! downstream crates supply the concrete implementation (mirrors how
//! `libbit`'s `BitRepo` delegates to a `BitObjDb` rather than inlining disk
//! access into every component).

use crate::error::WorktreeResult;
use crate::hash::ObjectId;
use crate::obj::FileMode;
use crate::path::RepoPath;
use crate::time::DateTime;
use std::io::Write;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub time: DateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: smallvec::SmallVec<[ObjectId; 1]>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub mode: FileMode,
    pub oid: ObjectId,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tree {
    /// sorted by directory-aware path ordering, matching the on-disk
    /// ordering of the object this was read from
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn find_entry(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

pub fn tree_entry_is_submodule(entry: &TreeEntry) -> bool {
    entry.mode == FileMode::Gitlink
}

/// an object store handle for writing a new blob without buffering its
/// entire content in memory: the caller streams bytes into the temp file,
/// then `finish` computes the id and commits it to the store.
pub trait BlobWriter: Write {
    fn finish(self: Box<Self>) -> WorktreeResult<ObjectId>;
}

pub trait ObjectStore: Send + Sync {
    fn read_blob(&self, id: ObjectId) -> WorktreeResult<Vec<u8>>;

    /// stream the blob's content into `out` in fixed-size blocks, used by
    /// the status walker's block-compare path so large files are never
    /// loaded whole.
    fn blob_read_block(&self, id: ObjectId, offset: u64, buf: &mut [u8]) -> WorktreeResult<usize>;

    fn blob_size(&self, id: ObjectId) -> WorktreeResult<u64>;

    fn write_blob(&self, content: &[u8]) -> WorktreeResult<ObjectId>;

    /// open a write handle for a new blob backed by a temp file in `dir`,
    /// so large files can be hashed and stored without an intermediate
    /// in-memory copy.
    fn blob_file_create(&self, dir: &std::path::Path) -> WorktreeResult<Box<dyn BlobWriter>>;

    fn read_tree(&self, id: ObjectId) -> WorktreeResult<Tree>;

    fn write_tree(&self, tree: &Tree) -> WorktreeResult<ObjectId>;

    fn read_commit(&self, id: ObjectId) -> WorktreeResult<Commit>;

    fn commit_create(
        &self,
        tree: ObjectId,
        parents: &[ObjectId],
        author: Signature,
        committer: Signature,
        message: &str,
    ) -> WorktreeResult<ObjectId>;

    /// resolve `path` as it exists in the tree of `commit`, used by
    /// `check_out_of_date` (§4.8)
    fn id_by_path(&self, commit: ObjectId, path: &RepoPath) -> WorktreeResult<Option<ObjectId>>;
}
