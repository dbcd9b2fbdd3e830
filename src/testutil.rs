//! in-memory test doubles for the collaborator traits (§6.4). only
//! compiled for tests; mirrors the teacher's pattern of small fixture
//! structs living alongside the modules that exercise them, pulled out
//! here since several modules' tests need the same doubles.

use crate::error::{WorktreeError, WorktreeResult};
use crate::hash::ObjectId;
use crate::linemerge::{Diff3Output, LineMerger, MergeLabels};
use crate::objstore::{BlobWriter, Commit, ObjectStore, Signature, Tree, TreeEntry};
use crate::path::RepoPath;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

#[derive(Default)]
pub struct FakeObjectStore {
    blobs: Mutex<HashMap<ObjectId, Vec<u8>>>,
    trees: Mutex<HashMap<ObjectId, Tree>>,
    commits: Mutex<HashMap<ObjectId, Commit>>,
}

impl FakeObjectStore {
    /// hash and store `bytes`, returning the resulting id; the test-only
    /// counterpart of `ObjectStore::write_blob` that doesn't need `&self`
    /// to be behind a trait object.
    pub fn put_blob(&self, bytes: &[u8]) -> ObjectId {
        let id = ObjectId::hash_bytes(bytes);
        self.blobs.lock().unwrap().insert(id, bytes.to_vec());
        id
    }

    pub fn put_tree(&self, tree: Tree) -> ObjectId {
        let id = hash_tree(&tree);
        self.trees.lock().unwrap().insert(id, tree);
        id
    }
}

fn hash_tree(tree: &Tree) -> ObjectId {
    let mut buf = Vec::new();
    for entry in &tree.entries {
        buf.extend_from_slice(entry.name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&(entry.mode as u32).to_le_bytes());
        buf.extend_from_slice(entry.oid.as_bytes());
    }
    ObjectId::hash_bytes(&buf)
}

fn hash_commit(tree: ObjectId, parents: &[ObjectId], message: &str) -> ObjectId {
    let mut buf = Vec::new();
    buf.extend_from_slice(tree.as_bytes());
    for p in parents {
        buf.extend_from_slice(p.as_bytes());
    }
    buf.extend_from_slice(message.as_bytes());
    ObjectId::hash_bytes(&buf)
}

struct FakeBlobWriter {
    buf: Vec<u8>,
}

impl Write for FakeBlobWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.write(data)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl BlobWriter for FakeBlobWriter {
    fn finish(self: Box<Self>) -> WorktreeResult<ObjectId> {
        Ok(ObjectId::hash_bytes(&self.buf))
    }
}

impl ObjectStore for FakeObjectStore {
    fn read_blob(&self, id: ObjectId) -> WorktreeResult<Vec<u8>> {
        self.blobs.lock().unwrap().get(&id).cloned().ok_or(WorktreeError::NoObj(id))
    }

    fn blob_read_block(&self, id: ObjectId, offset: u64, buf: &mut [u8]) -> WorktreeResult<usize> {
        let blobs = self.blobs.lock().unwrap();
        let content = blobs.get(&id).ok_or(WorktreeError::NoObj(id))?;
        let offset = offset as usize;
        if offset >= content.len() {
            return Ok(0);
        }
        let n = buf.len().min(content.len() - offset);
        buf[..n].copy_from_slice(&content[offset..offset + n]);
        Ok(n)
    }

    fn blob_size(&self, id: ObjectId) -> WorktreeResult<u64> {
        self.blobs.lock().unwrap().get(&id).map(|b| b.len() as u64).ok_or(WorktreeError::NoObj(id))
    }

    fn write_blob(&self, content: &[u8]) -> WorktreeResult<ObjectId> {
        Ok(self.put_blob(content))
    }

    fn blob_file_create(&self, _dir: &std::path::Path) -> WorktreeResult<Box<dyn BlobWriter>> {
        Ok(Box::new(FakeBlobWriter { buf: Vec::new() }))
    }

    fn read_tree(&self, id: ObjectId) -> WorktreeResult<Tree> {
        if id == ObjectId::EMPTY_TREE {
            return Ok(Tree::default());
        }
        self.trees.lock().unwrap().get(&id).cloned().ok_or(WorktreeError::NoObj(id))
    }

    fn write_tree(&self, tree: &Tree) -> WorktreeResult<ObjectId> {
        Ok(self.put_tree(tree.clone()))
    }

    fn read_commit(&self, id: ObjectId) -> WorktreeResult<Commit> {
        self.commits.lock().unwrap().get(&id).cloned().ok_or(WorktreeError::NoObj(id))
    }

    fn commit_create(
        &self,
        tree: ObjectId,
        parents: &[ObjectId],
        author: Signature,
        committer: Signature,
        message: &str,
    ) -> WorktreeResult<ObjectId> {
        let id = hash_commit(tree, parents, message);
        let commit = Commit {
            tree,
            parents: parents.iter().copied().collect(),
            author,
            committer,
            message: message.to_owned(),
        };
        self.commits.lock().unwrap().insert(id, commit);
        Ok(id)
    }

    fn id_by_path(&self, commit: ObjectId, path: &RepoPath) -> WorktreeResult<Option<ObjectId>> {
        let root = self.read_commit(commit)?.tree;
        let mut current = self.read_tree(root)?;
        let mut components = path.components().peekable();
        let mut found = None;
        while let Some(name) = components.next() {
            match current.find_entry(name) {
                Some(entry) if components.peek().is_none() => {
                    found = Some(entry.oid);
                    break;
                }
                Some(entry) => current = self.read_tree(entry.oid)?,
                None => break,
            }
        }
        Ok(found)
    }
}

/// a deterministic stand-in for the real line merger: concatenates the
/// three sides with conflict markers whenever `mine` and `derived` differ,
/// reporting one overlap in that case and zero otherwise.
pub struct FakeLineMerger {
    force_conflict: bool,
}

impl FakeLineMerger {
    pub fn concat_no_overlap() -> Self {
        Self { force_conflict: false }
    }

    pub fn always_conflict() -> Self {
        Self { force_conflict: true }
    }
}

impl LineMerger for FakeLineMerger {
    fn diff3(
        &self,
        out: &mut dyn Write,
        derived_path: &std::path::Path,
        ancestor_path: &std::path::Path,
        mine_path: &std::path::Path,
        labels: MergeLabels<'_>,
    ) -> WorktreeResult<Diff3Output> {
        let mine = std::fs::read(mine_path)?;
        let ancestor = std::fs::read(ancestor_path)?;
        let derived = std::fs::read(derived_path)?;

        if !self.force_conflict && mine == ancestor {
            out.write_all(&derived)?;
            return Ok(Diff3Output { overlap_count: 0 });
        }
        if !self.force_conflict && derived == ancestor {
            out.write_all(&mine)?;
            return Ok(Diff3Output { overlap_count: 0 });
        }
        if !self.force_conflict && mine == derived {
            out.write_all(&mine)?;
            return Ok(Diff3Output { overlap_count: 0 });
        }

        write!(out, "<<<<<<< {}\n", labels.mine)?;
        out.write_all(&mine)?;
        write!(out, "||||||| {}\n", labels.ancestor)?;
        out.write_all(&ancestor)?;
        write!(out, "=======\n")?;
        out.write_all(&derived)?;
        write!(out, ">>>>>>> {}\n", labels.derived)?;
        Ok(Diff3Output { overlap_count: 1 })
    }
}
