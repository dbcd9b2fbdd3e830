//! `ThreeWayMerger` (§4.3): merges the common ancestor, the incoming
//! ("derived") side, and the current on-disk file, via the external
//! line-level `LineMerger` (§6.4). adapted from the teacher's
//! `MergeCtxt`/temp-file-then-rename idiom, narrowed to the file/blob
//! granularity this crate owns rather than a whole-commit merge.

use crate::error::{WorktreeError, WorktreeResult};
use crate::hash::ObjectId;
use crate::linemerge::{LineMerger, MergeLabels};
use crate::objstore::ObjectStore;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub overlap_count: usize,
    /// true when the merged result is byte-identical to the derived side,
    /// meaning the local copy's changes were fully absorbed (§4.3 step 3)
    pub local_changes_subsumed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymlinkMergeOutcome {
    /// both sides agree (no-op, or local already matches incoming)
    Merge,
    /// local was unchanged; incoming target installed in its place
    Updated,
    /// both sides changed the target in different, incompatible ways
    Conflict,
}

pub struct ThreeWayMerger<'a> {
    store: &'a dyn ObjectStore,
    merger: &'a dyn LineMerger,
}

impl<'a> ThreeWayMerger<'a> {
    pub fn new(store: &'a dyn ObjectStore, merger: &'a dyn LineMerger) -> Self {
        Self { store, merger }
    }

    /// merge `ancestor_blob` (absent ⇒ empty ancestor, "add vs add") and
    /// `derived_blob` against the file currently at `on_disk_path`,
    /// replacing it in place (§4.3 steps 1, 2, 4).
    pub fn merge_file(
        &self,
        on_disk_path: &Path,
        ancestor_blob: Option<ObjectId>,
        derived_blob: ObjectId,
        ancestor_label: &str,
        derived_label: &str,
        st_mode: u32,
    ) -> WorktreeResult<MergeOutcome> {
        let parent = on_disk_path.parent().unwrap_or_else(|| Path::new("."));

        let ancestor_content = read_or_empty(self.store, ancestor_blob)?;
        let derived_content = self.store.read_blob(derived_blob)?;

        let mut ancestor_tmp = NamedTempFile::new_in(parent)?;
        ancestor_tmp.write_all(&ancestor_content)?;
        let mut derived_tmp = NamedTempFile::new_in(parent)?;
        derived_tmp.write_all(&derived_content)?;
        let mut merged_tmp = NamedTempFile::new_in(parent)?;

        let labels = MergeLabels { derived: derived_label, ancestor: ancestor_label, mine: "" };
        let diff3 = self.merger.diff3(
            &mut merged_tmp,
            derived_tmp.path(),
            ancestor_tmp.path(),
            on_disk_path,
            labels,
        )?;

        let local_changes_subsumed = diff3.overlap_count == 0
            && std::fs::read(merged_tmp.path())? == derived_content;

        merged_tmp.as_file().sync_all()?;
        let mut perms = merged_tmp.as_file().metadata()?.permissions();
        perms.set_mode(st_mode);
        merged_tmp.as_file().set_permissions(perms)?;

        // `persist` renames onto `on_disk_path`; on failure it hands the
        // `NamedTempFile` back, whose `Drop` unlinks it (§4.3 step 4).
        merged_tmp.persist(on_disk_path).map_err(|e| WorktreeError::Io(e.error))?;

        Ok(MergeOutcome { overlap_count: diff3.overlap_count, local_changes_subsumed })
    }

    /// merge three blobs with no on-disk "local" participant, returning
    /// the merged bytes rather than installing them — used where the
    /// merge produces a fresh blob instead of updating a working file.
    pub fn merge_blob(
        &self,
        ancestor_blob: Option<ObjectId>,
        mine_blob: ObjectId,
        derived_blob: ObjectId,
        ancestor_label: &str,
        derived_label: &str,
    ) -> WorktreeResult<(Vec<u8>, usize)> {
        let tmp_dir = std::env::temp_dir();
        let ancestor_content = read_or_empty(self.store, ancestor_blob)?;
        let mine_content = self.store.read_blob(mine_blob)?;
        let derived_content = self.store.read_blob(derived_blob)?;

        let mut ancestor_tmp = NamedTempFile::new_in(&tmp_dir)?;
        ancestor_tmp.write_all(&ancestor_content)?;
        let mut mine_tmp = NamedTempFile::new_in(&tmp_dir)?;
        mine_tmp.write_all(&mine_content)?;
        let mut derived_tmp = NamedTempFile::new_in(&tmp_dir)?;
        derived_tmp.write_all(&derived_content)?;

        let mut out = Vec::new();
        let labels = MergeLabels { derived: derived_label, ancestor: ancestor_label, mine: "" };
        let diff3 =
            self.merger.diff3(&mut out, derived_tmp.path(), ancestor_tmp.path(), mine_tmp.path(), labels)?;
        Ok((out, diff3.overlap_count))
    }

    /// symlink three-way merge (§4.3 "Symlink merge"): compares the three
    /// targets as plain strings rather than running the line merger.
    pub fn merge_symlink(
        &self,
        on_disk_path: &Path,
        ancestor_target: Option<&str>,
        local_target: &str,
        derived_target: &str,
    ) -> WorktreeResult<SymlinkMergeOutcome> {
        let local_unchanged = ancestor_target == Some(local_target);
        let incoming_unchanged = ancestor_target == Some(derived_target);

        if local_unchanged && incoming_unchanged {
            Ok(SymlinkMergeOutcome::Merge)
        } else if local_unchanged {
            update_symlink(on_disk_path, derived_target)?;
            Ok(SymlinkMergeOutcome::Updated)
        } else if derived_target == local_target {
            Ok(SymlinkMergeOutcome::Merge)
        } else {
            install_symlink_conflict(on_disk_path, ancestor_target.unwrap_or(""), local_target, derived_target)?;
            Ok(SymlinkMergeOutcome::Conflict)
        }
    }
}

fn read_or_empty(store: &dyn ObjectStore, blob: Option<ObjectId>) -> WorktreeResult<Vec<u8>> {
    match blob {
        Some(id) => store.read_blob(id),
        None => Ok(Vec::new()),
    }
}

/// `unlink` + `symlink`: not atomic, matches POSIX `ln -sf` (§4.3).
fn update_symlink(path: &Path, target: &str) -> WorktreeResult<()> {
    let _ = std::fs::remove_file(path);
    std::os::unix::fs::symlink(target, path)?;
    Ok(())
}

fn install_symlink_conflict(
    path: &Path,
    ancestor: &str,
    local: &str,
    derived: &str,
) -> WorktreeResult<()> {
    let _ = std::fs::remove_file(path);
    let content = format!(
        "<<<<<<< mine\n{local}\n||||||| base\n{ancestor}\n=======\n{derived}\n>>>>>>> merged change\n"
    );
    std::fs::write(path, &content)?;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o644);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeLineMerger, FakeObjectStore};
    use tempfile::tempdir;

    #[test]
    fn merge_file_installs_merged_content() {
        let store = FakeObjectStore::default();
        let ancestor = store.put_blob(b"line\n");
        let derived = store.put_blob(b"line\nderived\n");
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"line\nmine\n").unwrap();

        let merger = FakeLineMerger::concat_no_overlap();
        let three_way = ThreeWayMerger::new(&store, &merger);
        let outcome = three_way
            .merge_file(&path, Some(ancestor), derived, "base: commit aaa", "merged change: commit bbb", 0o644)
            .unwrap();

        assert_eq!(outcome.overlap_count, 0);
        assert!(std::fs::read(&path).unwrap().len() > 0);
    }

    #[test]
    fn symlink_merge_both_unchanged_is_merge() {
        let store = FakeObjectStore::default();
        let merger = FakeLineMerger::concat_no_overlap();
        let three_way = ThreeWayMerger::new(&store, &merger);
        let dir = tempdir().unwrap();
        let path = dir.path().join("link");
        let outcome = three_way.merge_symlink(&path, Some("a"), "a", "a").unwrap();
        assert_eq!(outcome, SymlinkMergeOutcome::Merge);
    }

    #[test]
    fn symlink_merge_incoming_change_updates_target() {
        let store = FakeObjectStore::default();
        let merger = FakeLineMerger::concat_no_overlap();
        let three_way = ThreeWayMerger::new(&store, &merger);
        let dir = tempdir().unwrap();
        let path = dir.path().join("link");
        std::os::unix::fs::symlink("a", &path).unwrap();
        let outcome = three_way.merge_symlink(&path, Some("a"), "a", "b").unwrap();
        assert_eq!(outcome, SymlinkMergeOutcome::Updated);
        assert_eq!(std::fs::read_link(&path).unwrap().to_str().unwrap(), "b");
    }

    #[test]
    fn symlink_merge_conflicting_changes_installs_conflict_file() {
        let store = FakeObjectStore::default();
        let merger = FakeLineMerger::concat_no_overlap();
        let three_way = ThreeWayMerger::new(&store, &merger);
        let dir = tempdir().unwrap();
        let path = dir.path().join("link");
        std::os::unix::fs::symlink("b", &path).unwrap();
        let outcome = three_way.merge_symlink(&path, Some("a"), "b", "c").unwrap();
        assert_eq!(outcome, SymlinkMergeOutcome::Conflict);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("<<<<<<<"));
    }
}
