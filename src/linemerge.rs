//! the line-level diff3 collaborator (§6.4). the algorithm itself (line
//! tokenization, LCS/Myers diff, conflict-region detection) is out of
//! scope; this crate only needs to invoke it and read back the merged
//! bytes and overlap count.

use crate::error::WorktreeResult;
use std::path::Path;

/// labels rendered into conflict markers, e.g.
/// `<<<<<<< merged change: commit <id>` / `||||||| base: commit <id>`
pub struct MergeLabels<'a> {
    pub derived: &'a str,
    pub ancestor: &'a str,
    pub mine: &'a str,
}

pub struct Diff3Output {
    pub overlap_count: usize,
}

/// a three-way, line-level text merge: `mine` is the current on-disk
/// content, `ancestor` the common base, `derived` the incoming change.
/// conflict markers are written to `out` using `labels`; returns the
/// number of overlap regions ThreeWayMerger uses to decide
/// `local_changes_subsumed` (§4.3 step 3).
pub trait LineMerger: Send + Sync {
    fn diff3(
        &self,
        out: &mut dyn std::io::Write,
        derived_path: &Path,
        ancestor_path: &Path,
        mine_path: &Path,
        labels: MergeLabels<'_>,
    ) -> WorktreeResult<Diff3Output>;
}
