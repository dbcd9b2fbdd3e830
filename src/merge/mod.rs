//! file-level and tree-level three-way merge (§4.3, §4.7). the teacher's
//! `merge.rs` runs a full commit-level merge (`MergeCtxt`, merge-base
//! discovery, a CLI-facing `MergeOpts`/`MergeConflicts`); that orchestration
//! belongs one layer up (driven by the state machines in this crate), so
//! only the two collaborators the spec names — `ThreeWayMerger` and
//! `MergeDriver` — live here.

pub mod driver;
pub mod three_way;

pub use driver::{check_merge_ok, MergeDriver};
pub use three_way::{MergeOutcome, SymlinkMergeOutcome, ThreeWayMerger};
