//! per-worktree reference markers (§3.5): UUID-scoped ref names that act
//! as durable state flags for the worktree's own base commit and for the
//! rebase/histedit state machines' in-progress bookkeeping.

use crate::worktree::Worktree;

pub const BASE: &str = "base";

pub const REBASE_TMP: &str = "rebase-tmp";
pub const NEWBASE: &str = "newbase";
pub const REBASE_BRANCH: &str = "rebase-branch";
pub const REBASE_COMMIT: &str = "rebase-commit";

pub const HISTEDIT_TMP: &str = "histedit-tmp";
pub const HISTEDIT_BRANCH: &str = "histedit-branch";
pub const HISTEDIT_BASE_COMMIT: &str = "histedit-base-commit";
pub const HISTEDIT_COMMIT: &str = "histedit-commit";

/// the full ref name backing marker `name` for this worktree (§3.5: one
/// namespace per worktree uuid so concurrent worktrees never collide).
pub fn marker(worktree: &Worktree, name: &str) -> String {
    format!("refs/wtvcs/{}/{name}", worktree.uuid)
}
