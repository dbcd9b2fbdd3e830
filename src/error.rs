use crate::hash::ObjectId;
use crate::path::RepoPath;
use thiserror::Error;

pub type WorktreeResult<T> = Result<T, WorktreeError>;

/// every leaf error this crate returns, grouped the way `spec.md` §7 groups
/// them (preconditions / version control / environment). unlike the
/// teacher's `anyhow::Error` + `downcast::<BitError>()` dance, callers match
/// on this directly without a fallible downcast.
#[derive(Debug, Error)]
pub enum WorktreeError {
    // --- preconditions ---
    #[error("{0} is not a worktree")]
    NotWorktree(std::path::PathBuf),
    #[error("worktree is locked by another process")]
    WorktreeBusy,
    #[error("worktree meta data is missing or corrupt: {0}")]
    WorktreeMeta(String),
    #[error("worktree format version {found} is not supported (expected {expected})")]
    WorktreeVers { found: u32, expected: u32 },
    #[error("worktree's repository path does not match: {0}")]
    WorktreeRepo(String),
    #[error("index entries reference more than one base commit")]
    MixedCommits,
    #[error("one or more paths are in conflict")]
    Conflicts,
    #[error("path {0} has staged changes")]
    StagedPaths(RepoPath),
    #[error("path {0} is already staged")]
    FileStaged(RepoPath),
    #[error("path {0} has been modified")]
    FileModified(RepoPath),
    #[error("path {0} has unexpected status")]
    FileStatus(RepoPath),
    #[error("path {0} is obstructed by a non-regular file")]
    FileObstructed(RepoPath),
    #[error("symlink target for {0} is unsafe")]
    BadSymlink(RepoPath),
    #[error("cannot integrate a branch into itself")]
    SameBranch,

    // --- version control ---
    #[error("path {0} is out of date with the repository")]
    CommitOutOfDate(RepoPath),
    #[error("HEAD moved during commit")]
    CommitHeadChanged,
    #[error("no changes to commit")]
    CommitNoChanges,
    #[error("commit message must not be empty")]
    CommitMsgEmpty,
    #[error("conflicted paths cannot be committed")]
    CommitConflict,
    #[error("path {0} is out of date for rebase")]
    RebaseOutOfDate(RepoPath),
    #[error("rebase commit marker does not match ({expected} != {found})")]
    RebaseCommitId { expected: ObjectId, found: ObjectId },
    #[error("path {0} is out of date for staging")]
    StageOutOfDate(RepoPath),
    #[error("path {0} is in conflict and cannot be staged")]
    StageConflict(RepoPath),
    #[error("path {0} has no change to stage")]
    StageNoChange(RepoPath),
    #[error("path {0} is not staged")]
    FileNotStaged(RepoPath),
    #[error("no paths were merged")]
    NoMergedPaths,
    #[error("duplicate entry {0} in synthesized tree")]
    TreeDupEntry(RepoPath),
    #[error("no tree entry for path {0}")]
    NoTreeEntry(RepoPath),
    #[error("invalid patch choice")]
    PatchChoice,
    #[error("histedit commit marker does not match ({expected} != {found})")]
    HisteditCommitId { expected: ObjectId, found: ObjectId },

    // --- environment ---
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no space left on device")]
    NoSpace,
    #[error("invalid path: {0}")]
    BadPath(String),
    #[error("path is not absolute: {0}")]
    NotAbsPath(std::path::PathBuf),
    #[error("object {0} not found")]
    NoObj(ObjectId),
    #[error("invalid object id string: {0}")]
    BadObjIdStr(String),
    #[error("object {0} has unexpected type")]
    ObjType(ObjectId),
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorktreeError {
    /// corresponds to the teacher's `is_not_found_err`: callers probing for
    /// "absent" rather than "broken" use this instead of matching variants.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoObj(_) | Self::NoTreeEntry(_))
            || matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// mirrors the teacher's `is_fatal`: conflicts and cancellation are
    /// expected outcomes that callers report rather than propagate as bugs.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled | Self::Conflicts | Self::CommitConflict | Self::StageConflict(_)
        )
    }
}

pub trait WorktreeResultExt<T> {
    fn is_not_found(&self) -> bool;
}

impl<T> WorktreeResultExt<T> for WorktreeResult<T> {
    fn is_not_found(&self) -> bool {
        match self {
            Ok(..) => false,
            Err(e) => e.is_not_found(),
        }
    }
}
