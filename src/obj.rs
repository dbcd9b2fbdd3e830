//! file modes as recorded in a tree entry or a file index entry.
//!
//! the object model itself (blobs, trees, commits, tags) belongs to the
//! object store, which is an external collaborator (see `objstore.rs`); this
//! module only keeps the mode/file-type tag that both the object store's
//! tree entries and this crate's index entries need to agree on.

use std::convert::TryFrom;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::Metadata;
use std::os::unix::prelude::PermissionsExt;
use std::str::FromStr;

/// the ordering of variants is significant: it implements `Ord`, and a
/// directory must sort after the "file" variants (mirrors the teacher's
/// `FileMode`, which notes the same constraint).
#[derive(Copy, PartialEq, Eq, Clone, Debug, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum FileMode {
    Reg     = 0o100644,
    Exec    = 0o100755,
    Link    = 0o120000,
    Tree    = 0o40000,
    Gitlink = 0o160000,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid file mode `{0:06o}`")]
pub struct InvalidFileMode(u32);

impl TryFrom<u32> for FileMode {
    type Error = InvalidFileMode;

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        Ok(match n {
            0o100644 => Self::Reg,
            0o100755 => Self::Exec,
            0o120000 => Self::Link,
            0o40000 => Self::Tree,
            0o160000 => Self::Gitlink,
            _ => return Err(InvalidFileMode(n)),
        })
    }
}

impl Display for FileMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let n = self.as_u32();
        if f.alternate() { write!(f, "{:o}", n) } else { write!(f, "{:06o}", n) }
    }
}

impl FileMode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_link(self) -> bool {
        matches!(self, Self::Link)
    }

    /// regular or executable: a plain tracked file, not a symlink
    pub fn is_file(self) -> bool {
        matches!(self, Self::Exec | Self::Reg)
    }

    /// anything an index entry can directly reference as a blob
    pub fn is_blob(self) -> bool {
        matches!(self, Self::Exec | Self::Reg | Self::Link)
    }

    pub fn is_tree(self) -> bool {
        matches!(self, Self::Tree)
    }

    pub fn is_executable(self) -> bool {
        matches!(self, Self::Exec)
    }

    pub fn new(n: u32) -> Self {
        Self::try_from(n).unwrap_or_else(|e| panic!("{e}"))
    }

    pub fn from_metadata(metadata: &Metadata) -> Self {
        if metadata.file_type().is_symlink() {
            Self::Link
        } else if metadata.is_dir() {
            Self::Tree
        } else {
            let is_executable = metadata.permissions().mode() & 0o111 != 0;
            if is_executable { Self::Exec } else { Self::Reg }
        }
    }

    /// apply the executable bit of `self` to `other`'s file/dir-ness,
    /// used when a `MODE_CHANGE` status only flips exec without altering
    /// content (file vs symlink/tree never changes via a mode bump alone).
    pub fn with_executable(self, executable: bool) -> Self {
        match self {
            Self::Reg | Self::Exec => if executable { Self::Exec } else { Self::Reg },
            other => other,
        }
    }
}

impl FromStr for FileMode {
    type Err = InvalidFileMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n = u32::from_str_radix(s, 8).map_err(|_| InvalidFileMode(0))?;
        Self::try_from(n)
    }
}
