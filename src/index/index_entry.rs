//! one record of the file index (§3.3). serialization follows §6.2's
//! little-endian fixed header + variable path bytes + optional trailing
//! ids, adapted from the teacher's `BitIndexEntry` read/write pair in
//! `index/index_entry.rs` (ctime/mtime/size/mode/oid/flags/path, padded to
//! a record boundary). the presence of each optional id is made explicit
//! with a flags byte rather than inferred from `stage`, so a corrupt or
//! hand-edited stream fails the trailing checksum instead of silently
//! misreading the following record.

use crate::error::{WorktreeError, WorktreeResult};
use crate::hash::ObjectId;
use crate::io::{ReadExt, WriteExt};
use crate::path::RepoPath;
use crate::time::Timestamp;
use bitflags::bitflags;
use std::io::{Read, Write};

/// the file-type tag an index entry's mode carries (§3.3): a narrower set
/// than a tree entry's `FileMode`, since an index entry only ever
/// represents a tracked file, never a tree or gitlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFileType {
    Regular,
    Symlink,
    /// a symlink whose target failed the safety check (§4.4) and was
    /// installed as a regular file containing the target text
    BadSymlink,
}

impl IndexFileType {
    fn to_tag(self) -> u8 {
        match self {
            Self::Regular => 0,
            Self::Symlink => 1,
            Self::BadSymlink => 2,
        }
    }

    fn from_tag(tag: u8) -> WorktreeResult<Self> {
        Ok(match tag {
            0 => Self::Regular,
            1 => Self::Symlink,
            2 => Self::BadSymlink,
            _ => return Err(WorktreeError::WorktreeMeta(format!("bad file-type tag {tag}"))),
        })
    }

    pub fn is_symlink(self) -> bool {
        matches!(self, Self::Symlink | Self::BadSymlink)
    }
}

/// packed UNIX perms + file-type tag (§3.3 "mode (packed: UNIX perms + a
/// file-type tag")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexMode {
    pub file_type: IndexFileType,
    pub executable: bool,
}

impl IndexMode {
    pub fn regular(executable: bool) -> Self {
        Self { file_type: IndexFileType::Regular, executable }
    }

    pub fn symlink() -> Self {
        Self { file_type: IndexFileType::Symlink, executable: false }
    }

    pub fn bad_symlink() -> Self {
        Self { file_type: IndexFileType::BadSymlink, executable: false }
    }

    fn to_u32(self) -> u32 {
        let perm: u32 = if self.executable { 0o755 } else { 0o644 };
        (u32::from(self.file_type.to_tag()) << 16) | perm
    }

    fn from_u32(n: u32) -> WorktreeResult<Self> {
        let file_type = IndexFileType::from_tag(((n >> 16) & 0xff) as u8)?;
        let executable = n & 0o111 != 0;
        Ok(Self { file_type, executable })
    }
}

/// §3.3 "a `stage` tag in {none, add, modify, delete}"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    None,
    Add,
    Modify,
    Delete,
}

impl Stage {
    fn to_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Add => 1,
            Self::Modify => 2,
            Self::Delete => 3,
        }
    }

    fn from_u8(n: u8) -> WorktreeResult<Self> {
        Ok(match n {
            0 => Self::None,
            1 => Self::Add,
            2 => Self::Modify,
            3 => Self::Delete,
            _ => return Err(WorktreeError::WorktreeMeta(format!("bad stage tag {n}"))),
        })
    }
}

bitflags! {
    struct EntryFlags: u8 {
        const HAS_BLOB         = 1 << 0;
        const HAS_COMMIT       = 1 << 1;
        const HAS_STAGED_BLOB  = 1 << 2;
        /// §3.3 transient flag: the path was deleted on disk
        const NO_FILE_ON_DISK  = 1 << 3;
        /// §3.3 transient flag: entry pending removal from the index
        const REMOVED          = 1 << 4;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub path: RepoPath,
    pub blob_sha1: Option<ObjectId>,
    pub commit_sha1: Option<ObjectId>,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub size_low32: u32,
    pub mode: IndexMode,
    pub staged_blob_sha1: Option<ObjectId>,
    pub staged_file_type: Option<IndexFileType>,
    pub stage: Stage,
    pub no_file_on_disk: bool,
    pub removed: bool,
}

impl IndexEntry {
    pub fn new(path: RepoPath, mode: IndexMode) -> Self {
        Self {
            path,
            blob_sha1: None,
            commit_sha1: None,
            mtime: Timestamp::zero(),
            ctime: Timestamp::zero(),
            size_low32: 0,
            mode,
            staged_blob_sha1: None,
            staged_file_type: None,
            stage: Stage::None,
            no_file_on_disk: false,
            removed: false,
        }
    }

    pub fn is_staged(&self) -> bool {
        self.stage != Stage::None
    }

    fn flags(&self) -> EntryFlags {
        let mut flags = EntryFlags::empty();
        flags.set(EntryFlags::HAS_BLOB, self.blob_sha1.is_some());
        flags.set(EntryFlags::HAS_COMMIT, self.commit_sha1.is_some());
        flags.set(EntryFlags::HAS_STAGED_BLOB, self.staged_blob_sha1.is_some());
        flags.set(EntryFlags::NO_FILE_ON_DISK, self.no_file_on_disk);
        flags.set(EntryFlags::REMOVED, self.removed);
        flags
    }

    pub fn serialize(&self, writer: &mut dyn Write) -> WorktreeResult<()> {
        writer.write_timestamp(self.ctime)?;
        writer.write_timestamp(self.mtime)?;
        writer.write_u32(self.size_low32)?;
        writer.write_u32(self.mode.to_u32())?;
        writer.write_u8(self.stage.to_u8())?;
        writer.write_u8(self.flags().bits())?;

        let path_bytes = self.path.as_str().as_bytes();
        writer.write_u16(path_bytes.len() as u16)?;
        writer.write_all(path_bytes)?;

        if let Some(blob) = self.blob_sha1 {
            writer.write_oid(blob)?;
        }
        if let Some(commit) = self.commit_sha1 {
            writer.write_oid(commit)?;
        }
        if let Some(staged_blob) = self.staged_blob_sha1 {
            writer.write_oid(staged_blob)?;
            let tag = self.staged_file_type.expect("staged blob implies staged file type");
            writer.write_u8(tag.to_tag())?;
        }
        Ok(())
    }

    pub fn deserialize(reader: &mut dyn Read) -> WorktreeResult<Self> {
        let ctime = reader.read_timestamp()?;
        let mtime = reader.read_timestamp()?;
        let size_low32 = reader.read_u32()?;
        let mode = IndexMode::from_u32(reader.read_u32()?)?;
        let stage = Stage::from_u8(reader.read_u8()?)?;
        let flags = EntryFlags::from_bits(reader.read_u8()?)
            .ok_or_else(|| WorktreeError::WorktreeMeta("bad entry flags".to_owned()))?;

        let path_len = reader.read_u16()? as usize;
        let path_bytes = reader.read_path_bytes(path_len)?;
        let path = RepoPath::new(
            String::from_utf8(path_bytes)
                .map_err(|_| WorktreeError::WorktreeMeta("non-utf8 path in index".to_owned()))?,
        );

        let blob_sha1 =
            flags.contains(EntryFlags::HAS_BLOB).then(|| reader.read_oid()).transpose()?;
        let commit_sha1 =
            flags.contains(EntryFlags::HAS_COMMIT).then(|| reader.read_oid()).transpose()?;
        let (staged_blob_sha1, staged_file_type) = if flags.contains(EntryFlags::HAS_STAGED_BLOB) {
            let blob = reader.read_oid()?;
            let tag = IndexFileType::from_tag(reader.read_u8()?)?;
            (Some(blob), Some(tag))
        } else {
            (None, None)
        };

        Ok(Self {
            path,
            blob_sha1,
            commit_sha1,
            mtime,
            ctime,
            size_low32,
            mode,
            staged_blob_sha1,
            staged_file_type,
            stage,
            no_file_on_disk: flags.contains(EntryFlags::NO_FILE_ON_DISK),
            removed: flags.contains(EntryFlags::REMOVED),
        })
    }
}
