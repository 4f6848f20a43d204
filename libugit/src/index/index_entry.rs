use crate::error::{GitError, GitResult};
use crate::hash::{HashAlgo, Oid};
use crate::io::{BufReadExt, ReadExt, WriteExt};
use crate::obj::{FileMode, TreeEntry};
use crate::time::Timespec;
use num_enum::TryFromPrimitive;
use std::cmp::Ordering;
use std::convert::TryFrom;
use std::fmt::{self, Debug, Formatter};
use std::io::{BufRead, Read, Write};
use std::os::unix::prelude::MetadataExt;
use std::path::Path;

/// Stage 0 is a normally staged file; 1/2/3 are the merge base / ours /
/// theirs sides of an unmerged path.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum MergeStage {
    None   = 0,
    Base   = 1,
    Ours   = 2,
    Theirs = 3,
}

impl MergeStage {
    pub fn is_merging(self) -> bool {
        self != MergeStage::None
    }
}

/// 1 bit assume-valid, 1 bit extended, 2 bits stage, 12 bits path length
/// (capped at 0xFFF).
#[derive(Copy, Clone, Hash, PartialEq, Eq, Default)]
pub struct IndexEntryFlags(u16);

impl IndexEntryFlags {
    const PATH_LEN_MASK: u16 = 0x0FFF;

    pub fn new(bits: u16) -> Self {
        Self(bits)
    }

    pub fn with_path_len(len: usize) -> Self {
        Self(Self::PATH_LEN_MASK.min(len as u16))
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn assume_valid(self) -> bool {
        self.0 & (1 << 15) != 0
    }

    pub fn extended(self) -> bool {
        self.0 & (1 << 14) != 0
    }

    pub fn stage(self) -> MergeStage {
        MergeStage::try_from(((self.0 & 0x3000) >> 12) as u8).unwrap()
    }

    pub fn set_stage(&mut self, stage: MergeStage) {
        self.0 = (self.0 & !0x3000) | ((stage as u16) << 12);
    }

    pub fn path_len(self) -> u16 {
        self.0 & Self::PATH_LEN_MASK
    }

    fn with_updated_path_len(self, len: usize) -> Self {
        Self((self.0 & !Self::PATH_LEN_MASK) | Self::PATH_LEN_MASK.min(len as u16))
    }
}

impl Debug for IndexEntryFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexEntryFlags")
            .field("assume_valid", &self.assume_valid())
            .field("extended", &self.extended())
            .field("stage", &self.stage())
            .field("path_len", &self.path_len())
            .finish()
    }
}

bitflags! {
    /// The v3 extended flags word (bit 15 must be zero on disk).
    #[derive(Default)]
    pub struct ExtendedFlags: u16 {
        const SKIP_WORKTREE = 1 << 14;
        const INTENT_TO_ADD = 1 << 13;
    }
}

/// One staging-area record. Also the uniform currency of the walker: tree
/// and worktree entries are converted into this shape for comparison.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct IndexEntry {
    pub ctime: Timespec,
    pub mtime: Timespec,
    pub device: u32,
    pub inode: u32,
    pub mode: FileMode,
    pub uid: u32,
    pub gid: u32,
    pub filesize: u32,
    pub oid: Oid,
    pub flags: IndexEntryFlags,
    pub extended_flags: ExtendedFlags,
    pub path: String,
}

const ENTRY_FIXED_SIZE: usize = 8  // ctime
    + 8  // mtime
    + 4  // device
    + 4  // inode
    + 4  // mode
    + 4  // uid
    + 4  // gid
    + 4; // filesize

impl IndexEntry {
    pub fn key(&self) -> (String, MergeStage) {
        (self.path.clone(), self.stage())
    }

    pub fn stage(&self) -> MergeStage {
        self.flags.stage()
    }

    pub fn skip_worktree(&self) -> bool {
        self.extended_flags.contains(ExtendedFlags::SKIP_WORKTREE)
    }

    /// A synthetic entry for a tree's blob: stat fields zeroed, only the
    /// oid/mode carry information.
    pub fn from_tree_entry(prefix: &str, entry: &TreeEntry) -> Self {
        Self {
            ctime: Timespec::zero(),
            mtime: Timespec::zero(),
            device: 0,
            inode: 0,
            mode: entry.mode,
            uid: 0,
            gid: 0,
            filesize: 0,
            oid: entry.oid,
            flags: IndexEntryFlags::with_path_len(
                crate::path::join(prefix, &entry.path).len(),
            ),
            extended_flags: ExtendedFlags::empty(),
            path: crate::path::join(prefix, &entry.path),
        }
    }

    /// An entry freshly stat'ed from the working tree.
    pub fn from_file(abs_path: &Path, rel_path: &str, oid: Oid) -> GitResult<Self> {
        let metadata = abs_path.symlink_metadata()?;
        ensure!(!metadata.is_dir(), "index entries must not be directories");
        Ok(Self {
            ctime: Timespec::ctime(&metadata),
            mtime: Timespec::mtime(&metadata),
            device: metadata.dev() as u32,
            inode: metadata.ino() as u32,
            mode: FileMode::from_metadata(&metadata),
            uid: metadata.uid(),
            gid: metadata.gid(),
            filesize: metadata.size() as u32,
            oid,
            flags: IndexEntryFlags::with_path_len(rel_path.len()),
            extended_flags: ExtendedFlags::empty(),
            path: rel_path.to_owned(),
        })
    }

    pub fn with_stage(mut self, stage: MergeStage) -> Self {
        self.flags.set_stage(stage);
        self
    }

    fn fixed_size(algo: HashAlgo) -> usize {
        ENTRY_FIXED_SIZE + algo.oid_size() + 2
    }

    /// v2/v3 entries are zero-padded to a multiple of eight bytes, with at
    /// least one padding byte doubling as the path terminator.
    pub(super) fn padding_len(path_len: usize, extended: bool, algo: HashAlgo) -> usize {
        let entry_size = Self::fixed_size(algo) + if extended { 2 } else { 0 } + path_len;
        let padding = 8 - (entry_size % 8);
        debug_assert!(padding > 0 && padding <= 8);
        padding
    }

    pub(super) fn parse(
        reader: &mut impl BufRead,
        version: u32,
        previous_path: &str,
        algo: HashAlgo,
    ) -> GitResult<Self> {
        let ctime = reader.read_timespec()?;
        let mtime = reader.read_timespec()?;
        let device = reader.read_u32()?;
        let inode = reader.read_u32()?;
        let mode = FileMode::new(reader.read_u32()?)?;
        let uid = reader.read_u32()?;
        let gid = reader.read_u32()?;
        let filesize = reader.read_u32()?;
        let oid = reader.read_oid(algo)?;
        let flags = IndexEntryFlags::new(reader.read_u16()?);
        let extended_flags = if flags.extended() {
            ensure!(version >= 3, GitError::corrupt("extended index entry in a v2 index"));
            ExtendedFlags::from_bits_truncate(reader.read_u16()?)
        } else {
            ExtendedFlags::empty()
        };

        let path = if version == 4 {
            // prefix compression: strip N bytes off the previous path, then
            // append the null-terminated suffix
            let strip = reader.read_offset()? as usize;
            ensure!(strip <= previous_path.len(), GitError::corrupt("index v4 prefix length"));
            let mut path = previous_path[..previous_path.len() - strip].to_owned();
            path.push_str(&reader.read_null_terminated_str()?);
            path
        } else {
            let path = reader.read_null_terminated_str()?;
            // the terminator consumed above counts as one padding byte
            let padding = Self::padding_len(path.len(), flags.extended(), algo) - 1;
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf[..padding])?;
            ensure!(buf.iter().all(|&b| b == 0), GitError::corrupt("index entry padding"));
            path
        };
        ensure!(!path.is_empty() && !path.ends_with('/'), GitError::corrupt("index entry path"));
        ensure!(
            flags.path_len() as usize == path.len().min(0xFFF),
            GitError::corrupt("index entry path length field")
        );

        Ok(Self {
            ctime,
            mtime,
            device,
            inode,
            mode,
            uid,
            gid,
            filesize,
            oid,
            flags,
            extended_flags,
            path,
        })
    }

    /// Serializes in v2/v3 form (the emitter never writes v4).
    pub(super) fn write(&self, writer: &mut impl Write, algo: HashAlgo) -> GitResult<()> {
        let extended = !self.extended_flags.is_empty();
        let mut flags = self.flags.with_updated_path_len(self.path.len());
        if extended {
            flags.0 |= 1 << 14;
        } else {
            flags.0 &= !(1 << 14);
        }
        writer.write_timespec(self.ctime)?;
        writer.write_timespec(self.mtime)?;
        writer.write_u32(self.device)?;
        writer.write_u32(self.inode)?;
        writer.write_u32(self.mode.as_u32())?;
        writer.write_u32(self.uid)?;
        writer.write_u32(self.gid)?;
        writer.write_u32(self.filesize)?;
        writer.write_oid(self.oid)?;
        writer.write_u16(flags.bits())?;
        if extended {
            writer.write_u16(self.extended_flags.bits())?;
        }
        writer.write_all(self.path.as_bytes())?;
        let padding = Self::padding_len(self.path.len(), extended, algo);
        writer.write_all(&[0u8; 8][..padding])?;
        Ok(())
    }
}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // byte order on paths, stage breaking ties; this agrees with tree
        // traversal order because only files appear in the index
        self.path.cmp(&other.path).then_with(|| self.stage().cmp(&other.stage()))
    }
}
