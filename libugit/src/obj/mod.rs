mod blob;
mod commit;
mod obj_id;
mod tag;
mod tree;

pub use blob::*;
pub use commit::*;
pub use obj_id::*;
pub use tag::*;
pub use tree::*;

use crate::error::{GitGenericError, GitResult};
use crate::hash::{HashAlgo, Oid};
use crate::io::BufReadExt;
use crate::serialize::Serialize;
use num_enum::TryFromPrimitive;
use std::convert::TryFrom;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::Metadata;
use std::io::{BufRead, Write};
use std::os::unix::prelude::PermissionsExt;
use std::str::FromStr;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum ObjType {
    Commit = 1,
    Tree   = 2,
    Blob   = 3,
    Tag    = 4,
}

impl Display for ObjType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjType::Commit => "commit",
            ObjType::Tree => "tree",
            ObjType::Blob => "blob",
            ObjType::Tag => "tag",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ObjType {
    type Err = GitGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(ObjType::Commit),
            "tree" => Ok(ObjType::Tree),
            "blob" => Ok(ObjType::Blob),
            "tag" => Ok(ObjType::Tag),
            _ => bail!("unknown object type `{}`", s),
        }
    }
}

/// Tree entry / index entry file modes. The ordering of variants is
/// significant: `Ord` is not derived, mode ordering is never used for
/// sorting (tree sort order is purely path based).
#[derive(Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u32)]
pub enum FileMode {
    Reg     = 0o100644,
    Exec    = 0o100755,
    Link    = 0o120000,
    Tree    = 0o040000,
    Gitlink = 0o160000,
}

impl Display for FileMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let n = self.as_u32();
        // the alternate form is the tree-serialization form with no padding
        if f.alternate() { write!(f, "{:o}", n) } else { write!(f, "{:06o}", n) }
    }
}

impl Debug for FileMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FileMode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_link(self) -> bool {
        matches!(self, FileMode::Link)
    }

    pub fn is_file(self) -> bool {
        matches!(self, FileMode::Reg | FileMode::Exec)
    }

    pub fn is_blob(self) -> bool {
        matches!(self, FileMode::Reg | FileMode::Exec | FileMode::Link)
    }

    pub fn is_tree(self) -> bool {
        matches!(self, FileMode::Tree)
    }

    pub fn is_gitlink(self) -> bool {
        matches!(self, FileMode::Gitlink)
    }

    pub fn new(u: u32) -> GitResult<Self> {
        Self::try_from(u).map_err(|_| anyhow!("invalid filemode `{:06o}`", u))
    }

    pub fn from_metadata(metadata: &Metadata) -> Self {
        if metadata.file_type().is_symlink() {
            Self::Link
        } else if metadata.is_dir() {
            Self::Tree
        } else if metadata.permissions().mode() & 0o111 != 0 {
            Self::Exec
        } else {
            Self::Reg
        }
    }

    pub fn infer_obj_type(self) -> ObjType {
        match self {
            Self::Tree => ObjType::Tree,
            Self::Reg | Self::Exec | Self::Link => ObjType::Blob,
            // submodules point at commits in a foreign object store
            Self::Gitlink => ObjType::Commit,
        }
    }
}

impl FromStr for FileMode {
    type Err = GitGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(u32::from_str_radix(s, 8)?)
    }
}

#[derive(PartialEq, Debug, Copy, Clone)]
pub struct ObjHeader {
    pub obj_type: ObjType,
    pub size: u64,
}

/// Parses the `<type> <len>\0` header of a wrapped object.
pub(crate) fn read_obj_header(reader: &mut impl BufRead) -> GitResult<ObjHeader> {
    let mut buf = vec![];
    let i = reader.read_until(0x20, &mut buf)?;
    ensure!(i > 1, "missing ascii field");
    let obj_type = std::str::from_utf8(&buf[..i - 1])?.parse::<ObjType>()?;
    let size = reader.read_ascii_num(0x00)? as u64;
    Ok(ObjHeader { obj_type, size })
}

/// An object as stored: type tag plus uninterpreted content bytes.
#[derive(PartialEq, Clone)]
pub struct RawObject {
    pub obj_type: ObjType,
    pub bytes: Vec<u8>,
}

impl Debug for RawObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "RawObject({}, {} bytes)", self.obj_type, self.bytes.len())
    }
}

impl RawObject {
    pub fn new(obj_type: ObjType, bytes: Vec<u8>) -> Self {
        Self { obj_type, bytes }
    }

    /// The hashed form `"<type> <len>\0" || content`. The zlib'd form of
    /// this is what lands on disk; the hash is always of this, never of the
    /// compressed bytes.
    pub fn wrapped(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.bytes.len() + 16);
        write!(buf, "{} {}\0", self.obj_type, self.bytes.len()).unwrap();
        buf.extend_from_slice(&self.bytes);
        buf
    }

    pub fn oid(&self, algo: HashAlgo) -> Oid {
        algo.hash_bytes(self.wrapped())
    }

    pub fn parse(&self, algo: HashAlgo) -> GitResult<ObjectKind> {
        ObjectKind::parse(self.obj_type, &self.bytes, algo)
    }
}

#[derive(PartialEq, Debug, Clone)]
pub enum ObjectKind {
    Blob(Blob),
    Commit(Commit),
    Tree(Tree),
    Tag(Tag),
}

impl ObjectKind {
    pub fn parse(obj_type: ObjType, bytes: &[u8], algo: HashAlgo) -> GitResult<Self> {
        match obj_type {
            ObjType::Blob => Ok(Self::Blob(Blob::from_bytes(bytes.to_vec()))),
            ObjType::Commit => Commit::parse(bytes).map(Self::Commit),
            ObjType::Tree => Tree::parse(bytes, algo).map(Self::Tree),
            ObjType::Tag => Tag::parse(bytes).map(Self::Tag),
        }
    }

    pub fn obj_type(&self) -> ObjType {
        match self {
            ObjectKind::Blob(..) => ObjType::Blob,
            ObjectKind::Commit(..) => ObjType::Commit,
            ObjectKind::Tree(..) => ObjType::Tree,
            ObjectKind::Tag(..) => ObjType::Tag,
        }
    }

    pub fn is_treeish(&self) -> bool {
        matches!(self, Self::Tree(..) | Self::Commit(..))
    }

    pub fn into_commit(self) -> GitResult<Commit> {
        match self {
            Self::Commit(commit) => Ok(commit),
            _ => Err(anyhow!("expected commit, found `{}`", self.obj_type())),
        }
    }

    pub fn into_tree(self) -> GitResult<Tree> {
        match self {
            Self::Tree(tree) => Ok(tree),
            _ => Err(anyhow!("expected tree, found `{}`", self.obj_type())),
        }
    }

    pub fn into_blob(self) -> GitResult<Blob> {
        match self {
            Self::Blob(blob) => Ok(blob),
            _ => Err(anyhow!("expected blob, found `{}`", self.obj_type())),
        }
    }

    pub fn into_tag(self) -> GitResult<Tag> {
        match self {
            Self::Tag(tag) => Ok(tag),
            _ => Err(anyhow!("expected tag, found `{}`", self.obj_type())),
        }
    }
}

impl Serialize for ObjectKind {
    fn serialize(&self, writer: &mut dyn Write) -> GitResult<()> {
        match self {
            ObjectKind::Blob(blob) => blob.serialize(writer),
            ObjectKind::Commit(commit) => commit.serialize(writer),
            ObjectKind::Tree(tree) => tree.serialize(writer),
            ObjectKind::Tag(tag) => tag.serialize(writer),
        }
    }
}

/// Anything that can be written into the object store. The oid is always of
/// the wrapped serialization.
pub trait WritableObject: Serialize {
    fn obj_ty(&self) -> ObjType;

    fn to_raw(&self) -> GitResult<RawObject> {
        Ok(RawObject::new(self.obj_ty(), self.serialize_to_vec()?))
    }
}

impl WritableObject for ObjectKind {
    fn obj_ty(&self) -> ObjType {
        self.obj_type()
    }
}

#[cfg(test)]
mod tests;
