use super::{FileMode, ObjType, WritableObject};
use crate::error::{GitError, GitResult};
use crate::hash::{HashAlgo, Oid};
use crate::io::{BufReadExt, ReadExt};
use crate::path;
use crate::serialize::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::io::{BufRead, Cursor, Write};

/// An ordered sequence of `(mode, name, oid)` entries. The `BTreeSet`
/// ordering is the canonical on-disk ordering (see [`TreeEntry::cmp`]), so
/// serialization is byte-identical for a given logical tree.
#[derive(PartialEq, Debug, Default, Clone)]
pub struct Tree {
    pub entries: BTreeSet<TreeEntry>,
}

impl Tree {
    pub fn new(entries: BTreeSet<TreeEntry>) -> Self {
        Self { entries }
    }

    pub fn parse(bytes: &[u8], algo: HashAlgo) -> GitResult<Self> {
        let mut reader = Cursor::new(bytes);
        let mut tree = Self::default();
        let mut last: Option<TreeEntry> = None;
        while !reader.is_at_eof()? {
            let entry = TreeEntry::parse(&mut reader, algo)?;
            // the set ordering must agree with the on-disk order, otherwise
            // reserialization would not be byte-identical
            if let Some(prev) = &last {
                if prev.cmp(&entry) != Ordering::Less {
                    return Err(GitError::corrupt(format!(
                        "tree entry `{}` out of order after `{}`",
                        entry.path, prev.path
                    )));
                }
            }
            last = Some(entry.clone());
            tree.entries.insert(entry);
        }
        Ok(tree)
    }

    pub fn find_entry(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|entry| entry.path == name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for Tree {
    fn serialize(&self, writer: &mut dyn Write) -> GitResult<()> {
        for entry in &self.entries {
            entry.serialize(writer)?;
        }
        Ok(())
    }
}

impl WritableObject for Tree {
    fn obj_ty(&self) -> ObjType {
        ObjType::Tree
    }
}

impl Display for Tree {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{}", entry)?;
        }
        Ok(())
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct TreeEntry {
    pub mode: FileMode,
    pub path: String,
    pub oid: Oid,
}

impl TreeEntry {
    pub fn new(mode: FileMode, path: impl Into<String>, oid: Oid) -> Self {
        Self { mode, path: path.into(), oid }
    }

    fn parse(reader: &mut impl BufRead, algo: HashAlgo) -> GitResult<Self> {
        let mut buf = vec![];
        let i = reader.read_until(0x20, &mut buf)?;
        ensure!(i > 1, "truncated tree entry");
        let mode: FileMode = std::str::from_utf8(&buf[..i - 1])?.parse()?;
        let path = reader.read_null_terminated_str()?;
        let oid = reader.read_oid(algo)?;
        Ok(Self { mode, path, oid })
    }
}

impl Serialize for TreeEntry {
    fn serialize(&self, writer: &mut dyn Write) -> GitResult<()> {
        // the alternate display form drops the leading zero, as on disk
        write!(writer, "{:#} {}\0", self.mode, self.path)?;
        writer.write_all(self.oid.as_bytes())?;
        Ok(())
    }
}

impl Display for TreeEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\t{}", self.mode, self.mode.infer_obj_type(), self.oid, self.path)
    }
}

impl PartialOrd for TreeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TreeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        path::tree_entry_cmp(&self.path, self.mode.is_tree(), &other.path, other.mode.is_tree())
    }
}
