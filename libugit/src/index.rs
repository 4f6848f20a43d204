mod index_entry;

pub use index_entry::*;

use crate::error::{GitError, GitResult};
use crate::hash::{HashAlgo, Oid};
use crate::io::{HashWriter, ReadExt, WriteExt};
use crate::lockfile::{Lockfile, LockfileFlags};
use crate::obj::{FileMode, Tree, TreeEntry};
use crate::odb::Odb;
use crate::path;
use crate::time::Timespec;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::PathBuf;

const INDEX_SIGNATURE: &[u8; 4] = b"DIRC";
const INDEX_VERSION_MIN: u32 = 2;
const INDEX_VERSION_MAX: u32 = 4;

/// extensions whose payloads describe entry state; they go stale the moment
/// the entry list changes and are dropped rather than rewritten wrong
const STATE_DEPENDENT_EXTENSIONS: [&[u8; 4]; 3] = [b"TREE", b"IEOT", b"UNTR"];

type EntryMap = BTreeMap<(String, MergeStage), IndexEntry>;

/// An opaque on-disk extension, carried through read/write untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexExtension {
    pub signature: [u8; 4],
    pub data: Vec<u8>,
}

/// The staging area: sorted entries plus extensions, bracketed by the
/// `DIRC` header and a trailing checksum.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexInner {
    version: u32,
    entries: EntryMap,
    extensions: Vec<IndexExtension>,
}

/// The staging area bound to its file. `load` then mutate then `write`; the
/// write recomputes the trailing hash and goes through a lockfile.
#[derive(Debug)]
pub struct Index {
    path: PathBuf,
    algo: HashAlgo,
    /// mtime of the index file when loaded; racy-clean detection compares
    /// worktree mtimes against this
    pub mtime: Option<Timespec>,
    inner: IndexInner,
    dirty: bool,
}

impl IndexInner {
    pub fn parse(bytes: &[u8], algo: HashAlgo) -> GitResult<Self> {
        let oid_size = algo.oid_size();
        ensure!(bytes.len() >= 12 + oid_size, GitError::corrupt("truncated index file"));
        // the trailing checksum covers everything before it, extensions
        // included; splitting up front makes the extension boundary exact
        let (body, checksum) = bytes.split_at(bytes.len() - oid_size);
        let computed = algo.hash_bytes(body);
        ensure_eq!(Oid::from_bytes(checksum)?, computed, "index checksum mismatch");

        let mut reader = std::io::Cursor::new(body);
        let mut sig = [0u8; 4];
        reader.read_exact(&mut sig)?;
        ensure_eq!(&sig, INDEX_SIGNATURE, "invalid index signature");
        let version = reader.read_u32()?;
        ensure!(
            (INDEX_VERSION_MIN..=INDEX_VERSION_MAX).contains(&version),
            "unsupported index version `{}`",
            version
        );
        let count = reader.read_u32()?;

        let mut entries = EntryMap::new();
        let mut previous_path = String::new();
        for _ in 0..count {
            let entry = IndexEntry::parse(&mut reader, version, &previous_path, algo)?;
            previous_path = entry.path.clone();
            let key = entry.key();
            ensure!(
                entries.insert(key.clone(), entry).is_none(),
                GitError::corrupt(format!("duplicate index entry `{}`", key.0))
            );
        }
        Self::validate_stages(&entries)?;

        let mut extensions = vec![];
        while (reader.position() as usize) < body.len() {
            let mut signature = [0u8; 4];
            reader.read_exact(&mut signature)?;
            let size = reader.read_u32()? as usize;
            ensure!(
                reader.position() as usize + size <= body.len(),
                GitError::corrupt("index extension overruns the checksum")
            );
            let mut data = vec![0u8; size];
            reader.read_exact(&mut data)?;
            extensions.push(IndexExtension { signature, data });
        }

        Ok(Self { version, entries, extensions })
    }

    fn validate_stages(entries: &EntryMap) -> GitResult<()> {
        // a path carries either a single stage-0 entry or a nonempty subset
        // of stages {1,2,3}, never both
        let mut it = entries.keys().peekable();
        while let Some((path, stage)) = it.next() {
            if *stage == MergeStage::None {
                if let Some((next_path, next_stage)) = it.peek() {
                    ensure!(
                        next_path != path || !next_stage.is_merging(),
                        GitError::corrupt(format!(
                            "path `{}` has both stage-0 and conflict stages",
                            path
                        ))
                    );
                }
            }
        }
        Ok(())
    }

    pub fn write_to(&self, writer: &mut dyn Write, algo: HashAlgo) -> GitResult<()> {
        let version = if self
            .entries
            .values()
            .any(|entry| !entry.extended_flags.is_empty())
        {
            3
        } else {
            2
        };
        let mut writer = HashWriter::new(algo, writer);
        writer.write_all(INDEX_SIGNATURE)?;
        writer.write_u32(version)?;
        writer.write_u32(self.entries.len() as u32)?;
        for entry in self.entries.values() {
            entry.write(&mut writer, algo)?;
        }
        for extension in &self.extensions {
            writer.write_all(&extension.signature)?;
            writer.write_u32(extension.data.len() as u32)?;
            writer.write_all(&extension.data)?;
        }
        writer.write_trailing_hash()?;
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str, stage: MergeStage) -> Option<&IndexEntry> {
        self.entries.get(&(path.to_owned(), stage))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        // consecutive stages of one path collapse to a single entry
        self.entries.values().map(|entry| entry.path.as_str()).dedup()
    }
}

/// The unmerged state of one path; absent sides were deleted on that side.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub path: String,
    pub base: Option<Oid>,
    pub ours: Option<Oid>,
    pub theirs: Option<Oid>,
}

pub type Conflicts = Vec<Conflict>;

impl Index {
    pub fn load(path: PathBuf, algo: HashAlgo) -> GitResult<Self> {
        let (inner, mtime) = match crate::fs::read_optional(&path)? {
            Some(bytes) => {
                let mtime = std::fs::metadata(&path).ok().map(|m| Timespec::mtime(&m));
                (IndexInner::parse(&bytes, algo)?, mtime)
            }
            // the index file may not exist yet
            None => (IndexInner { version: 2, ..Default::default() }, None),
        };
        Ok(Self { path, algo, mtime, inner, dirty: false })
    }

    pub fn inner(&self) -> &IndexInner {
        &self.inner
    }

    /// Replaces an entry at the same `(path, stage)`. Inserting stage 0
    /// clears conflict stages for the path and vice versa, maintaining the
    /// stage invariant by construction.
    pub fn add_entry(&mut self, entry: IndexEntry) {
        self.mark_dirty();
        let path = entry.path.clone();
        if entry.stage() == MergeStage::None {
            for stage in [MergeStage::Base, MergeStage::Ours, MergeStage::Theirs] {
                self.inner.entries.remove(&(path.clone(), stage));
            }
        } else {
            self.inner.entries.remove(&(path.clone(), MergeStage::None));
        }
        self.inner.entries.insert(entry.key(), entry);
    }

    /// Removes every stage of `path`; `false` when nothing was there.
    pub fn remove_path(&mut self, path: &str) -> bool {
        self.mark_dirty();
        let mut removed = false;
        for stage in
            [MergeStage::None, MergeStage::Base, MergeStage::Ours, MergeStage::Theirs]
        {
            removed |= self.inner.entries.remove(&(path.to_owned(), stage)).is_some();
        }
        removed
    }

    fn mark_dirty(&mut self) {
        if !self.dirty {
            self.dirty = true;
            self.inner
                .extensions
                .retain(|ext| !STATE_DEPENDENT_EXTENSIONS.contains(&&ext.signature));
        }
    }

    pub fn has_conflicts(&self) -> bool {
        self.inner.entries.values().any(|entry| entry.stage().is_merging())
    }

    pub fn conflicts(&self) -> Conflicts {
        let mut by_path: BTreeMap<&str, Conflict> = BTreeMap::new();
        for entry in self.inner.entries.values() {
            let stage = entry.stage();
            if !stage.is_merging() {
                continue;
            }
            let conflict = by_path.entry(&entry.path).or_insert_with(|| Conflict {
                path: entry.path.clone(),
                base: None,
                ours: None,
                theirs: None,
            });
            match stage {
                MergeStage::Base => conflict.base = Some(entry.oid),
                MergeStage::Ours => conflict.ours = Some(entry.oid),
                MergeStage::Theirs => conflict.theirs = Some(entry.oid),
                MergeStage::None => unreachable!(),
            }
        }
        by_path.into_values().collect()
    }

    /// Replaces the staged state with the contents of a tree, all at stage
    /// 0 with zeroed stat info (the next status run refreshes them).
    pub fn read_tree(&mut self, odb: &Odb, tree_oid: Oid) -> GitResult<()> {
        self.mark_dirty();
        self.inner.entries.clear();
        let mut stack = vec![(String::new(), tree_oid)];
        while let Some((prefix, oid)) = stack.pop() {
            let tree = odb.read_raw(oid)?.parse(odb.algo())?.into_tree()?;
            for entry in &tree.entries {
                if entry.mode.is_tree() {
                    stack.push((path::join(&prefix, &entry.path), entry.oid));
                } else {
                    let indexed = IndexEntry::from_tree_entry(&prefix, entry);
                    self.inner.entries.insert(indexed.key(), indexed);
                }
            }
        }
        Ok(())
    }

    /// Builds and writes the tree objects for the current entries.
    pub fn write_tree(&self, odb: &Odb) -> GitResult<Oid> {
        ensure!(
            !self.has_conflicts(),
            GitError::UnmergedPaths(
                self.conflicts().into_iter().map(|conflict| conflict.path).collect()
            )
        );
        build_tree(odb, "", &self.inner.entries.values().cloned().collect::<Vec<_>>())
    }

    /// Entries whose mtime equals the index file's own mtime may have been
    /// modified in the same clock tick the index was written; treat them as
    /// suspect rather than clean.
    pub fn is_racy_entry(&self, worktree_mtime: Timespec) -> bool {
        self.mtime.map(|mtime| mtime <= worktree_mtime).unwrap_or(true)
    }

    /// Persists under the lockfile, recomputing the trailing checksum.
    pub fn write(&self) -> GitResult<()> {
        Lockfile::with_mut(&self.path, LockfileFlags::empty(), |lockfile| {
            self.inner.write_to(lockfile, self.algo)
        })
    }
}

/// Bottom-up tree construction from sorted file entries: one recursion
/// level per directory depth.
fn build_tree(odb: &Odb, prefix: &str, entries: &[IndexEntry]) -> GitResult<Oid> {
    let mut tree = BTreeSet::new();
    let mut i = 0;
    while i < entries.len() {
        let entry = &entries[i];
        let relative = entry
            .path
            .strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .expect("entry outside its tree prefix");
        match relative.split_once('/') {
            None => {
                tree.insert(TreeEntry::new(entry.mode, relative, entry.oid));
                i += 1;
            }
            Some((dir, _)) => {
                // collect the whole contiguous run belonging to this subtree
                let subtree_prefix = path::join(prefix, dir);
                let start = i;
                while i < entries.len()
                    && path::has_prefix(&entries[i].path, &subtree_prefix)
                {
                    i += 1;
                }
                let subtree_oid = build_tree(odb, &subtree_prefix, &entries[start..i])?;
                tree.insert(TreeEntry::new(FileMode::Tree, dir, subtree_oid));
            }
        }
    }
    odb.write(&Tree::new(tree))
}

#[cfg(test)]
mod tests;
