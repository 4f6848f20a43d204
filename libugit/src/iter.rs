//! The walker: a synchronized traversal over any combination of the HEAD
//! (or another) tree, the staging area, and the working directory. Every
//! source yields file entries sorted by raw path bytes, which coincides
//! with canonical tree order because directories themselves never appear
//! in the merged stream.

pub mod walk;

pub use walk::{WalkItem, Walker};

use crate::error::{GitError, GitResult};
use crate::hash::Oid;
use crate::index::{Index, IndexEntry, MergeStage};
use crate::obj::{FileMode, ObjType, RawObject};
use crate::path;
use crate::repo::Repository;
use crate::time::Timespec;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;

/// Which source produced an entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Tree,
    Stage,
    Workdir,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorktreeStat {
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub size: u64,
    pub mode: FileMode,
}

/// A lazily-evaluated per-source handle. `oid()` and `content()` for
/// workdir entries touch the filesystem on first call and memoize.
#[derive(Debug, Clone)]
pub struct Entry {
    pub path: String,
    pub mode: FileMode,
    pub source: SourceKind,
    oid: Rc<RefCell<Option<Oid>>>,
    abs_path: Option<PathBuf>,
    stat: Option<WorktreeStat>,
    pub index_entry: Option<IndexEntry>,
}

impl Entry {
    pub fn from_tree(path: String, mode: FileMode, oid: Oid) -> Self {
        Self {
            path,
            mode,
            source: SourceKind::Tree,
            oid: Rc::new(RefCell::new(Some(oid))),
            abs_path: None,
            stat: None,
            index_entry: None,
        }
    }

    pub fn from_index(entry: IndexEntry) -> Self {
        Self {
            path: entry.path.clone(),
            mode: entry.mode,
            source: SourceKind::Stage,
            oid: Rc::new(RefCell::new(Some(entry.oid))),
            abs_path: None,
            stat: Some(WorktreeStat {
                mtime: entry.mtime,
                ctime: entry.ctime,
                size: entry.filesize as u64,
                mode: entry.mode,
            }),
            index_entry: Some(entry),
        }
    }

    fn from_workdir(path: String, abs_path: PathBuf, stat: WorktreeStat) -> Self {
        Self {
            path,
            mode: stat.mode,
            source: SourceKind::Workdir,
            oid: Rc::new(RefCell::new(None)),
            abs_path: Some(abs_path),
            stat: Some(stat),
            index_entry: None,
        }
    }

    pub fn obj_type(&self) -> ObjType {
        self.mode.infer_obj_type()
    }

    /// The object id; for workdir entries this hashes the file contents on
    /// first call (without writing the object).
    pub fn oid(&self, repo: &Repository) -> GitResult<Oid> {
        if let Some(oid) = *self.oid.borrow() {
            return Ok(oid);
        }
        let bytes = self.read_file_bytes()?;
        let oid = RawObject::new(ObjType::Blob, bytes).oid(repo.algo());
        *self.oid.borrow_mut() = Some(oid);
        Ok(oid)
    }

    /// Known oid without IO, when one is available.
    pub fn known_oid(&self) -> Option<Oid> {
        *self.oid.borrow()
    }

    /// Blob contents of this entry.
    pub fn content(&self, repo: &Repository) -> GitResult<Vec<u8>> {
        match self.source {
            SourceKind::Workdir => self.read_file_bytes(),
            _ => repo.read_blob(self.known_oid().expect("tree/stage entries know their oid")),
        }
    }

    fn read_file_bytes(&self) -> GitResult<Vec<u8>> {
        let abs = self.abs_path.as_ref().expect("only workdir entries read files");
        if self.mode.is_link() {
            Ok(std::fs::read_link(abs)?.to_string_lossy().into_owned().into_bytes())
        } else {
            Ok(std::fs::read(abs)?)
        }
    }

    /// Filesystem metadata; `None` for tree entries.
    pub fn stat(&self) -> Option<WorktreeStat> {
        self.stat
    }
}

/// Subtree filter: empty means whole tree, and entries prune eagerly so
/// filtered walks skip whole subtrees.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    prefixes: Vec<String>,
}

impl Filter {
    pub const MATCH_ALL: Filter = Filter { prefixes: Vec::new() };

    pub fn new(prefixes: &[&str]) -> GitResult<Self> {
        for prefix in prefixes {
            path::validate_filter(prefix)?;
        }
        Ok(Self {
            prefixes: prefixes.iter().filter(|p| !p.is_empty()).map(|p| (*p).to_owned()).collect(),
        })
    }

    pub fn matches(&self, file_path: &str) -> bool {
        self.prefixes.is_empty()
            || self.prefixes.iter().any(|prefix| {
                path::has_prefix(file_path, prefix) || path::has_prefix(prefix, file_path)
            })
    }

    /// Whether a subtree at `dir_path` can be skipped entirely.
    pub fn prunes(&self, dir_path: &str) -> bool {
        !self.prefixes.is_empty()
            && !self.prefixes.iter().any(|prefix| {
                path::has_prefix(prefix, dir_path) || path::has_prefix(dir_path, prefix)
            })
    }
}

/// Depth-first file iterator over a stored tree.
pub struct TreeIter<'r> {
    repo: &'r Repository,
    filter: Filter,
    /// queued entries of partially-walked trees, outermost last
    stack: Vec<(String, VecDeque<crate::obj::TreeEntry>)>,
}

impl<'r> TreeIter<'r> {
    pub fn new(repo: &'r Repository, tree_oid: Oid, filter: Filter) -> GitResult<Self> {
        let tree = repo.read_tree(tree_oid)?;
        Ok(Self { repo, filter, stack: vec![(String::new(), tree.entries.into_iter().collect())] })
    }
}

impl Iterator for TreeIter<'_> {
    type Item = GitResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (prefix, entries) = self.stack.last_mut()?;
            let entry = match entries.pop_front() {
                Some(entry) => entry,
                None => {
                    self.stack.pop();
                    continue;
                }
            };
            let full_path = path::join(prefix, &entry.path);
            if entry.mode.is_tree() {
                if self.filter.prunes(&full_path) {
                    continue;
                }
                let subtree = match self.repo.read_tree(entry.oid) {
                    Ok(tree) => tree,
                    Err(err) => return Some(Err(err)),
                };
                self.stack.push((full_path, subtree.entries.into_iter().collect()));
                continue;
            }
            if !self.filter.matches(&full_path) {
                continue;
            }
            return Some(Ok(Entry::from_tree(full_path, entry.mode, entry.oid)));
        }
    }
}

/// Stage-0 index entries as walker entries (conflict stages are surfaced
/// through [`Index::conflicts`], not the walker).
pub fn index_entries(index: &Index, filter: &Filter) -> Vec<Entry> {
    index
        .inner()
        .entries()
        .filter(|entry| entry.stage() == MergeStage::None)
        .filter(|entry| filter.matches(&entry.path))
        .map(|entry| Entry::from_index(entry.clone()))
        .collect()
}

/// Working-directory files honoring `.gitignore`/`info/exclude`, collected
/// and sorted into walk order.
pub fn worktree_entries(repo: &Repository, filter: &Filter) -> GitResult<Vec<Entry>> {
    ensure!(!repo.is_bare(), "bare repository has no working directory");
    let workdir = repo.workdir();
    let mut builder = ignore::WalkBuilder::new(workdir);
    builder
        .hidden(false)
        .parents(false)
        .git_global(false)
        .git_ignore(true)
        .git_exclude(true)
        .require_git(false)
        .sort_by_file_name(std::ffi::OsStr::cmp);

    let mut entries = vec![];
    for result in builder.build() {
        let entry = result?;
        let abs = entry.path().to_path_buf();
        let rel = match abs.strip_prefix(workdir) {
            Ok(rel) if rel.as_os_str().is_empty() => continue,
            Ok(rel) => rel,
            Err(..) => continue,
        };
        let rel = match rel.to_str() {
            Some(rel) => rel.to_owned(),
            None => {
                return Err(anyhow!(GitError::InvalidFilepath(
                    rel.to_string_lossy().into_owned()
                )))
            }
        };
        if rel == crate::repo::GIT_DIR_NAME || rel.starts_with(".git/") {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(..) => continue,
        };
        if metadata.is_dir() {
            continue;
        }
        if !filter.matches(&rel) {
            continue;
        }
        let mode = FileMode::from_metadata(&metadata);
        let stat = WorktreeStat {
            mtime: Timespec::mtime(&metadata),
            ctime: Timespec::ctime(&metadata),
            size: metadata.len(),
            mode,
        };
        entries.push(Entry::from_workdir(rel, abs, stat));
    }
    // walk order is plain byte order on full paths
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

#[cfg(test)]
mod tests;
