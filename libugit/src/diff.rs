//! Pairwise diffs between walker sources; status, checkout safety, and the
//! merge pre-checks are all built on these.

use crate::error::GitResult;
use crate::hash::Oid;
use crate::iter::{walk::WalkSource, Entry, Filter, SourceKind, Walker};
use crate::repo::Repository;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct Change {
    pub kind: ChangeKind,
    pub path: String,
    pub old: Option<Entry>,
    pub new: Option<Entry>,
}

#[derive(Debug, Default)]
pub struct TreeDiff {
    pub changes: Vec<Change>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|change| change.path.as_str())
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.changes.iter().any(|change| change.path == path)
    }

    fn push(&mut self, kind: ChangeKind, path: String, old: Option<Entry>, new: Option<Entry>) {
        self.changes.push(Change { kind, path, old, new });
    }
}

/// Whether two entries hold the same content, spending the minimum effort:
/// known oids first, then the stat shortcut, hashing only as a last resort.
fn entries_equal(repo: &Repository, index: &RacyCheck, old: &Entry, new: &Entry) -> GitResult<bool> {
    if old.mode != new.mode {
        // filesystems without a trustworthy executable bit report mode
        // noise; `core.filemode = false` ignores exec-bit-only differences
        let exec_flip_only = old.mode.is_file() && new.mode.is_file();
        if !exec_flip_only || repo.config().filemode()? {
            return Ok(false);
        }
    }
    if let (Some(old_oid), Some(new_oid)) = (old.known_oid(), new.known_oid()) {
        return Ok(old_oid == new_oid);
    }
    // index vs worktree: trust matching stat data unless the entry is racy
    if old.source == SourceKind::Stage && new.source == SourceKind::Workdir {
        if let (Some(old_stat), Some(new_stat)) = (old.stat(), new.stat()) {
            if old_stat.mtime == new_stat.mtime
                && old_stat.size == new_stat.size
                && !index.racy(new_stat.mtime)
            {
                return Ok(true);
            }
        }
    }
    Ok(old.oid(repo)? == new.oid(repo)?)
}

// minimal view of the index needed for racy-entry decisions
struct RacyCheck {
    mtime: Option<crate::time::Timespec>,
}

impl RacyCheck {
    fn racy(&self, worktree_mtime: crate::time::Timespec) -> bool {
        self.mtime.map(|mtime| mtime <= worktree_mtime).unwrap_or(true)
    }
}

fn diff_sources(
    repo: &Repository,
    old: WalkSource,
    new: WalkSource,
    filter: Filter,
) -> GitResult<TreeDiff> {
    let index = RacyCheck { mtime: repo.index()?.mtime };
    let mut diff = TreeDiff::default();
    for item in Walker::new(repo, &[old, new], filter)? {
        let old = item.slot(0).cloned();
        let new = item.slot(1).cloned();
        match (old, new) {
            (Some(old), Some(new)) => {
                if !entries_equal(repo, &index, &old, &new)? {
                    diff.push(ChangeKind::Modified, item.path, Some(old), Some(new));
                }
            }
            (Some(old), None) => diff.push(ChangeKind::Deleted, item.path, Some(old), None),
            (None, Some(new)) => diff.push(ChangeKind::Created, item.path, None, Some(new)),
            (None, None) => unreachable!("walker yields only populated paths"),
        }
    }
    Ok(diff)
}

/// HEAD (or any) tree vs the staging area: the "changes to be committed".
pub fn diff_tree_to_index(repo: &Repository, tree: Oid, filter: Filter) -> GitResult<TreeDiff> {
    diff_sources(repo, WalkSource::Tree(tree), WalkSource::Stage, filter)
}

/// Staging area vs working directory: the "changes not staged".
pub fn diff_index_to_worktree(repo: &Repository, filter: Filter) -> GitResult<TreeDiff> {
    diff_sources(repo, WalkSource::Stage, WalkSource::Workdir, filter)
}

pub fn diff_tree_to_tree(
    repo: &Repository,
    old_tree: Oid,
    new_tree: Oid,
    filter: Filter,
) -> GitResult<TreeDiff> {
    diff_sources(repo, WalkSource::Tree(old_tree), WalkSource::Tree(new_tree), filter)
}

pub fn diff_tree_to_worktree(repo: &Repository, tree: Oid, filter: Filter) -> GitResult<TreeDiff> {
    diff_sources(repo, WalkSource::Tree(tree), WalkSource::Workdir, filter)
}
