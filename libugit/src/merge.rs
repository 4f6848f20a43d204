use crate::checkout::CheckoutOpts;
use crate::diff;
use crate::error::{GitError, GitResult};
use crate::graph;
use crate::hash::Oid;
use crate::index::{IndexEntry, MergeStage};
use crate::iter::{walk::WalkSource, Filter, Walker};
use crate::obj::{FileMode, ObjType, Tree, TreeEntry};
use crate::repo::Repository;
use crate::xdiff::{self, ConflictStyle};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone)]
pub struct MergeOpts {
    pub no_commit: bool,
    pub no_ff: bool,
    /// leave disk untouched on conflict instead of writing markers/stages
    pub abort_on_conflict: bool,
    pub message: Option<String>,
}

impl Default for MergeOpts {
    fn default() -> Self {
        Self { no_commit: false, no_ff: false, abort_on_conflict: false, message: None }
    }
}

/// What a merge produced. Conflicts leave the working tree and index
/// carrying markers/stages (unless `abort_on_conflict`), and no commit is
/// created.
#[derive(Debug, PartialEq)]
pub enum MergeResults {
    /// theirs was already reachable; nothing to do
    Null,
    FastForward { from: Oid, to: Oid },
    Conflicts(MergeConflicts),
    Merge(MergeSummary),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeSummary {
    pub commit: Option<Oid>,
    pub tree: Oid,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MergeConflicts {
    pub unmerged_paths: Vec<String>,
    pub conflicts: usize,
}

impl Display for MergeConflicts {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "automatic merge failed; fix conflicts and then commit the result")?;
        for path in &self.unmerged_paths {
            writeln!(f, "\tboth modified: {}", path)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Side {
    oid: Oid,
    mode: FileMode,
}

impl Side {
    fn of(entry: Option<&crate::iter::Entry>) -> Option<Side> {
        entry.map(|entry| Side {
            oid: entry.known_oid().expect("tree entries know their oid"),
            mode: entry.mode,
        })
    }
}

/// Per-path outcome of a tree-level merge.
#[derive(Debug)]
enum Take {
    Keep(Side),
    Conflict {
        base: Option<Side>,
        ours: Option<Side>,
        theirs: Option<Side>,
        /// blob with conflict markers (already written to the odb); doubles
        /// as the path's content in a virtual base
        merged: Side,
        /// cleared for directory/file collisions: the directory's files own
        /// the worktree path, the file side lives only in the stages
        materialize: bool,
    },
}

struct TreeMergeOutcome {
    /// full result: every path present after the merge
    takes: BTreeMap<String, Take>,
    conflicts: usize,
}

impl TreeMergeOutcome {
    fn unmerged_paths(&self) -> Vec<String> {
        self.takes
            .iter()
            .filter(|(_, take)| matches!(take, Take::Conflict { .. }))
            .map(|(path, _)| path.clone())
            .collect()
    }
}

pub fn merge(repo: &Repository, their_ref: crate::refs::GitRef, opts: &MergeOpts) -> GitResult<MergeResults> {
    let their_desc = match &their_ref {
        crate::refs::GitRef::Symbolic(sym) => sym.short().to_owned(),
        crate::refs::GitRef::Direct(oid) => oid.to_string(),
    };
    let their_head = repo.refdb().fully_resolve(their_ref)?;
    MergeCtxt::new(repo, their_head, their_desc, opts.clone())?.merge()
}

struct MergeCtxt<'r> {
    repo: &'r Repository,
    their_head: Oid,
    their_desc: String,
    opts: MergeOpts,
    style: ConflictStyle,
}

impl<'r> MergeCtxt<'r> {
    fn new(
        repo: &'r Repository,
        their_head: Oid,
        their_desc: String,
        opts: MergeOpts,
    ) -> GitResult<Self> {
        let style = repo.config().conflictstyle()?.parse()?;
        Ok(Self { repo, their_head, their_desc, opts, style })
    }

    /// Disallow any staged or unstaged changes before merging; untracked
    /// files are fine as long as the merge does not want their paths.
    fn pre_merge_checks(&self) -> GitResult<()> {
        let repo = self.repo;
        ensure!(repo.repo_state() == crate::repo::RepoState::None, "a merge is already in progress");
        let head_tree = repo.head_tree_oid()?;
        let staged = diff::diff_tree_to_index(repo, head_tree, Filter::MATCH_ALL)?;
        let unstaged = diff::diff_index_to_worktree(repo, Filter::MATCH_ALL)?;
        let mut dirty: Vec<String> =
            staged.paths().chain(unstaged.paths()).map(str::to_owned).collect();
        if !dirty.is_empty() {
            dirty.sort();
            dirty.dedup();
            bail!(
                "your local changes to the following files would be overwritten by merge:\n  {}",
                dirty.join("\n  ")
            );
        }
        Ok(())
    }

    fn merge(mut self) -> GitResult<MergeResults> {
        debug!("MergeCtxt::merge(theirs: {})", self.their_head);
        self.pre_merge_checks()?;
        let repo = self.repo;
        let our_head = repo.fully_resolve_head()?;
        let their_head = self.their_head;

        let base = self.merge_base_recursive(our_head, their_head)?;
        if let Some(base) = base {
            if base == their_head {
                return Ok(MergeResults::Null);
            }
            if !self.opts.no_ff && base == our_head {
                let tree = repo.tree_oid_of_commit(their_head)?;
                crate::checkout::checkout(repo, tree, &CheckoutOpts::default())?;
                repo.update_head_for_commit(
                    their_head,
                    Some(our_head),
                    &format!("merge {}: Fast-forward", self.their_desc),
                )?;
                return Ok(MergeResults::FastForward { from: our_head, to: their_head });
            }
        }

        let base_tree = match base {
            Some(base) => repo.tree_oid_of_commit(base)?,
            None => repo.algo().empty_tree(),
        };
        let our_tree = repo.tree_oid_of_commit(our_head)?;
        let their_tree = repo.tree_oid_of_commit(their_head)?;
        let outcome = self.merge_trees(base_tree, our_tree, their_tree)?;

        let message = self
            .opts
            .message
            .take()
            .unwrap_or_else(|| format!("Merge {} into HEAD", self.their_desc));

        if outcome.conflicts > 0 {
            let conflicts = MergeConflicts {
                unmerged_paths: outcome.unmerged_paths(),
                conflicts: outcome.conflicts,
            };
            if !self.opts.abort_on_conflict {
                self.apply_outcome(&outcome, our_tree)?;
                repo.write_merge_state(their_head, &message)?;
            }
            return Ok(MergeResults::Conflicts(conflicts));
        }

        self.apply_outcome(&outcome, our_tree)?;
        let tree = repo.index()?.write_tree(repo.odb())?;
        if self.opts.no_commit {
            repo.write_merge_state(their_head, &message)?;
            return Ok(MergeResults::Merge(MergeSummary { commit: None, tree }));
        }
        // first parent is always our side
        let commit = repo.commit_tree(tree, smallvec![our_head, their_head], message)?;
        repo.clear_merge_state()?;
        Ok(MergeResults::Merge(MergeSummary { commit: Some(commit), tree }))
    }

    /// The recursive strategy: multiple best common ancestors (criss-cross)
    /// are merged into a virtual base commit, recursively.
    fn merge_base_recursive(&mut self, ours: Oid, theirs: Oid) -> GitResult<Option<Oid>> {
        let bases = graph::merge_bases(self.repo, ours, theirs)?;
        match bases.as_slice() {
            [] => Ok(None),
            [base] => Ok(Some(*base)),
            [first, rest @ ..] => {
                debug!("criss-cross: merging {} bases into a virtual base", bases.len());
                let mut virtual_base = *first;
                for &other in rest {
                    virtual_base = self.make_virtual_base(virtual_base, other)?;
                }
                Ok(Some(virtual_base))
            }
        }
    }

    /// Merges two ancestors purely in the object store (no index/worktree),
    /// accepting conflict markers as content, and records the result as a
    /// virtual commit that only the recursion ever sees.
    fn make_virtual_base(&mut self, a: Oid, b: Oid) -> GitResult<Oid> {
        debug!("MergeCtxt::make_virtual_base({}, {})", a, b);
        let repo = self.repo;
        let base = self.merge_base_recursive(a, b)?;
        let base_tree = match base {
            Some(base) => repo.tree_oid_of_commit(base)?,
            None => repo.algo().empty_tree(),
        };
        let outcome =
            self.merge_trees(base_tree, repo.tree_oid_of_commit(a)?, repo.tree_oid_of_commit(b)?)?;
        let tree = self.build_result_tree(&outcome)?;
        repo.write_commit_detached(
            tree,
            smallvec![a, b],
            "virtual merge base".to_owned(),
        )
    }

    /// Pure three-way tree merge. File-level conflicts produce marker blobs
    /// in the odb; nothing outside the object store is touched.
    fn merge_trees(
        &self,
        base_tree: Oid,
        our_tree: Oid,
        their_tree: Oid,
    ) -> GitResult<TreeMergeOutcome> {
        let repo = self.repo;
        let mut takes: BTreeMap<String, Take> = BTreeMap::new();
        let mut conflicts = 0;

        let sources = [
            WalkSource::Tree(base_tree),
            WalkSource::Tree(our_tree),
            WalkSource::Tree(their_tree),
        ];
        for item in Walker::new(repo, &sources, Filter::MATCH_ALL)? {
            let base = Side::of(item.slot(0));
            let ours = Side::of(item.slot(1));
            let theirs = Side::of(item.slot(2));

            let take = if ours == theirs {
                // identical on both sides, including identical deletion
                match &ours {
                    Some(side) => Take::Keep(side.clone()),
                    None => continue,
                }
            } else if base == ours {
                // only theirs changed
                match &theirs {
                    Some(side) => Take::Keep(side.clone()),
                    None => continue,
                }
            } else if base == theirs {
                match &ours {
                    Some(side) => Take::Keep(side.clone()),
                    None => continue,
                }
            } else {
                // genuine divergence: line-level merge when both sides still
                // have a file; delete/modify is always a conflict
                let (take, conflicted) = self.divergent_take(&item.path, base, ours, theirs)?;
                if conflicted {
                    conflicts += 1;
                }
                take
            };
            takes.insert(item.path, take);
        }

        resolve_df_collisions(&mut takes, &mut conflicts);
        Ok(TreeMergeOutcome { takes, conflicts })
    }

    fn divergent_take(
        &self,
        path: &str,
        base: Option<Side>,
        ours: Option<Side>,
        theirs: Option<Side>,
    ) -> GitResult<(Take, bool)> {
        let repo = self.repo;
        let read = |side: &Option<Side>| -> GitResult<Vec<u8>> {
            match side {
                Some(side) => repo.read_blob(side.oid),
                None => Ok(vec![]),
            }
        };
        let base_bytes = read(&base)?;
        let our_bytes = read(&ours)?;
        let their_bytes = read(&theirs)?;

        let mode = match (&ours, &theirs) {
            (Some(our_side), _) => our_side.mode,
            (None, Some(their_side)) => their_side.mode,
            (None, None) => FileMode::Reg,
        };
        let both_present = ours.is_some() && theirs.is_some();
        if !both_present {
            // modify/delete: the surviving side's content stays on disk,
            // the stages record the disagreement
            let survivor = if ours.is_some() { &our_bytes } else { &their_bytes };
            let merged_oid = repo.odb().write_raw(ObjType::Blob, survivor)?;
            trace!("modify/delete conflict for `{}`", path);
            return Ok((
                Take::Conflict {
                    base,
                    ours,
                    theirs,
                    merged: Side { oid: merged_oid, mode },
                    materialize: true,
                },
                true,
            ));
        }

        let merged = xdiff::merge_blobs(
            self.style,
            "HEAD",
            &self.their_desc,
            &base_bytes,
            &our_bytes,
            &their_bytes,
        );
        let merged_oid = repo.odb().write_raw(ObjType::Blob, &merged.bytes)?;
        if merged.is_clean() {
            // edits touched disjoint regions; no conflict at all
            return Ok((Take::Keep(Side { oid: merged_oid, mode }), false));
        }
        trace!("conflicted take for `{}` ({} hunks)", path, merged.conflicts);
        Ok((
            Take::Conflict {
                base,
                ours,
                theirs,
                merged: Side { oid: merged_oid, mode },
                materialize: true,
            },
            true,
        ))
    }

    /// Builds the result tree of a pure merge (virtual bases): conflicted
    /// paths contribute their marker blobs.
    fn build_result_tree(&self, outcome: &TreeMergeOutcome) -> GitResult<Oid> {
        let entries: Vec<IndexEntry> = outcome
            .takes
            .iter()
            .filter_map(|(path, take)| {
                let side = match take {
                    Take::Keep(side) => side,
                    Take::Conflict { merged, materialize: true, .. } => merged,
                    // the directory side of a D/F collision owns the path
                    Take::Conflict { materialize: false, .. } => return None,
                };
                Some(synthetic_entry(path, side))
            })
            .collect();
        build_tree_from_entries(self.repo, &entries)
    }

    /// Applies a merge outcome to the index and working tree: clean paths
    /// land at stage 0, conflicted paths get marker files plus stages
    /// 1/2/3 and no stage 0.
    fn apply_outcome(&self, outcome: &TreeMergeOutcome, our_tree: Oid) -> GitResult<()> {
        let repo = self.repo;
        let mut index = repo.index()?;

        // paths in ours but absent from the result are deletions
        let our_paths: Vec<String> =
            crate::iter::TreeIter::new(repo, our_tree, Filter::MATCH_ALL)?
                .map(|entry| entry.map(|e| e.path))
                .collect::<GitResult<_>>()?;
        for path in &our_paths {
            if !outcome.takes.contains_key(path) {
                index.remove_path(path);
                crate::checkout::remove_worktree_file(repo, path)?;
            }
        }

        for (path, take) in &outcome.takes {
            match take {
                Take::Keep(side) => {
                    crate::checkout::write_worktree_file(repo, path, side.oid, side.mode)?;
                    index.add_entry(IndexEntry::from_file(
                        &repo.to_absolute(path),
                        path,
                        side.oid,
                    )?);
                }
                Take::Conflict { base, ours, theirs, merged, materialize } => {
                    if *materialize {
                        crate::checkout::write_worktree_file(repo, path, merged.oid, merged.mode)?;
                    }
                    index.remove_path(path);
                    for (stage, side) in [
                        (MergeStage::Base, base),
                        (MergeStage::Ours, ours),
                        (MergeStage::Theirs, theirs),
                    ] {
                        if let Some(side) = side {
                            index.add_entry(synthetic_entry(path, side).with_stage(stage));
                        }
                    }
                }
            }
        }
        index.write()
    }
}

/// A file at `p` colliding with a directory `p/` from the other side: the
/// directory's files keep the worktree path, the file is parked in the
/// ours-stage with no stage 0 and nothing materialized at `p`.
fn resolve_df_collisions(takes: &mut BTreeMap<String, Take>, conflicts: &mut usize) {
    let paths: Vec<String> = takes.keys().cloned().collect();
    for path in &paths {
        let collides = paths
            .iter()
            .any(|other| other.len() > path.len() && crate::path::has_prefix(other, path));
        if !collides {
            continue;
        }
        match takes.get_mut(path) {
            Some(Take::Keep(side)) => {
                let side = side.clone();
                *conflicts += 1;
                takes.insert(
                    path.clone(),
                    Take::Conflict {
                        base: None,
                        ours: Some(side.clone()),
                        theirs: None,
                        merged: side,
                        materialize: false,
                    },
                );
            }
            Some(Take::Conflict { materialize, .. }) => *materialize = false,
            None => {}
        }
    }
}

fn synthetic_entry(path: &str, side: &Side) -> IndexEntry {
    IndexEntry {
        ctime: crate::time::Timespec::zero(),
        mtime: crate::time::Timespec::zero(),
        device: 0,
        inode: 0,
        mode: side.mode,
        uid: 0,
        gid: 0,
        filesize: 0,
        oid: side.oid,
        flags: crate::index::IndexEntryFlags::with_path_len(path.len()),
        extended_flags: Default::default(),
        path: path.to_owned(),
    }
}

/// Tree construction from sorted synthetic entries (no index involved).
fn build_tree_from_entries(repo: &Repository, entries: &[IndexEntry]) -> GitResult<Oid> {
    fn build(repo: &Repository, prefix: &str, entries: &[IndexEntry]) -> GitResult<Oid> {
        let mut tree = std::collections::BTreeSet::new();
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
                    let subtree_prefix = crate::path::join(prefix, dir);
                    let start = i;
                    while i < entries.len()
                        && crate::path::has_prefix(&entries[i].path, &subtree_prefix)
                    {
                        i += 1;
                    }
                    let subtree = build(repo, &subtree_prefix, &entries[start..i])?;
                    tree.insert(TreeEntry::new(FileMode::Tree, dir, subtree));
                }
            }
        }
        repo.write_obj(&Tree::new(tree))
    }
    build(repo, "", entries)
}

#[cfg(test)]
mod tests;
