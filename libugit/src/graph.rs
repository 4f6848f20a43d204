//! Commit-DAG reachability: merge bases via parallel painting from both
//! tips, plus ancestry tests and object-closure enumeration for the wire
//! engine.

use crate::error::GitResult;
use crate::hash::Oid;
use crate::obj::ObjectKind;
use crate::repo::Repository;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BinaryHeap;

const PARENT1: u8 = 1;
const PARENT2: u8 = 2;
const BOTH: u8 = PARENT1 | PARENT2;
const STALE: u8 = 4;

fn commit_date(repo: &Repository, oid: Oid) -> GitResult<i64> {
    Ok(repo.peel_to_commit(oid)?.committer.time.seconds)
}

/// Parents of a commit, treating shallow roots as parentless so truncated
/// histories terminate cleanly.
fn parents_of(repo: &Repository, oid: Oid) -> GitResult<Vec<Oid>> {
    if repo.is_shallow_root(oid)? {
        return Ok(vec![]);
    }
    Ok(repo.peel_to_commit(oid)?.parents.to_vec())
}

/// All best common ancestors of `a` and `b`: commits reachable from both
/// with no descendant that also is. More than one result is the criss-cross
/// case the recursive merge strategy deals with.
pub fn merge_bases(repo: &Repository, a: Oid, b: Oid) -> GitResult<Vec<Oid>> {
    if a == b {
        return Ok(vec![a]);
    }
    let candidates = paint_down_to_common(repo, a, b)?;
    // drop candidates that are ancestors of other candidates
    let mut best = vec![];
    'candidate: for &candidate in &candidates {
        for &other in &candidates {
            if other != candidate && is_ancestor(repo, candidate, other)? {
                continue 'candidate;
            }
        }
        best.push(candidate);
    }
    Ok(best)
}

pub fn merge_base(repo: &Repository, a: Oid, b: Oid) -> GitResult<Option<Oid>> {
    Ok(merge_bases(repo, a, b)?.into_iter().next())
}

/// Both-painted commits found by walking the two tips in parallel,
/// newest-first so common history is reached before it is re-walked.
fn paint_down_to_common(repo: &Repository, a: Oid, b: Oid) -> GitResult<Vec<Oid>> {
    let mut flags: FxHashMap<Oid, u8> = Default::default();
    let mut heap: BinaryHeap<(i64, Oid)> = BinaryHeap::new();
    flags.insert(a, PARENT1);
    flags.insert(b, PARENT2);
    heap.push((commit_date(repo, a)?, a));
    heap.push((commit_date(repo, b)?, b));

    let mut results = vec![];
    while heap.iter().any(|&(_, oid)| flags[&oid] & STALE == 0) {
        let (_, oid) = heap.pop().expect("loop condition guarantees an entry");
        let mut f = flags[&oid];
        if f & BOTH == BOTH && f & STALE == 0 {
            results.push(oid);
            f |= STALE;
            flags.insert(oid, f);
        }
        let pass = f & (BOTH | STALE);
        for parent in parents_of(repo, oid)? {
            let known = flags.entry(parent).or_insert(0);
            if *known & pass != pass {
                *known |= pass;
                heap.push((commit_date(repo, parent)?, parent));
            }
        }
    }
    Ok(results)
}

/// Whether `ancestor` is reachable from `descendant` via parent edges.
pub fn is_ancestor(repo: &Repository, ancestor: Oid, descendant: Oid) -> GitResult<bool> {
    if ancestor == descendant {
        return Ok(true);
    }
    let cutoff = commit_date(repo, ancestor)?;
    let mut seen: FxHashSet<Oid> = Default::default();
    let mut heap = BinaryHeap::new();
    heap.push((commit_date(repo, descendant)?, descendant));
    seen.insert(descendant);
    while let Some((date, oid)) = heap.pop() {
        if oid == ancestor {
            return Ok(true);
        }
        // clock skew tolerance: keep walking slightly past the cutoff
        if date < cutoff - 86400 {
            continue;
        }
        for parent in parents_of(repo, oid)? {
            if seen.insert(parent) {
                heap.push((commit_date(repo, parent)?, parent));
            }
        }
    }
    Ok(false)
}

/// The full object closure (commits, trees, blobs, tags) reachable from
/// `roots`, skipping anything already in `skip` and growing `skip` as it
/// goes. The wire engine computes pack contents as
/// `closure(wants) - closure(haves)`.
pub fn reachable_objects(
    repo: &Repository,
    roots: &[Oid],
    skip: &mut FxHashSet<Oid>,
) -> GitResult<Vec<Oid>> {
    let mut out = vec![];
    let mut stack: Vec<Oid> = roots.iter().copied().filter(|oid| !skip.contains(oid)).collect();
    while let Some(oid) = stack.pop() {
        if !skip.insert(oid) {
            continue;
        }
        out.push(oid);
        match repo.read_obj(oid)? {
            ObjectKind::Commit(commit) => {
                stack.push(commit.tree);
                if !repo.is_shallow_root(oid)? {
                    stack.extend(commit.parents.iter().copied());
                }
            }
            ObjectKind::Tree(tree) => {
                for entry in &tree.entries {
                    // gitlinks live in a foreign object store
                    if !entry.mode.is_gitlink() {
                        stack.push(entry.oid);
                    }
                }
            }
            ObjectKind::Tag(tag) => stack.push(tag.object),
            ObjectKind::Blob(..) => {}
        }
    }
    Ok(out)
}

/// Commit closure only; negotiation paints have-sets with this.
pub fn reachable_commits(repo: &Repository, roots: &[Oid]) -> GitResult<FxHashSet<Oid>> {
    let mut seen: FxHashSet<Oid> = Default::default();
    let mut stack: Vec<Oid> = roots.to_vec();
    while let Some(oid) = stack.pop() {
        if !seen.insert(oid) {
            continue;
        }
        for parent in parents_of(repo, oid)? {
            stack.push(parent);
        }
    }
    Ok(seen)
}
