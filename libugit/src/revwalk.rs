use crate::error::GitResult;
use crate::hash::Oid;
use crate::obj::Commit;
use crate::repo::Repository;
use rustc_hash::FxHashSet;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, PartialEq)]
pub struct WalkedCommit {
    pub oid: Oid,
    pub commit: Commit,
}

/// Commit walk in descending committer-date order (the `log` order), with
/// optional hidden tips whose whole ancestry is excluded. Negotiation walks
/// this to enumerate `have` lines.
pub struct RevWalk<'r> {
    repo: &'r Repository,
    heap: BinaryHeap<(i64, Oid)>,
    seen: FxHashSet<Oid>,
    hidden: FxHashSet<Oid>,
}

impl<'r> RevWalk<'r> {
    pub fn new(repo: &'r Repository) -> Self {
        Self { repo, heap: BinaryHeap::new(), seen: Default::default(), hidden: Default::default() }
    }

    pub fn push(&mut self, oid: Oid) -> GitResult<()> {
        if self.seen.insert(oid) {
            let commit = self.repo.peel_to_commit(oid)?;
            self.heap.push((commit.committer.time.seconds, oid));
        }
        Ok(())
    }

    pub fn push_head(&mut self) -> GitResult<()> {
        if let Some(oid) = self.repo.try_fully_resolve_head()? {
            self.push(oid)?;
        }
        Ok(())
    }

    /// Excludes `oid` and everything reachable from it. The full closure is
    /// painted up front; correct over skewed timestamps, at the price of
    /// touching the whole hidden history.
    pub fn hide(&mut self, oid: Oid) -> GitResult<()> {
        self.hidden.extend(crate::graph::reachable_commits(self.repo, &[oid])?);
        Ok(())
    }
}

impl Iterator for RevWalk<'_> {
    type Item = GitResult<WalkedCommit>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (_, oid) = self.heap.pop()?;
            let commit = match self.repo.peel_to_commit(oid) {
                Ok(commit) => commit,
                Err(err) => return Some(Err(err)),
            };
            let truncated = match self.repo.is_shallow_root(oid) {
                Ok(truncated) => truncated,
                Err(err) => return Some(Err(err)),
            };
            if !truncated {
                for &parent in &commit.parents {
                    if self.seen.insert(parent) {
                        match self.repo.peel_to_commit(parent) {
                            Ok(parent_commit) => self
                                .heap
                                .push((parent_commit.committer.time.seconds, parent)),
                            Err(err) => return Some(Err(err)),
                        }
                    }
                }
            }
            if self.hidden.contains(&oid) {
                continue;
            }
            return Some(Ok(WalkedCommit { oid, commit }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn walks_newest_first() -> GitResult<()> {
        with_test_repo(|repo| {
            let mut expected = vec![];
            for i in 0..3 {
                expected.push(write_and_commit(&repo, &[("f", &i.to_string())], "c")?);
            }
            expected.reverse();

            let mut walk = RevWalk::new(&repo);
            walk.push_head()?;
            let oids: Vec<Oid> =
                walk.map(|c| c.map(|c| c.oid)).collect::<GitResult<_>>()?;
            assert_eq!(oids, expected);
            Ok(())
        })
    }

    #[test]
    fn hidden_ancestry_is_excluded() -> GitResult<()> {
        with_test_repo(|repo| {
            let old = write_and_commit(&repo, &[("f", "old")], "old")?;
            let new = write_and_commit(&repo, &[("f", "new")], "new")?;
            let mut walk = RevWalk::new(&repo);
            walk.push(new)?;
            walk.hide(old)?;
            let oids: Vec<Oid> =
                walk.map(|c| c.map(|c| c.oid)).collect::<GitResult<_>>()?;
            assert_eq!(oids, vec![new]);
            Ok(())
        })
    }
}
