use crate::error::GitResult;
use crate::refs::{Reflog, SymbolicRef};
use crate::repo::Repository;
use crate::revwalk::{RevWalk, WalkedCommit};

/// `log`: HEAD ancestry, newest first.
pub fn log(repo: &Repository, limit: Option<usize>) -> GitResult<Vec<WalkedCommit>> {
    let mut walk = RevWalk::new(repo);
    walk.push_head()?;
    match limit {
        Some(limit) => walk.take(limit).collect(),
        None => walk.collect(),
    }
}

/// `reflog <ref>`.
pub fn reflog(repo: &Repository, name: &str) -> GitResult<Reflog> {
    repo.refdb().read_reflog(&SymbolicRef::new(name.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn log_lists_ancestry() -> GitResult<()> {
        with_test_repo(|repo| {
            write_and_commit(&repo, &[("f", "1")], "one")?;
            write_and_commit(&repo, &[("f", "2")], "two")?;
            let entries = log(&repo, None)?;
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].commit.subject(), "two");
            assert_eq!(entries[1].commit.subject(), "one");
            assert_eq!(log(&repo, Some(1))?.len(), 1);
            Ok(())
        })
    }
}
