use crate::diff::{self, Change, ChangeKind};
use crate::error::GitResult;
use crate::iter::Filter;
use crate::repo::Repository;

/// The usual three-way classification plus unmerged paths during a merge.
#[derive(Debug, Default)]
pub struct Status {
    /// HEAD tree vs index
    pub staged: Vec<Change>,
    /// index vs worktree, tracked paths only
    pub unstaged: Vec<Change>,
    /// present in the worktree, unknown to the index
    pub untracked: Vec<String>,
    pub unmerged: Vec<String>,
}

impl Status {
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty()
            && self.unstaged.is_empty()
            && self.untracked.is_empty()
            && self.unmerged.is_empty()
    }
}

pub fn status(repo: &Repository) -> GitResult<Status> {
    let head_tree = repo.head_tree_oid()?;
    let staged = diff::diff_tree_to_index(repo, head_tree, Filter::MATCH_ALL)?;
    let worktree = diff::diff_index_to_worktree(repo, Filter::MATCH_ALL)?;

    let mut status = Status::default();
    status.staged = staged.changes;
    for change in worktree.changes {
        match change.kind {
            // a file the index does not know about is untracked, not staged
            ChangeKind::Created => status.untracked.push(change.path),
            _ => status.unstaged.push(change),
        }
    }
    status.unmerged =
        repo.index()?.conflicts().into_iter().map(|conflict| conflict.path).collect();
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn clean_after_commit() -> GitResult<()> {
        with_sample_repo(|repo| {
            let status = status(&repo)?;
            assert!(status.is_clean(), "expected clean status, got {:?}", status);
            Ok(())
        })
    }

    #[test]
    fn detects_staged_unstaged_and_untracked() -> GitResult<()> {
        with_sample_repo(|repo| {
            // staged: a new file added to the index
            std::fs::write(repo.to_absolute("staged.txt"), "staged")?;
            crate::cmd::add(&repo, &["staged.txt".to_owned()])?;
            // unstaged: modify the committed file without re-adding
            std::fs::write(repo.to_absolute("a.txt"), "modified\n")?;
            // untracked: never added
            std::fs::write(repo.to_absolute("untracked.txt"), "new")?;

            let status = status(&repo)?;
            assert_eq!(status.staged.len(), 1);
            assert_eq!(status.staged[0].path, "staged.txt");
            assert_eq!(status.staged[0].kind, ChangeKind::Created);
            assert_eq!(status.unstaged.len(), 1);
            assert_eq!(status.unstaged[0].path, "a.txt");
            assert_eq!(status.unstaged[0].kind, ChangeKind::Modified);
            assert_eq!(status.untracked, vec!["untracked.txt"]);
            Ok(())
        })
    }

    #[test]
    fn detects_deletion() -> GitResult<()> {
        with_sample_repo(|repo| {
            std::fs::remove_file(repo.to_absolute("a.txt"))?;
            let status = status(&repo)?;
            assert_eq!(status.unstaged.len(), 1);
            assert_eq!(status.unstaged[0].kind, ChangeKind::Deleted);
            Ok(())
        })
    }
}
