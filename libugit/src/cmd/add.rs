use crate::error::{GitResult, Multiple};
use crate::index::IndexEntry;
use crate::iter::{self, Filter};
use crate::repo::Repository;

/// Stages the files matching `pathspecs` (directories recurse). Individual
/// failures are collected and surfaced together.
pub fn add(repo: &Repository, pathspecs: &[String]) -> GitResult<()> {
    let refs: Vec<&str> = pathspecs.iter().map(String::as_str).collect();
    let filter = Filter::new(&refs)?;
    let entries = iter::worktree_entries(repo, &filter)?;
    ensure!(
        !entries.is_empty(),
        "no files added: pathspec did not match any files"
    );

    let mut index = repo.index()?;
    let mut errors = vec![];
    for entry in entries {
        match stage_one(repo, &entry) {
            Ok(staged) => index.add_entry(staged),
            Err(err) => errors.push(err.context(entry.path.clone())),
        }
    }
    Multiple::collect(errors)?;
    index.write()
}

fn stage_one(repo: &Repository, entry: &crate::iter::Entry) -> GitResult<IndexEntry> {
    let oid = repo.hash_workdir_file(&entry.path)?;
    IndexEntry::from_file(&repo.to_absolute(&entry.path), &entry.path, oid)
}

/// Stages every change, deletions included (`add --all`).
pub fn add_all(repo: &Repository) -> GitResult<()> {
    let diff = crate::diff::diff_index_to_worktree(repo, Filter::MATCH_ALL)?;
    let mut index = repo.index()?;
    for change in diff.changes {
        match change.kind {
            crate::diff::ChangeKind::Deleted => {
                index.remove_path(&change.path);
            }
            _ => {
                let oid = repo.hash_workdir_file(&change.path)?;
                index.add_entry(IndexEntry::from_file(
                    &repo.to_absolute(&change.path),
                    &change.path,
                    oid,
                )?);
            }
        }
    }
    index.write()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn add_is_idempotent() -> GitResult<()> {
        with_test_repo(|repo| {
            std::fs::write(repo.to_absolute("f"), "contents")?;
            add(&repo, &["f".to_owned()])?;
            let first = repo.index()?.inner().clone();
            add(&repo, &["f".to_owned()])?;
            // the second add may refresh stat data but the staged content
            // is identical
            let second = repo.index()?.inner().clone();
            let oids = |inner: &crate::index::IndexInner| {
                inner.entries().map(|e| (e.path.clone(), e.oid)).collect::<Vec<_>>()
            };
            assert_eq!(oids(&first), oids(&second));
            Ok(())
        })
    }

    #[test]
    fn add_of_missing_pathspec_fails() -> GitResult<()> {
        with_test_repo(|repo| {
            assert!(add(&repo, &["nonexistent".to_owned()]).is_err());
            Ok(())
        })
    }

    #[test]
    fn add_directory_recurses() -> GitResult<()> {
        with_test_repo(|repo| {
            std::fs::create_dir_all(repo.to_absolute("d/e"))?;
            std::fs::write(repo.to_absolute("d/one"), "1")?;
            std::fs::write(repo.to_absolute("d/e/two"), "2")?;
            add(&repo, &["d".to_owned()])?;
            let index = repo.index()?;
            assert_eq!(index.inner().paths().collect::<Vec<_>>(), vec!["d/e/two", "d/one"]);
            Ok(())
        })
    }
}
