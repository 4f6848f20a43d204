use crate::error::GitResult;
use crate::hash::Oid;
use crate::refs::{GitRef, RefUpdate, SymbolicRef, SymbolicRefKind};
use crate::repo::Repository;

/// Creates a branch at HEAD (or at `start` when given) without switching.
pub fn branch_create(repo: &Repository, name: &str, start: Option<Oid>) -> GitResult<()> {
    let target = match start {
        Some(oid) => oid,
        None => repo.fully_resolve_head()?,
    };
    let sym = SymbolicRef::new_branch(name)?;
    repo.refdb().create(
        &sym,
        GitRef::Direct(target),
        RefUpdate::new(repo.user_signature()?, format!("branch: Created from {}", target)),
    )
}

pub fn branch_delete(repo: &Repository, name: &str) -> GitResult<()> {
    let sym = SymbolicRef::new_branch(name)?;
    if let Some(current) = repo.current_branch()? {
        ensure!(current != sym, "cannot delete the currently checked out branch `{}`", name);
    }
    repo.refdb().delete(&sym)
}

/// Branch names with their tips, current first marker left to the caller.
pub fn branches(repo: &Repository) -> GitResult<Vec<(String, Oid)>> {
    Ok(repo
        .refdb()
        .ls_refs()?
        .into_iter()
        .filter(|(name, _)| SymbolicRef::new(name.clone()).kind() == SymbolicRefKind::Branch)
        .map(|(name, oid)| (name.trim_start_matches("refs/heads/").to_owned(), oid))
        .collect())
}

/// `update-ref`: plumbing-level direct ref write.
pub fn update_ref(repo: &Repository, name: &str, target: Oid) -> GitResult<()> {
    let sym = SymbolicRef::new_valid(name.to_owned())?;
    repo.refdb().update(
        &sym,
        GitRef::Direct(target),
        RefUpdate::new(repo.user_signature()?, format!("update-ref: moving to {}", target)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn create_list_delete_branch() -> GitResult<()> {
        with_sample_repo(|repo| {
            let head = repo.fully_resolve_head()?;
            branch_create(&repo, "feature", None)?;
            assert!(branch_create(&repo, "feature", None).is_err());
            let listed = branches(&repo)?;
            assert_eq!(listed, vec![("feature".to_owned(), head), ("master".to_owned(), head)]);
            branch_delete(&repo, "feature")?;
            assert_eq!(branches(&repo)?.len(), 1);
            Ok(())
        })
    }

    #[test]
    fn cannot_delete_current_branch() -> GitResult<()> {
        with_sample_repo(|repo| {
            assert!(branch_delete(&repo, "master").is_err());
            Ok(())
        })
    }
}
