use crate::error::GitResult;
use crate::hash::Oid;
use crate::obj::Tag;
use crate::refs::{GitRef, RefUpdate, SymbolicRef};
use crate::repo::Repository;

/// A lightweight tag: just a ref.
pub fn tag_lightweight(repo: &Repository, name: &str, target: Oid) -> GitResult<()> {
    let sym = SymbolicRef::new_tag(name)?;
    repo.refdb().create(
        &sym,
        GitRef::Direct(target),
        RefUpdate::new(repo.user_signature()?, format!("tag: tagging {}", target)),
    )
}

/// An annotated tag: a tag object plus the ref pointing at it.
pub fn tag_annotated(
    repo: &Repository,
    name: &str,
    target: Oid,
    message: String,
) -> GitResult<Oid> {
    let obj_type = repo.odb().read_header(target)?.obj_type;
    let tag = Tag::new(target, obj_type, name, repo.user_signature()?, message);
    let tag_oid = repo.write_obj(&tag)?;
    let sym = SymbolicRef::new_tag(name)?;
    repo.refdb().create(
        &sym,
        GitRef::Direct(tag_oid),
        RefUpdate::new(repo.user_signature()?, format!("tag: tagging {}", target)),
    )?;
    Ok(tag_oid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn annotated_tag_roundtrip() -> GitResult<()> {
        with_sample_repo(|repo| {
            let head = repo.fully_resolve_head()?;
            let tag_oid = tag_annotated(&repo, "v1.0", head, "first release\n".to_owned())?;
            let tag = repo.read_obj(tag_oid)?.into_tag()?;
            assert_eq!(tag.object, head);
            assert_eq!(tag.name, "v1.0");
            // peeling the tag ref lands on the commit
            assert_eq!(repo.peel_to_commit(tag_oid)?.tree, repo.head_tree_oid()?);
            Ok(())
        })
    }

    #[test]
    fn lightweight_tag_points_directly() -> GitResult<()> {
        with_sample_repo(|repo| {
            let head = repo.fully_resolve_head()?;
            tag_lightweight(&repo, "mark", head)?;
            let sym = SymbolicRef::new_tag("mark")?;
            assert_eq!(repo.refdb().read(&sym)?, GitRef::Direct(head));
            Ok(())
        })
    }
}
