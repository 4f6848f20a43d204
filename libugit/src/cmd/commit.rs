use crate::error::GitResult;
use crate::hash::Oid;
use crate::obj::Parents;
use crate::repo::Repository;

/// Commits the staged tree: parents are HEAD plus MERGE_HEAD when a merge
/// is being concluded.
pub fn commit(repo: &Repository, message: String) -> GitResult<Oid> {
    ensure!(!message.trim().is_empty(), "aborting commit due to empty commit message");
    let index = repo.index()?;
    let tree = index.write_tree(repo.odb())?;

    let mut parents = Parents::new();
    if let Some(head) = repo.try_fully_resolve_head()? {
        // an empty diff with no merge in flight is a pointless commit
        if repo.read_merge_head()?.is_none() {
            ensure!(
                repo.tree_oid_of_commit(head)? != tree,
                "nothing to commit, working tree clean"
            );
        }
        parents.push(head);
    }
    if let Some(merge_head) = repo.read_merge_head()? {
        parents.push(merge_head);
    }

    let oid = repo.commit_tree(tree, parents, message)?;
    repo.clear_merge_state()?;
    Ok(oid)
}

/// `commit-tree`: a commit object from explicit parts, no ref movement.
pub fn commit_tree(
    repo: &Repository,
    tree: Oid,
    parents: Parents,
    message: String,
) -> GitResult<Oid> {
    repo.write_commit_detached(tree, parents, message)
}

/// `write-tree`.
pub fn write_tree(repo: &Repository) -> GitResult<Oid> {
    repo.index()?.write_tree(repo.odb())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgo;
    use crate::test_utils::*;

    #[test]
    fn first_commit_shape_is_deterministic() -> GitResult<()> {
        // the S2 scenario: a single `a.txt` containing "hi\n" committed by a
        // fixed identity produces a commit determined entirely by its parts
        with_test_repo(|repo| {
            repo.config().set_local("user", None, "name", "A")?;
            repo.config().set_local("user", None, "email", "a@b")?;
            let commit_oid = write_and_commit(&repo, &[("a.txt", "hi\n")], "c")?;

            let blob_oid = HashAlgo::Sha1.hash_bytes(b"blob 3\0hi\n");
            let mut tree_bytes = b"100644 a.txt\0".to_vec();
            tree_bytes.extend_from_slice(blob_oid.as_bytes());
            let mut wrapped = format!("tree {}\0", tree_bytes.len()).into_bytes();
            wrapped.extend_from_slice(&tree_bytes);
            let tree_oid = HashAlgo::Sha1.hash_bytes(&wrapped);

            let commit = repo.read_commit(commit_oid)?;
            assert_eq!(commit.tree, tree_oid);
            assert!(commit.parents.is_empty());

            // identical parts rehash to the same oid
            let raw = repo.odb().read_raw(commit_oid)?;
            assert_eq!(raw.oid(HashAlgo::Sha1), commit_oid);
            Ok(())
        })
    }

    #[test]
    fn empty_message_is_rejected() -> GitResult<()> {
        with_test_repo(|repo| {
            std::fs::write(repo.to_absolute("f"), "x")?;
            crate::cmd::add(&repo, &["f".to_owned()])?;
            assert!(commit(&repo, "  \n".to_owned()).is_err());
            Ok(())
        })
    }

    #[test]
    fn commit_without_changes_is_rejected() -> GitResult<()> {
        with_sample_repo(|repo| {
            assert!(commit(&repo, "nothing".to_owned()).is_err());
            Ok(())
        })
    }
}
