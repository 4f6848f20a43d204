//! Walker-driven checkout: compute the delta between the staged state and a
//! target tree, refuse to clobber local modifications, then migrate the
//! working directory and index together.

use crate::diff::{self, ChangeKind};
use crate::error::{GitError, GitResult};
use crate::hash::Oid;
use crate::index::IndexEntry;
use crate::iter::Filter;
use crate::obj::FileMode;
use crate::refs::{GitRef, SymbolicRef};
use crate::repo::Repository;
use std::os::unix::fs::PermissionsExt;

#[derive(Debug, Clone, Default)]
pub struct CheckoutOpts {
    /// overwrite local modifications instead of failing
    pub force: bool,
}

/// Makes the working directory and index match `target_tree`. The
/// migration diff runs tree (old side) against index (new side), so a
/// "deleted" change means the index lacks something the target has.
pub fn checkout(repo: &Repository, target_tree: Oid, opts: &CheckoutOpts) -> GitResult<()> {
    ensure!(!repo.is_bare(), "cannot checkout into a bare repository");
    let migration = diff::diff_tree_to_index(repo, target_tree, Filter::MATCH_ALL)?;
    if migration.is_empty() {
        return Ok(());
    }

    if !opts.force {
        let dirty = diff::diff_index_to_worktree(repo, Filter::MATCH_ALL)?;
        let conflicts: Vec<String> = dirty
            .paths()
            .filter(|path| migration.contains_path(path))
            .map(str::to_owned)
            .collect();
        if !conflicts.is_empty() {
            bail!(GitError::CheckoutConflict(conflicts));
        }
    }

    let mut index = repo.index()?;
    for change in &migration.changes {
        match change.kind {
            // old = target tree side, new = index side
            ChangeKind::Deleted => {
                // in the target but not in the index: write it out
                let entry = change.old.as_ref().expect("deleted carries the tree side");
                let oid = entry.known_oid().expect("tree entries know their oid");
                write_worktree_file(repo, &change.path, oid, entry.mode)?;
                index.add_entry(IndexEntry::from_file(
                    &repo.to_absolute(&change.path),
                    &change.path,
                    oid,
                )?);
            }
            ChangeKind::Created => {
                // staged but absent from the target: remove it
                remove_worktree_file(repo, &change.path)?;
                index.remove_path(&change.path);
            }
            ChangeKind::Modified => {
                let entry = change.old.as_ref().expect("modified carries both sides");
                let oid = entry.known_oid().expect("tree entries know their oid");
                write_worktree_file(repo, &change.path, oid, entry.mode)?;
                index.add_entry(IndexEntry::from_file(
                    &repo.to_absolute(&change.path),
                    &change.path,
                    oid,
                )?);
            }
        }
    }
    index.write()?;
    Ok(())
}

/// Checks out a branch or detached commit: migrates the worktree then
/// repoints HEAD.
pub fn checkout_revision(
    repo: &Repository,
    target: GitRef,
    opts: &CheckoutOpts,
) -> GitResult<()> {
    let commit_oid = repo.refdb().fully_resolve(target.clone())?;
    let tree = repo.tree_oid_of_commit(commit_oid)?;
    checkout(repo, tree, opts)?;
    let (head_target, desc) = match &target {
        GitRef::Symbolic(sym) => (target.clone(), format!("checkout: moving to {:#}", sym)),
        GitRef::Direct(oid) => (GitRef::Direct(*oid), format!("checkout: moving to {}", oid)),
    };
    repo.set_head(head_target, &desc)
}

/// Creates a branch at HEAD and checks it out.
pub fn checkout_new_branch(repo: &Repository, name: &str) -> GitResult<()> {
    let sym = SymbolicRef::new_branch(name)?;
    let head = repo.try_fully_resolve_head()?;
    if let Some(oid) = head {
        repo.refdb().create(
            &sym,
            GitRef::Direct(oid),
            crate::refs::RefUpdate::new(repo.user_signature()?, "branch: Created from HEAD"),
        )?;
    }
    repo.set_head(GitRef::Symbolic(sym.clone()), &format!("checkout: moving to {:#}", sym))
}

pub(crate) fn write_worktree_file(repo: &Repository, rel: &str, oid: Oid, mode: FileMode) -> GitResult<()> {
    let abs = repo.to_absolute(rel);
    if let Some(parent) = abs.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if mode.is_gitlink() {
        // submodule checkouts are orchestrated elsewhere; leave a directory
        std::fs::create_dir_all(&abs)?;
        return Ok(());
    }
    crate::fs::remove_file_if_exists(&abs)?;
    if mode.is_link() {
        let target = repo.read_blob(oid)?;
        std::os::unix::fs::symlink(String::from_utf8_lossy(&target).as_ref(), &abs)?;
        return Ok(());
    }
    // stream so huge (possibly chunked) blobs never materialize in memory
    let mut reader = repo.odb().stream(oid)?;
    let mut file = std::fs::File::create(&abs)?;
    std::io::copy(&mut reader, &mut file)?;
    let perm_mode = if mode == FileMode::Exec { 0o755 } else { 0o644 };
    std::fs::set_permissions(&abs, std::fs::Permissions::from_mode(perm_mode))?;
    Ok(())
}

pub(crate) fn remove_worktree_file(repo: &Repository, rel: &str) -> GitResult<()> {
    let abs = repo.to_absolute(rel);
    crate::fs::remove_file_if_exists(&abs)?;
    // prune now-empty parents up to the workdir root
    let mut parent = abs.parent();
    while let Some(dir) = parent {
        if dir == repo.workdir() || std::fs::remove_dir(dir).is_err() {
            break;
        }
        parent = dir.parent();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GitErrorExt;
    use crate::test_utils::*;

    #[test]
    fn checkout_restores_tree_contents() -> GitResult<()> {
        with_test_repo(|repo| {
            let first = write_and_commit(&repo, &[("a.txt", "one\n"), ("d/b.txt", "two\n")], "c1")?;
            write_and_commit(&repo, &[("a.txt", "changed\n")], "c2")?;
            remove_and_commit(&repo, &["d/b.txt"], "c3")?;

            let tree = repo.tree_oid_of_commit(first)?;
            checkout(&repo, tree, &CheckoutOpts::default())?;
            assert_eq!(std::fs::read_to_string(repo.to_absolute("a.txt"))?, "one\n");
            assert_eq!(std::fs::read_to_string(repo.to_absolute("d/b.txt"))?, "two\n");
            Ok(())
        })
    }

    #[test]
    fn checkout_refuses_to_overwrite_dirty_files() -> GitResult<()> {
        with_test_repo(|repo| {
            let first = write_and_commit(&repo, &[("a.txt", "one\n")], "c1")?;
            write_and_commit(&repo, &[("a.txt", "two\n")], "c2")?;
            std::fs::write(repo.to_absolute("a.txt"), "dirty local edit\n")?;

            let tree = repo.tree_oid_of_commit(first)?;
            let err = checkout(&repo, tree, &CheckoutOpts::default()).unwrap_err();
            let conflicts = err.try_into_checkout_conflict()?;
            assert_eq!(conflicts, vec!["a.txt"]);
            // force overrides
            checkout(&repo, tree, &CheckoutOpts { force: true })?;
            assert_eq!(std::fs::read_to_string(repo.to_absolute("a.txt"))?, "one\n");
            Ok(())
        })
    }

    #[test]
    fn checkout_new_branch_points_head_at_it() -> GitResult<()> {
        with_sample_repo(|repo| {
            checkout_new_branch(&repo, "feature")?;
            match repo.read_head()? {
                GitRef::Symbolic(sym) => assert_eq!(sym.path(), "refs/heads/feature"),
                head => panic!("unexpected HEAD `{}`", head),
            }
            Ok(())
        })
    }
}
