use crate::error::GitResult;
use crate::repo::Repository;

/// An initialized repository in a tempdir with a configured identity.
/// The tempdir guard must stay alive for the duration of the test.
pub fn with_test_repo<R>(f: impl FnOnce(Repository) -> GitResult<R>) -> GitResult<R> {
    let dir = tempfile::tempdir()?;
    // pin the branch name so host-level config cannot skew test expectations
    let repo = Repository::init_opts(
        dir.path(),
        crate::repo::InitOpts { default_branch: Some("master".to_owned()), ..Default::default() },
    )?;
    repo.config().set_local("user", None, "name", "Test User")?;
    repo.config().set_local("user", None, "email", "test@example.com")?;
    repo.config().set_local("merge", None, "conflictstyle", "merge")?;
    f(repo)
}

/// Like [`with_test_repo`] plus one commit containing `a.txt`.
pub fn with_sample_repo<R>(f: impl FnOnce(Repository) -> GitResult<R>) -> GitResult<R> {
    with_test_repo(|repo| {
        write_and_commit(&repo, &[("a.txt", "hi\n")], "initial commit")?;
        f(repo)
    })
}

/// Writes the given files into the worktree, stages them, and commits.
pub fn write_and_commit(
    repo: &Repository,
    files: &[(&str, &str)],
    message: &str,
) -> GitResult<crate::hash::Oid> {
    for (path, contents) in files {
        let abs = repo.to_absolute(path);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&abs, contents)?;
    }
    let paths: Vec<String> = files.iter().map(|(path, _)| (*path).to_owned()).collect();
    crate::cmd::add(repo, &paths)?;
    crate::cmd::commit(repo, message.to_owned())
}

/// Stages a removal and commits it.
pub fn remove_and_commit(
    repo: &Repository,
    paths: &[&str],
    message: &str,
) -> GitResult<crate::hash::Oid> {
    let mut index = repo.index()?;
    for path in paths {
        std::fs::remove_file(repo.to_absolute(path))?;
        index.remove_path(path);
    }
    index.write()?;
    crate::cmd::commit(repo, message.to_owned())
}
