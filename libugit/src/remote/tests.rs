use super::*;
use crate::protocol::push::PushOpts;
use crate::repo::Repository;
use crate::test_utils::*;
use crate::transport::http::LoopbackHttp;

fn source_repo() -> GitResult<(tempfile::TempDir, Repository)> {
    let dir = tempfile::tempdir()?;
    let repo = Repository::init_opts(
        dir.path(),
        InitOpts { default_branch: Some("master".to_owned()), ..Default::default() },
    )?;
    repo.config().set_local("user", None, "name", "Upstream")?;
    repo.config().set_local("user", None, "email", "up@stream")?;
    Ok((dir, repo))
}

fn file_url(repo: &Repository) -> String {
    repo.workdir().display().to_string()
}

#[tokio::test]
async fn clone_over_file_transport() -> GitResult<()> {
    let (_src_dir, src) = source_repo()?;
    write_and_commit(&src, &[("a.txt", "hello\n"), ("d/b.txt", "nested\n")], "c1")?;
    let head = write_and_commit(&src, &[("a.txt", "hello again\n")], "c2")?;

    let dst_dir = tempfile::tempdir()?;
    let dst_path = dst_dir.path().join("cloned");
    let repo = clone(
        &file_url(&src),
        &dst_path,
        None,
        &CloneOpts::default(),
        &mut RemoteCallbacks::default(),
    )
    .await?;

    // refs, objects, and worktree all arrived
    assert_eq!(repo.fully_resolve_head()?, head);
    assert_eq!(std::fs::read_to_string(repo.to_absolute("a.txt"))?, "hello again\n");
    assert_eq!(std::fs::read_to_string(repo.to_absolute("d/b.txt"))?, "nested\n");
    let tracking = repo
        .refdb()
        .try_fully_resolve(GitRef::Symbolic(SymbolicRef::new("refs/remotes/origin/master")))?;
    assert_eq!(tracking, Some(head));
    Ok(())
}

#[tokio::test]
async fn clone_empty_repository() -> GitResult<()> {
    let (_src_dir, src) = source_repo()?;
    let dst_dir = tempfile::tempdir()?;
    let repo = clone(
        &file_url(&src),
        dst_dir.path().join("cloned"),
        None,
        &CloneOpts::default(),
        &mut RemoteCallbacks::default(),
    )
    .await?;
    assert_eq!(repo.try_fully_resolve_head()?, None);
    Ok(())
}

#[tokio::test]
async fn fetch_picks_up_new_upstream_commits() -> GitResult<()> {
    let (_src_dir, src) = source_repo()?;
    write_and_commit(&src, &[("f", "one\n")], "c1")?;

    let dst_dir = tempfile::tempdir()?;
    let repo = clone(
        &file_url(&src),
        dst_dir.path().join("cloned"),
        None,
        &CloneOpts::default(),
        &mut RemoteCallbacks::default(),
    )
    .await?;

    let new_head = write_and_commit(&src, &[("f", "two\n")], "c2")?;
    let summary = fetch_remote(
        &repo,
        "origin",
        None,
        &FetchOpts::default(),
        &mut RemoteCallbacks::default(),
    )
    .await?;
    assert!(summary.pack_objects > 0);
    assert!(repo.odb().contains(new_head)?);
    let tracking = repo
        .refdb()
        .try_fully_resolve(GitRef::Symbolic(SymbolicRef::new("refs/remotes/origin/master")))?;
    assert_eq!(tracking, Some(new_head));

    // a second fetch transfers nothing
    let summary = fetch_remote(
        &repo,
        "origin",
        None,
        &FetchOpts::default(),
        &mut RemoteCallbacks::default(),
    )
    .await?;
    assert_eq!(summary.pack_objects, 0);
    Ok(())
}

#[tokio::test]
async fn fetch_with_protocol_v1() -> GitResult<()> {
    let (_src_dir, src) = source_repo()?;
    let head = write_and_commit(&src, &[("f", "v1\n")], "c1")?;

    let dst_dir = tempfile::tempdir()?;
    let repo = Repository::init(dst_dir.path().join("cloned"))?;
    add_remote(&repo, "origin", &file_url(&src))?;
    let opts = FetchOpts { protocol_version: 1, ..Default::default() };
    fetch_remote(&repo, "origin", None, &opts, &mut RemoteCallbacks::default()).await?;
    assert!(repo.odb().contains(head)?);
    Ok(())
}

#[tokio::test]
async fn shallow_clone_truncates_history() -> GitResult<()> {
    let (_src_dir, src) = source_repo()?;
    let c1 = write_and_commit(&src, &[("f", "1\n")], "c1")?;
    let c2 = write_and_commit(&src, &[("f", "2\n")], "c2")?;

    let dst_dir = tempfile::tempdir()?;
    let opts = CloneOpts {
        fetch: FetchOpts { depth: Some(1), protocol_version: 1, ..Default::default() },
        ..Default::default()
    };
    let repo = clone(
        &file_url(&src),
        dst_dir.path().join("cloned"),
        None,
        &opts,
        &mut RemoteCallbacks::default(),
    )
    .await?;

    assert_eq!(repo.fully_resolve_head()?, c2);
    assert!(!repo.odb().contains(c1)?, "parent commit must not be fetched");
    // the tip is recorded as a graph root
    assert_eq!(repo.shallow_roots()?, vec![c2]);
    // log terminates at the shallow root instead of erroring
    let mut walk = crate::revwalk::RevWalk::new(&repo);
    walk.push_head()?;
    let walked: Vec<_> = walk.collect::<GitResult<Vec<_>>>()?;
    assert_eq!(walked.len(), 1);
    Ok(())
}

#[tokio::test]
async fn push_into_bare_remote() -> GitResult<()> {
    let remote_dir = tempfile::tempdir()?;
    let remote_repo = Repository::init_opts(
        remote_dir.path(),
        InitOpts { bare: true, default_branch: Some("master".to_owned()), ..Default::default() },
    )?;

    let (_local_dir, local) = source_repo()?;
    let head = write_and_commit(&local, &[("f", "pushed\n")], "c1")?;
    add_remote(&local, "origin", &remote_repo.gitdir().display().to_string())?;

    let refspec = Refspec::push_branch("master", false);
    push_remote(
        &local,
        "origin",
        &[refspec],
        None,
        &PushOpts::default(),
        &mut RemoteCallbacks::default(),
    )
    .await?;

    assert!(remote_repo.odb().contains(head)?);
    let remote_master = remote_repo
        .refdb()
        .try_fully_resolve(GitRef::Symbolic(SymbolicRef::new_branch("master")?))?;
    assert_eq!(remote_master, Some(head));
    Ok(())
}

#[tokio::test]
async fn non_fast_forward_push_needs_force() -> GitResult<()> {
    let remote_dir = tempfile::tempdir()?;
    let remote_repo = Repository::init_opts(
        remote_dir.path(),
        InitOpts { bare: true, default_branch: Some("master".to_owned()), ..Default::default() },
    )?;

    let (_a_dir, local) = source_repo()?;
    write_and_commit(&local, &[("f", "one\n")], "c1")?;
    add_remote(&local, "origin", &remote_repo.gitdir().display().to_string())?;
    let spec = Refspec::push_branch("master", false);
    push_remote(&local, "origin", &[spec.clone()], None, &PushOpts::default(), &mut RemoteCallbacks::default())
        .await?;

    // rewrite local history so the next push is a non-fast-forward
    let divergent = {
        let tree = local.head_tree_oid()?;
        local.write_commit_detached(tree, smallvec::smallvec![], "rewritten".to_owned())?
    };
    local.refdb().update(
        &SymbolicRef::new_branch("master")?,
        GitRef::Direct(divergent),
        crate::refs::RefUpdate::new(local.user_signature()?, "reset: moving to rewritten"),
    )?;

    let err = push_remote(
        &local,
        "origin",
        &[spec],
        None,
        &PushOpts::default(),
        &mut RemoteCallbacks::default(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("non-fast-forward"), "got: {}", err);

    let forced = Refspec::push_branch("master", true);
    push_remote(
        &local,
        "origin",
        &[forced],
        None,
        &PushOpts::default(),
        &mut RemoteCallbacks::default(),
    )
    .await?;
    let remote_master = remote_repo
        .refdb()
        .try_fully_resolve(GitRef::Symbolic(SymbolicRef::new_branch("master")?))?;
    assert_eq!(remote_master, Some(divergent));
    Ok(())
}

#[tokio::test]
async fn clone_over_loopback_http_v2() -> GitResult<()> {
    let (_src_dir, src) = source_repo()?;
    let head = write_and_commit(&src, &[("h.txt", "over http\n")], "c1")?;

    let dst_dir = tempfile::tempdir()?;
    let client = Box::new(LoopbackHttp { repo: src.clone() });
    let repo = clone(
        "https://example.invalid/repo.git",
        dst_dir.path().join("cloned"),
        Some(client),
        &CloneOpts::default(),
        &mut RemoteCallbacks::default(),
    )
    .await?;
    assert_eq!(repo.fully_resolve_head()?, head);
    assert_eq!(std::fs::read_to_string(repo.to_absolute("h.txt"))?, "over http\n");
    Ok(())
}

#[tokio::test]
async fn clone_over_loopback_http_v1() -> GitResult<()> {
    let (_src_dir, src) = source_repo()?;
    let head = write_and_commit(&src, &[("h.txt", "v1 http\n")], "c1")?;

    let dst_dir = tempfile::tempdir()?;
    let client = Box::new(LoopbackHttp { repo: src.clone() });
    let opts = CloneOpts {
        fetch: FetchOpts { protocol_version: 1, ..Default::default() },
        ..Default::default()
    };
    let repo = clone(
        "https://example.invalid/repo.git",
        dst_dir.path().join("cloned"),
        Some(client),
        &opts,
        &mut RemoteCallbacks::default(),
    )
    .await?;
    assert_eq!(repo.fully_resolve_head()?, head);
    Ok(())
}

#[test]
fn refspec_parsing_and_matching() -> GitResult<()> {
    let spec: Refspec = "+refs/heads/*:refs/remotes/origin/*".parse()?;
    assert!(spec.is_forced());
    assert_eq!(
        spec.match_ref("refs/heads/main"),
        Some("refs/remotes/origin/main".to_owned())
    );
    assert_eq!(spec.match_ref("refs/tags/v1"), None);
    assert_eq!(spec.to_string(), "+refs/heads/*:refs/remotes/origin/*");

    let simple: Refspec = "main:main".parse()?;
    assert_eq!(simple.match_ref("main"), Some("main".to_owned()));
    assert!("refs/heads/*:refs/remotes/origin/x".parse::<Refspec>().is_err());
    Ok(())
}

#[test]
fn remote_config_roundtrip() -> GitResult<()> {
    with_test_repo(|repo| {
        add_remote(&repo, "origin", "https://example.com/repo.git")?;
        assert!(add_remote(&repo, "origin", "https://example.com/other.git").is_err());
        let remote = get_remote(&repo, "origin")?;
        assert_eq!(remote.url, "https://example.com/repo.git");
        assert_eq!(remote.fetch, Refspec::default_fetch_for_remote("origin"));
        assert_eq!(ls_remotes(&repo)?.len(), 1);
        remove_remote(&repo, "origin")?;
        assert!(get_remote(&repo, "origin").is_err());
        Ok(())
    })
}
