use super::*;
use crate::error::{GitError, GitResult};
use crate::hash::HashAlgo;
use crate::signature::{GitTime, Signature};
use crate::test_utils::*;

fn sig() -> Signature {
    Signature::new("A", "a@b", GitTime::new(1577836800, 0))
}

fn oid(n: u8) -> crate::hash::Oid {
    HashAlgo::Sha1.hash_bytes([n])
}

#[test]
fn ref_name_validation() {
    assert!(is_valid_name("refs/heads/feature/x"));
    assert!(!is_valid_name(".hidden"));
    assert!(!is_valid_name("double..dot"));
    assert!(!is_valid_name("spa ce"));
    assert!(!is_valid_name("tilde~1"));
    assert!(!is_valid_name("glob*"));
    assert!(!is_valid_name("refs/heads/x.lock"));
    assert!(!is_valid_name("trailing/"));
    assert!(!is_valid_name("at@{sym"));
    assert!(!is_valid_name(""));
}

#[test]
fn head_of_fresh_repo_is_unborn_symref() -> GitResult<()> {
    with_test_repo(|repo| {
        let head = repo.refdb().read(&SymbolicRef::head())?;
        assert_eq!(head, GitRef::Symbolic(SymbolicRef::new("refs/heads/master")));
        // resolving stops at the nonexistent branch
        assert_eq!(
            repo.refdb().resolve(GitRef::head())?,
            GitRef::Symbolic(SymbolicRef::new("refs/heads/master"))
        );
        assert_eq!(repo.refdb().try_fully_resolve(GitRef::head())?, None);
        Ok(())
    })
}

#[test]
fn write_then_read_returns_written_value() -> GitResult<()> {
    with_test_repo(|repo| {
        let branch = SymbolicRef::new_branch("main")?;
        let target = oid(1);
        repo.refdb().update(&branch, GitRef::Direct(target), RefUpdate::new(sig(), "created"))?;
        assert_eq!(repo.refdb().read(&branch)?, GitRef::Direct(target));

        // idempotent rewrite leaves the store identical
        repo.refdb().update(&branch, GitRef::Direct(target), RefUpdate::new(sig(), "again"))?;
        assert_eq!(repo.refdb().read(&branch)?, GitRef::Direct(target));
        Ok(())
    })
}

#[test]
fn cas_write_detects_stale_expectation() -> GitResult<()> {
    with_test_repo(|repo| {
        let branch = SymbolicRef::new_branch("main")?;
        let (o1, o2, o3) = (oid(1), oid(2), oid(3));
        repo.refdb().update(&branch, GitRef::Direct(o1), RefUpdate::new(sig(), "init"))?;

        // expected-old matches: succeeds
        repo.refdb().update(
            &branch,
            GitRef::Direct(o2),
            RefUpdate::new(sig(), "advance").expecting(Expect::Value(GitRef::Direct(o1))),
        )?;

        // second writer still expecting o1 loses
        let err = repo
            .refdb()
            .update(
                &branch,
                GitRef::Direct(o3),
                RefUpdate::new(sig(), "stale").expecting(Expect::Value(GitRef::Direct(o1))),
            )
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<GitError>(), Some(GitError::RefStale { .. })));
        assert_eq!(repo.refdb().read(&branch)?, GitRef::Direct(o2));

        // exactly one reflog entry records the contested transition
        let log = repo.refdb().read_reflog(&branch)?;
        let matching: Vec<_> =
            log.entries.iter().filter(|entry| entry.new_oid == o2).collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].old_oid, o1);
        Ok(())
    })
}

#[test]
fn concurrent_cas_writers_one_wins() -> GitResult<()> {
    with_test_repo(|repo| {
        let branch = SymbolicRef::new_branch("main")?;
        let o1 = oid(1);
        repo.refdb().update(&branch, GitRef::Direct(o1), RefUpdate::new(sig(), "init"))?;

        let results: Vec<GitResult<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = [oid(2), oid(3)]
                .into_iter()
                .map(|target| {
                    let repo = repo.clone();
                    let branch = branch.clone();
                    scope.spawn(move || {
                        repo.refdb().update(
                            &branch,
                            GitRef::Direct(target),
                            RefUpdate::new(sig(), "race")
                                .expecting(Expect::Value(GitRef::Direct(o1))),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        let winners = results.iter().filter(|result| result.is_ok()).count();
        assert_eq!(winners, 1, "exactly one CAS writer must win");
        // the loser surfaced RefStale or lock contention, never corruption
        let value = repo.refdb().read(&branch)?;
        assert!(value == GitRef::Direct(oid(2)) || value == GitRef::Direct(oid(3)));
        Ok(())
    })
}

#[test]
fn symbolic_cycle_is_invalid_ref() -> GitResult<()> {
    with_test_repo(|repo| {
        std::fs::create_dir_all(repo.gitdir().join("refs/heads"))?;
        std::fs::write(repo.gitdir().join("refs/heads/a"), "ref: refs/heads/b\n")?;
        std::fs::write(repo.gitdir().join("refs/heads/b"), "ref: refs/heads/a\n")?;
        let err = repo
            .refdb()
            .resolve(GitRef::Symbolic(SymbolicRef::new("refs/heads/a")))
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<GitError>(), Some(GitError::InvalidRef(..))));
        Ok(())
    })
}

#[test]
fn over_deep_symref_chain_fails() -> GitResult<()> {
    with_test_repo(|repo| {
        std::fs::create_dir_all(repo.gitdir().join("refs/heads"))?;
        for i in 0..7 {
            std::fs::write(
                repo.gitdir().join(format!("refs/heads/s{}", i)),
                format!("ref: refs/heads/s{}\n", i + 1),
            )?;
        }
        let err = repo
            .refdb()
            .resolve(GitRef::Symbolic(SymbolicRef::new("refs/heads/s0")))
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<GitError>(), Some(GitError::InvalidRef(..))));
        Ok(())
    })
}

#[test]
fn loose_wins_over_packed() -> GitResult<()> {
    with_test_repo(|repo| {
        let packed_oid = oid(1);
        let loose_oid = oid(2);
        std::fs::write(
            repo.gitdir().join("packed-refs"),
            format!("# pack-refs with: peeled fully-peeled sorted \n{} refs/heads/dual\n", packed_oid),
        )?;
        let branch = SymbolicRef::new_branch("dual")?;
        assert_eq!(repo.refdb().read(&branch)?, GitRef::Direct(packed_oid));

        std::fs::write(repo.gitdir().join("refs/heads/dual"), format!("{}\n", loose_oid))?;
        assert_eq!(repo.refdb().read(&branch)?, GitRef::Direct(loose_oid));
        Ok(())
    })
}

#[test]
fn delete_removes_loose_and_packed() -> GitResult<()> {
    with_test_repo(|repo| {
        let target = oid(1);
        std::fs::write(
            repo.gitdir().join("packed-refs"),
            format!("# pack-refs with: peeled fully-peeled sorted \n{} refs/heads/gone\n", target),
        )?;
        let branch = SymbolicRef::new_branch("gone")?;
        repo.refdb().update(&branch, GitRef::Direct(target), RefUpdate::new(sig(), "make loose"))?;

        repo.refdb().delete(&branch)?;
        assert!(!repo.refdb().exists(&branch)?);
        assert!(!repo.refdb().packed_refs()?.contains("refs/heads/gone"));
        // deleting again reports not-found
        assert!(repo.refdb().delete(&branch).is_err());
        Ok(())
    })
}

#[test]
fn packed_refs_cache_invalidates_on_mtime_change() -> GitResult<()> {
    with_test_repo(|repo| {
        let path = repo.gitdir().join("packed-refs");
        std::fs::write(&path, format!("{} refs/heads/x\n", oid(1)))?;
        assert!(repo.refdb().packed_refs()?.contains("refs/heads/x"));

        // rewrite with a strictly newer mtime
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&path, format!("{} refs/heads/y\n", oid(2)))?;
        let packed = repo.refdb().packed_refs()?;
        assert!(packed.contains("refs/heads/y"));
        assert!(!packed.contains("refs/heads/x"));
        Ok(())
    })
}

#[test]
fn peeled_tag_from_packed_refs() -> GitResult<()> {
    with_test_repo(|repo| {
        let (tag, commit) = (oid(1), oid(2));
        std::fs::write(
            repo.gitdir().join("packed-refs"),
            format!("{} refs/tags/v1\n^{}\n", tag, commit),
        )?;
        let sym = SymbolicRef::new_tag("v1")?;
        assert_eq!(repo.refdb().read(&sym)?, GitRef::Direct(tag));
        assert_eq!(repo.refdb().peeled(&sym)?, Some(commit));
        Ok(())
    })
}

#[test]
fn reflog_appends_on_branch_and_head_moves() -> GitResult<()> {
    with_test_repo(|repo| {
        let c1 = write_and_commit(&repo, &[("f", "1")], "first")?;
        let c2 = write_and_commit(&repo, &[("f", "2")], "second")?;

        let branch_log = repo.refdb().read_reflog(&SymbolicRef::new_branch("master")?)?;
        assert_eq!(branch_log.entries.len(), 2);
        assert!(branch_log.entries[0].old_oid.is_zero());
        assert_eq!(branch_log.entries[0].new_oid, c1);
        assert_eq!(branch_log.entries[1].old_oid, c1);
        assert_eq!(branch_log.entries[1].new_oid, c2);
        assert!(branch_log.entries[0].msg.starts_with("commit (initial):"));

        let head_log = repo.refdb().read_reflog(&SymbolicRef::head())?;
        assert_eq!(head_log.entries.len(), 2);
        Ok(())
    })
}

#[test]
fn missing_logs_dir_makes_reflog_a_noop() -> GitResult<()> {
    with_test_repo(|repo| {
        std::fs::remove_dir_all(repo.gitdir().join("logs"))?;
        let branch = SymbolicRef::new_branch("quiet")?;
        repo.refdb().update(&branch, GitRef::Direct(oid(1)), RefUpdate::new(sig(), "no log"))?;
        assert_eq!(repo.refdb().read_reflog(&branch)?.entries.len(), 0);
        Ok(())
    })
}
