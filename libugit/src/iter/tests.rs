use super::walk::{WalkSource, Walker};
use super::*;
use crate::test_utils::*;

#[test]
fn tree_iter_yields_files_in_tree_order() -> GitResult<()> {
    with_test_repo(|repo| {
        write_and_commit(
            &repo,
            &[
                ("foo-bar", "1"),
                ("foo.c", "2"),
                ("foo/baz", "3"),
                ("foo/qux/deep", "4"),
                ("zed", "5"),
            ],
            "layout",
        )?;
        let tree_oid = repo.head_tree_oid()?;
        let paths: Vec<String> = TreeIter::new(&repo, tree_oid, Filter::MATCH_ALL)?
            .map(|entry| entry.map(|e| e.path))
            .collect::<GitResult<_>>()?;
        assert_eq!(paths, vec!["foo-bar", "foo.c", "foo/baz", "foo/qux/deep", "zed"]);
        Ok(())
    })
}

#[test]
fn filter_prunes_subtrees() -> GitResult<()> {
    with_test_repo(|repo| {
        write_and_commit(
            &repo,
            &[("a/one", "1"), ("b/two", "2"), ("c/three", "3")],
            "three dirs",
        )?;
        let tree_oid = repo.head_tree_oid()?;
        let filter = Filter::new(&["b"])?;
        let paths: Vec<String> = TreeIter::new(&repo, tree_oid, filter)?
            .map(|entry| entry.map(|e| e.path))
            .collect::<GitResult<_>>()?;
        assert_eq!(paths, vec!["b/two"]);
        Ok(())
    })
}

#[test]
fn trailing_slash_filter_is_rejected() {
    assert!(Filter::new(&["src/"]).is_err());
    assert!(Filter::new(&[""]).is_ok());
}

#[test]
fn union_walk_aligns_sources_by_path() -> GitResult<()> {
    with_test_repo(|repo| {
        write_and_commit(&repo, &[("common", "same"), ("only-committed", "x")], "base")?;
        // a new untracked file plus a deleted committed file
        std::fs::write(repo.to_absolute("untracked"), "new")?;
        std::fs::remove_file(repo.to_absolute("only-committed"))?;

        let head = repo.head_tree_oid()?;
        let items: Vec<_> = Walker::new(
            &repo,
            &[WalkSource::Tree(head), WalkSource::Stage, WalkSource::Workdir],
            Filter::MATCH_ALL,
        )?
        .collect();

        let by_path: std::collections::HashMap<&str, &crate::iter::WalkItem> =
            items.iter().map(|item| (item.path.as_str(), item)).collect();

        let common = by_path["common"];
        assert!(common.slot(0).is_some() && common.slot(1).is_some() && common.slot(2).is_some());

        let committed = by_path["only-committed"];
        assert!(committed.slot(0).is_some() && committed.slot(1).is_some());
        assert!(committed.slot(2).is_none());

        let untracked = by_path["untracked"];
        assert!(untracked.slot(0).is_none() && untracked.slot(1).is_none());
        assert!(untracked.slot(2).is_some());

        // workdir oid is computed lazily and matches the staged copy
        assert_eq!(common.slot(2).unwrap().oid(&repo)?, common.slot(1).unwrap().oid(&repo)?);
        Ok(())
    })
}

#[test]
fn worktree_respects_gitignore() -> GitResult<()> {
    with_test_repo(|repo| {
        std::fs::write(repo.to_absolute(".gitignore"), "ignored.txt\n")?;
        std::fs::write(repo.to_absolute("ignored.txt"), "nope")?;
        std::fs::write(repo.to_absolute("kept.txt"), "yes")?;
        let paths: Vec<String> = worktree_entries(&repo, &Filter::MATCH_ALL)?
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        assert!(paths.contains(&"kept.txt".to_owned()));
        assert!(paths.contains(&".gitignore".to_owned()));
        assert!(!paths.contains(&"ignored.txt".to_owned()));
        Ok(())
    })
}
