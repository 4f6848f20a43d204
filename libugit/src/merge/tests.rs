use super::*;
use crate::checkout::{checkout_new_branch, checkout_revision, CheckoutOpts};
use crate::refs::{GitRef, SymbolicRef};
use crate::test_utils::*;

fn switch(repo: &Repository, branch: &str) -> GitResult<()> {
    checkout_revision(
        repo,
        GitRef::Symbolic(SymbolicRef::new_branch(branch)?),
        &CheckoutOpts::default(),
    )
}

fn merge_branch(repo: &Repository, branch: &str, opts: &MergeOpts) -> GitResult<MergeResults> {
    merge(repo, GitRef::Symbolic(SymbolicRef::new_branch(branch)?), opts)
}

#[test]
fn merging_an_ancestor_is_a_noop() -> GitResult<()> {
    with_test_repo(|repo| {
        write_and_commit(&repo, &[("f", "1")], "c1")?;
        checkout_new_branch(&repo, "old")?;
        switch(&repo, "master")?;
        write_and_commit(&repo, &[("f", "2")], "c2")?;
        assert_eq!(merge_branch(&repo, "old", &MergeOpts::default())?, MergeResults::Null);
        Ok(())
    })
}

#[test]
fn fast_forward_when_head_is_the_base() -> GitResult<()> {
    with_test_repo(|repo| {
        let c1 = write_and_commit(&repo, &[("f", "1")], "c1")?;
        checkout_new_branch(&repo, "ahead")?;
        let c2 = write_and_commit(&repo, &[("f", "2")], "c2")?;
        switch(&repo, "master")?;

        let result = merge_branch(&repo, "ahead", &MergeOpts::default())?;
        assert_eq!(result, MergeResults::FastForward { from: c1, to: c2 });
        assert_eq!(repo.fully_resolve_head()?, c2);
        assert_eq!(std::fs::read_to_string(repo.to_absolute("f"))?, "2");
        Ok(())
    })
}

#[test]
fn delete_half_meets_added_file() -> GitResult<()> {
    // branch A deletes file1..file5, branch B adds extra.txt; the merge
    // carries file6..file10 plus extra.txt with no conflicts and parents
    // ordered (A, B)
    with_test_repo(|repo| {
        let files: Vec<(String, String)> =
            (1..=10).map(|i| (format!("file{}", i), format!("contents {}\n", i))).collect();
        let file_refs: Vec<(&str, &str)> =
            files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
        write_and_commit(&repo, &file_refs, "base")?;

        checkout_new_branch(&repo, "adder")?;
        write_and_commit(&repo, &[("extra.txt", "extra\n")], "add extra")?;

        switch(&repo, "master")?;
        let doomed: Vec<&str> = (1..=5).map(|i| &*file_refs[i - 1].0).collect();
        remove_and_commit(&repo, &doomed, "delete first half")?;
        let our_head = repo.fully_resolve_head()?;

        let result = merge_branch(&repo, "adder", &MergeOpts::default())?;
        let summary = match result {
            MergeResults::Merge(summary) => summary,
            other => panic!("expected a real merge, got {:?}", other),
        };

        let merge_commit = repo.read_commit(summary.commit.unwrap())?;
        assert_eq!(merge_commit.parents.len(), 2);
        assert_eq!(merge_commit.parents[0], our_head);

        let tree = repo.read_tree(summary.tree)?;
        let names: Vec<&str> = tree.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            names,
            vec!["extra.txt", "file10", "file6", "file7", "file8", "file9"]
        );
        assert!(!repo.to_absolute("file1").exists());
        assert!(repo.to_absolute("extra.txt").exists());
        Ok(())
    })
}

#[test]
fn conflicting_appends_leave_markers_and_stages() -> GitResult<()> {
    // S4: both sides append a different line to o.txt
    with_test_repo(|repo| {
        write_and_commit(&repo, &[("o.txt", "original\n")], "base")?;
        checkout_new_branch(&repo, "c-side")?;
        write_and_commit(&repo, &[("o.txt", "original\nmodified by c\n")], "theirs")?;
        switch(&repo, "master")?;
        write_and_commit(&repo, &[("o.txt", "original\nmodified by a\n")], "ours")?;

        let result = merge_branch(&repo, "c-side", &MergeOpts::default())?;
        let conflicts = match result {
            MergeResults::Conflicts(conflicts) => conflicts,
            other => panic!("expected conflicts, got {:?}", other),
        };
        assert_eq!(conflicts.unmerged_paths, vec!["o.txt"]);
        assert_eq!(conflicts.conflicts, 1);

        let contents = std::fs::read_to_string(repo.to_absolute("o.txt"))?;
        assert_eq!(
            contents,
            "original\n<<<<<<< HEAD\nmodified by a\n=======\nmodified by c\n>>>>>>> c-side\n"
        );

        // index: stages 1/2/3 and no stage 0
        let index = repo.index()?;
        let listed = index.conflicts();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "o.txt");
        assert!(listed[0].base.is_some() && listed[0].ours.is_some() && listed[0].theirs.is_some());
        assert!(index.inner().get("o.txt", crate::index::MergeStage::None).is_none());

        // no commit was created and MERGE_HEAD points at theirs
        assert_eq!(repo.repo_state(), crate::repo::RepoState::Merging);
        assert!(repo.read_merge_head()?.is_some());
        Ok(())
    })
}

#[test]
fn abort_on_conflict_leaves_disk_untouched() -> GitResult<()> {
    with_test_repo(|repo| {
        write_and_commit(&repo, &[("o.txt", "original\n")], "base")?;
        checkout_new_branch(&repo, "side")?;
        write_and_commit(&repo, &[("o.txt", "side\n")], "theirs")?;
        switch(&repo, "master")?;
        write_and_commit(&repo, &[("o.txt", "master\n")], "ours")?;

        let opts = MergeOpts { abort_on_conflict: true, ..Default::default() };
        let result = merge_branch(&repo, "side", &opts)?;
        assert!(matches!(result, MergeResults::Conflicts(..)));
        assert_eq!(std::fs::read_to_string(repo.to_absolute("o.txt"))?, "master\n");
        assert_eq!(repo.repo_state(), crate::repo::RepoState::None);
        assert!(!repo.index()?.has_conflicts());
        Ok(())
    })
}

#[test]
fn dirty_worktree_blocks_merge() -> GitResult<()> {
    with_test_repo(|repo| {
        write_and_commit(&repo, &[("f", "base\n")], "base")?;
        checkout_new_branch(&repo, "side")?;
        write_and_commit(&repo, &[("f", "side\n")], "side")?;
        switch(&repo, "master")?;
        std::fs::write(repo.to_absolute("f"), "uncommitted\n")?;
        assert!(merge_branch(&repo, "side", &MergeOpts::default()).is_err());
        Ok(())
    })
}

#[test]
fn merge_commit_message_defaults_to_branch_name() -> GitResult<()> {
    with_test_repo(|repo| {
        write_and_commit(&repo, &[("f", "base\n")], "base")?;
        checkout_new_branch(&repo, "topic")?;
        write_and_commit(&repo, &[("g", "topic\n")], "topic work")?;
        switch(&repo, "master")?;
        write_and_commit(&repo, &[("h", "master\n")], "master work")?;

        let result = merge_branch(&repo, "topic", &MergeOpts::default())?;
        let summary = match result {
            MergeResults::Merge(summary) => summary,
            other => panic!("expected merge, got {:?}", other),
        };
        let commit = repo.read_commit(summary.commit.unwrap())?;
        assert!(commit.message.contains("topic"));
        Ok(())
    })
}
