use super::*;
use crate::hash::HashAlgo;
use crate::obj::ObjType;

fn entry(path: &str, contents: &[u8], stage: MergeStage) -> IndexEntry {
    let oid = HashAlgo::Sha1.hash_bytes(
        RawObjectBytes { obj_type: ObjType::Blob, bytes: contents }.wrapped(),
    );
    IndexEntry {
        ctime: Timespec::new(1, 0),
        mtime: Timespec::new(1, 0),
        device: 1,
        inode: 2,
        mode: FileMode::Reg,
        uid: 1000,
        gid: 1000,
        filesize: contents.len() as u32,
        oid,
        flags: IndexEntryFlags::with_path_len(path.len()),
        extended_flags: ExtendedFlags::empty(),
        path: path.to_owned(),
    }
    .with_stage(stage)
}

// tiny local helper so the tests do not depend on the odb
struct RawObjectBytes<'a> {
    obj_type: ObjType,
    bytes: &'a [u8],
}

impl RawObjectBytes<'_> {
    fn wrapped(&self) -> Vec<u8> {
        let mut buf = format!("{} {}\0", self.obj_type, self.bytes.len()).into_bytes();
        buf.extend_from_slice(self.bytes);
        buf
    }
}

fn empty_index() -> GitResult<(tempfile::TempDir, Index)> {
    let dir = tempfile::tempdir()?;
    let index = Index::load(dir.path().join("index"), HashAlgo::Sha1)?;
    Ok((dir, index))
}

#[test]
fn write_then_load_roundtrip() -> GitResult<()> {
    let (dir, mut index) = empty_index()?;
    index.add_entry(entry("a.txt", b"hi\n", MergeStage::None));
    index.add_entry(entry("dir/b.txt", b"there\n", MergeStage::None));
    index.write()?;

    let reloaded = Index::load(dir.path().join("index"), HashAlgo::Sha1)?;
    assert_eq!(reloaded.inner(), index.inner());
    assert_eq!(
        reloaded.inner().paths().collect::<Vec<_>>(),
        vec!["a.txt", "dir/b.txt"]
    );
    Ok(())
}

#[test]
fn write_read_write_is_byte_stable() -> GitResult<()> {
    let (_dir, mut index) = empty_index()?;
    index.add_entry(entry("x", b"1", MergeStage::None));
    index.add_entry(entry("y/z", b"2", MergeStage::None));

    let mut first = vec![];
    index.inner().write_to(&mut first, HashAlgo::Sha1)?;
    let parsed = IndexInner::parse(&first, HashAlgo::Sha1)?;
    let mut second = vec![];
    parsed.write_to(&mut second, HashAlgo::Sha1)?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn adding_same_entry_twice_is_idempotent() -> GitResult<()> {
    let (_dir, mut index) = empty_index()?;
    index.add_entry(entry("a", b"same", MergeStage::None));
    let snapshot = index.inner().clone();
    index.add_entry(entry("a", b"same", MergeStage::None));
    assert_eq!(index.inner(), &snapshot);
    Ok(())
}

#[test]
fn stage0_clears_conflict_stages_and_vice_versa() -> GitResult<()> {
    let (_dir, mut index) = empty_index()?;
    index.add_entry(entry("f", b"base", MergeStage::Base));
    index.add_entry(entry("f", b"ours", MergeStage::Ours));
    index.add_entry(entry("f", b"theirs", MergeStage::Theirs));
    assert!(index.has_conflicts());
    assert_eq!(index.inner().len(), 3);

    index.add_entry(entry("f", b"resolved", MergeStage::None));
    assert!(!index.has_conflicts());
    assert_eq!(index.inner().len(), 1);

    index.add_entry(entry("f", b"conflict again", MergeStage::Ours));
    assert_eq!(index.inner().get("f", MergeStage::None), None);
    Ok(())
}

#[test]
fn parse_rejects_mixed_stage0_and_conflicts() -> GitResult<()> {
    // construct invalid bytes by writing entries straight through the inner
    let mut inner = IndexInner::default();
    inner.entries.insert(
        ("f".to_owned(), MergeStage::None),
        entry("f", b"zero", MergeStage::None),
    );
    inner.entries.insert(
        ("f".to_owned(), MergeStage::Ours),
        entry("f", b"ours", MergeStage::Ours),
    );
    let mut bytes = vec![];
    inner.write_to(&mut bytes, HashAlgo::Sha1)?;
    assert!(IndexInner::parse(&bytes, HashAlgo::Sha1).is_err());
    Ok(())
}

#[test]
fn conflicts_lists_all_three_sides() -> GitResult<()> {
    let (_dir, mut index) = empty_index()?;
    index.add_entry(entry("o.txt", b"original\n", MergeStage::Base));
    index.add_entry(entry("o.txt", b"ours\n", MergeStage::Ours));
    index.add_entry(entry("o.txt", b"theirs\n", MergeStage::Theirs));
    let conflicts = index.conflicts();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.path, "o.txt");
    assert!(conflict.base.is_some() && conflict.ours.is_some() && conflict.theirs.is_some());
    Ok(())
}

#[test]
fn corrupt_checksum_is_rejected() -> GitResult<()> {
    let (_dir, mut index) = empty_index()?;
    index.add_entry(entry("a", b"x", MergeStage::None));
    let mut bytes = vec![];
    index.inner().write_to(&mut bytes, HashAlgo::Sha1)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    assert!(IndexInner::parse(&bytes, HashAlgo::Sha1).is_err());
    Ok(())
}

#[test]
fn extensions_roundtrip_opaquely() -> GitResult<()> {
    let mut inner = IndexInner::default();
    inner.entries.insert(("a".to_owned(), MergeStage::None), entry("a", b"x", MergeStage::None));
    inner.extensions.push(IndexExtension { signature: *b"REUC", data: b"payload".to_vec() });
    let mut bytes = vec![];
    inner.write_to(&mut bytes, HashAlgo::Sha1)?;
    let parsed = IndexInner::parse(&bytes, HashAlgo::Sha1)?;
    assert_eq!(parsed.extensions, inner.extensions);
    Ok(())
}

#[test]
fn skip_worktree_forces_v3_and_survives() -> GitResult<()> {
    let mut e = entry("s", b"x", MergeStage::None);
    e.extended_flags = ExtendedFlags::SKIP_WORKTREE;
    let mut inner = IndexInner::default();
    inner.entries.insert(e.key(), e.clone());
    let mut bytes = vec![];
    inner.write_to(&mut bytes, HashAlgo::Sha1)?;
    // version field
    assert_eq!(u32::from_be_bytes(bytes[4..8].try_into().unwrap()), 3);
    let parsed = IndexInner::parse(&bytes, HashAlgo::Sha1)?;
    assert!(parsed.entries().next().unwrap().skip_worktree());
    Ok(())
}

#[test]
fn reads_v4_prefix_compressed_paths() -> GitResult<()> {
    // hand-assemble a v4 index with two entries sharing the prefix `dir/`
    let algo = HashAlgo::Sha1;
    let e1 = entry("dir/alpha", b"1", MergeStage::None);
    let e2 = entry("dir/beta", b"2", MergeStage::None);

    let mut body = vec![];
    body.extend_from_slice(b"DIRC");
    body.extend_from_slice(&4u32.to_be_bytes());
    body.extend_from_slice(&2u32.to_be_bytes());
    for (entry, strip, suffix) in [(&e1, 0usize, "dir/alpha"), (&e2, 5usize, "beta")] {
        body.extend_from_slice(&entry.ctime.sec.to_be_bytes());
        body.extend_from_slice(&entry.ctime.nano.to_be_bytes());
        body.extend_from_slice(&entry.mtime.sec.to_be_bytes());
        body.extend_from_slice(&entry.mtime.nano.to_be_bytes());
        body.extend_from_slice(&entry.device.to_be_bytes());
        body.extend_from_slice(&entry.inode.to_be_bytes());
        body.extend_from_slice(&entry.mode.as_u32().to_be_bytes());
        body.extend_from_slice(&entry.uid.to_be_bytes());
        body.extend_from_slice(&entry.gid.to_be_bytes());
        body.extend_from_slice(&entry.filesize.to_be_bytes());
        body.extend_from_slice(entry.oid.as_bytes());
        body.extend_from_slice(&entry.flags.bits().to_be_bytes());
        // v4 path: strip-varint (offset encoding) then nul-terminated suffix
        crate::io::WriteExt::write_offset(&mut body, strip as u64)?;
        body.extend_from_slice(suffix.as_bytes());
        body.push(0);
    }
    let checksum = algo.hash_bytes(&body);
    body.extend_from_slice(checksum.as_bytes());

    let parsed = IndexInner::parse(&body, algo)?;
    assert_eq!(parsed.paths().collect::<Vec<_>>(), vec!["dir/alpha", "dir/beta"]);
    Ok(())
}
