use super::*;
use crate::error::GitResult;
use crate::hash::HashAlgo;
use quickcheck::{Arbitrary, Gen};

impl Arbitrary for FileMode {
    fn arbitrary(g: &mut Gen) -> Self {
        *g.choose(&[FileMode::Reg, FileMode::Exec, FileMode::Link, FileMode::Tree]).unwrap()
    }
}

impl Arbitrary for TreeEntry {
    fn arbitrary(g: &mut Gen) -> Self {
        let len = 1 + usize::arbitrary(g) % 30;
        let path: String = (0..len)
            .map(|_| *g.choose(&['a', 'b', 'z', '0', '.', '-', '_']).unwrap())
            .collect();
        Self { path, mode: Arbitrary::arbitrary(g), oid: Arbitrary::arbitrary(g) }
    }
}

impl Arbitrary for Tree {
    fn arbitrary(g: &mut Gen) -> Self {
        Self { entries: Arbitrary::arbitrary(g) }
    }
}

#[quickcheck]
fn serialize_then_parse_tree(tree: Tree) -> GitResult<()> {
    let bytes = tree.serialize_to_vec()?;
    let parsed = Tree::parse(&bytes, HashAlgo::Sha1)?;
    assert_eq!(tree, parsed);
    Ok(())
}

#[quickcheck]
fn tree_entries_sorted_under_subtree_comparator(tree: Tree) -> bool {
    // the set iterates in comparator order; pin that the comparator treats
    // subtrees as `name/`
    tree.entries
        .iter()
        .zip(tree.entries.iter().skip(1))
        .all(|(a, b)| {
            let a_key = if a.mode.is_tree() { format!("{}/", a.path) } else { a.path.clone() };
            let b_key = if b.mode.is_tree() { format!("{}/", b.path) } else { b.path.clone() };
            a_key < b_key
        })
}

#[test]
fn tree_roundtrips_byte_identically() -> GitResult<()> {
    // tree with one entry `(100644, "a.txt", sha1("blob 3\0hi\n"))`
    let blob_oid = HashAlgo::Sha1.hash_bytes(b"blob 3\0hi\n");
    let mut tree = Tree::default();
    tree.entries.insert(TreeEntry::new(FileMode::Reg, "a.txt", blob_oid));
    let bytes = tree.serialize_to_vec()?;

    let mut expected = b"100644 a.txt\0".to_vec();
    expected.extend_from_slice(blob_oid.as_bytes());
    assert_eq!(bytes, expected);

    let parsed = Tree::parse(&bytes, HashAlgo::Sha1)?;
    assert_eq!(parsed, tree);
    assert_eq!(parsed.serialize_to_vec()?, bytes);
    Ok(())
}

#[test]
fn tree_parse_rejects_out_of_order_entries() -> GitResult<()> {
    let oid = HashAlgo::Sha1.empty_blob();
    let mut tree_b = Tree::default();
    tree_b.entries.insert(TreeEntry::new(FileMode::Reg, "b", oid));
    let mut tree_a = Tree::default();
    tree_a.entries.insert(TreeEntry::new(FileMode::Reg, "a", oid));

    let mut bytes = tree_b.serialize_to_vec()?;
    bytes.extend(tree_a.serialize_to_vec()?);
    assert!(Tree::parse(&bytes, HashAlgo::Sha1).is_err());
    Ok(())
}

#[test]
fn subtree_sorts_after_sibling_file_with_dash() -> GitResult<()> {
    let blob = HashAlgo::Sha1.empty_blob();
    let subtree = HashAlgo::Sha1.empty_tree();
    let mut tree = Tree::default();
    tree.entries.insert(TreeEntry::new(FileMode::Tree, "foo", subtree));
    tree.entries.insert(TreeEntry::new(FileMode::Reg, "foo-bar", blob));
    tree.entries.insert(TreeEntry::new(FileMode::Reg, "foo.c", blob));

    let names = tree.entries.iter().map(|entry| entry.path.as_str()).collect::<Vec<_>>();
    // `foo-bar` ('-' = 0x2d) and `foo.c` ('.' = 0x2e) both sort before the
    // subtree `foo` which compares as `foo/` ('/' = 0x2f)
    assert_eq!(names, vec!["foo-bar", "foo.c", "foo"]);
    Ok(())
}

#[test]
fn commit_roundtrip_plain() -> GitResult<()> {
    let text = "tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
                parent c57eff55ebc0c54973903af5f72bac72762cf4f4\n\
                parent e69de29bb2d1d6434b8b29ae775ad8c2e48c5391\n\
                author A <a@b> 1577836800 +0000\n\
                committer A <a@b> 1577836800 +0000\n\
                \n\
                a message\n\nwith body\n";
    let commit = Commit::parse(text.as_bytes())?;
    assert_eq!(commit.parents.len(), 2);
    assert_eq!(commit.first_parent().unwrap().to_hex(), "c57eff55ebc0c54973903af5f72bac72762cf4f4");
    assert_eq!(commit.subject(), "a message");
    assert_eq!(commit.serialize_to_vec()?, text.as_bytes());
    Ok(())
}

#[test]
fn commit_roundtrip_with_gpgsig_continuation() -> GitResult<()> {
    let text = "tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
                author A <a@b> 1577836800 +0000\n\
                committer A <a@b> 1577836800 +0000\n\
                gpgsig -----BEGIN PGP SIGNATURE-----\n \n iQEzBAABCAAdFiEE\n -----END PGP SIGNATURE-----\n\
                \n\
                signed\n";
    let commit = Commit::parse(text.as_bytes())?;
    let sig = commit.gpgsig.as_deref().unwrap();
    assert!(sig.starts_with("-----BEGIN PGP SIGNATURE-----\n"));
    assert!(sig.ends_with("-----END PGP SIGNATURE-----"));
    assert_eq!(commit.serialize_to_vec()?, text.as_bytes());
    // parse(serialize(parse(x))) == parse(x)
    assert_eq!(Commit::parse(&commit.serialize_to_vec()?)?, commit);
    Ok(())
}

#[test]
fn commit_preserves_unknown_headers() -> GitResult<()> {
    let text = "tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
                author A <a@b> 1577836800 +0000\n\
                committer A <a@b> 1577836800 +0000\n\
                somefutureheader some value\n\
                \n\
                m\n";
    let commit = Commit::parse(text.as_bytes())?;
    assert_eq!(commit.extra_headers, vec![("somefutureheader".to_owned(), "some value".to_owned())]);
    assert_eq!(commit.serialize_to_vec()?, text.as_bytes());
    Ok(())
}

#[test]
fn tag_roundtrip() -> GitResult<()> {
    let text = "object c57eff55ebc0c54973903af5f72bac72762cf4f4\n\
                type commit\n\
                tag v1.0.0\n\
                tagger A <a@b> 1577836800 +0000\n\
                \n\
                release\n";
    let tag = Tag::parse(text.as_bytes())?;
    assert_eq!(tag.name, "v1.0.0");
    assert_eq!(tag.obj_type, ObjType::Commit);
    assert_eq!(tag.serialize_to_vec()?, text.as_bytes());
    Ok(())
}

#[test]
fn rehashing_parsed_object_yields_original_oid() -> GitResult<()> {
    let raw = RawObject::new(ObjType::Blob, b"hi\n".to_vec());
    let oid = raw.oid(HashAlgo::Sha1);
    let parsed = raw.parse(HashAlgo::Sha1)?;
    let reserialized = RawObject::new(parsed.obj_type(), parsed.serialize_to_vec()?);
    assert_eq!(reserialized.oid(HashAlgo::Sha1), oid);
    Ok(())
}

#[test]
fn wrapped_form_of_hello_world() {
    let raw = RawObject::new(ObjType::Blob, b"Hello world!".to_vec());
    assert_eq!(raw.wrapped(), b"blob 12\0Hello world!");
    assert_eq!(raw.oid(HashAlgo::Sha1).to_hex(), "c57eff55ebc0c54973903af5f72bac72762cf4f4");
}

#[test]
fn header_parse_rejects_bad_length_declaration() {
    // declared length shorter than content is caught by the odb read path;
    // here just pin the header parse itself
    let mut reader = std::io::BufReader::new(&b"blob 3\0abc"[..]);
    let header = read_obj_header(&mut reader).unwrap();
    assert_eq!(header, ObjHeader { obj_type: ObjType::Blob, size: 3 });
}
