use super::delta::{encode_delta, DeltaOp};
use super::*;
use crate::error::GitResultExt;
use crate::io::deflate;
use crate::obj::RawObject;
use std::io::Write as _;

fn raw_blob(bytes: &[u8]) -> RawObject {
    RawObject::new(ObjType::Blob, bytes.to_vec())
}

/// Hand-assembles a pack with full control over entry encodings.
struct TestPackBuilder {
    buf: Vec<u8>,
    count: u32,
}

impl TestPackBuilder {
    fn new() -> Self {
        Self { buf: { let mut b = PACK_SIGNATURE.to_vec(); b.extend(&2u32.to_be_bytes()); b.extend(&0u32.to_be_bytes()); b }, count: 0 }
    }

    fn offset(&self) -> u64 {
        self.buf.len() as u64
    }

    fn add_raw(&mut self, obj: &RawObject) -> u64 {
        let offset = self.offset();
        self.buf.write_pack_obj_header(PackObjType::from(obj.obj_type) as u8, obj.bytes.len() as u64).unwrap();
        self.buf.extend(deflate(&obj.bytes).unwrap());
        self.count += 1;
        offset
    }

    fn add_ofs_delta(&mut self, base_offset: u64, delta: &[u8]) -> u64 {
        let offset = self.offset();
        self.buf.write_pack_obj_header(PackObjType::OfsDelta as u8, delta.len() as u64).unwrap();
        self.buf.write_offset(offset - base_offset).unwrap();
        self.buf.extend(deflate(delta).unwrap());
        self.count += 1;
        offset
    }

    fn add_ref_delta(&mut self, base: Oid, delta: &[u8]) -> u64 {
        let offset = self.offset();
        self.buf.write_pack_obj_header(PackObjType::RefDelta as u8, delta.len() as u64).unwrap();
        self.buf.write_all(base.as_bytes()).unwrap();
        self.buf.extend(deflate(delta).unwrap());
        self.count += 1;
        offset
    }

    fn finish(mut self, algo: HashAlgo) -> Vec<u8> {
        self.buf[8..12].copy_from_slice(&self.count.to_be_bytes());
        let hash = algo.hash_bytes(&self.buf);
        self.buf.extend(hash.as_bytes());
        self.buf
    }
}

fn append_delta(bytes: &[u8]) -> (Vec<u8>, Vec<u8>) {
    // target = base || " appended"
    let mut target = bytes.to_vec();
    target.extend_from_slice(b" appended");
    let payload = encode_delta(
        bytes.len() as u64,
        target.len() as u64,
        &[DeltaOp::Copy(0, bytes.len() as u64), DeltaOp::Insert(b" appended".to_vec())],
    );
    (payload, target)
}

#[test]
fn index_then_read_pack_with_delta_chain() -> crate::error::GitResult<()> {
    let algo = HashAlgo::Sha1;
    let dir = tempfile::tempdir()?;

    let base = raw_blob(b"base contents of some file");
    let (delta1, target1) = append_delta(&base.bytes);
    let (delta2, target2) = append_delta(&target1);

    let mut builder = TestPackBuilder::new();
    let base_offset = builder.add_raw(&base);
    let mid_offset = builder.add_ofs_delta(base_offset, &delta1);
    builder.add_ofs_delta(mid_offset, &delta2);
    let pack_bytes = builder.finish(algo);

    let outcome = index_pack(algo, dir.path(), &pack_bytes[..], |_| Ok(None))?;
    assert_eq!(outcome.object_count, 3);
    assert_eq!(outcome.appended_bases, 0);

    let pack = Pack::open(&outcome.pack_path, &outcome.idx_path, algo)?;
    assert!(pack.is_usable());

    let base_oid = base.oid(algo);
    let mid_oid = raw_blob(&target1).oid(algo);
    let tip_oid = raw_blob(&target2).oid(algo);
    assert_eq!(pack.read_raw(base_oid)?.bytes, base.bytes);
    assert_eq!(pack.read_raw(mid_oid)?.bytes, target1);
    assert_eq!(pack.read_raw(tip_oid)?.bytes, target2);

    // reconstructed header reports the object size, not the delta size
    let header = pack.read_header(tip_oid)?;
    assert_eq!(header.obj_type, ObjType::Blob);
    assert_eq!(header.size, target2.len() as u64);
    Ok(())
}

#[test]
fn ref_delta_resolves_against_in_pack_base() -> crate::error::GitResult<()> {
    let algo = HashAlgo::Sha1;
    let dir = tempfile::tempdir()?;

    let base = raw_blob(b"shared base");
    let (delta, target) = append_delta(&base.bytes);

    let mut builder = TestPackBuilder::new();
    builder.add_raw(&base);
    builder.add_ref_delta(base.oid(algo), &delta);
    let pack_bytes = builder.finish(algo);

    let outcome = index_pack(algo, dir.path(), &pack_bytes[..], |_| Ok(None))?;
    let pack = Pack::open(&outcome.pack_path, &outcome.idx_path, algo)?;
    assert_eq!(pack.read_raw(raw_blob(&target).oid(algo))?.bytes, target);
    Ok(())
}

#[test]
fn thin_pack_is_fattened_with_local_base() -> crate::error::GitResult<()> {
    let algo = HashAlgo::Sha1;
    let dir = tempfile::tempdir()?;

    let base = raw_blob(b"only in the local store");
    let base_oid = base.oid(algo);
    let (delta, target) = append_delta(&base.bytes);

    let mut builder = TestPackBuilder::new();
    builder.add_ref_delta(base_oid, &delta);
    let pack_bytes = builder.finish(algo);

    let base_clone = base.clone();
    let outcome = index_pack(algo, dir.path(), &pack_bytes[..], move |oid| {
        Ok((oid == base_oid).then(|| base_clone.clone()))
    })?;
    assert_eq!(outcome.appended_bases, 1);
    assert_eq!(outcome.object_count, 2);

    // the fattened pack must be self contained
    let pack = Pack::open(&outcome.pack_path, &outcome.idx_path, algo)?;
    assert!(pack.contains(base_oid));
    assert_eq!(pack.read_raw(raw_blob(&target).oid(algo))?.bytes, target);
    Ok(())
}

#[test]
fn thin_pack_without_base_fails() -> crate::error::GitResult<()> {
    let algo = HashAlgo::Sha1;
    let dir = tempfile::tempdir()?;

    let base = raw_blob(b"nowhere to be found");
    let (delta, _) = append_delta(&base.bytes);
    let mut builder = TestPackBuilder::new();
    builder.add_ref_delta(base.oid(algo), &delta);
    let pack_bytes = builder.finish(algo);

    assert!(index_pack(algo, dir.path(), &pack_bytes[..], |_| Ok(None)).is_err());
    Ok(())
}

#[test]
fn corrupt_trailer_disables_pack_only() -> crate::error::GitResult<()> {
    let algo = HashAlgo::Sha1;
    let dir = tempfile::tempdir()?;

    let blob = raw_blob(b"exclusive to this pack");
    let mut builder = TestPackBuilder::new();
    builder.add_raw(&blob);
    let pack_bytes = builder.finish(algo);
    let outcome = index_pack(algo, dir.path(), &pack_bytes[..], |_| Ok(None))?;

    // flip a byte inside the stored pack body; the trailer no longer matches
    let mut stored = std::fs::read(&outcome.pack_path)?;
    let mid = stored.len() / 2;
    stored[mid] ^= 0xff;
    std::fs::write(&outcome.pack_path, &stored)?;

    let pack = Pack::open(&outcome.pack_path, &outcome.idx_path, algo)?;
    assert!(!pack.is_usable());
    let err = pack.read_raw(blob.oid(algo)).unwrap_err();
    assert!(err.is_not_found_err());
    Ok(())
}

#[test]
fn index_roundtrips_through_v2_serialization() -> crate::error::GitResult<()> {
    let algo = HashAlgo::Sha1;
    let dir = tempfile::tempdir()?;

    let objects: Vec<_> = (0..32).map(|i| raw_blob(format!("object {}", i).as_bytes())).collect();
    let mut builder = TestPackBuilder::new();
    for obj in &objects {
        builder.add_raw(obj);
    }
    let pack_bytes = builder.finish(algo);
    let outcome = index_pack(algo, dir.path(), &pack_bytes[..], |_| Ok(None))?;

    let bytes = std::fs::read(&outcome.idx_path)?;
    let parsed = PackIndex::parse(&mut std::io::BufReader::new(&bytes[..]), algo)?;
    let mut reserialized = vec![];
    parsed.serialize_v2(&mut reserialized, algo)?;
    assert_eq!(bytes, reserialized);

    // every advertised oid reads back and rehashes to itself
    let pack = Pack::open(&outcome.pack_path, &outcome.idx_path, algo)?;
    for oid in pack.oids().to_vec() {
        assert_eq!(pack.read_raw(oid)?.oid(algo), oid);
    }
    Ok(())
}

#[test]
fn prefix_candidates_from_index() -> crate::error::GitResult<()> {
    let algo = HashAlgo::Sha1;
    let dir = tempfile::tempdir()?;
    let blob = raw_blob(b"prefix target");
    let oid = blob.oid(algo);
    let mut builder = TestPackBuilder::new();
    builder.add_raw(&blob);
    let pack_bytes = builder.finish(algo);
    let outcome = index_pack(algo, dir.path(), &pack_bytes[..], |_| Ok(None))?;
    let pack = Pack::open(&outcome.pack_path, &outcome.idx_path, algo)?;

    assert_eq!(pack.prefix_matches(&oid.to_hex()[..6]), vec![oid]);
    assert!(pack.prefix_matches("0000").is_empty() || oid.to_hex().starts_with("0000"));
    Ok(())
}
