use super::delta::Delta;
use super::{parse_pack_header, PackIndex, PackObjType, PACK_EXT, PACK_IDX_EXT};
use crate::error::{GitError, GitResult};
use crate::fs;
use crate::hash::{crc_of, HashAlgo, Oid};
use crate::io::{inflate_exact, ReadExt, WriteExt};
use crate::obj::{ObjType, RawObject};
use rustc_hash::FxHashMap;
use std::convert::TryFrom;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct IndexPackOutcome {
    pub pack_hash: Oid,
    pub oids: Vec<Oid>,
    pub object_count: u32,
    /// bases pulled out of the local store to complete a thin pack
    pub appended_bases: u32,
    pub pack_path: PathBuf,
    pub idx_path: PathBuf,
}

struct WireEntry {
    offset: u64,
    end: u64,
    payload: WirePayload,
}

enum WirePayload {
    Raw(RawObject),
    Ofs { base_rel: u64, delta: Vec<u8> },
    Ref { base: Oid, delta: Vec<u8> },
}

/// Ingests a pack received off the wire: verifies the trailer, resolves
/// every delta, completes thin packs by appending the referenced bases from
/// the local store, then writes the final `pack-<hash>.{pack,idx}` pair
/// under `pack_dir`. The incoming stream is buffered whole; the seekable
/// on-disk reader in [`super::Pack`] is the streaming path.
pub fn index_pack(
    algo: HashAlgo,
    pack_dir: &Path,
    mut stream: impl Read,
    thin_base: impl Fn(Oid) -> GitResult<Option<RawObject>>,
) -> GitResult<IndexPackOutcome> {
    let mut bytes = vec![];
    stream.read_to_end(&mut bytes)?;

    let oid_size = algo.oid_size();
    ensure!(bytes.len() > 12 + oid_size, GitError::corrupt("truncated pack stream"));
    let (body, trailer) = bytes.split_at(bytes.len() - oid_size);
    let trailer = Oid::from_bytes(trailer)?;
    let computed = algo.hash_bytes(body);
    ensure_eq!(computed, trailer, "pack stream trailer mismatch");

    let mut reader = Cursor::new(body);
    let count = parse_pack_header(&mut reader)?;

    // pass 1: walk the entries, inflating each payload
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let offset = reader.position();
        let (ty, size) = reader.read_le_varint_with_shift(3)?;
        let kind = PackObjType::try_from(ty)
            .map_err(|_| GitError::corrupt_at(format!("pack entry type `{}`", ty), offset))?;
        let payload = match kind {
            PackObjType::OfsDelta => {
                let base_rel = reader.read_offset()?;
                let (delta, _) = inflate_exact(&mut reader, size)?;
                WirePayload::Ofs { base_rel, delta }
            }
            PackObjType::RefDelta => {
                let base = reader.read_oid(algo)?;
                let (delta, _) = inflate_exact(&mut reader, size)?;
                WirePayload::Ref { base, delta }
            }
            kind => {
                let (data, _) = inflate_exact(&mut reader, size)?;
                ensure_eq!(data.len() as u64, size, "pack entry size mismatch");
                WirePayload::Raw(RawObject::new(ObjType::try_from(kind)?, data))
            }
        };
        entries.push(WireEntry { offset, end: reader.position(), payload });
    }
    ensure_eq!(reader.position() as usize, body.len(), "trailing garbage after pack entries");

    // pass 2: resolve deltas; ofs bases always precede their deltas, ref
    // bases may appear later in the pack or only in the local store
    let mut resolved: FxHashMap<u64, RawObject> = Default::default();
    let mut oid_at: FxHashMap<u64, Oid> = Default::default();
    let mut offset_of: FxHashMap<Oid, u64> = Default::default();
    let mut pending: Vec<(u64, Oid, Vec<u8>)> = vec![];

    let mut record = |offset: u64,
                      obj: RawObject,
                      resolved: &mut FxHashMap<u64, RawObject>,
                      oid_at: &mut FxHashMap<u64, Oid>,
                      offset_of: &mut FxHashMap<Oid, u64>| {
        let oid = obj.oid(algo);
        oid_at.insert(offset, oid);
        offset_of.insert(oid, offset);
        resolved.insert(offset, obj);
    };

    for entry in &entries {
        match &entry.payload {
            WirePayload::Raw(obj) =>
                record(entry.offset, obj.clone(), &mut resolved, &mut oid_at, &mut offset_of),
            WirePayload::Ofs { base_rel, delta } => {
                let base_offset = entry
                    .offset
                    .checked_sub(*base_rel)
                    .ok_or_else(|| GitError::corrupt_at("ofs-delta base underflow", entry.offset))?;
                let base = resolved.get(&base_offset).ok_or_else(|| {
                    GitError::corrupt_at("ofs-delta references a non-entry offset", entry.offset)
                })?;
                let obj = RawObject::new(base.obj_type, Delta::parse(delta)?.expand(&base.bytes)?);
                record(entry.offset, obj, &mut resolved, &mut oid_at, &mut offset_of);
            }
            WirePayload::Ref { base, delta } =>
                pending.push((entry.offset, *base, delta.clone())),
        }
    }

    let mut appended: Vec<RawObject> = vec![];
    let mut appended_oids: Vec<Oid> = vec![];
    loop {
        let before = pending.len();
        let mut still_pending = vec![];
        for (offset, base_oid, delta) in pending {
            let base = match offset_of.get(&base_oid) {
                Some(base_offset) => Some(resolved[base_offset].clone()),
                None => match appended_oids.iter().position(|&oid| oid == base_oid) {
                    Some(i) => Some(appended[i].clone()),
                    None => match thin_base(base_oid)? {
                        Some(base) => {
                            // thin pack: the base gets appended so the final
                            // pack is self contained
                            appended_oids.push(base_oid);
                            appended.push(base.clone());
                            Some(base)
                        }
                        None => None,
                    },
                },
            };
            match base {
                Some(base) => {
                    let obj =
                        RawObject::new(base.obj_type, Delta::parse(&delta)?.expand(&base.bytes)?);
                    record(offset, obj, &mut resolved, &mut oid_at, &mut offset_of);
                }
                None => still_pending.push((offset, base_oid, delta)),
            }
        }
        pending = still_pending;
        if pending.is_empty() {
            break;
        }
        ensure!(
            pending.len() < before,
            GitError::corrupt(format!(
                "unresolvable ref-delta base `{}`",
                pending[0].1
            ))
        );
    }

    // assemble the final pack; appending bases keeps every original offset
    // valid since the header stays 12 bytes
    let total_count = count + appended.len() as u32;
    let mut final_pack = Vec::with_capacity(bytes.len());
    final_pack.extend_from_slice(super::PACK_SIGNATURE);
    final_pack.write_u32(super::PACK_VERSION)?;
    final_pack.write_u32(total_count)?;
    final_pack.extend_from_slice(&body[12..]);

    let mut table: Vec<(Oid, u64, u32)> = entries
        .iter()
        .map(|entry| {
            let oid = oid_at[&entry.offset];
            let crc = crc_of(&body[entry.offset as usize..entry.end as usize]);
            (oid, entry.offset, crc)
        })
        .collect();

    for (obj, oid) in appended.iter().zip(&appended_oids) {
        let offset = final_pack.len() as u64;
        final_pack.write_pack_obj_header(PackObjType::from(obj.obj_type) as u8, obj.bytes.len() as u64)?;
        final_pack.extend_from_slice(&crate::io::deflate(&obj.bytes)?);
        let crc = crc_of(&final_pack[offset as usize..]);
        table.push((*oid, offset, crc));
    }

    let pack_hash = algo.hash_bytes(&final_pack);
    final_pack.extend_from_slice(pack_hash.as_bytes());

    table.sort_by_key(|&(oid, ..)| oid);
    table.dedup_by_key(|&mut (oid, ..)| oid);
    let oids: Vec<Oid> = table.iter().map(|&(oid, ..)| oid).collect();
    let index = PackIndex {
        fanout: PackIndex::build_fanout(&oids),
        oids: oids.clone(),
        crcs: Some(table.iter().map(|&(_, _, crc)| crc).collect()),
        offsets: table.iter().map(|&(_, offset, _)| offset).collect(),
        pack_hash,
    };

    let pack_path = pack_dir.join(format!("pack-{}.{}", pack_hash, PACK_EXT));
    let idx_path = pack_dir.join(format!("pack-{}.{}", pack_hash, PACK_IDX_EXT));
    fs::atomic_write(&pack_path, &final_pack, true)?;
    let mut idx_bytes = vec![];
    index.serialize_v2(&mut idx_bytes, algo)?;
    fs::atomic_write(&idx_path, &idx_bytes, false)?;

    debug!(
        "indexed pack `{}`: {} objects ({} thin bases appended)",
        pack_hash,
        total_count,
        appended.len()
    );

    Ok(IndexPackOutcome {
        pack_hash,
        oids,
        object_count: total_count,
        appended_bases: appended.len() as u32,
        pack_path,
        idx_path,
    })
}
