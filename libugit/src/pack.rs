pub mod delta;
mod indexer;
mod writer;

pub use self::indexer::{index_pack, IndexPackOutcome};
pub use self::writer::{write_pack_to_vec, PackWriter};

use self::delta::Delta;
use crate::error::{GitError, GitResult};
use crate::hash::{HashAlgo, Oid};
use crate::io::{BufferedFileStream, ReadExt, WriteExt};
use crate::obj::{ObjHeader, ObjType, RawObject};
use crate::serialize::BufReadSeek;
use num_enum::TryFromPrimitive;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::fs::File;
use std::io::{prelude::*, BufReader, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";
pub const PACK_VERSION: u32 = 2;
pub const PACK_EXT: &str = "pack";
pub const PACK_IDX_EXT: &str = "idx";
const PACK_IDX_MAGIC: u32 = 0xff744f63;
const FANOUT_ENTRYC: usize = 256;
/// offsets above this live in the v2 extended 64-bit offset table
const MAX_SMALL_OFFSET: u64 = 0x7fffffff;
/// real-world delta chains reach 50+, anything near this is corruption
const MAX_DELTA_CHAIN: usize = 4096;
/// bound on the resolved-base cache; chains re-resolve past this
const DELTA_CACHE_LIMIT: usize = 64;

/// The 3-bit entry type tag in pack entry headers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum PackObjType {
    Commit   = 1,
    Tree     = 2,
    Blob     = 3,
    Tag      = 4,
    OfsDelta = 6,
    RefDelta = 7,
}

impl PackObjType {
    pub fn is_delta(self) -> bool {
        matches!(self, PackObjType::OfsDelta | PackObjType::RefDelta)
    }
}

impl From<ObjType> for PackObjType {
    fn from(obj_type: ObjType) -> Self {
        match obj_type {
            ObjType::Commit => PackObjType::Commit,
            ObjType::Tree => PackObjType::Tree,
            ObjType::Blob => PackObjType::Blob,
            ObjType::Tag => PackObjType::Tag,
        }
    }
}

impl TryFrom<PackObjType> for ObjType {
    type Error = crate::error::GitGenericError;

    fn try_from(ty: PackObjType) -> GitResult<ObjType> {
        match ty {
            PackObjType::Commit => Ok(ObjType::Commit),
            PackObjType::Tree => Ok(ObjType::Tree),
            PackObjType::Blob => Ok(ObjType::Blob),
            PackObjType::Tag => Ok(ObjType::Tag),
            PackObjType::OfsDelta | PackObjType::RefDelta =>
                Err(anyhow!("delta entry has no standalone object type")),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PackEntryHeader {
    pub kind: PackObjType,
    /// inflated size of this entry's payload (for deltas, of the delta
    /// itself, not the reconstructed object)
    pub size: u64,
}

/// A fully read pack entry with its inflated payload.
#[derive(Debug)]
pub struct PackEntry {
    pub offset: u64,
    /// offset one past the compressed payload; the raw byte span
    /// `offset..end_offset` is what entry crcs cover
    pub end_offset: u64,
    pub payload: PackEntryPayload,
}

#[derive(Debug)]
pub enum PackEntryPayload {
    Raw(RawObject),
    Ofs { base_rel: u64, delta: Vec<u8> },
    Ref { base: Oid, delta: Vec<u8> },
}

/// Parsed `.idx` contents. Both v1 and v2 parse into this; lookups are
/// fanout-byte narrowing followed by binary search.
#[derive(Debug, Clone)]
#[cfg_attr(test, derive(PartialEq))]
pub struct PackIndex {
    pub fanout: [u32; FANOUT_ENTRYC],
    pub oids: Vec<Oid>,
    /// v1 indexes carry no crcs
    pub crcs: Option<Vec<u32>>,
    pub offsets: Vec<u64>,
    pub pack_hash: Oid,
}

impl PackIndex {
    pub fn build_fanout(oids: &[Oid]) -> [u32; FANOUT_ENTRYC] {
        let mut fanout = [0u32; FANOUT_ENTRYC];
        for oid in oids {
            fanout[oid.first_byte() as usize] += 1;
        }
        for i in 1..FANOUT_ENTRYC {
            fanout[i] += fanout[i - 1];
        }
        fanout
    }

    pub fn parse(reader: &mut impl BufRead, algo: HashAlgo) -> GitResult<Self> {
        let mut hashing = crate::io::HashReader::new(algo, reader);
        let first = hashing.read_u32()?;
        let index = if first == PACK_IDX_MAGIC {
            let version = hashing.read_u32()?;
            ensure_eq!(version, 2, "unsupported pack index version `{}`", version);
            Self::parse_v2_body(&mut hashing, algo)?
        } else {
            // v1 has no magic; the first word is fanout[0]
            Self::parse_v1_body(first, &mut hashing, algo)?
        };
        let computed = hashing.finalize();
        let trailer = hashing.read_oid(algo)?;
        ensure_eq!(trailer, computed, "pack index checksum mismatch");
        Ok(index)
    }

    fn read_fanout(reader: &mut impl Read, first: Option<u32>) -> GitResult<[u32; FANOUT_ENTRYC]> {
        let mut fanout = [0u32; FANOUT_ENTRYC];
        let mut start = 0;
        if let Some(first) = first {
            fanout[0] = first;
            start = 1;
        }
        for slot in &mut fanout[start..] {
            *slot = reader.read_u32()?;
        }
        ensure!(fanout.windows(2).all(|w| w[0] <= w[1]), GitError::corrupt("pack index fanout"));
        Ok(fanout)
    }

    fn parse_v2_body(reader: &mut impl Read, algo: HashAlgo) -> GitResult<Self> {
        let fanout = Self::read_fanout(reader, None)?;
        let n = fanout[FANOUT_ENTRYC - 1] as usize;
        let mut oids = Vec::with_capacity(n);
        for _ in 0..n {
            oids.push(reader.read_oid(algo)?);
        }
        ensure!(oids.windows(2).all(|w| w[0] < w[1]), GitError::corrupt("pack index oid table"));
        let mut crcs = Vec::with_capacity(n);
        for _ in 0..n {
            crcs.push(reader.read_u32()?);
        }
        let mut small_offsets = Vec::with_capacity(n);
        for _ in 0..n {
            small_offsets.push(reader.read_u32()?);
        }
        // the msb of a small offset redirects into the 64-bit table
        let ext_count =
            small_offsets.iter().filter(|&&offset| offset as u64 > MAX_SMALL_OFFSET).count();
        let mut ext_offsets = Vec::with_capacity(ext_count);
        for _ in 0..ext_count {
            ext_offsets.push(reader.read_u64()?);
        }
        let offsets = small_offsets
            .into_iter()
            .map(|offset| {
                if offset as u64 > MAX_SMALL_OFFSET {
                    let ext_index = (offset as u64 & MAX_SMALL_OFFSET) as usize;
                    ext_offsets
                        .get(ext_index)
                        .copied()
                        .ok_or_else(|| GitError::corrupt("pack index extended offset table"))
                } else {
                    Ok(offset as u64)
                }
            })
            .collect::<GitResult<Vec<_>>>()?;
        let pack_hash = reader.read_oid(algo)?;
        Ok(Self { fanout, oids, crcs: Some(crcs), offsets, pack_hash })
    }

    fn parse_v1_body(first: u32, reader: &mut impl Read, algo: HashAlgo) -> GitResult<Self> {
        let fanout = Self::read_fanout(reader, Some(first))?;
        let n = fanout[FANOUT_ENTRYC - 1] as usize;
        let mut oids = Vec::with_capacity(n);
        let mut offsets = Vec::with_capacity(n);
        for _ in 0..n {
            offsets.push(reader.read_u32()? as u64);
            oids.push(reader.read_oid(algo)?);
        }
        ensure!(oids.windows(2).all(|w| w[0] < w[1]), GitError::corrupt("pack index oid table"));
        let pack_hash = reader.read_oid(algo)?;
        Ok(Self { fanout, oids, crcs: None, offsets, pack_hash })
    }

    pub fn len(&self) -> usize {
        self.oids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oids.is_empty()
    }

    /// Index of `oid` in the sorted table. On a miss the error carries the
    /// insertion point, which prefix scans use to enumerate candidates.
    pub fn find_oid_index(&self, oid: Oid) -> GitResult<usize> {
        let prefix = oid.first_byte() as usize;
        let low = if prefix == 0 { 0 } else { self.fanout[prefix - 1] as usize };
        let high = self.fanout[prefix] as usize;
        match self.oids[low..high].binary_search(&oid) {
            Ok(i) => Ok(low + i),
            Err(i) => Err(anyhow!(GitError::ObjectNotFoundInPackIndex(oid, (low + i) as u64))),
        }
    }

    pub fn find_offset(&self, oid: Oid) -> GitResult<u64> {
        self.find_oid_index(oid).map(|i| self.offsets[i])
    }

    pub fn prefix_matches(&self, prefix: &str, algo: HashAlgo) -> Vec<Oid> {
        use crate::error::GitErrorExt;
        let probe = match crate::obj::PartialOid::new(prefix) {
            Ok(partial) => partial.zero_extended(algo),
            Err(..) => return vec![],
        };
        let start = match self.find_oid_index(probe) {
            Ok(i) => i,
            Err(err) => match err.try_into_obj_not_found_in_pack_index_err() {
                Ok((_, i)) => i as usize,
                Err(..) => return vec![],
            },
        };
        self.oids[start..].iter().take_while(|oid| oid.has_prefix(prefix)).copied().collect()
    }

    /// Serializes in v2 format, extended offset table included when needed.
    pub fn serialize_v2(&self, writer: &mut dyn Write, algo: HashAlgo) -> GitResult<()> {
        let mut writer = crate::io::HashWriter::new(algo, writer);
        writer.write_u32(PACK_IDX_MAGIC)?;
        writer.write_u32(2)?;
        for n in self.fanout {
            writer.write_u32(n)?;
        }
        for oid in &self.oids {
            writer.write_oid(*oid)?;
        }
        let crcs = self.crcs.as_ref().expect("cannot serialize a v1 index as v2 without crcs");
        for crc in crcs {
            writer.write_u32(*crc)?;
        }
        let mut ext = vec![];
        for &offset in &self.offsets {
            if offset > MAX_SMALL_OFFSET {
                writer.write_u32(0x8000_0000 | ext.len() as u32)?;
                ext.push(offset);
            } else {
                writer.write_u32(offset as u32)?;
            }
        }
        for offset in ext {
            writer.write_u64(offset)?;
        }
        writer.write_oid(self.pack_hash)?;
        writer.write_trailing_hash()?;
        Ok(())
    }
}

/// Streamed access to a `.pack` file over any seekable buffered reader.
pub struct PackfileReader<R> {
    reader: R,
    objectc: u32,
}

impl<R: BufReadSeek> PackfileReader<R> {
    pub fn new(mut reader: R) -> GitResult<Self> {
        let objectc = parse_pack_header(&mut reader)?;
        Ok(Self { reader, objectc })
    }

    pub fn object_count(&self) -> u32 {
        self.objectc
    }

    fn read_entry_header(&mut self) -> GitResult<PackEntryHeader> {
        let (ty, size) = self.reader.read_le_varint_with_shift(3)?;
        let kind = PackObjType::try_from(ty)
            .map_err(|_| GitError::corrupt(format!("pack entry type `{}`", ty)))?;
        Ok(PackEntryHeader { kind, size })
    }

    pub fn read_entry_header_at(&mut self, offset: u64) -> GitResult<PackEntryHeader> {
        self.reader.seek(SeekFrom::Start(offset))?;
        self.read_entry_header()
    }

    /// Reads the entry at `offset` in full, inflating its payload.
    pub fn read_entry_at(&mut self, offset: u64, algo: HashAlgo) -> GitResult<PackEntry> {
        self.reader.seek(SeekFrom::Start(offset))?;
        let header = self.read_entry_header()?;
        let payload = match header.kind {
            PackObjType::OfsDelta => {
                let base_rel = self.reader.read_offset()?;
                let (delta, _) = crate::io::inflate_exact(&mut self.reader, header.size)?;
                ensure_eq!(delta.len() as u64, header.size, "pack delta size mismatch");
                PackEntryPayload::Ofs { base_rel, delta }
            }
            PackObjType::RefDelta => {
                let base = self.reader.read_oid(algo)?;
                let (delta, _) = crate::io::inflate_exact(&mut self.reader, header.size)?;
                ensure_eq!(delta.len() as u64, header.size, "pack delta size mismatch");
                PackEntryPayload::Ref { base, delta }
            }
            kind => {
                let (bytes, _) = crate::io::inflate_exact(&mut self.reader, header.size)?;
                ensure_eq!(bytes.len() as u64, header.size, "pack entry size mismatch");
                PackEntryPayload::Raw(RawObject::new(ObjType::try_from(kind)?, bytes))
            }
        };
        let end_offset = self.reader.stream_position()?;
        Ok(PackEntry { offset, end_offset, payload })
    }

    /// Reads the ofs/ref base reference of the delta entry whose header was
    /// just consumed; used by the header-only path.
    fn read_delta_base(&mut self, kind: PackObjType, algo: HashAlgo) -> GitResult<DeltaBase> {
        Ok(match kind {
            PackObjType::OfsDelta => DeltaBase::Ofs(self.reader.read_offset()?),
            PackObjType::RefDelta => DeltaBase::Ref(self.reader.read_oid(algo)?),
            _ => unreachable!("not a delta kind"),
        })
    }
}

enum DeltaBase {
    Ofs(u64),
    Ref(Oid),
}

pub(crate) fn parse_pack_header(reader: &mut impl Read) -> GitResult<u32> {
    let mut sig = [0u8; 4];
    reader.read_exact(&mut sig)?;
    ensure_eq!(&sig, PACK_SIGNATURE, "invalid packfile signature");
    let version = reader.read_u32()?;
    ensure_eq!(version, PACK_VERSION, "unsupported packfile version `{}`", version);
    Ok(reader.read_u32()?)
}

/// Bounded cache of resolved delta bases keyed by pack offset. Insertion
/// order eviction; delta chains revisit recent offsets, which this serves
/// fine without true recency tracking.
struct DeltaBaseCache {
    map: FxHashMap<u64, RawObject>,
    order: VecDeque<u64>,
}

impl DeltaBaseCache {
    fn new() -> Self {
        Self { map: Default::default(), order: Default::default() }
    }

    fn get(&self, offset: u64) -> Option<RawObject> {
        self.map.get(&offset).cloned()
    }

    fn put(&mut self, offset: u64, obj: RawObject) {
        if self.map.insert(offset, obj).is_none() {
            self.order.push_back(offset);
            if self.order.len() > DELTA_CACHE_LIMIT {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                }
            }
        }
    }
}

struct PackState {
    reader: PackfileReader<BufferedFileStream>,
    cache: DeltaBaseCache,
}

/// A `{pack-<hash>.pack, pack-<hash>.idx}` pair. Reads are `&self`; the
/// seekable reader state sits behind a mutex so the object store can serve
/// concurrent readers.
pub struct Pack {
    pack_path: PathBuf,
    index: PackIndex,
    algo: HashAlgo,
    state: Mutex<PackState>,
    /// cleared when the trailer fails verification; a disabled pack answers
    /// every lookup with not-found and never poisons its siblings
    usable: AtomicBool,
}

impl Pack {
    pub fn open(pack_path: impl AsRef<Path>, idx_path: impl AsRef<Path>, algo: HashAlgo) -> GitResult<Self> {
        let pack_path = pack_path.as_ref().to_path_buf();
        let index =
            PackIndex::parse(&mut BufReader::new(File::open(idx_path.as_ref())?), algo)?;
        let reader = PackfileReader::new(BufReader::new(File::open(&pack_path)?))?;
        let pack = Self {
            pack_path,
            index,
            algo,
            state: Mutex::new(PackState { reader, cache: DeltaBaseCache::new() }),
            usable: AtomicBool::new(true),
        };
        if let Err(err) = pack.verify_trailer() {
            warn!("disabling pack `{}`: {}", pack.pack_path.display(), err);
            pack.usable.store(false, Ordering::Release);
        }
        Ok(pack)
    }

    /// Hashes the pack contents and compares against both the trailer and
    /// the idx's recorded pack hash.
    fn verify_trailer(&self) -> GitResult<()> {
        let bytes = std::fs::read(&self.pack_path)?;
        let oid_size = self.algo.oid_size();
        ensure!(bytes.len() > oid_size, GitError::corrupt("truncated packfile"));
        let (body, trailer) = bytes.split_at(bytes.len() - oid_size);
        let computed = self.algo.hash_bytes(body);
        let trailer = Oid::from_bytes(trailer)?;
        ensure_eq!(
            computed,
            trailer,
            "pack trailer mismatch in `{}` (computed {}, trailer {})",
            self.pack_path.display(),
            computed,
            trailer
        );
        ensure_eq!(trailer, self.index.pack_hash, "pack index does not describe this pack");
        Ok(())
    }

    pub fn is_usable(&self) -> bool {
        self.usable.load(Ordering::Acquire)
    }

    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    pub fn oids(&self) -> &[Oid] {
        &self.index.oids
    }

    fn not_found(&self, oid: Oid) -> crate::error::GitGenericError {
        anyhow!(GitError::ObjectNotFound(oid.into()))
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.is_usable() && self.index.find_oid_index(oid).is_ok()
    }

    pub fn obj_offset(&self, oid: Oid) -> GitResult<u64> {
        if !self.is_usable() {
            return Err(self.not_found(oid));
        }
        self.index.find_offset(oid)
    }

    pub fn prefix_matches(&self, prefix: &str) -> Vec<Oid> {
        if !self.is_usable() {
            return vec![];
        }
        self.index.prefix_matches(prefix, self.algo)
    }

    pub fn read_raw(&self, oid: Oid) -> GitResult<RawObject> {
        trace!("Pack::read_raw(oid: {})", oid);
        if !self.is_usable() {
            return Err(self.not_found(oid));
        }
        let offset = self.index.find_offset(oid)?;
        let mut state = self.state.lock();
        self.read_raw_at(&mut state, offset)
    }

    /// Fully expands the object at `offset`. Delta chains are resolved with
    /// an explicit frame stack, never recursion; chains of 50+ are routine
    /// in real packs and would overflow a recursive resolver.
    fn read_raw_at(&self, state: &mut PackState, offset: u64) -> GitResult<RawObject> {
        let mut frames: Vec<(u64, Vec<u8>)> = vec![];
        let mut cur = offset;
        let mut base = loop {
            if let Some(hit) = state.cache.get(cur) {
                break hit;
            }
            ensure!(
                frames.len() < MAX_DELTA_CHAIN,
                GitError::corrupt(format!("delta chain longer than {}", MAX_DELTA_CHAIN))
            );
            let entry = state.reader.read_entry_at(cur, self.algo)?;
            match entry.payload {
                PackEntryPayload::Raw(raw) => break raw,
                PackEntryPayload::Ofs { base_rel, delta } => {
                    ensure!(
                        base_rel <= cur,
                        GitError::corrupt_at("ofs-delta base offset underflow", cur)
                    );
                    frames.push((cur, delta));
                    cur -= base_rel;
                }
                PackEntryPayload::Ref { base, delta } => {
                    frames.push((cur, delta));
                    cur = self.index.find_offset(base).map_err(|_| {
                        anyhow!(GitError::corrupt(format!(
                            "ref-delta base `{}` missing from pack `{}`",
                            base,
                            self.pack_path.display()
                        )))
                    })?;
                }
            }
        };

        while let Some((at, delta_bytes)) = frames.pop() {
            let delta = Delta::parse(&delta_bytes)?;
            base = RawObject::new(base.obj_type, delta.expand(&base.bytes)?);
            state.cache.put(at, base.clone());
        }
        Ok(base)
    }

    /// Object type and reconstructed size without materializing the object
    /// (except for the outermost delta payload, whose destination-size
    /// varint is the object size).
    pub fn read_header(&self, oid: Oid) -> GitResult<ObjHeader> {
        if !self.is_usable() {
            return Err(self.not_found(oid));
        }
        let mut offset = self.index.find_offset(oid)?;
        let mut state = self.state.lock();
        let mut outer_size = None;
        for _ in 0..MAX_DELTA_CHAIN {
            let header = state.reader.read_entry_header_at(offset)?;
            if !header.kind.is_delta() {
                return Ok(ObjHeader {
                    obj_type: ObjType::try_from(header.kind)?,
                    size: outer_size.unwrap_or(header.size),
                });
            }
            if outer_size.is_none() {
                // need the delta's dst-size varint; it sits after the src
                // size at the head of the inflated payload
                let entry_offset = offset;
                let base = state.reader.read_delta_base(header.kind, self.algo)?;
                let (delta, _) = crate::io::inflate_exact(&mut state.reader.reader, header.size)?;
                let mut cursor = std::io::Cursor::new(&delta);
                let _src = cursor.read_size()?;
                outer_size = Some(cursor.read_size()?);
                offset = match base {
                    DeltaBase::Ofs(rel) => entry_offset - rel,
                    DeltaBase::Ref(base_oid) => self.index.find_offset(base_oid)?,
                };
            } else {
                let entry_offset = offset;
                let base = state.reader.read_delta_base(header.kind, self.algo)?;
                offset = match base {
                    DeltaBase::Ofs(rel) => entry_offset - rel,
                    DeltaBase::Ref(base_oid) => self.index.find_offset(base_oid)?,
                };
            }
        }
        Err(GitError::corrupt(format!("delta chain longer than {}", MAX_DELTA_CHAIN)))
    }
}

#[cfg(test)]
mod tests;
