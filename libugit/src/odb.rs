use crate::error::{GitError, GitResult, GitResultExt};
use crate::fs;
use crate::hash::{HashAlgo, Oid};
use crate::io::{deflate, BufReadExt, ReadExt};
use crate::obj::{self, Id, ObjHeader, ObjType, PartialOid, RawObject, WritableObject};
use crate::pack::{self, Pack, PACK_EXT, PACK_IDX_EXT};
use flate2::bufread::ZlibDecoder;
use parking_lot::RwLock;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Blobs over this many bytes are stored chunked unless configured
/// otherwise (`ugit.chunkthreshold`).
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 100 * 1024 * 1024;
/// Size of a single chunk file in the chunked representation.
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// The unified object database: loose files, packs, and the private chunked
/// large-blob store, searched in that order. Reads take `&self`; this is
/// the one component that must serve concurrent readers.
pub struct Odb {
    algo: HashAlgo,
    loose: LooseBackend,
    packed: PackedBackend,
    chunked: ChunkedBackend,
    chunk_threshold: u64,
}

impl Odb {
    pub fn new(objects_dir: PathBuf, algo: HashAlgo, chunk_threshold: Option<u64>) -> GitResult<Self> {
        let packed = PackedBackend::new(objects_dir.join("pack"), algo)?;
        Ok(Self {
            algo,
            loose: LooseBackend { objects_dir: objects_dir.clone(), algo },
            packed,
            chunked: ChunkedBackend { dir: objects_dir.join("chunked"), algo },
            chunk_threshold: chunk_threshold.unwrap_or(DEFAULT_CHUNK_THRESHOLD),
        })
    }

    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    /// Rescans the pack directory; called after a fetch lands a new pack.
    pub fn refresh_packs(&self) -> GitResult<()> {
        self.packed.refresh()
    }

    pub fn pack_dir(&self) -> PathBuf {
        self.packed.pack_dir.clone()
    }

    pub fn packs(&self) -> Vec<Arc<Pack>> {
        self.packed.packs.read().clone()
    }

    pub fn contains(&self, oid: Oid) -> GitResult<bool> {
        Ok(self.loose.contains(oid)
            || self.packed.contains(oid)
            || self.chunked.contains(oid))
    }

    pub fn contains_prefix(&self, prefix: &PartialOid) -> GitResult<bool> {
        Ok(!self.prefix_candidates(prefix)?.is_empty())
    }

    pub fn read_raw(&self, id: impl Into<Id>) -> GitResult<RawObject> {
        let oid = self.expand_id(id.into())?;
        trace!("Odb::read_raw(oid: {})", oid);
        match self.loose.read_raw(oid) {
            Err(err) if err.is_not_found_err() => {}
            result => return result,
        }
        match self.packed.read_raw(oid) {
            Err(err) if err.is_not_found_err() => {}
            result => return result,
        }
        self.chunked.read_raw(oid)
    }

    pub fn read_header(&self, id: impl Into<Id>) -> GitResult<ObjHeader> {
        let oid = self.expand_id(id.into())?;
        match self.loose.read_header(oid) {
            Err(err) if err.is_not_found_err() => {}
            result => return result,
        }
        match self.packed.read_header(oid) {
            Err(err) if err.is_not_found_err() => {}
            result => return result,
        }
        self.chunked.read_header(oid)
    }

    /// Lazily inflated blob contents; checkout and the wire engine stream
    /// large blobs through this rather than materializing them.
    pub fn stream(&self, oid: Oid) -> GitResult<Box<dyn Read + Send>> {
        if self.loose.contains(oid) {
            return self.loose.stream(oid);
        }
        if self.chunked.contains(oid) {
            return self.chunked.stream(oid);
        }
        // packed blobs pay delta reconstruction up front; the resolved base
        // is buffered and the final bytes stream from the buffer
        let raw = self.packed.read_raw(oid)?;
        Ok(Box::new(Cursor::new(raw.bytes)))
    }

    /// Content-addressed write: hash, then store. Idempotent; concurrent
    /// writers of the same oid race benignly on the rename.
    pub fn write_raw(&self, obj_type: ObjType, bytes: &[u8]) -> GitResult<Oid> {
        let raw = RawObject::new(obj_type, bytes.to_vec());
        let oid = raw.oid(self.algo);
        if self.contains(oid)? {
            return Ok(oid);
        }
        if obj_type == ObjType::Blob && bytes.len() as u64 >= self.chunk_threshold {
            self.chunked.write(oid, &raw)?;
        } else {
            self.loose.write(oid, &raw)?;
        }
        Ok(oid)
    }

    pub fn write(&self, obj: &dyn WritableObject) -> GitResult<Oid> {
        let raw = obj.to_raw()?;
        self.write_raw(raw.obj_type, &raw.bytes)
    }

    /// Ingests a wire pack (possibly thin) into the pack directory and makes
    /// its objects readable.
    pub fn index_pack(&self, stream: impl Read) -> GitResult<pack::IndexPackOutcome> {
        let outcome = pack::index_pack(self.algo, &self.packed.pack_dir, stream, |oid| {
            match self.read_raw(oid) {
                Ok(raw) => Ok(Some(raw)),
                Err(err) if err.is_not_found_err() => Ok(None),
                Err(err) => Err(err),
            }
        })?;
        self.refresh_packs()?;
        Ok(outcome)
    }

    pub fn prefix_candidates(&self, prefix: &PartialOid) -> GitResult<Vec<Oid>> {
        let mut candidates = self.loose.prefix_candidates(prefix)?;
        candidates.extend(self.packed.prefix_candidates(prefix));
        candidates.extend(self.chunked.prefix_candidates(prefix)?);
        candidates.sort_unstable();
        candidates.dedup();
        Ok(candidates)
    }

    pub fn expand_prefix(&self, prefix: &PartialOid) -> GitResult<Oid> {
        let candidates = self.prefix_candidates(prefix)?;
        match candidates.len() {
            0 => Err(anyhow!(GitError::ObjectNotFound(prefix.clone().into()))),
            1 => Ok(candidates[0]),
            _ => Err(anyhow!(GitError::AmbiguousPrefix(prefix.clone(), candidates))),
        }
    }

    pub fn expand_id(&self, id: Id) -> GitResult<Oid> {
        match id {
            Id::Full(oid) => Ok(oid),
            Id::Partial(prefix) => self.expand_prefix(&prefix),
        }
    }
}

struct LooseBackend {
    /// path to `objects/`
    objects_dir: PathBuf,
    algo: HashAlgo,
}

impl LooseBackend {
    // infallible on purpose: the write path needs the target path whether or
    // not it exists yet
    fn obj_path(&self, oid: Oid) -> PathBuf {
        let (dir, file) = oid.split();
        self.objects_dir.join(dir).join(file)
    }

    fn contains(&self, oid: Oid) -> bool {
        self.obj_path(oid).exists()
    }

    fn read_stream(&self, oid: Oid) -> GitResult<impl BufRead> {
        let path = self.obj_path(oid);
        let file = std::fs::File::open(&path)
            .map_err(|_| anyhow!(GitError::ObjectNotFound(oid.into())))?;
        Ok(BufReader::new(ZlibDecoder::new(BufReader::new(file))))
    }

    fn read_raw(&self, oid: Oid) -> GitResult<RawObject> {
        let mut stream = self.read_stream(oid)?;
        let header = obj::read_obj_header(&mut stream)?;
        let bytes = stream.read_to_vec()?;
        ensure_eq!(
            bytes.len() as u64,
            header.size,
            "loose object `{}` declares {} bytes but contains {}",
            oid,
            header.size,
            bytes.len()
        );
        Ok(RawObject::new(header.obj_type, bytes))
    }

    fn read_header(&self, oid: Oid) -> GitResult<ObjHeader> {
        obj::read_obj_header(&mut self.read_stream(oid)?)
    }

    fn stream(&self, oid: Oid) -> GitResult<Box<dyn Read + Send>> {
        let mut stream = self.read_stream(oid)?;
        // skip past the header; the caller receives content bytes only
        obj::read_obj_header(&mut stream)?;
        Ok(Box::new(stream))
    }

    fn write(&self, oid: Oid, raw: &RawObject) -> GitResult<()> {
        let compressed = deflate(&raw.wrapped())?;
        fs::atomic_write(&self.obj_path(oid), &compressed, true)
    }

    fn prefix_candidates(&self, prefix: &PartialOid) -> GitResult<Vec<Oid>> {
        let (dir, file_prefix) = prefix.split();
        let full_dir = self.objects_dir.join(dir);
        if !full_dir.exists() {
            return Ok(vec![]);
        }
        let mut candidates = vec![];
        for entry in std::fs::read_dir(&full_dir)? {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            let filename = entry.file_name();
            let filename = match filename.to_str() {
                Some(name) => name,
                None => continue,
            };
            if filename.starts_with(file_prefix) {
                if let Ok(oid) = Oid::from_str(&format!("{}{}", dir, filename)) {
                    candidates.push(oid);
                }
            }
        }
        Ok(candidates)
    }
}

struct PackedBackend {
    pack_dir: PathBuf,
    algo: HashAlgo,
    packs: RwLock<Vec<Arc<Pack>>>,
}

impl PackedBackend {
    fn new(pack_dir: PathBuf, algo: HashAlgo) -> GitResult<Self> {
        let backend = Self { pack_dir, algo, packs: Default::default() };
        backend.refresh()?;
        Ok(backend)
    }

    fn refresh(&self) -> GitResult<()> {
        if !self.pack_dir.exists() {
            return Ok(());
        }
        let mut packs = vec![];
        for entry in std::fs::read_dir(&self.pack_dir)? {
            let pack_path = entry?.path();
            if pack_path.extension() != Some(PACK_EXT.as_ref()) {
                continue;
            }
            let idx_path = pack_path.with_extension(PACK_IDX_EXT);
            ensure!(
                idx_path.exists(),
                "packfile `{}` is missing its index file",
                pack_path.display()
            );
            packs.push(Arc::new(Pack::open(&pack_path, &idx_path, self.algo)?));
        }
        *self.packs.write() = packs;
        Ok(())
    }

    fn find_pack(&self, oid: Oid) -> Option<Arc<Pack>> {
        self.packs.read().iter().find(|pack| pack.contains(oid)).cloned()
    }

    fn contains(&self, oid: Oid) -> bool {
        self.find_pack(oid).is_some()
    }

    fn read_raw(&self, oid: Oid) -> GitResult<RawObject> {
        match self.find_pack(oid) {
            Some(pack) => pack.read_raw(oid),
            None => Err(anyhow!(GitError::ObjectNotFound(oid.into()))),
        }
    }

    fn read_header(&self, oid: Oid) -> GitResult<ObjHeader> {
        match self.find_pack(oid) {
            Some(pack) => pack.read_header(oid),
            None => Err(anyhow!(GitError::ObjectNotFound(oid.into()))),
        }
    }

    fn prefix_candidates(&self, prefix: &PartialOid) -> Vec<Oid> {
        self.packs
            .read()
            .iter()
            .flat_map(|pack| pack.prefix_matches(prefix.hex()))
            .collect()
    }
}

/// Private chunked representation for very large blobs (an optimization of
/// this store, not part of git's on-disk format): a manifest under
/// `objects/chunked/<xx>/<rest>` listing zlib'd chunk files. Fully
/// transparent: the oid is the oid of the flat object.
struct ChunkedBackend {
    dir: PathBuf,
    algo: HashAlgo,
}

impl ChunkedBackend {
    fn manifest_path(&self, oid: Oid) -> PathBuf {
        let (dir, file) = oid.split();
        self.dir.join(dir).join(file)
    }

    fn chunk_path(&self, oid: Oid, i: usize) -> PathBuf {
        let (dir, file) = oid.split();
        self.dir.join(dir).join(format!("{}.{}", file, i))
    }

    fn contains(&self, oid: Oid) -> bool {
        self.manifest_path(oid).exists()
    }

    fn read_manifest(&self, oid: Oid) -> GitResult<(u64, usize)> {
        let text = fs::read_optional_string(&self.manifest_path(oid))?
            .ok_or_else(|| anyhow!(GitError::ObjectNotFound(oid.into())))?;
        let mut lines = text.lines();
        let header = lines.next().ok_or_else(|| GitError::corrupt("chunk manifest"))?;
        let (size, chunks) =
            header.split_once(' ').ok_or_else(|| GitError::corrupt("chunk manifest"))?;
        Ok((size.parse()?, chunks.parse()?))
    }

    fn read_raw(&self, oid: Oid) -> GitResult<RawObject> {
        let mut bytes = vec![];
        self.stream(oid)?.read_to_end(&mut bytes)?;
        Ok(RawObject::new(ObjType::Blob, bytes))
    }

    fn read_header(&self, oid: Oid) -> GitResult<ObjHeader> {
        let (size, _) = self.read_manifest(oid)?;
        Ok(ObjHeader { obj_type: ObjType::Blob, size })
    }

    fn stream(&self, oid: Oid) -> GitResult<Box<dyn Read + Send>> {
        let (size, chunks) = self.read_manifest(oid)?;
        let mut readers: Vec<Box<dyn Read + Send>> = vec![];
        for i in 0..chunks {
            let file = std::fs::File::open(self.chunk_path(oid, i))?;
            readers.push(Box::new(ZlibDecoder::new(BufReader::new(file))));
        }
        Ok(Box::new(ChainedReader { readers: readers.into(), remaining: size }))
    }

    fn write(&self, oid: Oid, raw: &RawObject) -> GitResult<()> {
        let chunks = raw.bytes.chunks(CHUNK_SIZE);
        let count = chunks.len();
        for (i, chunk) in chunks.enumerate() {
            fs::atomic_write(&self.chunk_path(oid, i), &deflate(chunk)?, true)?;
        }
        // manifest last, so a half-written object is simply invisible
        let manifest = format!("{} {}\n", raw.bytes.len(), count);
        fs::atomic_write(&self.manifest_path(oid), manifest.as_bytes(), true)
    }

    fn prefix_candidates(&self, prefix: &PartialOid) -> GitResult<Vec<Oid>> {
        let (dir, file_prefix) = prefix.split();
        let full_dir = self.dir.join(dir);
        if !full_dir.exists() {
            return Ok(vec![]);
        }
        let mut candidates = vec![];
        for entry in std::fs::read_dir(&full_dir)? {
            let entry = entry?;
            let filename = entry.file_name();
            let filename = match filename.to_str() {
                Some(name) => name,
                None => continue,
            };
            // chunk files carry a `.N` suffix; only manifests are object names
            if filename.contains('.') || !filename.starts_with(file_prefix) {
                continue;
            }
            if let Ok(oid) = Oid::from_str(&format!("{}{}", dir, filename)) {
                candidates.push(oid);
            }
        }
        Ok(candidates)
    }
}

/// Sequential concatenation of chunk streams, bounded by the manifest size.
struct ChainedReader {
    readers: std::collections::VecDeque<Box<dyn Read + Send>>,
    remaining: u64,
}

impl Read for ChainedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let reader = match self.readers.front_mut() {
                Some(reader) => reader,
                None => return Ok(0),
            };
            match reader.read(buf)? {
                0 => {
                    self.readers.pop_front();
                }
                n => {
                    self.remaining = self.remaining.saturating_sub(n as u64);
                    return Ok(n);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_odb(threshold: Option<u64>) -> GitResult<(tempfile::TempDir, Odb)> {
        let dir = tempfile::tempdir()?;
        let odb = Odb::new(dir.path().join("objects"), HashAlgo::Sha1, threshold)?;
        Ok((dir, odb))
    }

    #[test]
    fn write_then_read_loose_object() -> GitResult<()> {
        let (_dir, odb) = test_odb(None)?;
        let oid = odb.write_raw(ObjType::Blob, b"Hello world!")?;
        assert_eq!(oid.to_hex(), "c57eff55ebc0c54973903af5f72bac72762cf4f4");
        let raw = odb.read_raw(oid)?;
        assert_eq!(raw.obj_type, ObjType::Blob);
        assert_eq!(raw.bytes, b"Hello world!");
        assert_eq!(odb.read_header(oid)?, ObjHeader { obj_type: ObjType::Blob, size: 12 });
        Ok(())
    }

    #[test]
    fn write_is_idempotent() -> GitResult<()> {
        let (_dir, odb) = test_odb(None)?;
        let a = odb.write_raw(ObjType::Blob, b"same")?;
        let b = odb.write_raw(ObjType::Blob, b"same")?;
        assert_eq!(a, b);
        assert_eq!(odb.read_raw(a)?.bytes, b"same");
        Ok(())
    }

    #[test]
    fn missing_object_is_not_found() -> GitResult<()> {
        let (_dir, odb) = test_odb(None)?;
        let missing = HashAlgo::Sha1.hash_bytes(b"never written");
        assert!(odb.read_raw(missing).is_not_found_err());
        assert!(!odb.contains(missing)?);
        Ok(())
    }

    #[test]
    fn chunked_blob_is_transparent() -> GitResult<()> {
        // force chunking with a tiny threshold and chunk reads across files
        let (_dir, odb) = test_odb(Some(64))?;
        let bytes: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let oid = odb.write_raw(ObjType::Blob, &bytes)?;
        // the chunked oid equals the flat object's oid
        let flat = RawObject::new(ObjType::Blob, bytes.clone());
        assert_eq!(oid, flat.oid(HashAlgo::Sha1));

        assert_eq!(odb.read_raw(oid)?.bytes, bytes);
        assert_eq!(odb.read_header(oid)?.size, bytes.len() as u64);
        let mut streamed = vec![];
        odb.stream(oid)?.read_to_end(&mut streamed)?;
        assert_eq!(streamed, bytes);
        Ok(())
    }

    #[test]
    fn prefix_expansion() -> GitResult<()> {
        let (_dir, odb) = test_odb(None)?;
        let oid = odb.write_raw(ObjType::Blob, b"prefixed")?;
        let prefix = PartialOid::new(&oid.to_hex()[..8])?;
        assert_eq!(odb.expand_prefix(&prefix)?, oid);
        Ok(())
    }

    #[test]
    fn small_blobs_stay_loose_even_with_chunking_enabled() -> GitResult<()> {
        let (_dir, odb) = test_odb(Some(1024))?;
        let oid = odb.write_raw(ObjType::Blob, b"small")?;
        assert_eq!(odb.read_raw(oid)?.bytes, b"small");
        Ok(())
    }
}
