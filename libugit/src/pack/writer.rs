use super::{PackObjType, PACK_SIGNATURE, PACK_VERSION};
use crate::error::GitResult;
use crate::hash::{HashAlgo, Oid};
use crate::io::{deflate, HashWriter, WriteExt};
use crate::obj::RawObject;
use std::io::Write;

/// Emits a pack stream. Entries are written undeltified; receivers that
/// want deltas repack on their own schedule, and every consumer accepts a
/// deltaless pack.
pub struct PackWriter<W> {
    writer: HashWriter<W>,
    expected: u32,
    written: u32,
}

impl<W: Write> PackWriter<W> {
    pub fn new(algo: HashAlgo, writer: W, object_count: u32) -> GitResult<Self> {
        let mut writer = HashWriter::new(algo, writer);
        writer.write_all(PACK_SIGNATURE)?;
        writer.write_u32(PACK_VERSION)?;
        writer.write_u32(object_count)?;
        Ok(Self { writer, expected: object_count, written: 0 })
    }

    pub fn write_object(&mut self, obj: &RawObject) -> GitResult<()> {
        assert!(self.written < self.expected, "wrote more objects than declared");
        self.writer
            .write_pack_obj_header(PackObjType::from(obj.obj_type) as u8, obj.bytes.len() as u64)?;
        self.writer.write_all(&deflate(&obj.bytes)?)?;
        self.written += 1;
        Ok(())
    }

    /// Appends the trailer and returns `(pack_hash, inner_writer)`.
    pub fn finish(mut self) -> GitResult<(Oid, W)> {
        ensure_eq!(self.written, self.expected, "declared {} objects, wrote {}", self.expected, self.written);
        let hash = self.writer.write_trailing_hash()?;
        let mut inner = self.writer.into_inner();
        inner.flush()?;
        Ok((hash, inner))
    }
}

/// Convenience for building an in-memory pack out of raw objects.
pub fn write_pack_to_vec(algo: HashAlgo, objects: &[RawObject]) -> GitResult<(Oid, Vec<u8>)> {
    let mut writer = PackWriter::new(algo, vec![], objects.len() as u32)?;
    for obj in objects {
        writer.write_object(obj)?;
    }
    let (hash, buf) = writer.finish()?;
    Ok((hash, buf))
}
