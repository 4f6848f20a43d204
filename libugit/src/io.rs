use crate::error::{GitError, GitResult};
use crate::hash::{HashAlgo, Hasher, Oid};
use crate::time::Timespec;
use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress};
use std::fs::File;
use std::io::{self, prelude::*, BufReader};
use std::str::FromStr;

pub type BufferedFileStream = BufReader<File>;

// all integer reads are big-endian; that is the only byte order git uses
pub(crate) trait ReadExt: Read {
    #[inline]
    fn read_u8(&mut self) -> io::Result<u8> {
        let mut i = 0u8;
        self.read_exact(std::slice::from_mut(&mut i))?;
        Ok(i)
    }

    /// The offset encoding used by ofs-delta entries. Unlike the size
    /// encoding this adds one at each continuation step, so consecutive
    /// lengths do not overlap in representation.
    fn read_offset(&mut self) -> io::Result<u64> {
        let mut byte = self.read_u8()? as u64;
        let mut offset = byte & 0x7f;
        while byte & 0x80 != 0 {
            offset += 1;
            byte = self.read_u8()? as u64;
            offset = (offset << 7) | (byte & 0x7f);
        }
        Ok(offset)
    }

    #[inline]
    /// little-endian base-128 varint ("size encoding" in the pack format)
    fn read_size(&mut self) -> io::Result<u64> {
        self.read_le_varint_with_shift(0).map(|x| x.1)
    }

    /// Reads a varint whose first byte also packs `init_shift` bits of
    /// another value in its high (non-MSB) bits; pack entry headers store the
    /// 3-bit object type this way. Returns `(packed_bits, value)`.
    fn read_le_varint_with_shift(&mut self, init_shift: u64) -> io::Result<(u8, u64)> {
        debug_assert!(init_shift < 8);
        let mut n = 0;
        let byte = self.read_u8()?;
        let anti_shift = 7 - init_shift;
        let k_mask = ((1u16 << init_shift) - 1) << anti_shift;
        let k = (byte & k_mask as u8) >> anti_shift;

        let mask = (1 << anti_shift) - 1;
        n |= (byte & mask) as u64;

        if byte & 0x80 != 0 {
            let mut shift = 7 - init_shift;
            loop {
                let byte = self.read_u8()? as u64;
                n |= (byte & 0x7f) << shift;
                shift += 7;
                if byte & 0x80 == 0 {
                    break;
                }
            }
        }

        Ok((k, n))
    }

    /// The packed little-endian format used by delta copy instructions: the
    /// header byte's low bits select which of the following bytes are
    /// present, absent bytes are zero.
    fn read_le_packed(&mut self, header: u8) -> io::Result<u64> {
        debug_assert!(header & 1 << 7 != 0);
        let mut value = 0;
        for i in 0..7 {
            if header & 1 << i == 0 {
                continue;
            }
            let byte = self.read_u8()? as u64;
            value |= byte << (i * 8)
        }
        Ok(value)
    }

    #[inline]
    fn read_u16(&mut self) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    #[inline]
    fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    #[inline]
    fn read_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    #[inline]
    fn read_timespec(&mut self) -> io::Result<Timespec> {
        let sec = self.read_u32()?;
        let nano = self.read_u32()?;
        Ok(Timespec::new(sec, nano))
    }

    #[inline]
    fn read_oid(&mut self, algo: HashAlgo) -> io::Result<Oid> {
        let mut buf = [0u8; 32];
        self.read_exact(&mut buf[..algo.oid_size()])?;
        Ok(Oid::from_bytes(&buf[..algo.oid_size()]).unwrap())
    }

    #[inline]
    fn read_to_vec(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![];
        self.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl<R: Read + ?Sized> ReadExt for R {
}

pub(crate) trait BufReadExt: BufRead {
    /// reads the bytes up to `sep`, parsing them as a base-10 ascii number
    fn read_ascii_num(&mut self, sep: u8) -> GitResult<i64> {
        let mut buf = vec![];
        let i = self.read_until(sep, &mut buf)?;
        ensure!(i > 1, "missing ascii number field");
        let s = std::str::from_utf8(&buf[..i - 1])?;
        Ok(s.parse()?)
    }

    /// reads the bytes up to `sep`, parsing them via `FromStr`
    fn read_ascii_str<T: FromStr>(&mut self, sep: u8) -> GitResult<T>
    where
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        let mut buf = vec![];
        let i = self.read_until(sep, &mut buf)?;
        ensure!(i > 1, "missing ascii field");
        Ok(std::str::from_utf8(&buf[..i - 1])?.parse()?)
    }

    fn read_null_terminated_str(&mut self) -> GitResult<String> {
        let mut buf = vec![];
        let i = self.read_until(0, &mut buf)?;
        ensure!(i > 0, "unexpected eof reading null-terminated string");
        Ok(String::from_utf8(buf[..i - 1].to_vec())?)
    }

    fn is_at_eof(&mut self) -> io::Result<bool> {
        Ok(self.fill_buf()?.is_empty())
    }
}

impl<R: BufRead + ?Sized> BufReadExt for R {
}

pub(crate) trait WriteExt: Write {
    fn write_u8(&mut self, u: u8) -> io::Result<()> {
        self.write_all(std::slice::from_ref(&u))
    }

    fn write_u16(&mut self, u: u16) -> io::Result<()> {
        self.write_all(&u.to_be_bytes())
    }

    fn write_u32(&mut self, u: u32) -> io::Result<()> {
        self.write_all(&u.to_be_bytes())
    }

    fn write_u64(&mut self, u: u64) -> io::Result<()> {
        self.write_all(&u.to_be_bytes())
    }

    fn write_timespec(&mut self, t: Timespec) -> io::Result<()> {
        self.write_u32(t.sec)?;
        self.write_u32(t.nano)
    }

    fn write_oid(&mut self, oid: Oid) -> io::Result<()> {
        self.write_all(oid.as_bytes())
    }

    /// The inverse of [`ReadExt::read_le_varint_with_shift`]: a pack entry
    /// header packing `k` (the 3-bit type) above the low `size` bits.
    fn write_pack_obj_header(&mut self, k: u8, mut size: u64) -> io::Result<()> {
        let mut byte = (k << 4) | (size & 0x0f) as u8;
        size >>= 4;
        while size != 0 {
            self.write_u8(byte | 0x80)?;
            byte = (size & 0x7f) as u8;
            size >>= 7;
        }
        self.write_u8(byte)
    }

    /// The inverse of [`ReadExt::read_offset`].
    fn write_offset(&mut self, mut offset: u64) -> io::Result<()> {
        let mut bytes = vec![(offset & 0x7f) as u8];
        offset >>= 7;
        while offset != 0 {
            offset -= 1;
            bytes.push(0x80 | (offset & 0x7f) as u8);
            offset >>= 7;
        }
        bytes.reverse();
        self.write_all(&bytes)
    }
}

impl<W: Write + ?Sized> WriteExt for W {
}

/// Hashes all bytes read through the reader.
pub(crate) struct HashReader<R> {
    reader: R,
    hasher: Hasher,
}

impl<R: BufRead> BufRead for HashReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        // note: consume bypasses `read` so callers relying on the digest must
        // not mix `fill_buf`/`consume` with it; the codebase only uses `read`
        self.reader.consume(amt)
    }
}

impl<R: Read> Read for HashReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

impl<R: Read> HashReader<R> {
    pub fn new(algo: HashAlgo, reader: R) -> Self {
        Self { reader, hasher: algo.hasher() }
    }

    pub fn finalize(&mut self) -> Oid {
        self.hasher.finalize_reset()
    }
}

/// Hashes all bytes written through the writer.
pub(crate) struct HashWriter<W> {
    writer: W,
    hasher: Hasher,
}

impl<W: Write> Write for HashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl<W: Write> HashWriter<W> {
    pub fn new(algo: HashAlgo, writer: W) -> Self {
        Self { writer, hasher: algo.hasher() }
    }

    pub fn current_hash(&mut self) -> Oid {
        // clone-free finalize would consume the hasher; reset-and-replay is
        // not an option mid-stream, so finalize a copy
        match &self.hasher {
            Hasher::Sha1(h) => {
                let mut h = h.clone();
                Oid::from_bytes(sha1::Digest::finalize_reset(&mut h).as_slice()).unwrap()
            }
            Hasher::Sha256(h) => {
                let mut h = h.clone();
                Oid::from_bytes(sha2::Digest::finalize_reset(&mut h).as_slice()).unwrap()
            }
        }
    }

    /// Appends the digest of everything written so far and returns it.
    pub fn write_trailing_hash(&mut self) -> io::Result<Oid> {
        let hash = self.current_hash();
        self.writer.write_oid(hash)?;
        Ok(hash)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

pub fn deflate(bytes: &[u8]) -> GitResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(vec![], Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

pub fn inflate(bytes: &[u8]) -> GitResult<Vec<u8>> {
    let mut decoder = flate2::bufread::ZlibDecoder::new(bytes);
    let mut out = vec![];
    decoder
        .read_to_end(&mut out)
        .map_err(|_| GitError::corrupt_at("zlib stream", decoder.total_in()))?;
    Ok(out)
}

/// Inflates exactly one zlib stream from `reader`, consuming only the bytes
/// belonging to it, and returns the inflated bytes along with the number of
/// compressed bytes consumed. This is the primitive the pack reader and
/// indexer are built on; pack entries are back-to-back zlib streams with no
/// length prefix.
pub(crate) fn inflate_exact(
    reader: &mut impl BufRead,
    size_hint: u64,
) -> GitResult<(Vec<u8>, u64)> {
    let mut decompressor = Decompress::new(true);
    let mut output = Vec::with_capacity(size_hint as usize);
    loop {
        let input = reader.fill_buf()?;
        let at_eof = input.is_empty();
        let in_so_far = decompressor.total_in();
        let flush = if at_eof { FlushDecompress::Finish } else { FlushDecompress::None };
        let status = decompressor
            .decompress_vec(input, &mut output, flush)
            .map_err(|_| GitError::corrupt_at("zlib stream", decompressor.total_in()))?;
        let consumed = decompressor.total_in() - in_so_far;
        reader.consume(consumed as usize);
        match status {
            flate2::Status::Ok | flate2::Status::BufError => {
                if at_eof {
                    return Err(GitError::corrupt_at(
                        "truncated zlib stream",
                        decompressor.total_in(),
                    ));
                }
            }
            flate2::Status::StreamEnd => break,
        }
    }
    Ok((output, decompressor.total_in()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn deflate_then_inflate_roundtrip() -> GitResult<()> {
        let bytes = b"some bytes that deserve compressing compressing compressing";
        assert_eq!(inflate(&deflate(bytes)?)?, bytes);
        Ok(())
    }

    #[test]
    fn inflate_rejects_garbage() {
        let err = inflate(b"certainly not zlib").unwrap_err();
        assert!(err.to_string().contains("corrupt"));
    }

    #[test]
    fn offset_encoding_roundtrip() -> GitResult<()> {
        for &offset in &[0u64, 1, 127, 128, 129, 16383, 16384, 1 << 20, (1 << 32) + 7] {
            let mut buf = vec![];
            buf.write_offset(offset)?;
            assert_eq!(Cursor::new(&buf).read_offset()?, offset, "offset {}", offset);
        }
        Ok(())
    }

    #[test]
    fn pack_obj_header_roundtrip() -> GitResult<()> {
        for &(ty, size) in &[(1u8, 0u64), (3, 15), (3, 16), (7, 123456789), (6, u32::MAX as u64)] {
            let mut buf = vec![];
            buf.write_pack_obj_header(ty, size)?;
            let (k, n) = Cursor::new(&buf).read_le_varint_with_shift(3)?;
            assert_eq!((k, n), (ty, size));
        }
        Ok(())
    }

    #[test]
    fn inflate_exact_consumes_only_its_stream() -> GitResult<()> {
        let mut stream = deflate(b"first")?;
        let compressed_len = stream.len() as u64;
        stream.extend_from_slice(b"trailing");
        let mut reader = Cursor::new(stream);
        let (bytes, consumed) = inflate_exact(&mut reader, 5)?;
        assert_eq!(bytes, b"first");
        assert_eq!(consumed, compressed_len);
        assert_eq!(reader.read_to_vec()?, b"trailing");
        Ok(())
    }
}
