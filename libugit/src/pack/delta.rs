//! The delta payload format shared by ofs-delta and ref-delta entries:
//! `src_size_varint || dst_size_varint || ops*`, where each op either copies
//! a span out of the base or inserts literal bytes.

use crate::error::{GitError, GitResult};
use crate::io::ReadExt;
use std::io::{BufRead, Cursor, Read};

#[derive(PartialEq, Clone, Debug)]
pub struct Delta {
    pub source_size: u64,
    pub target_size: u64,
    ops: Vec<DeltaOp>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeltaOp {
    /// copy (offset, size) out of the base
    Copy(u64, u64),
    Insert(Vec<u8>),
}

impl Delta {
    pub fn parse(bytes: &[u8]) -> GitResult<Self> {
        let mut reader = Cursor::new(bytes);
        let source_size = reader.read_size()?;
        let target_size = reader.read_size()?;
        let mut ops = vec![];
        while (reader.position() as usize) < bytes.len() {
            ops.push(DeltaOp::read(&mut reader)?);
        }
        Ok(Self { source_size, target_size, ops })
    }

    pub fn expand(&self, base: &[u8]) -> GitResult<Vec<u8>> {
        trace!("Delta::expand (source_size: {} -> target_size: {})", self.source_size, self.target_size);
        ensure_eq!(
            self.source_size as usize,
            base.len(),
            "delta source size is `{}` but base is `{}` bytes",
            self.source_size,
            base.len()
        );

        let mut expanded = Vec::with_capacity(self.target_size as usize);
        for op in &self.ops {
            match op {
                &DeltaOp::Copy(offset, size) => {
                    let (offset, size) = (offset as usize, size as usize);
                    let end = offset
                        .checked_add(size)
                        .filter(|&end| end <= base.len())
                        .ok_or_else(|| GitError::corrupt("delta copy op out of bounds"))?;
                    expanded.extend_from_slice(&base[offset..end]);
                }
                DeltaOp::Insert(bytes) => expanded.extend_from_slice(bytes),
            }
        }

        ensure_eq!(
            self.target_size as usize,
            expanded.len(),
            "delta target size is `{}` but expansion produced `{}` bytes",
            self.target_size,
            expanded.len()
        );
        Ok(expanded)
    }
}

impl DeltaOp {
    fn read(reader: &mut impl BufRead) -> GitResult<Self> {
        // the MSB of the op byte distinguishes copy from insert
        let byte = reader.read_u8()?;
        if byte & 0x80 != 0 {
            let n = reader.read_le_packed(byte)?;
            let offset = n & 0xFFFF_FFFF;
            let mut size = (n >> 32) & 0xFF_FFFF;
            // a copy size of zero means 0x10000
            if size == 0 {
                size = 0x10000;
            }
            Ok(Self::Copy(offset, size))
        } else if byte != 0 {
            let mut bytes = vec![0; byte as usize];
            reader.read_exact(&mut bytes)?;
            Ok(Self::Insert(bytes))
        } else {
            // op byte zero is reserved
            Err(GitError::corrupt("delta op byte 0"))
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            &DeltaOp::Copy(offset, size) => {
                debug_assert!(size <= 0x10000 && size > 0);
                let size = if size == 0x10000 { 0 } else { size };
                let mut header = 0x80u8;
                let mut body = vec![];
                for i in 0..4 {
                    let byte = ((offset >> (i * 8)) & 0xff) as u8;
                    if byte != 0 {
                        header |= 1 << i;
                        body.push(byte);
                    }
                }
                for i in 0..3 {
                    let byte = ((size >> (i * 8)) & 0xff) as u8;
                    if byte != 0 {
                        header |= 1 << (4 + i);
                        body.push(byte);
                    }
                }
                out.push(header);
                out.extend_from_slice(&body);
            }
            DeltaOp::Insert(bytes) => {
                debug_assert!(!bytes.is_empty() && bytes.len() <= 0x7f);
                out.push(bytes.len() as u8);
                out.extend_from_slice(bytes);
            }
        }
    }
}

fn write_size(out: &mut Vec<u8>, mut n: u64) {
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Serializes a delta payload; the test suite and the pack tests use this to
/// manufacture deltified entries.
pub fn encode_delta(source_size: u64, target_size: u64, ops: &[DeltaOp]) -> Vec<u8> {
    let mut out = vec![];
    write_size(&mut out, source_size);
    write_size(&mut out, target_size);
    for op in ops {
        op.write(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_copy_and_insert_ops() -> GitResult<()> {
        let base = b"the quick brown fox";
        let payload = encode_delta(
            base.len() as u64,
            13,
            &[
                DeltaOp::Copy(4, 5),                    // "quick"
                DeltaOp::Insert(b" red ".to_vec()),
                DeltaOp::Copy(16, 3),                   // "fox"
            ],
        );
        let delta = Delta::parse(&payload)?;
        assert_eq!(delta.expand(base)?, b"quick red fox");
        Ok(())
    }

    #[test]
    fn copy_size_zero_means_64k() -> GitResult<()> {
        let base = vec![7u8; 0x10000];
        let payload = encode_delta(base.len() as u64, 0x10000, &[DeltaOp::Copy(0, 0x10000)]);
        let delta = Delta::parse(&payload)?;
        assert_eq!(delta.expand(&base)?.len(), 0x10000);
        Ok(())
    }

    #[test]
    fn mismatched_source_size_fails() -> GitResult<()> {
        let payload = encode_delta(5, 1, &[DeltaOp::Copy(0, 1)]);
        let delta = Delta::parse(&payload)?;
        assert!(delta.expand(b"too long for declared size").is_err());
        Ok(())
    }

    #[test]
    fn out_of_bounds_copy_fails() -> GitResult<()> {
        let payload = encode_delta(3, 10, &[DeltaOp::Copy(1, 10)]);
        let delta = Delta::parse(&payload)?;
        assert!(delta.expand(b"abc").is_err());
        Ok(())
    }
}
