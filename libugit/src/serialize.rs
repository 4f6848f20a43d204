use crate::error::GitResult;
use std::io::prelude::*;

/// On-disk/wire serialization. Parsing is deliberately inherent per type:
/// most formats need sizing or hash-algorithm context, so a uniform
/// deserialize trait buys nothing but `Sized` gymnastics.
pub trait Serialize {
    fn serialize(&self, writer: &mut dyn Write) -> GitResult<()>;

    fn serialize_to_vec(&self) -> GitResult<Vec<u8>> {
        let mut buf = vec![];
        self.serialize(&mut buf)?;
        Ok(buf)
    }
}

pub trait BufReadSeek: BufRead + Seek {}

impl<R: BufRead + Seek> BufReadSeek for R {
}
