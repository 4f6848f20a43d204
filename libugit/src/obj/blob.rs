use super::{ObjType, WritableObject};
use crate::error::GitResult;
use crate::serialize::Serialize;
use std::fmt::{self, Debug, Display, Formatter};
use std::io::Write;

/// Uninterpreted bytes.
#[derive(PartialEq, Eq, Clone, Default)]
pub struct Blob {
    bytes: Vec<u8>,
}

impl Blob {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl Serialize for Blob {
    fn serialize(&self, writer: &mut dyn Write) -> GitResult<()> {
        writer.write_all(&self.bytes)?;
        Ok(())
    }
}

impl WritableObject for Blob {
    fn obj_ty(&self) -> ObjType {
        ObjType::Blob
    }
}

impl Debug for Blob {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.bytes.len())
    }
}

impl Display for Blob {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}
