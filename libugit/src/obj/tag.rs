use super::commit::{parse_headers, write_header};
use super::{ObjType, WritableObject};
use crate::error::{GitError, GitResult};
use crate::hash::Oid;
use crate::serialize::Serialize;
use crate::signature::Signature;
use std::fmt::{self, Display, Formatter};
use std::io::Write;

/// An annotated tag object.
#[derive(PartialEq, Clone, Debug)]
pub struct Tag {
    /// the tagged object
    pub object: Oid,
    pub obj_type: ObjType,
    pub name: String,
    pub tagger: Option<Signature>,
    pub gpgsig: Option<String>,
    pub message: String,
}

impl Tag {
    pub fn new(
        object: Oid,
        obj_type: ObjType,
        name: impl Into<String>,
        tagger: Signature,
        message: String,
    ) -> Self {
        Self { object, obj_type, name: name.into(), tagger: Some(tagger), gpgsig: None, message }
    }

    pub fn parse(bytes: &[u8]) -> GitResult<Self> {
        let text =
            std::str::from_utf8(bytes).map_err(|_| GitError::corrupt("non-utf8 tag object"))?;
        let (headers, message) = parse_headers(text)?;

        let mut object = None;
        let mut obj_type = None;
        let mut name = None;
        let mut tagger = None;
        let mut gpgsig = None;

        for (key, value) in headers {
            match key.as_str() {
                "object" => object = Some(value.parse()?),
                "type" => obj_type = Some(value.parse()?),
                "tag" => name = Some(value),
                "tagger" => tagger = Some(value.parse()?),
                "gpgsig" => gpgsig = Some(value),
                _ => return Err(GitError::corrupt(format!("unknown tag header `{}`", key))),
            }
        }

        Ok(Self {
            object: object.ok_or_else(|| GitError::corrupt("tag missing `object` header"))?,
            obj_type: obj_type.ok_or_else(|| GitError::corrupt("tag missing `type` header"))?,
            name: name.ok_or_else(|| GitError::corrupt("tag missing `tag` header"))?,
            tagger,
            gpgsig,
            message: message.to_owned(),
        })
    }
}

impl Serialize for Tag {
    fn serialize(&self, writer: &mut dyn Write) -> GitResult<()> {
        write_header(writer, "object", self.object)?;
        write_header(writer, "type", self.obj_type)?;
        write_header(writer, "tag", &self.name)?;
        if let Some(tagger) = &self.tagger {
            write_header(writer, "tagger", tagger)?;
        }
        if let Some(gpgsig) = &self.gpgsig {
            write_header(writer, "gpgsig", gpgsig)?;
        }
        writeln!(writer)?;
        write!(writer, "{}", self.message)?;
        Ok(())
    }
}

impl WritableObject for Tag {
    fn obj_ty(&self) -> ObjType {
        ObjType::Tag
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut buf = vec![];
        self.serialize(&mut buf).map_err(|_| fmt::Error)?;
        write!(f, "{}", String::from_utf8_lossy(&buf))
    }
}
