use super::{ObjType, WritableObject};
use crate::error::{GitError, GitResult};
use crate::hash::Oid;
use crate::serialize::Serialize;
use crate::signature::Signature;
use smallvec::SmallVec;
use std::fmt::{self, Display, Formatter};
use std::io::Write;

/// Parent list; two inline covers everything but octopus merges.
pub type Parents = SmallVec<[Oid; 2]>;

/// Parsed commit. Parents preserve declaration order: the first parent is
/// the mainline. Recognized headers are pulled into fields; anything else
/// (`mergetag`, ...) is carried in `extra_headers` in order so canonical
/// commits reserialize byte-identically.
#[derive(PartialEq, Clone, Debug)]
pub struct Commit {
    pub tree: Oid,
    pub parents: Parents,
    pub author: Signature,
    pub committer: Signature,
    pub encoding: Option<String>,
    pub extra_headers: Vec<(String, String)>,
    pub gpgsig: Option<String>,
    pub message: String,
}

impl Commit {
    pub fn new(
        tree: Oid,
        parents: Parents,
        author: Signature,
        committer: Signature,
        message: String,
    ) -> Self {
        Self {
            tree,
            parents,
            author,
            committer,
            encoding: None,
            extra_headers: vec![],
            gpgsig: None,
            message,
        }
    }

    pub fn tree(&self) -> Oid {
        self.tree
    }

    /// The mainline parent, if any.
    pub fn first_parent(&self) -> Option<Oid> {
        self.parents.first().copied()
    }

    /// First line of the message.
    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }

    pub fn parse(bytes: &[u8]) -> GitResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| GitError::corrupt("non-utf8 commit object"))?;
        let (headers, message) = parse_headers(text)?;

        let mut tree = None;
        let mut parents = Parents::new();
        let mut author = None;
        let mut committer = None;
        let mut encoding = None;
        let mut gpgsig = None;
        let mut extra_headers = vec![];

        for (key, value) in headers {
            match key.as_str() {
                "tree" => tree = Some(value.parse()?),
                "parent" => parents.push(value.parse()?),
                "author" => author = Some(value.parse()?),
                "committer" => committer = Some(value.parse()?),
                "encoding" => encoding = Some(value),
                "gpgsig" => gpgsig = Some(value),
                _ => extra_headers.push((key, value)),
            }
        }

        Ok(Self {
            tree: tree.ok_or_else(|| GitError::corrupt("commit missing `tree` header"))?,
            parents,
            author: author.ok_or_else(|| GitError::corrupt("commit missing `author` header"))?,
            committer: committer
                .ok_or_else(|| GitError::corrupt("commit missing `committer` header"))?,
            encoding,
            extra_headers,
            gpgsig,
            message: message.to_owned(),
        })
    }
}

/// Splits an object body into `(headers, message)`. Continuation lines
/// (prefixed by a single space) fold into the previous header value with the
/// space stripped; the first blank line terminates the header section.
pub(super) fn parse_headers(text: &str) -> GitResult<(Vec<(String, String)>, &str)> {
    let mut headers: Vec<(String, String)> = vec![];
    let mut rest = text;
    loop {
        let (line, tail) = match rest.split_once('\n') {
            Some(split) => split,
            None => bail!(GitError::corrupt("missing blank line after object headers")),
        };
        rest = tail;
        if line.is_empty() {
            return Ok((headers, rest));
        }
        if let Some(continuation) = line.strip_prefix(' ') {
            let (_, value) = headers
                .last_mut()
                .ok_or_else(|| GitError::corrupt("continuation line with no header"))?;
            value.push('\n');
            value.push_str(continuation);
        } else {
            let (key, value) = line
                .split_once(' ')
                .ok_or_else(|| GitError::corrupt(format!("malformed header line `{}`", line)))?;
            headers.push((key.to_owned(), value.to_owned()));
        }
    }
}

/// Writes `key value\n`, prefixing each embedded newline of the value with a
/// single continuation space.
pub(super) fn write_header(
    writer: &mut dyn Write,
    key: &str,
    value: impl Display,
) -> GitResult<()> {
    writeln!(writer, "{} {}", key, value.to_string().replace('\n', "\n "))?;
    Ok(())
}

impl Serialize for Commit {
    fn serialize(&self, writer: &mut dyn Write) -> GitResult<()> {
        write_header(writer, "tree", self.tree)?;
        for parent in &self.parents {
            write_header(writer, "parent", parent)?;
        }
        write_header(writer, "author", &self.author)?;
        write_header(writer, "committer", &self.committer)?;
        if let Some(encoding) = &self.encoding {
            write_header(writer, "encoding", encoding)?;
        }
        for (key, value) in &self.extra_headers {
            write_header(writer, key, value)?;
        }
        if let Some(gpgsig) = &self.gpgsig {
            write_header(writer, "gpgsig", gpgsig)?;
        }
        writeln!(writer)?;
        write!(writer, "{}", self.message)?;
        Ok(())
    }
}

impl WritableObject for Commit {
    fn obj_ty(&self) -> ObjType {
        ObjType::Commit
    }
}

impl Display for Commit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut buf = vec![];
        self.serialize(&mut buf).map_err(|_| fmt::Error)?;
        write!(f, "{}", String::from_utf8_lossy(&buf))
    }
}
