mod packed;
mod refdb;
mod reflog;

pub use packed::*;
pub use refdb::*;
pub use reflog::*;

use crate::error::{GitGenericError, GitResult};
use crate::hash::Oid;
use lazy_static::lazy_static;
use regex::Regex;
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

lazy_static! {
    /// what makes a reference name invalid (anything else is fine):
    /// - a path component beginning with `.`
    /// - `..` anywhere
    /// - any of `*` `:` `?` `[` `\` `^` `~` space tab
    /// - ending with `/` or `.lock`
    /// - `@{`
    static ref INVALID_REF_REGEX: Regex =
        Regex::new(r#"^\.|/\.|\.\.|\*|:|\?|\[|\\|\^|~| |\t|/$|\.lock$|@\{"#).unwrap();
}

pub fn is_valid_name(s: &str) -> bool {
    !s.is_empty() && !INVALID_REF_REGEX.is_match(s)
}

/// A reference value: either an object directly or the path of another
/// reference (`ref: refs/heads/main`).
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum GitRef {
    Direct(Oid),
    Symbolic(SymbolicRef),
}

impl From<Oid> for GitRef {
    fn from(oid: Oid) -> Self {
        Self::Direct(oid)
    }
}

impl From<SymbolicRef> for GitRef {
    fn from(sym: SymbolicRef) -> Self {
        Self::Symbolic(sym)
    }
}

impl Display for GitRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            GitRef::Direct(oid) => write!(f, "{}", oid),
            GitRef::Symbolic(sym) => write!(f, "{}", sym),
        }
    }
}

// the on-disk form of a symbolic ref
const SYMBOLIC_REF_PREFIX: &str = "ref: ";

impl GitRef {
    pub fn head() -> Self {
        Self::Symbolic(SymbolicRef::head())
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct(..))
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Self::Symbolic(..))
    }

    pub fn into_direct(self) -> GitResult<Oid> {
        match self {
            Self::Direct(oid) => Ok(oid),
            Self::Symbolic(sym) => bail!("expected a direct reference, found `{}`", sym),
        }
    }

    /// The file representation, trailing newline included.
    pub fn file_contents(&self) -> String {
        match self {
            GitRef::Direct(oid) => format!("{}\n", oid),
            GitRef::Symbolic(sym) => format!("{}{}\n", SYMBOLIC_REF_PREFIX, sym.path()),
        }
    }
}

impl FromStr for GitRef {
    type Err = GitGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_end();
        if let Ok(oid) = Oid::from_str(s) {
            return Ok(Self::Direct(oid));
        }
        SymbolicRef::from_str(s).map(Self::Symbolic)
    }
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SymbolicRef {
    path: String,
    kind: SymbolicRefKind,
}

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub enum SymbolicRefKind {
    Head,
    Branch,
    Remote,
    Tag,
    Unknown,
}

impl Ord for SymbolicRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind.cmp(&other.kind).then_with(|| self.path.cmp(&other.path))
    }
}

impl PartialOrd for SymbolicRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub const REFS_HEADS_PREFIX: &str = "refs/heads/";
pub const REFS_TAGS_PREFIX: &str = "refs/tags/";
pub const REFS_REMOTES_PREFIX: &str = "refs/remotes/";

impl SymbolicRef {
    pub fn head() -> Self {
        Self::new("HEAD")
    }

    pub fn new(path: impl Into<String>) -> Self {
        let mut path = path.into();
        // `@` is an alias for HEAD
        if path == "@" {
            path = "HEAD".to_owned();
        }
        let kind = Self::calculate_kind(&path);
        Self { path, kind }
    }

    /// Construction that refuses names outside the recognized namespaces.
    pub fn new_valid(path: impl Into<String>) -> GitResult<Self> {
        let sym = Self::new(path);
        ensure!(
            sym.kind != SymbolicRefKind::Unknown && is_valid_name(&sym.path),
            crate::error::GitError::InvalidRef(sym.path.clone())
        );
        Ok(sym)
    }

    pub fn new_branch(name: &str) -> GitResult<Self> {
        Self::new_valid(format!("{}{}", REFS_HEADS_PREFIX, name))
    }

    pub fn new_tag(name: &str) -> GitResult<Self> {
        Self::new_valid(format!("{}{}", REFS_TAGS_PREFIX, name))
    }

    pub fn new_remote(remote: &str, branch: &str) -> GitResult<Self> {
        Self::new_valid(format!("{}{}/{}", REFS_REMOTES_PREFIX, remote, branch))
    }

    fn calculate_kind(path: &str) -> SymbolicRefKind {
        if path == "HEAD" {
            SymbolicRefKind::Head
        } else if path.starts_with(REFS_HEADS_PREFIX) {
            SymbolicRefKind::Branch
        } else if path.starts_with(REFS_REMOTES_PREFIX) {
            SymbolicRefKind::Remote
        } else if path.starts_with(REFS_TAGS_PREFIX) {
            SymbolicRefKind::Tag
        } else {
            SymbolicRefKind::Unknown
        }
    }

    pub fn kind(&self) -> SymbolicRefKind {
        self.kind
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_head(&self) -> bool {
        self.kind == SymbolicRefKind::Head
    }

    /// Abbreviated form for display (`refs/heads/main` -> `main`).
    pub fn short(&self) -> &str {
        for prefix in [REFS_HEADS_PREFIX, REFS_TAGS_PREFIX, REFS_REMOTES_PREFIX] {
            if let Some(short) = self.path.strip_prefix(prefix) {
                return short;
            }
        }
        &self.path
    }
}

impl Display for SymbolicRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if f.alternate() { write!(f, "{}", self.short()) } else { write!(f, "{}", self.path) }
    }
}

impl FromStr for SymbolicRef {
    type Err = GitGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix(SYMBOLIC_REF_PREFIX).unwrap_or(s).trim_end();
        Ok(Self::new(s))
    }
}

#[cfg(test)]
mod tests;
