use crate::hash::Oid;
use crate::merge::MergeConflicts;
use crate::obj::{Id, ObjType, PartialOid};
use crate::refs::SymbolicRef;
use std::fmt::{self, Display, Formatter};

pub type GitResult<T> = Result<T, GitGenericError>;
pub type GitGenericError = anyhow::Error;

/// Stable error kinds. Most call sites just use `anyhow`, but anything a
/// caller may want to match on (or a test wants to assert on) carries one of
/// these, recoverable via the downcasting extension traits below.
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq))]
pub enum GitError {
    #[error("object `{0}` not found")]
    ObjectNotFound(Id),
    /// object `{0}` is not in the pack index, but would be inserted at `{1}`
    #[error("object `{0}` not found in pack index")]
    ObjectNotFoundInPackIndex(Oid, u64),
    #[error("prefix oid `{0}` is ambiguous ({} candidates)", .1.len())]
    AmbiguousPrefix(PartialOid, Vec<Oid>),
    #[error("`{oid}` is a {found}, expected {expected}")]
    ObjectType { oid: Oid, expected: ObjType, found: ObjType },
    #[error("reference `{0}` not found")]
    RefNotFound(SymbolicRef),
    #[error("invalid reference `{0}`")]
    InvalidRef(String),
    #[error("reference `{name}` is stale (expected `{expected}`, found `{actual}`)")]
    RefStale { name: SymbolicRef, expected: String, actual: String },
    #[error("`{0}` already exists")]
    AlreadyExists(String),
    #[error("missing parameter `{0}`")]
    MissingParameter(&'static str),
    #[error("invalid filepath `{0}`")]
    InvalidFilepath(String),
    #[error("{0}")]
    Corrupt(CorruptKind),
    #[error("checkout would overwrite local changes: {0:?}")]
    CheckoutConflict(Vec<String>),
    #[error("{0}")]
    MergeConflict(MergeConflicts),
    #[error("unmerged paths: {0:?}")]
    UnmergedPaths(Vec<String>),
    #[error("push rejected: {}", .0.iter().map(|(r, e)| format!("{r} ({e})")).collect::<Vec<_>>().join(", "))]
    PushRejected(Vec<(String, String)>),
    #[error("http error {status}: {msg}")]
    Http { status: u16, msg: String },
    #[error("failed to parse url `{0}`")]
    ParseUrl(String),
    #[error("unknown transport for url `{0}`")]
    UnknownTransport(String),
    #[error("commit `{0}` has not been fetched")]
    CommitNotFetched(Oid),
    #[error("operation cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Corruption diagnostics carry where in the stream the damage was observed.
#[derive(Debug)]
#[cfg_attr(test, derive(PartialEq))]
pub struct CorruptKind {
    pub what: String,
    pub offset: Option<u64>,
}

impl CorruptKind {
    pub fn new(what: impl Into<String>) -> Self {
        Self { what: what.into(), offset: None }
    }

    pub fn at(what: impl Into<String>, offset: u64) -> Self {
        Self { what: what.into(), offset: Some(offset) }
    }
}

impl Display for CorruptKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.offset {
            Some(offset) => write!(f, "corrupt {} at offset {}", self.what, offset),
            None => write!(f, "corrupt {}", self.what),
        }
    }
}

impl GitError {
    pub fn corrupt(what: impl Into<String>) -> GitGenericError {
        anyhow!(GitError::Corrupt(CorruptKind::new(what)))
    }

    pub fn corrupt_at(what: impl Into<String>, offset: u64) -> GitGenericError {
        anyhow!(GitError::Corrupt(CorruptKind::at(what, offset)))
    }
}

pub trait GitErrorExt {
    fn try_into_git_error(self) -> GitResult<GitError>;
    fn try_into_obj_not_found_in_pack_index_err(self) -> GitResult<(Oid, u64)>;
    fn try_into_merge_conflict(self) -> GitResult<MergeConflicts>;
    fn try_into_checkout_conflict(self) -> GitResult<Vec<String>>;
}

impl GitErrorExt for GitGenericError {
    fn try_into_git_error(self) -> GitResult<GitError> {
        self.downcast::<GitError>()
    }

    fn try_into_obj_not_found_in_pack_index_err(self) -> GitResult<(Oid, u64)> {
        match self.try_into_git_error()? {
            GitError::ObjectNotFoundInPackIndex(oid, idx) => Ok((oid, idx)),
            err => Err(anyhow!(err)),
        }
    }

    fn try_into_merge_conflict(self) -> GitResult<MergeConflicts> {
        match self.try_into_git_error()? {
            GitError::MergeConflict(conflicts) => Ok(conflicts),
            err => Err(anyhow!(err)),
        }
    }

    fn try_into_checkout_conflict(self) -> GitResult<Vec<String>> {
        match self.try_into_git_error()? {
            GitError::CheckoutConflict(conflicts) => Ok(conflicts),
            err => Err(anyhow!(err)),
        }
    }
}

pub trait GitResultExt {
    fn is_not_found_err(&self) -> bool;
    fn is_fatal(&self) -> bool;
}

macro_rules! error_ext_is_method {
    ($method:ident) => {
        fn $method(&self) -> bool {
            match self {
                Ok(..) => false,
                Err(err) => err.$method(),
            }
        }
    };
}

impl<T> GitResultExt for GitResult<T> {
    error_ext_is_method!(is_not_found_err);

    error_ext_is_method!(is_fatal);
}

impl GitResultExt for GitGenericError {
    fn is_not_found_err(&self) -> bool {
        match self.downcast_ref::<GitError>() {
            Some(err) => matches!(
                err,
                GitError::ObjectNotFound(..)
                    | GitError::ObjectNotFoundInPackIndex(..)
                    | GitError::RefNotFound(..)
            ),
            None => false,
        }
    }

    fn is_fatal(&self) -> bool {
        match self.downcast_ref::<GitError>() {
            Some(err) => !matches!(
                err,
                GitError::ObjectNotFound(..)
                    | GitError::ObjectNotFoundInPackIndex(..)
                    | GitError::RefNotFound(..)
                    | GitError::MergeConflict(..)
                    | GitError::CheckoutConflict(..)
            ),
            None => true,
        }
    }
}

/// Collects child errors from fan-out operations (e.g. adding many files) and
/// surfaces them as one failure when more than one occurred.
#[derive(Debug)]
pub struct Multiple {
    pub errors: Vec<GitGenericError>,
}

impl Multiple {
    pub fn collect(errors: Vec<GitGenericError>) -> GitResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.into_iter().next().unwrap()),
            _ => Err(anyhow!(Multiple { errors })),
        }
    }
}

impl Display for Multiple {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            writeln!(f, "  {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for Multiple {}
