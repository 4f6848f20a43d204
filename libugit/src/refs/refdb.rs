use super::{is_valid_name, GitRef, PackedRefs, Reflog, ReflogEntry, SymbolicRef};
use crate::error::{GitError, GitResult};
use crate::fs;
use crate::hash::{HashAlgo, Oid};
use crate::lockfile::{Lockfile, LockfileFlags};
use crate::signature::Signature;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

/// symbolic chains longer than this fail rather than chase further
const MAX_SYMREF_DEPTH: usize = 5;
/// contended ref locks retry this many times with backoff before surfacing
const LOCK_ATTEMPTS: u32 = 4;

/// What the caller expects the ref to currently hold. A mismatch fails the
/// write with [`GitError::RefStale`]; this is the primitive behind
/// `--force-with-lease` and concurrent-write safety.
#[derive(Debug, Clone, PartialEq)]
pub enum Expect {
    Any,
    MustNotExist,
    Value(GitRef),
}

#[derive(Debug, Clone)]
pub struct RefUpdate {
    pub expect: Expect,
    pub committer: Signature,
    pub message: String,
}

impl RefUpdate {
    pub fn new(committer: Signature, message: impl Into<String>) -> Self {
        Self { expect: Expect::Any, committer, message: message.into() }
    }

    pub fn expecting(mut self, expect: Expect) -> Self {
        self.expect = expect;
        self
    }
}

struct PackedRefsCache {
    mtime: Option<SystemTime>,
    refs: PackedRefs,
}

/// Loose refs + `packed-refs` + reflogs under one roof. Loose always wins;
/// packed-refs is parsed lazily and invalidated by file mtime.
pub struct RefDb {
    gitdir: PathBuf,
    algo: HashAlgo,
    packed: RwLock<Option<PackedRefsCache>>,
}

impl RefDb {
    pub fn new(gitdir: PathBuf, algo: HashAlgo) -> Self {
        Self { gitdir, algo, packed: Default::default() }
    }

    fn ref_path(&self, sym: &SymbolicRef) -> PathBuf {
        self.gitdir.join(sym.path())
    }

    fn log_path(&self, sym: &SymbolicRef) -> PathBuf {
        self.gitdir.join("logs").join(sym.path())
    }

    fn packed_refs_path(&self) -> PathBuf {
        self.gitdir.join("packed-refs")
    }

    /// Loads `packed-refs` through the mtime-validated cache.
    pub fn packed_refs(&self) -> GitResult<PackedRefs> {
        let path = self.packed_refs_path();
        let mtime = fs::mtime(&path);
        if let Some(cache) = self.packed.read().as_ref() {
            if cache.mtime == mtime {
                return Ok(cache.refs.clone());
            }
        }
        let refs = match fs::read_optional_string(&path)? {
            Some(text) => PackedRefs::parse(&text)?,
            None => PackedRefs::default(),
        };
        *self.packed.write() = Some(PackedRefsCache { mtime, refs: refs.clone() });
        Ok(refs)
    }

    fn invalidate_packed_cache(&self) {
        *self.packed.write() = None;
    }

    /// The immediate value of `sym` (may itself be symbolic).
    pub fn read(&self, sym: &SymbolicRef) -> GitResult<GitRef> {
        self.read_opt(sym)?
            .ok_or_else(|| anyhow!(GitError::RefNotFound(sym.clone())))
    }

    pub fn read_opt(&self, sym: &SymbolicRef) -> GitResult<Option<GitRef>> {
        if let Some(text) = fs::read_optional_string(&self.ref_path(sym))? {
            return GitRef::from_str(&text).map(Some);
        }
        Ok(self.packed_refs()?.get(sym.path()).map(|entry| GitRef::Direct(entry.oid)))
    }

    pub fn exists(&self, sym: &SymbolicRef) -> GitResult<bool> {
        Ok(self.read_opt(sym)?.is_some())
    }

    /// The peeled (`<tag>^{}`) oid recorded in packed-refs, if any.
    pub fn peeled(&self, sym: &SymbolicRef) -> GitResult<Option<Oid>> {
        Ok(self.packed_refs()?.get(sym.path()).and_then(|entry| entry.peeled))
    }

    /// Follows symbolic links until a direct ref or a nonexistent ref. A
    /// nonexistent tip resolves to itself symbolically (the state of `HEAD`
    /// in a fresh repository); cycles and over-deep chains are
    /// [`GitError::InvalidRef`].
    pub fn resolve(&self, reference: GitRef) -> GitResult<GitRef> {
        let mut seen = vec![];
        let mut current = reference;
        for _ in 0..=MAX_SYMREF_DEPTH {
            let sym = match current {
                GitRef::Direct(..) => return Ok(current),
                GitRef::Symbolic(ref sym) => sym.clone(),
            };
            if seen.contains(&sym) {
                return Err(anyhow!(GitError::InvalidRef(format!(
                    "symbolic reference cycle through `{}`",
                    sym
                ))));
            }
            seen.push(sym.clone());
            match self.read_opt(&sym)? {
                Some(next) => current = next,
                None => return Ok(GitRef::Symbolic(sym)),
            }
        }
        Err(anyhow!(GitError::InvalidRef(format!(
            "symbolic reference chain deeper than {}",
            MAX_SYMREF_DEPTH
        ))))
    }

    pub fn fully_resolve(&self, reference: GitRef) -> GitResult<Oid> {
        match self.resolve(reference)? {
            GitRef::Direct(oid) => Ok(oid),
            GitRef::Symbolic(sym) => Err(anyhow!(GitError::RefNotFound(sym))),
        }
    }

    pub fn try_fully_resolve(&self, reference: GitRef) -> GitResult<Option<Oid>> {
        match self.resolve(reference)? {
            GitRef::Direct(oid) => Ok(Some(oid)),
            GitRef::Symbolic(..) => Ok(None),
        }
    }

    /// Atomic ref write via the `.lock` sibling. The expectation is checked
    /// under the lock, so a CAS loser observes [`GitError::RefStale`] rather
    /// than clobbering the winner.
    pub fn update(&self, sym: &SymbolicRef, to: GitRef, opts: RefUpdate) -> GitResult<()> {
        ensure!(
            is_valid_name(sym.path()),
            GitError::InvalidRef(sym.path().to_owned())
        );
        let path = self.ref_path(sym);
        let old = Lockfile::with_mut_retries(
            &path,
            LockfileFlags::empty(),
            LOCK_ATTEMPTS,
            |lockfile| {
                let current = self.read_opt(sym)?;
                match &opts.expect {
                    Expect::Any => {}
                    Expect::MustNotExist =>
                        if current.is_some() {
                            bail!(GitError::AlreadyExists(sym.path().to_owned()));
                        },
                    Expect::Value(expected) => {
                        let actual = current.clone();
                        if actual.as_ref() != Some(expected) {
                            bail!(GitError::RefStale {
                                name: sym.clone(),
                                expected: expected.to_string(),
                                actual: actual
                                    .map(|r| r.to_string())
                                    .unwrap_or_else(|| "<missing>".to_owned()),
                            });
                        }
                    }
                }
                lockfile.write_all(to.file_contents().as_bytes())?;
                Ok(current)
            },
        )?;

        let old_oid = match old {
            Some(old) => self.try_fully_resolve(old)?.unwrap_or_else(|| Oid::zero(self.algo)),
            None => Oid::zero(self.algo),
        };
        let new_oid =
            self.try_fully_resolve(to)?.unwrap_or_else(|| Oid::zero(self.algo));
        self.append_reflog(sym, old_oid, new_oid, opts.committer, &opts.message)?;
        Ok(())
    }

    pub fn create(&self, sym: &SymbolicRef, to: GitRef, opts: RefUpdate) -> GitResult<()> {
        self.update(sym, to, opts.expecting(Expect::MustNotExist))
    }

    /// Removes the loose file and any packed entry; missing both is
    /// [`GitError::RefNotFound`].
    pub fn delete(&self, sym: &SymbolicRef) -> GitResult<()> {
        let path = self.ref_path(sym);
        let loose_existed = path.exists();
        // hold the ref lock while deleting so concurrent updates don't
        // interleave between the two removals
        Lockfile::with_mut_retries(&path, LockfileFlags::empty(), LOCK_ATTEMPTS, |lockfile| {
            fs::remove_file_if_exists(&path)?;
            lockfile.rollback();
            Ok(())
        })?;

        let packed = self.packed_refs()?;
        let packed_existed = packed.contains(sym.path());
        if packed_existed {
            Lockfile::with_mut(
                &self.packed_refs_path(),
                LockfileFlags::empty(),
                |lockfile| {
                    let mut packed = self.packed_refs()?;
                    packed.remove(sym.path());
                    lockfile.write_all(packed.to_file_contents().as_bytes())?;
                    Ok(())
                },
            )?;
            self.invalidate_packed_cache();
        }

        if !loose_existed && !packed_existed {
            bail!(GitError::RefNotFound(sym.clone()));
        }
        fs::remove_file_if_exists(&self.log_path(sym))?;
        Ok(())
    }

    /// All refs under `refs/`, packed entries included, loose winning on
    /// collisions. Symbolic entries (e.g. `refs/remotes/origin/HEAD`) are
    /// resolved when possible and skipped otherwise.
    pub fn ls_refs(&self) -> GitResult<BTreeMap<String, Oid>> {
        let mut out = BTreeMap::new();
        for (name, entry) in self.packed_refs()?.iter() {
            out.insert(name.to_owned(), entry.oid);
        }
        let refs_dir = self.gitdir.join("refs");
        if refs_dir.exists() {
            for entry in walkdir::WalkDir::new(&refs_dir).sort_by_file_name() {
                let entry = entry?;
                if !entry.file_type().is_file()
                    || entry.path().extension() == Some("lock".as_ref())
                {
                    continue;
                }
                let name = entry
                    .path()
                    .strip_prefix(&self.gitdir)
                    .expect("walked path is under gitdir")
                    .to_str()
                    .ok_or_else(|| anyhow!("non-utf8 ref name"))?
                    .to_owned();
                let value = self.read(&SymbolicRef::new(name.clone()))?;
                match self.try_fully_resolve(value)? {
                    Some(oid) => {
                        out.insert(name, oid);
                    }
                    None => continue,
                }
            }
        }
        Ok(out)
    }

    /// Appends one reflog line. Tolerates a missing `logs` directory by
    /// doing nothing, per the audit-only contract.
    pub fn append_reflog(
        &self,
        sym: &SymbolicRef,
        old_oid: Oid,
        new_oid: Oid,
        committer: Signature,
        msg: &str,
    ) -> GitResult<()> {
        let logs_dir = self.gitdir.join("logs");
        if !logs_dir.exists() {
            return Ok(());
        }
        let path = self.log_path(sym);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entry = ReflogEntry { old_oid, new_oid, committer, msg: msg.to_owned() };
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }

    pub fn read_reflog(&self, sym: &SymbolicRef) -> GitResult<Reflog> {
        match fs::read_optional_string(&self.log_path(sym))? {
            Some(text) => Reflog::from_str(&text),
            None => Ok(Reflog::default()),
        }
    }
}
