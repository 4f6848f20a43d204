use crate::config::GitConfig;
use crate::error::{GitError, GitResult};
use crate::hash::{HashAlgo, Oid};
use crate::index::Index;
use crate::obj::{Commit, Id, ObjType, ObjectKind, Tag, Tree, WritableObject};
use crate::odb::Odb;
use crate::refs::{Expect, GitRef, RefDb, RefUpdate, SymbolicRef};
use crate::signature::Signature;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const GIT_DIR_NAME: &str = ".git";
const MAX_PEEL_DEPTH: usize = 10;

const MISSING_IDENTITY_MSG: &str = r#"Author identity unknown

*** Please tell me who you are.

Run

  ugit config user.email "you@example.com"
  ugit config user.name "Your Name"

to set your account's identity."#;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RepoState {
    None,
    Merging,
}

#[derive(Debug, Clone, Default)]
pub struct InitOpts {
    pub bare: bool,
    pub object_format: Option<HashAlgo>,
    pub default_branch: Option<String>,
}

struct RepoInner {
    workdir: PathBuf,
    gitdir: PathBuf,
    algo: HashAlgo,
    bare: bool,
    config: GitConfig,
    odb: Odb,
    refdb: RefDb,
}

/// A repository handle. Cloning is cheap (shared state behind an `Arc`);
/// the handle is not meant to be shared across threads by the library
/// itself — callers coordinate that — but the object store within serves
/// concurrent readers.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepoInner>,
}

impl PartialEq for Repository {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").field("gitdir", &self.inner.gitdir).finish()
    }
}

impl Repository {
    /// Creates the standard layout and opens the result.
    pub fn init_opts(path: impl AsRef<Path>, opts: InitOpts) -> GitResult<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let path = path.canonicalize()?;
        let gitdir = if opts.bare { path.clone() } else { path.join(GIT_DIR_NAME) };
        ensure!(
            !gitdir.join("HEAD").exists(),
            GitError::AlreadyExists(gitdir.display().to_string())
        );

        for dir in ["objects/pack", "objects/info", "refs/heads", "refs/tags", "logs", "info"] {
            std::fs::create_dir_all(gitdir.join(dir))?;
        }

        let algo = opts.object_format.unwrap_or_default();
        let mut config = crate::config::ConfigFile::default();
        // sha256 repos require format version 1 plus the extension
        let version = if algo == HashAlgo::Sha256 { "1" } else { "0" };
        config.set("core", None, "repositoryformatversion", version);
        config.set("core", None, "filemode", "true");
        config.set("core", None, "bare", if opts.bare { "true" } else { "false" });
        config.set("core", None, "logallrefupdates", "true");
        if algo == HashAlgo::Sha256 {
            config.set("extensions", None, "objectformat", "sha256");
        }
        std::fs::write(gitdir.join("config"), config.to_file_contents())?;

        let repo = Self::open_gitdir(gitdir.clone(), if opts.bare { None } else { Some(path) })?;
        let branch = match opts.default_branch {
            Some(branch) => branch,
            None => repo.config().defaultbranch()?,
        };
        std::fs::write(
            gitdir.join("HEAD"),
            GitRef::Symbolic(SymbolicRef::new_branch(&branch)?).file_contents(),
        )?;
        std::fs::write(
            gitdir.join("info").join("exclude"),
            "# per-repository ignores live here\n",
        )?;
        Ok(repo)
    }

    pub fn init(path: impl AsRef<Path>) -> GitResult<Self> {
        Self::init_opts(path, InitOpts::default())
    }

    /// Opens `path` as a worktree (containing `.git`) or a bare gitdir.
    pub fn open(path: impl AsRef<Path>) -> GitResult<Self> {
        let path = path
            .as_ref()
            .canonicalize()
            .with_context(|| format!("no repository at `{}`", path.as_ref().display()))?;
        let dotgit = path.join(GIT_DIR_NAME);
        if dotgit.is_dir() {
            return Self::open_gitdir(dotgit, Some(path));
        }
        if path.join("HEAD").exists() && path.join("objects").is_dir() {
            return Self::open_gitdir(path, None);
        }
        bail!("`{}` is not a ugit repository", path.display())
    }

    /// Walks up from `path` looking for a repository.
    pub fn find(path: impl AsRef<Path>) -> GitResult<Self> {
        let start = path.as_ref().canonicalize().with_context(|| {
            format!("cannot search for a repository from `{}`", path.as_ref().display())
        })?;
        let mut current = Some(start.as_path());
        while let Some(path) = current {
            if path.join(GIT_DIR_NAME).is_dir() {
                return Self::open(path);
            }
            current = path.parent();
        }
        bail!("not a ugit repository (or any of the parent directories): `{}`", start.display())
    }

    fn open_gitdir(gitdir: PathBuf, workdir: Option<PathBuf>) -> GitResult<Self> {
        let config = GitConfig::open(&gitdir);
        let version = config.repositoryformatversion()?.unwrap_or(0);
        ensure!(
            version == 0 || version == 1,
            "unsupported repositoryformatversion `{}`",
            version
        );
        let algo = match config.objectformat()? {
            Some(name) => HashAlgo::from_name(&name)?,
            None => HashAlgo::Sha1,
        };
        let chunk_threshold = config.chunkthreshold()?.map(|n| n as u64);
        let bare = workdir.is_none() || config.bare()?.unwrap_or(false);
        let odb = Odb::new(gitdir.join("objects"), algo, chunk_threshold)?;
        let refdb = RefDb::new(gitdir.clone(), algo);
        let workdir = workdir.unwrap_or_else(|| gitdir.clone());
        Ok(Self {
            inner: Arc::new(RepoInner { workdir, gitdir, algo, bare, config, odb, refdb }),
        })
    }

    #[inline]
    pub fn workdir(&self) -> &Path {
        &self.inner.workdir
    }

    #[inline]
    pub fn gitdir(&self) -> &Path {
        &self.inner.gitdir
    }

    #[inline]
    pub fn algo(&self) -> HashAlgo {
        self.inner.algo
    }

    #[inline]
    pub fn is_bare(&self) -> bool {
        self.inner.bare
    }

    #[inline]
    pub fn odb(&self) -> &Odb {
        &self.inner.odb
    }

    #[inline]
    pub fn refdb(&self) -> &RefDb {
        &self.inner.refdb
    }

    #[inline]
    pub fn config(&self) -> &GitConfig {
        &self.inner.config
    }

    pub fn index_path(&self) -> PathBuf {
        self.inner.gitdir.join("index")
    }

    pub fn index(&self) -> GitResult<Index> {
        Index::load(self.index_path(), self.inner.algo)
    }

    pub fn to_absolute(&self, rel: &str) -> PathBuf {
        self.inner.workdir.join(rel)
    }

    // ------------------------------------------------------------------
    // objects

    pub fn read_obj(&self, id: impl Into<Id>) -> GitResult<ObjectKind> {
        let raw = self.odb().read_raw(id)?;
        raw.parse(self.algo())
    }

    pub fn read_commit(&self, oid: Oid) -> GitResult<Commit> {
        self.read_obj(oid)?.into_commit()
    }

    pub fn read_tree(&self, oid: Oid) -> GitResult<Tree> {
        if oid == self.algo().empty_tree() {
            return Ok(Tree::default());
        }
        self.read_obj(oid)?.into_tree()
    }

    pub fn write_obj(&self, obj: &dyn WritableObject) -> GitResult<Oid> {
        self.odb().write(obj)
    }

    /// Follows tag objects down to the referenced commit.
    pub fn peel_to_commit(&self, mut oid: Oid) -> GitResult<Commit> {
        for _ in 0..MAX_PEEL_DEPTH {
            match self.read_obj(oid)? {
                ObjectKind::Commit(commit) => return Ok(commit),
                ObjectKind::Tag(Tag { object, .. }) => oid = object,
                obj => {
                    return Err(anyhow!(GitError::ObjectType {
                        oid,
                        expected: ObjType::Commit,
                        found: obj.obj_type(),
                    }))
                }
            }
        }
        Err(GitError::corrupt("tag chain too deep"))
    }

    pub fn tree_oid_of_commit(&self, oid: Oid) -> GitResult<Oid> {
        Ok(self.peel_to_commit(oid)?.tree)
    }

    // ------------------------------------------------------------------
    // refs / HEAD

    pub fn read_head(&self) -> GitResult<GitRef> {
        self.refdb().read(&SymbolicRef::head())
    }

    pub fn resolve_head(&self) -> GitResult<GitRef> {
        self.refdb().resolve(GitRef::head())
    }

    pub fn fully_resolve_head(&self) -> GitResult<Oid> {
        self.refdb().fully_resolve(GitRef::head())
    }

    pub fn try_fully_resolve_head(&self) -> GitResult<Option<Oid>> {
        self.refdb().try_fully_resolve(GitRef::head())
    }

    pub fn head_tree_oid(&self) -> GitResult<Oid> {
        match self.try_fully_resolve_head()? {
            Some(oid) => self.tree_oid_of_commit(oid),
            None => Ok(self.algo().empty_tree()),
        }
    }

    pub fn is_detached_head(&self) -> GitResult<bool> {
        Ok(self.read_head()?.is_direct())
    }

    /// The current branch when not detached.
    pub fn current_branch(&self) -> GitResult<Option<SymbolicRef>> {
        match self.read_head()? {
            GitRef::Symbolic(sym) => Ok(Some(sym)),
            GitRef::Direct(..) => Ok(None),
        }
    }

    pub fn repo_state(&self) -> RepoState {
        if self.gitdir().join("MERGE_HEAD").exists() {
            RepoState::Merging
        } else {
            RepoState::None
        }
    }

    /// Moves whatever HEAD points at (or HEAD itself when detached) to
    /// `to`, logging both the branch and HEAD.
    pub fn update_head_for_commit(
        &self,
        to: Oid,
        expected_old: Option<Oid>,
        message: &str,
    ) -> GitResult<()> {
        let committer = self.user_signature()?;
        match self.read_head()? {
            GitRef::Symbolic(branch) => {
                let expect = match expected_old {
                    Some(old) => Expect::Value(GitRef::Direct(old)),
                    None => Expect::Any,
                };
                let old = self.refdb().try_fully_resolve(GitRef::Symbolic(branch.clone()))?;
                self.refdb().update(
                    &branch,
                    GitRef::Direct(to),
                    RefUpdate::new(committer.clone(), message).expecting(expect),
                )?;
                self.refdb().append_reflog(
                    &SymbolicRef::head(),
                    old.unwrap_or_else(|| Oid::zero(self.algo())),
                    to,
                    committer,
                    message,
                )
            }
            GitRef::Direct(old) => self.refdb().update(
                &SymbolicRef::head(),
                GitRef::Direct(to),
                RefUpdate::new(committer, message)
                    .expecting(Expect::Value(GitRef::Direct(old))),
            ),
        }
    }

    /// Repoints HEAD itself (checkout/switch).
    pub fn set_head(&self, target: GitRef, message: &str) -> GitResult<()> {
        let committer = self.user_signature()?;
        self.refdb().update(&SymbolicRef::head(), target, RefUpdate::new(committer, message))
    }

    // ------------------------------------------------------------------
    // commits

    pub fn user_signature(&self) -> GitResult<Signature> {
        let name = self.config().name()?;
        let email = self.config().email()?;
        match (name, email) {
            (Some(name), Some(email)) => Ok(Signature::now(name, email)),
            _ => Err(anyhow!("{}", MISSING_IDENTITY_MSG)),
        }
    }

    /// Writes a commit object and advances HEAD's branch to it.
    pub fn commit_tree(
        &self,
        tree: Oid,
        parents: crate::obj::Parents,
        message: String,
    ) -> GitResult<Oid> {
        let author = self.user_signature()?;
        let committer = author.clone();
        let is_initial = parents.is_empty();
        let commit = Commit::new(tree, parents, author, committer, message);
        let oid = self.write_obj(&commit)?;
        let reflog_msg = if is_initial {
            format!("commit (initial): {}", commit.subject())
        } else if self.repo_state() == RepoState::Merging {
            format!("commit (merge): {}", commit.subject())
        } else {
            format!("commit: {}", commit.subject())
        };
        self.update_head_for_commit(oid, commit.first_parent(), &reflog_msg)?;
        Ok(oid)
    }

    /// Writes a commit object without touching any ref; the merge engine
    /// uses this for virtual bases.
    pub fn write_commit_detached(
        &self,
        tree: Oid,
        parents: crate::obj::Parents,
        message: String,
    ) -> GitResult<Oid> {
        let author = self.user_signature()?;
        let committer = author.clone();
        self.write_obj(&Commit::new(tree, parents, author, committer, message))
    }

    // ------------------------------------------------------------------
    // transient state files (merge machinery)

    fn state_file(&self, name: &str) -> PathBuf {
        self.gitdir().join(name)
    }

    pub fn write_merge_state(&self, their_head: Oid, message: &str) -> GitResult<()> {
        std::fs::write(self.state_file("MERGE_HEAD"), format!("{}\n", their_head))?;
        std::fs::write(self.state_file("MERGE_MSG"), message)?;
        std::fs::write(self.state_file("MERGE_MODE"), "")?;
        Ok(())
    }

    pub fn read_merge_head(&self) -> GitResult<Option<Oid>> {
        match crate::fs::read_optional_string(&self.state_file("MERGE_HEAD"))? {
            Some(text) => Ok(Some(text.trim().parse()?)),
            None => Ok(None),
        }
    }

    pub fn clear_merge_state(&self) -> GitResult<()> {
        for name in ["MERGE_HEAD", "MERGE_MSG", "MERGE_MODE"] {
            crate::fs::remove_file_if_exists(&self.state_file(name))?;
        }
        Ok(())
    }

    pub fn write_orig_head(&self, oid: Oid) -> GitResult<()> {
        Ok(std::fs::write(self.state_file("ORIG_HEAD"), format!("{}\n", oid))?)
    }

    /// Oids listed in `shallow`: history roots whose parents were not
    /// fetched.
    pub fn shallow_roots(&self) -> GitResult<Vec<Oid>> {
        match crate::fs::read_optional_string(&self.state_file("shallow"))? {
            Some(text) => text.lines().map(|line| Ok(line.trim().parse()?)).collect(),
            None => Ok(vec![]),
        }
    }

    pub fn write_shallow_roots(&self, roots: &[Oid]) -> GitResult<()> {
        if roots.is_empty() {
            return crate::fs::remove_file_if_exists(&self.state_file("shallow"));
        }
        let mut text = String::new();
        for root in roots {
            text.push_str(&format!("{}\n", root));
        }
        Ok(std::fs::write(self.state_file("shallow"), text)?)
    }

    /// Commits present locally but truncated: their parents may be absent.
    pub fn is_shallow_root(&self, oid: Oid) -> GitResult<bool> {
        Ok(self.shallow_roots()?.contains(&oid))
    }

    /// Hashes a worktree file the way `add` does: symlinks hash their
    /// target path bytes, regular files their contents.
    pub fn hash_workdir_file(&self, rel: &str) -> GitResult<Oid> {
        let abs = self.to_absolute(rel);
        let metadata = abs.symlink_metadata()?;
        let bytes = if metadata.file_type().is_symlink() {
            std::fs::read_link(&abs)?.to_string_lossy().into_owned().into_bytes()
        } else {
            std::fs::read(&abs)?
        };
        self.odb().write_raw(ObjType::Blob, &bytes)
    }

    /// Reads a blob by oid, streaming through the store.
    pub fn read_blob(&self, oid: Oid) -> GitResult<Vec<u8>> {
        let raw = self.odb().read_raw(oid)?;
        ensure!(
            raw.obj_type == ObjType::Blob,
            GitError::ObjectType { oid, expected: ObjType::Blob, found: raw.obj_type }
        );
        Ok(raw.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_expected_layout() -> GitResult<()> {
        let dir = tempfile::tempdir()?;
        let repo = Repository::init(dir.path())?;
        let gitdir = repo.gitdir();
        assert!(gitdir.join("objects/pack").is_dir());
        assert!(gitdir.join("refs/heads").is_dir());
        assert!(gitdir.join("logs").is_dir());
        assert_eq!(repo.algo(), HashAlgo::Sha1);
        // HEAD points at the unborn default branch
        match repo.read_head()? {
            GitRef::Symbolic(sym) => assert!(sym.path().starts_with("refs/heads/")),
            head => panic!("unexpected HEAD `{}`", head),
        }
        assert_eq!(repo.try_fully_resolve_head()?, None);
        Ok(())
    }

    #[test]
    fn reinit_fails() -> GitResult<()> {
        let dir = tempfile::tempdir()?;
        Repository::init(dir.path())?;
        assert!(Repository::init(dir.path()).is_err());
        Ok(())
    }

    #[test]
    fn init_sha256_repo() -> GitResult<()> {
        let dir = tempfile::tempdir()?;
        let repo = Repository::init_opts(
            dir.path(),
            InitOpts { object_format: Some(HashAlgo::Sha256), ..Default::default() },
        )?;
        assert_eq!(repo.algo(), HashAlgo::Sha256);
        let oid = repo.odb().write_raw(ObjType::Blob, b"hi")?;
        assert_eq!(oid.len(), 32);
        let reopened = Repository::open(dir.path())?;
        assert_eq!(reopened.algo(), HashAlgo::Sha256);
        Ok(())
    }

    #[test]
    fn find_walks_upward() -> GitResult<()> {
        let dir = tempfile::tempdir()?;
        Repository::init(dir.path())?;
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested)?;
        let repo = Repository::find(&nested)?;
        assert_eq!(repo.workdir(), dir.path().canonicalize()?);
        Ok(())
    }
}
