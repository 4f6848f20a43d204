use crate::error::GitResult;
use anyhow::Context;
use std::cell::Cell;
use std::fs::File;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCK_FILE_EXT: &str = "lock";

bitflags! {
    pub struct LockfileFlags: u8 {
        const SET_READONLY = 1;
    }
}

/// Guards a file with a `<path>.lock` sibling. Writes go to the lockfile and
/// are committed by an atomic rename; dropping without an explicit commit
/// rolls back by deleting the lockfile.
#[derive(Debug)]
pub struct Lockfile {
    /// the guarded file, `None` if it does not exist yet
    file: Option<File>,
    lockfile: File,
    flags: LockfileFlags,
    path: PathBuf,
    lockfile_path: PathBuf,
    committed: Cell<bool>,
    rolled_back: Cell<bool>,
}

impl Write for Lockfile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lockfile.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lockfile.flush()
    }
}

impl Lockfile {
    fn open(path: impl AsRef<Path>, flags: LockfileFlags) -> GitResult<Self> {
        let path = path.as_ref();
        assert!(!path.exists() || path.is_file(), "cannot lock symlinks or directories");
        let lockfile_path = path.with_extension(LOCK_FILE_EXT);
        path.parent().map(std::fs::create_dir_all).transpose()?;
        let lockfile = File::options()
            .create_new(true)
            .write(true)
            .open(&lockfile_path)
            .or_else(|err| match err.kind() {
                io::ErrorKind::AlreadyExists => Err(err).with_context(|| {
                    format!(
                        "failed to lock file `{}` (`{}` already exists)",
                        path.display(),
                        lockfile_path.display()
                    )
                }),
                _ => Err(err)
                    .with_context(|| format!("failed to create file `{}`", path.display())),
            })?;

        let file = path.exists().then(|| File::open(path)).transpose()?;

        Ok(Self {
            file,
            lockfile,
            flags,
            lockfile_path,
            path: path.to_path_buf(),
            committed: Cell::new(false),
            rolled_back: Cell::new(false),
        })
    }

    /// Acquires the lock, retrying with a bounded backoff when the path is
    /// contended. Only ref writes opt into this; everything else fails fast.
    fn open_with_retries(
        path: impl AsRef<Path>,
        flags: LockfileFlags,
        mut attempts: u32,
    ) -> GitResult<Self> {
        let mut backoff = Duration::from_millis(10);
        loop {
            match Self::open(&path, flags) {
                Ok(lockfile) => return Ok(lockfile),
                Err(err) if attempts > 1 => {
                    trace!("lock contention on `{}`: {}", path.as_ref().display(), err);
                    std::thread::sleep(backoff);
                    backoff *= 2;
                    attempts -= 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The guarded file's current contents (never the lockfile).
    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    pub fn with_readonly<R>(
        path: impl AsRef<Path>,
        flags: LockfileFlags,
        f: impl FnOnce(&Self) -> GitResult<R>,
    ) -> GitResult<R> {
        let lockfile = Self::open(path, flags)?;
        let r = f(&lockfile);
        lockfile.rollback();
        r
    }

    pub fn with_mut<R>(
        path: impl AsRef<Path>,
        flags: LockfileFlags,
        f: impl FnOnce(&mut Self) -> GitResult<R>,
    ) -> GitResult<R> {
        Self::open(path, flags)?.with_mut_inner(f)
    }

    pub fn with_mut_retries<R>(
        path: impl AsRef<Path>,
        flags: LockfileFlags,
        attempts: u32,
        f: impl FnOnce(&mut Self) -> GitResult<R>,
    ) -> GitResult<R> {
        Self::open_with_retries(path, flags, attempts)?.with_mut_inner(f)
    }

    /// Runs `f` with write access to the lockfile. An `Err` rolls the
    /// transaction back, `Ok` commits it to disk.
    fn with_mut_inner<R>(mut self, f: impl FnOnce(&mut Self) -> GitResult<R>) -> GitResult<R> {
        match f(&mut self) {
            Ok(r) => {
                self.commit().with_context(|| {
                    anyhow!(
                        "failed to commit lockfile to `{}`; the updated contents remain in `{}`",
                        self.path.display(),
                        self.lockfile_path.display()
                    )
                })?;
                Ok(r)
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    fn commit(&self) -> io::Result<()> {
        if self.rolled_back.get() {
            return Ok(());
        }
        let set_readonly = self.flags.contains(LockfileFlags::SET_READONLY);
        if set_readonly && self.path.exists() {
            let mut permissions = self.path.metadata()?.permissions();
            permissions.set_readonly(false);
            std::fs::set_permissions(&self.path, permissions)?;
        }

        std::fs::rename(&self.lockfile_path, &self.path)?;
        self.committed.set(true);

        if set_readonly {
            let mut permissions = self.path.metadata()?.permissions();
            permissions.set_readonly(true);
            std::fs::set_permissions(&self.path, permissions)?;
        }

        Ok(())
    }

    fn cleanup(&self) -> GitResult<()> {
        std::fs::remove_file(&self.lockfile_path).with_context(|| {
            format!("failed to remove lockfile `{}`", self.lockfile_path.display())
        })
    }

    pub fn rollback(&self) {
        self.rolled_back.set(true);
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        assert!(!self.rolled_back.get() || !self.committed.get());
        if self.rolled_back.get() || !self.committed.get() {
            // cleanup on cancellation/error paths must not panic over an
            // already-removed lockfile
            let _ = self.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockfile_commits_on_ok() -> GitResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("target");
        Lockfile::with_mut(&path, LockfileFlags::empty(), |lockfile| {
            lockfile.write_all(b"contents")?;
            Ok(())
        })?;
        assert_eq!(std::fs::read(&path)?, b"contents");
        assert!(!path.with_extension("lock").exists());
        Ok(())
    }

    #[test]
    fn lockfile_rolls_back_on_err() -> GitResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("target");
        std::fs::write(&path, b"old")?;
        let result: GitResult<()> = Lockfile::with_mut(&path, LockfileFlags::empty(), |lockfile| {
            lockfile.write_all(b"new")?;
            bail!("boom")
        });
        assert!(result.is_err());
        assert_eq!(std::fs::read(&path)?, b"old");
        assert!(!path.with_extension("lock").exists());
        Ok(())
    }

    #[test]
    fn concurrent_lock_fails() -> GitResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("target");
        let _held = Lockfile::open(&path, LockfileFlags::empty())?;
        assert!(Lockfile::open(&path, LockfileFlags::empty()).is_err());
        Ok(())
    }
}
