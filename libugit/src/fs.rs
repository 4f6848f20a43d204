//! Thin helpers over the host filesystem. All repository state IO funnels
//! through here or through [`crate::lockfile`], which keeps the library's
//! actual filesystem demands down to the small contract a provider must
//! satisfy: read/write/rename/readdir/stat and atomic same-directory rename.

use crate::error::GitResult;
use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// Writes `bytes` to `path` atomically: temp file in the same directory then
/// rename. If `keep_existing` and the target already exists the write is a
/// no-op (object files are immutable and content-addressed, so a losing
/// racer discards its temp file and reports success).
pub fn atomic_write(path: &Path, bytes: &[u8], keep_existing: bool) -> GitResult<()> {
    if keep_existing && path.exists() {
        return Ok(());
    }
    let dir = path.parent().expect("atomic_write target must have a parent");
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    io::Write::write_all(&mut tmp, bytes)?;
    match tmp.persist(path) {
        Ok(..) => Ok(()),
        Err(err) if keep_existing && path.exists() => {
            drop(err);
            Ok(())
        }
        Err(err) => Err(err.error.into()),
    }
}

pub fn read_optional(path: &Path) -> GitResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub fn read_optional_string(path: &Path) -> GitResult<Option<String>> {
    Ok(read_optional(path)?.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
}

pub fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|metadata| metadata.modified()).ok()
}

pub fn remove_file_if_exists(path: &Path) -> GitResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
