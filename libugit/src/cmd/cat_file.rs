use crate::error::GitResult;
use crate::obj::{Id, ObjHeader, ObjectKind};
use crate::repo::Repository;
use std::str::FromStr;

/// `cat-file -p`-ish: resolves a full or abbreviated oid to the parsed
/// object.
pub fn cat_file(repo: &Repository, spec: &str) -> GitResult<ObjectKind> {
    let id = Id::from_str(spec)?;
    repo.read_obj(id)
}

/// `cat-file -t`/`-s`: type and size without materializing the content.
pub fn cat_file_header(repo: &Repository, spec: &str) -> GitResult<ObjHeader> {
    let id = Id::from_str(spec)?;
    repo.odb().read_header(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GitError, GitErrorExt};
    use crate::obj::ObjType;
    use crate::test_utils::*;

    #[test]
    fn resolves_abbreviated_oids() -> GitResult<()> {
        with_test_repo(|repo| {
            let oid = repo.odb().write_raw(ObjType::Blob, b"abbreviate me")?;
            let obj = cat_file(&repo, &oid.to_hex()[..8])?;
            assert_eq!(obj.into_blob()?.bytes(), b"abbreviate me");
            let header = cat_file_header(&repo, &oid.to_hex())?;
            assert_eq!(header.size, 13);
            Ok(())
        })
    }

    #[test]
    fn ambiguous_prefix_is_reported() -> GitResult<()> {
        with_test_repo(|repo| {
            // birthday-search a pair of blobs sharing a 4-hex prefix, then
            // write only those two
            let algo = repo.algo();
            let mut seen = std::collections::HashMap::new();
            let (a, b) = (0u32..)
                .find_map(|i| {
                    let bytes = format!("candidate {}", i).into_bytes();
                    let prefix = crate::obj::RawObject::new(ObjType::Blob, bytes.clone())
                        .oid(algo)
                        .to_hex()[..4]
                        .to_owned();
                    seen.insert(prefix, bytes).map(|previous| {
                        (previous, format!("candidate {}", i).into_bytes())
                    })
                })
                .expect("the search space is unbounded");
            let first = repo.odb().write_raw(ObjType::Blob, &a)?;
            repo.odb().write_raw(ObjType::Blob, &b)?;
            let prefix = &first.to_hex()[..4];

            let err = cat_file(&repo, prefix).unwrap_err();
            match err.try_into_git_error()? {
                GitError::AmbiguousPrefix(..) => Ok(()),
                err => panic!("expected ambiguous prefix, got {}", err),
            }
        })
    }
}
