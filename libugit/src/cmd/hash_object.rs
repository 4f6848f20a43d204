use crate::error::GitResult;
use crate::hash::Oid;
use crate::obj::{ObjType, RawObject};
use crate::repo::Repository;

/// `hash-object [-w]`.
pub fn hash_object(
    repo: &Repository,
    obj_type: ObjType,
    bytes: &[u8],
    write: bool,
) -> GitResult<Oid> {
    if write {
        repo.odb().write_raw(obj_type, bytes)
    } else {
        Ok(RawObject::new(obj_type, bytes.to_vec()).oid(repo.algo()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn hash_without_write_leaves_odb_untouched() -> GitResult<()> {
        with_test_repo(|repo| {
            let oid = hash_object(&repo, ObjType::Blob, b"Hello world!", false)?;
            assert_eq!(oid.to_hex(), "c57eff55ebc0c54973903af5f72bac72762cf4f4");
            assert!(!repo.odb().contains(oid)?);
            let written = hash_object(&repo, ObjType::Blob, b"Hello world!", true)?;
            assert_eq!(written, oid);
            assert!(repo.odb().contains(oid)?);
            Ok(())
        })
    }
}
