use crate::error::{GitError, GitResult};
use crate::hash::Oid;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;

/// The `packed-refs` file: a sorted optimization over loose ref files.
/// Semantics obey "loose wins"; the ref store consults this only after the
/// loose file misses.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PackedRefs {
    entries: BTreeMap<String, PackedRefEntry>,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PackedRefEntry {
    pub oid: Oid,
    /// from a `^<oid>` peel line directly below a tag ref: the commit the
    /// annotated tag ultimately points at (`<tag>^{}`)
    pub peeled: Option<Oid>,
}

impl PackedRefs {
    pub fn get(&self, name: &str) -> Option<&PackedRefEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<PackedRefEntry> {
        self.entries.remove(name)
    }

    pub fn insert(&mut self, name: String, entry: PackedRefEntry) {
        self.entries.insert(name, entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PackedRefEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn parse(text: &str) -> GitResult<Self> {
        let mut entries = BTreeMap::new();
        let mut last: Option<String> = None;
        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(peeled) = line.strip_prefix('^') {
                let name = last
                    .as_ref()
                    .ok_or_else(|| GitError::corrupt("peel line with no preceding ref"))?;
                let entry: &mut PackedRefEntry = entries
                    .get_mut(name)
                    .expect("previous line inserted this entry");
                entry.peeled = Some(Oid::from_str(peeled)?);
                continue;
            }
            let (oid, name) = line
                .split_once(' ')
                .ok_or_else(|| GitError::corrupt(format!("packed-refs line `{}`", line)))?;
            entries.insert(
                name.to_owned(),
                PackedRefEntry { oid: Oid::from_str(oid)?, peeled: None },
            );
            last = Some(name.to_owned());
        }
        Ok(Self { entries })
    }

    pub fn to_file_contents(&self) -> String {
        let mut out = String::from("# pack-refs with: peeled fully-peeled sorted \n");
        for (name, entry) in &self.entries {
            writeln!(out, "{} {}", entry.oid, name).unwrap();
            if let Some(peeled) = entry.peeled {
                writeln!(out, "^{}", peeled).unwrap();
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgo;

    #[test]
    fn parse_with_peeled_lines() -> GitResult<()> {
        let commit = HashAlgo::Sha1.hash_bytes(b"commit-ish");
        let tag = HashAlgo::Sha1.hash_bytes(b"tag-ish");
        let text = format!(
            "# pack-refs with: peeled fully-peeled sorted \n{} refs/heads/main\n{} refs/tags/v1\n^{}\n",
            commit, tag, commit
        );
        let packed = PackedRefs::parse(&text)?;
        assert_eq!(packed.get("refs/heads/main").unwrap().oid, commit);
        let entry = packed.get("refs/tags/v1").unwrap();
        assert_eq!(entry.oid, tag);
        assert_eq!(entry.peeled, Some(commit));

        // roundtrip through the file form
        assert_eq!(PackedRefs::parse(&packed.to_file_contents())?, packed);
        Ok(())
    }
}
