use crate::error::{GitGenericError, GitResult};
use crate::hash::Oid;
use crate::signature::Signature;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// One line of `logs/<refname>`: `old new who ts tz\tmessage`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReflogEntry {
    pub old_oid: Oid,
    pub new_oid: Oid,
    pub committer: Signature,
    pub msg: String,
}

impl Display for ReflogEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\t{}", self.old_oid, self.new_oid, self.committer, self.msg)
    }
}

impl FromStr for ReflogEntry {
    type Err = GitGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (old_oid, s) = s.split_once(' ').ok_or_else(|| anyhow!("malformed reflog line"))?;
        let (new_oid, s) = s.split_once(' ').ok_or_else(|| anyhow!("malformed reflog line"))?;
        let (committer, msg) = s.split_once('\t').ok_or_else(|| anyhow!("malformed reflog line"))?;
        Ok(Self {
            old_oid: old_oid.parse()?,
            new_oid: new_oid.parse()?,
            committer: committer.parse()?,
            msg: msg.to_owned(),
        })
    }
}

/// Append-only audit of a ref's historical values. Readers of the ref value
/// never consult this.
#[derive(Debug, Default, PartialEq)]
pub struct Reflog {
    pub entries: Vec<ReflogEntry>,
}

impl Reflog {
    pub fn latest(&self) -> Option<&ReflogEntry> {
        self.entries.last()
    }
}

impl FromStr for Reflog {
    type Err = GitGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let entries = s.lines().map(ReflogEntry::from_str).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }
}

impl Reflog {
    pub fn to_file_contents(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.to_string());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgo;
    use crate::signature::GitTime;

    #[test]
    fn reflog_entry_roundtrip() -> GitResult<()> {
        let entry = ReflogEntry {
            old_oid: Oid::zero(HashAlgo::Sha1),
            new_oid: HashAlgo::Sha1.hash_bytes(b"x"),
            committer: Signature::new("A", "a@b", GitTime::new(1577836800, 0)),
            msg: "commit (initial): c".to_owned(),
        };
        let line = entry.to_string();
        assert_eq!(line.parse::<ReflogEntry>()?, entry);
        Ok(())
    }
}
