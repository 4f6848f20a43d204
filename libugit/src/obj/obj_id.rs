use crate::error::{GitGenericError, GitResult};
use crate::hash::{HashAlgo, Oid};
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

/// Either a full oid or an abbreviated hex prefix awaiting expansion against
/// the object store.
#[derive(PartialEq, Eq, Clone, Hash)]
pub enum Id {
    Full(Oid),
    Partial(PartialOid),
}

impl Id {
    pub fn is_full(&self) -> bool {
        matches!(self, Id::Full(..))
    }
}

impl From<Oid> for Id {
    fn from(oid: Oid) -> Self {
        Id::Full(oid)
    }
}

impl From<PartialOid> for Id {
    fn from(prefix: PartialOid) -> Self {
        Id::Partial(prefix)
    }
}

impl FromStr for Id {
    type Err = GitGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(oid) = Oid::from_str(s) {
            return Ok(Id::Full(oid));
        }
        PartialOid::new(s).map(Id::Partial)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Id::Full(oid) => Display::fmt(oid, f),
            Id::Partial(prefix) => Display::fmt(prefix, f),
        }
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

#[derive(PartialEq, Eq, Clone, Hash)]
pub struct PartialOid {
    hex: String,
}

impl PartialOid {
    pub fn new(s: &str) -> GitResult<Self> {
        ensure!(
            s.len() >= 4 && s.len() < 64 && s.chars().all(|c| c.is_ascii_hexdigit()),
            "invalid oid prefix `{}`",
            s
        );
        Ok(Self { hex: s.to_ascii_lowercase() })
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// The loose-object (directory, file-prefix) pair.
    pub fn split(&self) -> (&str, &str) {
        self.hex.split_at(2)
    }

    pub fn matches(&self, oid: Oid) -> bool {
        oid.has_prefix(&self.hex)
    }

    /// Zero-extends the prefix into a full (almost certainly nonexistent)
    /// oid; useful as a binary search probe.
    pub fn zero_extended(&self, algo: HashAlgo) -> Oid {
        let mut hex = self.hex.clone();
        // odd-length prefixes round down to whole bytes for the probe
        if hex.len() % 2 == 1 {
            hex.pop();
        }
        let mut bytes = hex::decode(&hex).expect("prefix is validated hex");
        bytes.resize(algo.oid_size(), 0);
        Oid::from_bytes(&bytes).unwrap()
    }
}

impl Display for PartialOid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

impl Debug for PartialOid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}
