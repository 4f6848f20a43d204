use crate::error::GitResult;
use std::fmt::{self, Display, Formatter};

/// A named feature both peers agree to use for the session; may carry a
/// value (`agent=ugit/0.1`, `symref=HEAD:refs/heads/main`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub name: String,
    pub value: Option<String>,
}

impl Capability {
    pub fn flag(name: impl Into<String>) -> Self {
        Self { name: name.into(), value: None }
    }

    pub fn valued(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: Some(value.into()) }
    }

    pub fn parse(word: &str) -> Self {
        match word.split_once('=') {
            Some((name, value)) => Self::valued(name, value),
            None => Self::flag(word),
        }
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.name, value),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapSet {
    caps: Vec<Capability>,
}

impl CapSet {
    pub fn new(caps: Vec<Capability>) -> Self {
        Self { caps }
    }

    /// Parses the space-separated capability list after the NUL of a v1
    /// advertisement line.
    pub fn parse(s: &str) -> Self {
        Self { caps: s.split_ascii_whitespace().map(Capability::parse).collect() }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.caps.iter().any(|cap| cap.name == name)
    }

    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.caps
            .iter()
            .find(|cap| cap.name == name)
            .and_then(|cap| cap.value.as_deref())
    }

    /// Values of every occurrence (symref can repeat).
    pub fn values_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.caps
            .iter()
            .filter(move |cap| cap.name == name)
            .filter_map(|cap| cap.value.as_deref())
    }

    pub fn push(&mut self, cap: Capability) {
        self.caps.push(cap);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.caps.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    /// The session capability set: everything the client can do that the
    /// server advertised, keeping the client's value for value-carrying
    /// capabilities (`agent`, `object-format`, ...).
    pub fn intersect(&self, client: &CapSet) -> CapSet {
        let caps = client
            .caps
            .iter()
            .filter(|cap| self.contains(&cap.name))
            .cloned()
            .collect();
        CapSet { caps }
    }

    pub fn to_line(&self) -> String {
        self.caps.iter().map(Capability::to_string).collect::<Vec<_>>().join(" ")
    }
}

/// Checks a negotiated object-format capability against the local one.
pub fn check_object_format(caps: &CapSet, local: crate::hash::HashAlgo) -> GitResult<()> {
    if let Some(format) = caps.value_of("object-format") {
        ensure!(
            format == local.name(),
            "remote uses object-format `{}` but this repository uses `{}`",
            format,
            local.name()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_print_caps() {
        let caps = CapSet::parse("multi_ack thin-pack agent=git/2.39 symref=HEAD:refs/heads/main");
        assert!(caps.contains("thin-pack"));
        assert_eq!(caps.value_of("agent"), Some("git/2.39"));
        assert_eq!(caps.value_of("symref"), Some("HEAD:refs/heads/main"));
        assert!(!caps.contains("no-such-cap"));
    }

    #[test]
    fn intersection_keeps_client_values() {
        let server = CapSet::parse("side-band-64k ofs-delta agent=git/2.39 object-format=sha1");
        let client = CapSet::parse("side-band-64k agent=ugit/0.1 object-format=sha1 thin-pack");
        let session = server.intersect(&client);
        assert!(session.contains("side-band-64k"));
        assert_eq!(session.value_of("agent"), Some("ugit/0.1"));
        // thin-pack was not advertised by the server
        assert!(!session.contains("thin-pack"));
        assert_eq!(session.to_line(), "side-band-64k agent=ugit/0.1 object-format=sha1");
    }
}
