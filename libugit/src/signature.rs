use crate::error::{GitGenericError, GitResult};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// UNIX seconds plus a signed minute offset from UTC, as embedded in commit
/// and tag headers.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, PartialOrd, Ord)]
pub struct GitTime {
    pub seconds: i64,
    /// timezone offset in minutes
    pub offset: i32,
}

impl GitTime {
    pub fn new(seconds: i64, offset: i32) -> Self {
        Self { seconds, offset }
    }

    pub fn now() -> Self {
        // fixed time under test so object ids are deterministic between runs
        if cfg!(test) {
            Self { seconds: 0, offset: 0 }
        } else {
            let now = chrono::offset::Local::now();
            Self { seconds: now.timestamp(), offset: now.offset().local_minus_utc() / 60 }
        }
    }
}

impl FromStr for GitTime {
    type Err = GitGenericError;

    // `1616061862 +1300`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (seconds, tz) =
            s.trim().split_once(' ').ok_or_else(|| anyhow!("malformed timestamp `{}`", s))?;
        let seconds = seconds.parse()?;
        ensure!(tz.len() == 5, "malformed timezone `{}`", tz);
        let sign = match &tz[0..1] {
            "+" => 1,
            "-" => -1,
            _ => bail!("malformed timezone sign in `{}`", tz),
        };
        let hours: i32 = tz[1..3].parse()?;
        let minutes: i32 = tz[3..5].parse()?;
        Ok(Self { seconds, offset: sign * (minutes + hours * 60) })
    }
}

impl Display for GitTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let sign = if self.offset >= 0 { '+' } else { '-' };
        let offset = self.offset.abs();
        write!(f, "{} {}{:02}{:02}", self.seconds, sign, offset / 60, offset % 60)
    }
}

#[derive(PartialEq, Eq, Clone, Debug, Hash)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub time: GitTime,
}

impl Signature {
    pub fn new(name: impl Into<String>, email: impl Into<String>, time: GitTime) -> Self {
        Self { name: name.into(), email: email.into(), time }
    }

    pub fn now(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self::new(name, email, GitTime::now())
    }
}

impl FromStr for Signature {
    type Err = GitGenericError;

    // `A U Thor <author@example.com> 1616061862 +1300`
    fn from_str(s: &str) -> GitResult<Self> {
        let email_start = s.find('<').ok_or_else(|| anyhow!("malformed signature `{}`", s))?;
        let email_end = s.find('>').ok_or_else(|| anyhow!("malformed signature `{}`", s))?;
        ensure!(email_start < email_end, "malformed signature `{}`", s);
        let name = s[..email_start].trim_end().to_owned();
        let email = s[email_start + 1..email_end].to_owned();
        let time = s[email_end + 1..].trim_start().parse()?;
        Ok(Self { name, email, time })
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}> {}", self.name, self.email, self.time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_signature() -> GitResult<()> {
        let s = "A U Thor <author@example.com> 1616061862 +1300";
        let sig: Signature = s.parse()?;
        assert_eq!(sig.name, "A U Thor");
        assert_eq!(sig.email, "author@example.com");
        assert_eq!(sig.time, GitTime::new(1616061862, 13 * 60));
        assert_eq!(sig.to_string(), s);
        Ok(())
    }

    #[test]
    fn negative_timezone_roundtrip() -> GitResult<()> {
        let s = "A <a@b> 1577836800 -0430";
        let sig: Signature = s.parse()?;
        assert_eq!(sig.time.offset, -(4 * 60 + 30));
        assert_eq!(sig.to_string(), s);
        Ok(())
    }
}
