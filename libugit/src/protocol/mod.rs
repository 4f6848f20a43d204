//! The smart-protocol engine: advertisement parsing, the fetch and push
//! client state machines, and the server side of upload-pack and
//! receive-pack (protocol v1 and v2).

pub mod caps;
pub mod fetch;
pub mod push;
pub mod receive_pack;
pub mod upload_pack;

pub use caps::{CapSet, Capability};

use crate::error::{GitError, GitResult};
use crate::hash::Oid;
use crate::pkt::Frame;
use crate::transport::Service;
use std::str::FromStr;

pub const AGENT: &str = "agent=ugit/0.1";
/// the ref advertised by an empty repository
const CAPABILITIES_REF: &str = "capabilities^{}";

/// A parsed ref/capability advertisement (either protocol version).
#[derive(Debug, Default)]
pub struct Advertised {
    pub version: u8,
    /// v1: `<oid> <refname>`, peeled `^{}` entries included
    pub refs: Vec<(Oid, String)>,
    pub caps: CapSet,
    /// v2: the capability advertisement (`ls-refs`, `fetch=shallow`, ...)
    pub v2_caps: CapSet,
}

impl Advertised {
    pub fn parse(frames: Vec<Frame>, _service: Service) -> GitResult<Self> {
        let mut adv = Advertised { version: 1, ..Default::default() };
        let mut lines = frames.into_iter();
        let first = match lines.next() {
            Some(frame) => frame.text()?,
            None => return Ok(adv),
        };

        if first == "version 2" {
            adv.version = 2;
            for frame in lines {
                match frame {
                    Frame::Data(..) => adv.v2_caps.push(Capability::parse(&frame.text()?)),
                    Frame::Flush | Frame::End => break,
                    Frame::Delim => bail!(GitError::corrupt("delimiter in v2 advertisement")),
                }
            }
            return Ok(adv);
        }

        // v1: first line carries the capability list after a NUL
        let first = if first == "version 1" {
            match lines.next() {
                Some(frame) => frame.text()?,
                None => return Ok(adv),
            }
        } else {
            first
        };
        adv.parse_v1_first_line(&first)?;
        for frame in lines {
            match frame {
                Frame::Data(..) => {
                    let line = frame.text()?;
                    let (oid, name) = line
                        .split_once(' ')
                        .ok_or_else(|| GitError::corrupt(format!("ref line `{}`", line)))?;
                    adv.refs.push((Oid::from_str(oid)?, name.to_owned()));
                }
                Frame::Flush | Frame::End => break,
                Frame::Delim => bail!(GitError::corrupt("delimiter in v1 advertisement")),
            }
        }
        Ok(adv)
    }

    fn parse_v1_first_line(&mut self, line: &str) -> GitResult<()> {
        let (refline, caps) = match line.split_once('\0') {
            Some((refline, caps)) => (refline, caps),
            None => (line, ""),
        };
        self.caps = CapSet::parse(caps);
        let (oid, name) = refline
            .split_once(' ')
            .ok_or_else(|| GitError::corrupt(format!("ref line `{}`", line)))?;
        let oid = Oid::from_str(oid)?;
        // an empty repository advertises a zero capabilities^{} placeholder
        if !(oid.is_zero() && name == CAPABILITIES_REF) {
            self.refs.push((oid, name.to_owned()));
        }
        Ok(())
    }

    pub fn find_ref(&self, name: &str) -> Option<Oid> {
        self.refs.iter().find(|(_, n)| n == name).map(|&(oid, _)| oid)
    }

    /// The branch HEAD points at, from the `symref` capability.
    pub fn head_symref(&self) -> Option<&str> {
        self.caps
            .values_of("symref")
            .chain(self.v2_caps.values_of("symref"))
            .find_map(|value| value.strip_prefix("HEAD:"))
    }

    pub fn is_empty_repo(&self) -> bool {
        self.refs.is_empty()
    }
}

/// The per-ref status a receive-pack session reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum RefStatus {
    Ok(String),
    Rejected { name: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkt;

    fn data(s: &str) -> Frame {
        Frame::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parse_v1_advertisement() -> GitResult<()> {
        let frames = vec![
            data("d1e8c9caa30a97152e5e6e4f58758b11c4e19f19 HEAD\0multi_ack side-band-64k symref=HEAD:refs/heads/main agent=git/2.39\n"),
            data("d1e8c9caa30a97152e5e6e4f58758b11c4e19f19 refs/heads/main\n"),
            Frame::Flush,
        ];
        let adv = Advertised::parse(frames, Service::UploadPack)?;
        assert_eq!(adv.version, 1);
        assert_eq!(adv.refs.len(), 2);
        assert_eq!(adv.head_symref(), Some("refs/heads/main"));
        assert!(adv.caps.contains("side-band-64k"));
        assert!(adv.find_ref("refs/heads/main").is_some());
        Ok(())
    }

    #[test]
    fn parse_empty_repo_advertisement() -> GitResult<()> {
        let zero = "0".repeat(40);
        let frames = vec![
            data(&format!("{} capabilities^{{}}\0report-status agent=git/2.39\n", zero)),
            Frame::Flush,
        ];
        let adv = Advertised::parse(frames, Service::ReceivePack)?;
        assert!(adv.is_empty_repo());
        assert!(adv.caps.contains("report-status"));
        Ok(())
    }

    #[test]
    fn parse_v2_advertisement() -> GitResult<()> {
        let frames = vec![
            data("version 2\n"),
            data("agent=git/2.39\n"),
            data("ls-refs\n"),
            data("fetch=shallow\n"),
            Frame::Flush,
        ];
        let adv = Advertised::parse(frames, Service::UploadPack)?;
        assert_eq!(adv.version, 2);
        assert!(adv.v2_caps.contains("ls-refs"));
        assert_eq!(adv.v2_caps.value_of("fetch"), Some("shallow"));
        Ok(())
    }

    #[test]
    fn sideband_frames_roundtrip() -> GitResult<()> {
        // a quick check that band-framing splits at the payload limit
        let mut out = vec![];
        pkt::encode(&mut out, &[1u8])?;
        assert_eq!(out, b"00051");
        Ok(())
    }
}
