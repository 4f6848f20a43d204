use crate::error::{GitGenericError, GitResult};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

pub const SHA1_SIZE: usize = 20;
pub const SHA256_SIZE: usize = 32;
/// Large enough for either algorithm; an [`Oid`] is always this wide on the
/// stack with `len` tracking the live prefix.
pub const MAX_OID_SIZE: usize = 32;

/// The hash algorithm in effect for a repository (`extensions.objectformat`).
/// Exactly one algorithm is in effect per repository.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HashAlgo {
    Sha1,
    Sha256,
}

impl Default for HashAlgo {
    fn default() -> Self {
        HashAlgo::Sha1
    }
}

impl HashAlgo {
    pub fn oid_size(self) -> usize {
        match self {
            HashAlgo::Sha1 => SHA1_SIZE,
            HashAlgo::Sha256 => SHA256_SIZE,
        }
    }

    pub fn hex_size(self) -> usize {
        2 * self.oid_size()
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Sha256 => "sha256",
        }
    }

    pub fn from_name(name: &str) -> GitResult<Self> {
        match name {
            "sha1" => Ok(HashAlgo::Sha1),
            "sha256" => Ok(HashAlgo::Sha256),
            _ => bail!("unknown object format `{}`", name),
        }
    }

    pub fn zero_oid(self) -> Oid {
        Oid::zero(self)
    }

    /// The oid of the empty blob; derivable without consulting storage.
    pub fn empty_blob(self) -> Oid {
        self.hash_bytes(b"blob 0\0")
    }

    /// The oid of the empty tree; derivable without consulting storage.
    pub fn empty_tree(self) -> Oid {
        self.hash_bytes(b"tree 0\0")
    }

    pub fn hash_bytes(self, bytes: impl AsRef<[u8]>) -> Oid {
        let mut hasher = self.hasher();
        hasher.update(bytes.as_ref());
        hasher.finalize()
    }

    pub fn hasher(self) -> Hasher {
        match self {
            HashAlgo::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgo::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }
}

/// Incremental hasher over the repository algorithm.
pub enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Sha1(hasher) => hasher.update(bytes),
            Hasher::Sha256(hasher) => hasher.update(bytes),
        }
    }

    pub fn finalize(self) -> Oid {
        match self {
            Hasher::Sha1(hasher) => Oid::from_bytes(hasher.finalize().as_slice()).unwrap(),
            Hasher::Sha256(hasher) => Oid::from_bytes(hasher.finalize().as_slice()).unwrap(),
        }
    }

    pub fn finalize_reset(&mut self) -> Oid {
        match self {
            Hasher::Sha1(hasher) => Oid::from_bytes(hasher.finalize_reset().as_slice()).unwrap(),
            Hasher::Sha256(hasher) => Oid::from_bytes(hasher.finalize_reset().as_slice()).unwrap(),
        }
    }

    pub fn algo(&self) -> HashAlgo {
        match self {
            Hasher::Sha1(..) => HashAlgo::Sha1,
            Hasher::Sha256(..) => HashAlgo::Sha256,
        }
    }
}

/// An object identity: the raw digest bytes of the wrapped object.
///
/// Invariant: `bytes[len..]` is zeroed, so the derived `Eq`/`Ord`/`Hash` are
/// consistent with comparing only the live prefix (oids of different widths
/// are never compared within one repository).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid {
    bytes: [u8; MAX_OID_SIZE],
    len: u8,
}

impl Oid {
    pub fn from_bytes(bytes: &[u8]) -> GitResult<Self> {
        ensure!(
            bytes.len() == SHA1_SIZE || bytes.len() == SHA256_SIZE,
            "invalid oid length `{}`",
            bytes.len()
        );
        let mut buf = [0; MAX_OID_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self { bytes: buf, len: bytes.len() as u8 })
    }

    pub fn zero(algo: HashAlgo) -> Self {
        Self { bytes: [0; MAX_OID_SIZE], len: algo.oid_size() as u8 }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn algo(&self) -> HashAlgo {
        match self.len as usize {
            SHA1_SIZE => HashAlgo::Sha1,
            SHA256_SIZE => HashAlgo::Sha256,
            _ => unreachable!("oid with invalid length"),
        }
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }

    #[inline]
    pub fn is_known(&self) -> bool {
        !self.is_zero()
    }

    /// The first byte, used by pack index fanout tables.
    #[inline]
    pub fn first_byte(&self) -> u8 {
        self.bytes[0]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    pub fn short(&self) -> String {
        self.to_hex()[0..7].to_owned()
    }

    /// Splits the hex representation into the loose-object (directory, file)
    /// pair `objects/xx/yyyy...`.
    pub fn split(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[0..2].to_owned(), hex[2..].to_owned())
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.to_hex().starts_with(prefix)
    }
}

impl FromStr for Oid {
    type Err = GitGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_end();
        ensure!(
            s.len() == 2 * SHA1_SIZE || s.len() == 2 * SHA256_SIZE,
            "invalid oid hex string `{}` (incorrect length)",
            s
        );
        let bytes = hex::decode(s)?;
        Self::from_bytes(&bytes)
    }
}

impl AsRef<[u8]> for Oid {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl Debug for Oid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for Oid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        if f.alternate() { write!(f, "{}", &hex[..7]) } else { write!(f, "{}", hex) }
    }
}

#[cfg(test)]
impl<'a> From<&'a str> for Oid {
    fn from(s: &'a str) -> Self {
        Self::from_str(s).unwrap()
    }
}

#[cfg(test)]
impl quickcheck::Arbitrary for Oid {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let bytes = (0..SHA1_SIZE).map(|_| u8::arbitrary(g)).collect::<Vec<_>>();
        Self::from_bytes(&bytes).unwrap()
    }
}

pub fn crc_of(bytes: impl AsRef<[u8]>) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes.as_ref());
    hasher.finalize()
}
