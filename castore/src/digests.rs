use data_encoding::HEXLOWER;
use sha1::{Digest as _, Sha1};
use thiserror::Error;

/// Length in bytes of an [ObjectDigest].
pub const DIGEST_LEN: usize = 20;

/// Content digest of an object, taken over its *uncompressed* bytes.
/// Doubles as the object's address in the cache and on the wire.
///
/// The all-zero digest is reserved as a sentinel ("null digest"): it is
/// never produced by hashing and marks entries without content, e.g.
/// zero-length files.
#[derive(Clone, Copy, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectDigest([u8; DIGEST_LEN]);

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("invalid digest length: {0}")]
    InvalidDigestLen(usize),
    #[error("invalid hex digest: {0}")]
    InvalidHexDigest(String),
}

impl ObjectDigest {
    /// The null digest, distinguishable from every real digest.
    pub const NULL: ObjectDigest = ObjectDigest([0u8; DIGEST_LEN]);

    /// Digest of the given bytes.
    pub fn of(data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data.as_ref());
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Parses the canonical lowercase hex form. Rejects wrong lengths and
    /// non-hex input; uppercase hex is not canonical and is rejected too.
    pub fn from_hex(hex: &str) -> Result<Self, Error> {
        if hex.len() != DIGEST_LEN * 2 {
            return Err(Error::InvalidDigestLen(hex.len()));
        }
        let mut bytes = [0u8; DIGEST_LEN];
        HEXLOWER
            .decode_mut(hex.as_bytes(), &mut bytes)
            .map_err(|_| Error::InvalidHexDigest(hex.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; DIGEST_LEN]
    }
}

/// Equality does not short-circuit, so comparing an attacker-supplied
/// digest against a computed one does not leak the matching prefix length
/// through timing.
impl PartialEq for ObjectDigest {
    fn eq(&self, other: &Self) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl TryFrom<&[u8]> for ObjectDigest {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; DIGEST_LEN] = value
            .try_into()
            .map_err(|_| Error::InvalidDigestLen(value.len()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<Vec<u8>> for ObjectDigest {
    type Error = Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        value.as_slice().try_into()
    }
}

impl From<&[u8; DIGEST_LEN]> for ObjectDigest {
    fn from(value: &[u8; DIGEST_LEN]) -> Self {
        Self(*value)
    }
}

impl std::fmt::Display for ObjectDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for ObjectDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectDigest({})", self.to_hex())
    }
}
