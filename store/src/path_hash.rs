use md5::{Digest as _, Md5};

/// 128-bit hash of an absolute repository path, the primary key of catalog
/// entries. Kept as the two 64-bit halves the catalog schema stores
/// (`md5path_1`, `md5path_2`).
///
/// Paths are rooted at the repository and carry a leading slash; the
/// repository root itself is the empty string.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathHash {
    pub half1: u64,
    pub half2: u64,
}

impl PathHash {
    pub fn of(path: &str) -> Self {
        let digest: [u8; 16] = Md5::digest(path.as_bytes()).into();
        Self::from_bytes(digest)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self {
            half1: u64::from_le_bytes(bytes[..8].try_into().unwrap()),
            half2: u64::from_le_bytes(bytes[8..].try_into().unwrap()),
        }
    }

    /// Halves as signed integers, the way SQLite stores them.
    pub fn to_columns(&self) -> (i64, i64) {
        (self.half1 as i64, self.half2 as i64)
    }

    pub fn from_columns(half1: i64, half2: i64) -> Self {
        Self {
            half1: half1 as u64,
            half2: half2 as u64,
        }
    }

    pub fn to_hex(&self) -> String {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.half1.to_le_bytes());
        bytes[8..].copy_from_slice(&self.half2.to_le_bytes());
        data_encoding::HEXLOWER.encode(&bytes)
    }

    /// Parses the hex form used in the manifest's root-prefix field.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        data_encoding::HEXLOWER
            .decode_mut(hex.as_bytes(), &mut bytes)
            .ok()?;
        Some(Self::from_bytes(bytes))
    }
}

impl std::fmt::Debug for PathHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PathHash({})", self.to_hex())
    }
}

/// The parent of an absolute repository path; the root's parent is the
/// root itself.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}
