use bitflags::bitflags;
use stratofs_castore::ObjectDigest;

bitflags! {
    /// Bits of the `flags` column of the catalog schema.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CatalogFlags: u32 {
        const DIRECTORY          = 0x01;
        const NESTED_MOUNTPOINT  = 0x02;
        const NESTED_ROOT        = 0x04;
        const FILE               = 0x08;
        const SYMLINK            = 0x10;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
}

/// Per-path metadata record, assembled from one catalog row.
///
/// The query layer is the only constructor site; everything else receives
/// entries fully built, with the inode already mangled by the catalog
/// manager ([DirectoryEntry::INVALID_INODE] until then).
#[derive(Clone, Debug, PartialEq)]
pub struct DirectoryEntry {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    /// Content digest; null for directories, symlinks and zero-length
    /// files.
    pub checksum: ObjectDigest,
    /// Expanded symlink target; empty unless `kind` is [EntryKind::Symlink].
    pub symlink_target: String,
    /// `(hardlink_group << 32) | linkcount`; `0` means one link, no group.
    pub hardlinks: u64,
    pub is_nested_root: bool,
    pub is_nested_mountpoint: bool,
    /// Assigned by the catalog manager once the owning catalog is active.
    pub inode: u64,
}

impl DirectoryEntry {
    pub const INVALID_INODE: u64 = 0;

    pub fn linkcount(&self) -> u32 {
        hardlinks_to_linkcount(self.hardlinks)
    }

    pub fn hardlink_group(&self) -> u32 {
        hardlinks_to_group(self.hardlinks)
    }

    /// The size reported to stat: symlinks report the length of their
    /// expanded target.
    pub fn stat_size(&self) -> u64 {
        match self.kind {
            EntryKind::Symlink => self.symlink_target.len() as u64,
            _ => self.size,
        }
    }

    /// Whether the two entries agree on the fields a nested-catalog root
    /// must share with its mountpoint.
    pub fn stat_matches(&self, other: &DirectoryEntry) -> bool {
        self.name == other.name
            && self.mode == other.mode
            && self.size == other.size
            && self.mtime == other.mtime
    }
}

/// The hardlinks field encodes the link count in the low 32 bit and the
/// hardlink group in the high 32 bit. A value of 0 means: one link, not
/// part of a group.
pub fn encode_hardlinks(group: u32, linkcount: u32) -> u64 {
    ((group as u64) << 32) | linkcount as u64
}

pub fn hardlinks_to_linkcount(hardlinks: u64) -> u32 {
    if hardlinks == 0 {
        return 1;
    }
    (hardlinks & 0xffff_ffff) as u32
}

pub fn hardlinks_to_group(hardlinks: u64) -> u32 {
    (hardlinks >> 32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardlink_encoding() {
        assert_eq!(1, hardlinks_to_linkcount(0));
        assert_eq!(0, hardlinks_to_group(0));

        let enc = encode_hardlinks(7, 3);
        assert_eq!(3, hardlinks_to_linkcount(enc));
        assert_eq!(7, hardlinks_to_group(enc));
    }

    #[test]
    fn flag_bits_match_schema() {
        assert_eq!(0x01, CatalogFlags::DIRECTORY.bits());
        assert_eq!(0x02, CatalogFlags::NESTED_MOUNTPOINT.bits());
        assert_eq!(0x04, CatalogFlags::NESTED_ROOT.bits());
        assert_eq!(0x08, CatalogFlags::FILE.bits());
        assert_eq!(0x10, CatalogFlags::SYMLINK.bits());
    }
}
