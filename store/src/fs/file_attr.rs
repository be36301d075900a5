#![allow(clippy::unnecessary_cast)] // libc::S_IFDIR is u32 on Linux and u16 on MacOS

use fuse_backend_rs::abi::fuse_abi::Attr;

use crate::dirent::{DirectoryEntry, EntryKind};

/// stat-shaped attributes for an entry, presented under the given inode
/// and owner.
pub fn entry_attr(entry: &DirectoryEntry, inode: u64, uid: u32, gid: u32) -> Attr {
    let type_bits = match entry.kind {
        EntryKind::Regular => libc::S_IFREG as u32,
        EntryKind::Directory => libc::S_IFDIR as u32,
        EntryKind::Symlink => libc::S_IFLNK as u32,
    };
    let mtime = entry.mtime.max(0) as u64;

    Attr {
        ino: inode,
        size: entry.stat_size(),
        blocks: 1 + entry.stat_size() / 512,
        blksize: 4096,
        mode: type_bits | (entry.mode & 0o7777),
        nlink: entry.linkcount(),
        uid,
        gid,
        atime: mtime,
        mtime,
        ctime: mtime,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::entry_attr;
    use crate::dirent::{encode_hardlinks, DirectoryEntry, EntryKind};
    use stratofs_castore::ObjectDigest;

    fn file_entry() -> DirectoryEntry {
        DirectoryEntry {
            name: "foo".into(),
            kind: EntryKind::Regular,
            mode: 0o755,
            uid: 0,
            gid: 0,
            size: 12345,
            mtime: 1700000000,
            checksum: ObjectDigest::of(b"foo"),
            symlink_target: String::new(),
            hardlinks: encode_hardlinks(0, 0),
            is_nested_root: false,
            is_nested_mountpoint: false,
            inode: 4711,
        }
    }

    #[test]
    fn attr_fields() {
        let attr = entry_attr(&file_entry(), 4711, 123, 456);
        assert_eq!(4711, attr.ino);
        assert_eq!(libc::S_IFREG as u32 | 0o755, attr.mode);
        assert_eq!(12345, attr.size);
        assert_eq!(1 + 12345 / 512, attr.blocks);
        assert_eq!(1700000000, attr.mtime);
        assert_eq!(1, attr.nlink);
        assert_eq!(123, attr.uid);
        assert_eq!(456, attr.gid);
    }

    #[test]
    fn symlink_size_is_target_length() {
        let mut entry = file_entry();
        entry.kind = EntryKind::Symlink;
        entry.symlink_target = "x86_64/lib".into();
        let attr = entry_attr(&entry, 1, 0, 0);
        assert_eq!("x86_64/lib".len() as u64, attr.size);
        assert_eq!(libc::S_IFLNK as u32 | 0o755, attr.mode);
    }
}
