//! Kernel-facing binding of [StratoFs].
//!
//! Implements the filesystem-in-userspace server traits; each callback
//! bridges onto the async read path with a stored runtime handle. Mounting
//! and session management live with the caller.

use std::ffi::CStr;
use std::io::{self, Cursor};
use std::sync::Arc;
use std::time::Duration;

use fuse_backend_rs::abi::fuse_abi::{stat64, OpenOptions};
use fuse_backend_rs::api::filesystem::{
    Context, Entry, FileSystem, FsOptions, GetxattrReply, ListxattrReply, ZeroCopyWriter, ROOT_ID,
};
use tracing::debug;

use super::file_attr::entry_attr;
use super::StratoFs;
use crate::dirent::EntryKind;

pub struct StratoFuse {
    fs: Arc<StratoFs>,
    tokio_handle: tokio::runtime::Handle,
}

impl StratoFuse {
    /// Must be constructed within a tokio runtime; the filesystem worker
    /// threads block on it.
    pub fn new(fs: Arc<StratoFs>) -> Self {
        Self {
            fs,
            tokio_handle: tokio::runtime::Handle::current(),
        }
    }

    fn entry_reply(&self, entry: &crate::dirent::DirectoryEntry, inode: u64) -> Entry {
        let (uid, gid) = self.fs.owner();
        Entry {
            inode,
            attr: entry_attr(entry, inode, uid, gid).into(),
            attr_timeout: self.fs.kcache_timeout(),
            entry_timeout: self.fs.kcache_timeout(),
            ..Default::default()
        }
    }
}

fn dirent_type(kind: EntryKind) -> u32 {
    match kind {
        EntryKind::Regular => libc::DT_REG as u32,
        EntryKind::Directory => libc::DT_DIR as u32,
        EntryKind::Symlink => libc::DT_LNK as u32,
    }
}

impl FileSystem for StratoFuse {
    type Handle = u64;
    type Inode = u64;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    #[tracing::instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn lookup(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<Entry> {
        debug!("lookup");
        let name = name
            .to_str()
            .map_err(|_| io::Error::from_raw_os_error(libc::ENOENT))?;
        let entry = self
            .tokio_handle
            .block_on(self.fs.lookup(parent, name))?;
        Ok(self.entry_reply(&entry, entry.inode))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn getattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Option<Self::Handle>,
    ) -> io::Result<(stat64, Duration)> {
        let entry = self.tokio_handle.block_on(self.fs.getattr(inode))?;
        let (uid, gid) = self.fs.owner();
        Ok((
            entry_attr(&entry, inode, uid, gid).into(),
            self.fs.kcache_timeout(),
        ))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn opendir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        // listings are produced per readdir call, no directory handle
        // state to keep
        Ok((None, OpenOptions::empty()))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset))]
    fn readdir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(fuse_backend_rs::api::filesystem::DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        debug!("readdir");
        let entries = self.tokio_handle.block_on(self.fs.readdir(inode))?;

        for (i, (ino, kind, name)) in entries.into_iter().skip(offset as usize).enumerate() {
            // the second parameter will become the "offset" parameter on
            // the next call
            let written = add_entry(fuse_backend_rs::api::filesystem::DirEntry {
                ino,
                offset: offset + (i as u64) + 1,
                type_: dirent_type(kind),
                name: name.as_bytes(),
            })?;
            // a full buffer shows as `Ok(0)`
            if written == 0 {
                break;
            }
        }
        Ok(())
    }

    fn releasedir(
        &self,
        _ctx: &Context,
        _inode: Self::Inode,
        _flags: u32,
        _handle: Self::Handle,
    ) -> io::Result<()> {
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn open(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        if inode == ROOT_ID {
            return Err(io::Error::from_raw_os_error(libc::EISDIR));
        }
        let fh = self.tokio_handle.block_on(self.fs.open(inode))?;
        Ok((Some(fh), OpenOptions::empty()))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.handle = handle, rq.offset = offset, rq.size = size))]
    fn read(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        let buf = self.fs.read(handle, offset, size)?;
        let buf_len = buf.len() as u64;
        let written = io::copy(&mut Cursor::new(buf), w)?;
        if written != buf_len {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        Ok(written as usize)
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.handle = handle))]
    fn release(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        handle: Self::Handle,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        self.fs.release(handle)
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn readlink(&self, _ctx: &Context, inode: Self::Inode) -> io::Result<Vec<u8>> {
        self.tokio_handle.block_on(self.fs.readlink(inode))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, name = ?name))]
    fn getxattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        name: &CStr,
        size: u32,
    ) -> io::Result<GetxattrReply> {
        let value = self
            .tokio_handle
            .block_on(self.fs.xattr(inode, name.to_bytes()))?
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODATA))?;

        if size == 0 {
            Ok(GetxattrReply::Count(value.len() as u32))
        } else if size < value.len() as u32 {
            Err(io::Error::from_raw_os_error(libc::ERANGE))
        } else {
            Ok(GetxattrReply::Value(value))
        }
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn listxattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        size: u32,
    ) -> io::Result<ListxattrReply> {
        let mut names = Vec::new();
        names.extend_from_slice(super::XATTR_HASH);
        names.push(0);
        names.extend_from_slice(super::XATTR_REVISION);
        names.push(0);

        if size == 0 {
            Ok(ListxattrReply::Count(names.len() as u32))
        } else if size < names.len() as u32 {
            Err(io::Error::from_raw_os_error(libc::ERANGE))
        } else {
            Ok(ListxattrReply::Names(names))
        }
    }
}
