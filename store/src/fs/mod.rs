//! The read path: filesystem operations mapped onto catalog queries,
//! object fetches and file-descriptor handouts.
//!
//! Every operation is a pure function of the current catalog tree and the
//! metadata caches, except `open`, which may fetch. The kernel binding is
//! a thin layer on top (see the `fuse` submodule); the methods here speak
//! `io::Result` with errno-shaped errors so both the binding and tests
//! drive the same code.

#[cfg(feature = "fuse")]
mod file_attr;
#[cfg(feature = "fuse")]
pub mod fuse;

use std::collections::HashMap;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use stratofs_castore::{FetchError, Fetcher, ObjectDigest, ObjectKind};

use crate::caches::{MetaCaches, PathLookup};
use crate::catalog::manager::{CatalogManager, ManagerError, ROOT_PATH};
use crate::dirent::{DirectoryEntry, EntryKind};
use crate::path_hash::{parent_path, PathHash};
use crate::settings::ClientSettings;

/// The kernel's root inode. Catalog inode ranges start above it.
pub const ROOT_ID: u64 = 1;

/// Extended attributes exposing provenance of an entry.
pub const XATTR_HASH: &[u8] = b"user.hash";
pub const XATTR_REVISION: &[u8] = b"user.revision";

struct FileHandle {
    digest: ObjectDigest,
    file: std::fs::File,
}

struct PathTable {
    generation: u64,
    paths: HashMap<u64, String>,
}

/// The filesystem adapter over one mounted repository.
pub struct StratoFs {
    mgr: Arc<CatalogManager>,
    fetcher: Arc<Fetcher>,
    caches: Arc<MetaCaches>,

    uid: u32,
    gid: u32,
    kcache_timeout: Duration,
    nfiles: u64,

    /// inode → absolute path, rebuilt per root generation. Lookups feed
    /// it; it is what turns a parent inode back into a path.
    paths: RwLock<PathTable>,

    file_handles: RwLock<HashMap<u64, Arc<FileHandle>>>,
    next_file_handle: AtomicU64,
}

impl StratoFs {
    pub fn new(
        mgr: Arc<CatalogManager>,
        fetcher: Arc<Fetcher>,
        caches: Arc<MetaCaches>,
        settings: &ClientSettings,
    ) -> Self {
        Self {
            mgr,
            fetcher,
            caches,
            uid: settings.uid,
            gid: settings.gid,
            kcache_timeout: settings.kcache_timeout,
            nfiles: settings.nfiles,
            paths: RwLock::new(PathTable {
                generation: 0,
                paths: HashMap::new(),
            }),
            file_handles: RwLock::new(HashMap::new()),
            next_file_handle: AtomicU64::new(1),
        }
    }

    pub fn kcache_timeout(&self) -> Duration {
        self.kcache_timeout
    }

    pub fn owner(&self) -> (u32, u32) {
        (self.uid, self.gid)
    }

    /// Drops path state of an older root generation. Called on entry of
    /// every operation so no request mixes two trees.
    fn sync_generation(&self) {
        let generation = self.mgr.generation();
        if self.paths.read().generation == generation {
            return;
        }
        let mut table = self.paths.write();
        if table.generation != generation {
            debug!(generation, "root generation changed, dropping path table");
            table.paths.clear();
            table.generation = generation;
        }
    }

    fn path_of(&self, inode: u64) -> io::Result<String> {
        if inode == ROOT_ID {
            return Ok(ROOT_PATH.to_string());
        }
        self.paths
            .read()
            .paths
            .get(&inode)
            .cloned()
            // the inode outlived the caches (or a root swap)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ESTALE))
    }

    fn remember_path(&self, inode: u64, path: String) {
        self.paths.write().paths.insert(inode, path);
    }

    /// Resolves `name` within the directory `parent`, filling the dentry,
    /// path and inode caches on the way.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn lookup(&self, parent: u64, name: &str) -> io::Result<DirectoryEntry> {
        self.sync_generation();
        if name.is_empty() || name.contains('/') || name.contains('\0') {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }

        let parent_path = self.path_of(parent)?;

        if let Some(inode) = self.caches.dentry.get(parent, name) {
            if let Some((entry, _)) = self.caches.inode.get(inode) {
                return Ok(entry);
            }
        }

        let path = format!("{}/{}", parent_path, name);
        let hash = PathHash::of(&path);

        match self.caches.path.get(&hash) {
            Some(PathLookup::Present(entry)) => {
                self.populate(parent, name, &path, &entry);
                return Ok(entry);
            }
            Some(PathLookup::Negative) => {
                return Err(io::Error::from_raw_os_error(libc::ENOENT));
            }
            None => {}
        }

        match self.mgr.lookup_path(&path).await {
            Ok(Some(entry)) => {
                self.caches.path.insert(hash, entry.clone());
                self.populate(parent, name, &path, &entry);
                Ok(entry)
            }
            Ok(None) => {
                self.caches.path.insert_negative(hash);
                Err(io::Error::from_raw_os_error(libc::ENOENT))
            }
            Err(e) => Err(manager_errno(e)),
        }
    }

    fn populate(&self, parent: u64, name: &str, path: &str, entry: &DirectoryEntry) {
        self.caches
            .inode
            .insert(entry.inode, entry.clone(), path.to_string());
        self.caches.dentry.insert(parent, name.to_string(), entry.inode);
        self.remember_path(entry.inode, path.to_string());
    }

    /// Attributes of an inode: metadata cache first, catalog row second.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn getattr(&self, inode: u64) -> io::Result<DirectoryEntry> {
        self.sync_generation();

        if inode == ROOT_ID {
            return match self.mgr.lookup_path(ROOT_PATH).await {
                Ok(Some(entry)) => Ok(entry),
                Ok(None) => Err(io::Error::from_raw_os_error(libc::ENOENT)),
                Err(e) => Err(manager_errno(e)),
            };
        }

        if let Some((entry, _)) = self.caches.inode.get(inode) {
            return Ok(entry);
        }

        match self.mgr.entry_by_inode(inode).await {
            Ok(Some(entry)) => {
                if let Ok(path) = self.path_of(inode) {
                    self.caches.inode.insert(inode, entry.clone(), path);
                }
                Ok(entry)
            }
            // no loaded catalog covers this inode anymore
            Ok(None) => Err(io::Error::from_raw_os_error(libc::ESTALE)),
            Err(e) => Err(manager_errno(e)),
        }
    }

    /// Directory listing in on-disk order, with `.` and `..` synthesized
    /// in front.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn readdir(&self, inode: u64) -> io::Result<Vec<(u64, EntryKind, String)>> {
        self.sync_generation();
        let path = self.path_of(inode)?;

        let listing = match self.mgr.listing(&path).await {
            Ok(Some(listing)) => listing,
            Ok(None) => return Err(io::Error::from_raw_os_error(libc::ENOTDIR)),
            Err(e) => return Err(manager_errno(e)),
        };

        let parent_inode = if path.is_empty() {
            ROOT_ID
        } else {
            let parent = parent_path(&path);
            if parent.is_empty() {
                ROOT_ID
            } else {
                match self.mgr.lookup_path(parent).await {
                    Ok(Some(entry)) => entry.inode,
                    _ => ROOT_ID,
                }
            }
        };

        let mut out = Vec::with_capacity(listing.len() + 2);
        out.push((inode, EntryKind::Directory, ".".to_string()));
        out.push((parent_inode, EntryKind::Directory, "..".to_string()));
        for entry in listing {
            out.push((entry.inode, entry.kind, entry.name));
        }
        Ok(out)
    }

    /// Makes the file's object locally available, pins it and hands out a
    /// descriptor-backed handle.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn open(&self, inode: u64) -> io::Result<u64> {
        self.sync_generation();
        let entry = self.getattr(inode).await?;
        match entry.kind {
            EntryKind::Regular => {}
            EntryKind::Directory | EntryKind::Symlink => {
                return Err(io::Error::from_raw_os_error(libc::EISDIR));
            }
        }

        if self.nfiles > 0 && self.file_handles.read().len() as u64 >= self.nfiles {
            warn!(nfiles = self.nfiles, "open file limit reached");
            return Err(io::Error::from_raw_os_error(libc::EMFILE));
        }

        let path = self
            .fetcher
            .fetch(&entry.checksum, ObjectKind::Blob)
            .await
            .map_err(fetch_errno)?;

        if let Err(e) = self.fetcher.quota().pin(&entry.checksum) {
            warn!(err=%e, "unable to pin object");
        }
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            // a concurrent insert may have evicted the object between the
            // fetch and this open; fetch once more
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let path = self
                    .fetcher
                    .fetch(&entry.checksum, ObjectKind::Blob)
                    .await
                    .map_err(fetch_errno)?;
                match std::fs::File::open(&path) {
                    Ok(file) => file,
                    Err(e) => {
                        let _ = self.fetcher.quota().unpin(&entry.checksum);
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                let _ = self.fetcher.quota().unpin(&entry.checksum);
                return Err(e);
            }
        };

        let fh = self.next_file_handle.fetch_add(1, Ordering::SeqCst);
        self.file_handles.write().insert(
            fh,
            Arc::new(FileHandle {
                digest: entry.checksum,
                file,
            }),
        );
        Ok(fh)
    }

    /// `pread` on the verified local object.
    pub fn read(&self, fh: u64, offset: u64, size: u32) -> io::Result<Vec<u8>> {
        let handle = self
            .file_handles
            .read()
            .get(&fh)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;

        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = handle.file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Closes the handle and releases the object's pin.
    pub fn release(&self, fh: u64) -> io::Result<()> {
        match self.file_handles.write().remove(&fh) {
            Some(handle) => {
                if let Err(e) = self.fetcher.quota().unpin(&handle.digest) {
                    warn!(err=%e, "unable to unpin object");
                }
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    /// The expanded symlink target.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn readlink(&self, inode: u64) -> io::Result<Vec<u8>> {
        let entry = self.getattr(inode).await?;
        match entry.kind {
            EntryKind::Symlink => Ok(entry.symlink_target.into_bytes()),
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    /// Provenance xattrs: the entry's content digest and the repository
    /// revision.
    pub async fn xattr(&self, inode: u64, name: &[u8]) -> io::Result<Option<Vec<u8>>> {
        if name == XATTR_HASH {
            let entry = self.getattr(inode).await?;
            if entry.checksum.is_null() {
                return Ok(None);
            }
            return Ok(Some(entry.checksum.to_hex().into_bytes()));
        }
        if name == XATTR_REVISION {
            return Ok(Some(self.mgr.revision().await.to_string().into_bytes()));
        }
        Ok(None)
    }

    /// Number of currently open file handles.
    pub fn open_files(&self) -> usize {
        self.file_handles.read().len()
    }
}

fn manager_errno(e: ManagerError) -> io::Error {
    match e {
        ManagerError::Fetch(FetchError::NoSpace) => io::Error::from_raw_os_error(libc::ENOSPC),
        // a subtree whose catalog cannot be loaded or verified reads as io
        // error; siblings stay functional
        e => {
            warn!(err=%e, "catalog access failed");
            io::Error::from_raw_os_error(libc::EIO)
        }
    }
}

fn fetch_errno(e: FetchError) -> io::Error {
    match e {
        FetchError::NoSpace => io::Error::from_raw_os_error(libc::ENOSPC),
        e => {
            warn!(err=%e, "object fetch failed");
            io::Error::from_raw_os_error(libc::EIO)
        }
    }
}
