//! Bounded in-memory metadata caches.
//!
//! Three independent LRU caches sit in front of the catalog layer: by
//! inode, by path hash and by name-within-parent (the dentry cache). All
//! of them are dropped wholesale whenever the trusted root catalog
//! changes, so no operation can observe a mix of two revisions.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::dirent::DirectoryEntry;
use crate::path_hash::PathHash;

/// Default TTL of cached negative lookups.
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheCounters {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// inode → (entry, absolute path). The path rides along so the adapter
/// can reconstruct child paths without a reverse hash lookup.
pub struct InodeCache {
    inner: Mutex<LruCache<u64, (DirectoryEntry, String)>>,
    pub counters: CacheCounters,
}

impl InodeCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            counters: CacheCounters::default(),
        }
    }

    pub fn get(&self, inode: u64) -> Option<(DirectoryEntry, String)> {
        match self.inner.lock().get(&inode).cloned() {
            Some(found) => {
                self.counters.hit();
                Some(found)
            }
            None => {
                self.counters.miss();
                None
            }
        }
    }

    pub fn insert(&self, inode: u64, entry: DirectoryEntry, path: String) {
        self.inner.lock().put(inode, (entry, path));
    }

    pub fn drop_all(&self) {
        self.inner.lock().clear();
    }
}

/// Cached outcome of a path-hash lookup. Negative outcomes are kept too,
/// tagged instead of sentinel-valued, and expire on their own TTL.
#[derive(Clone)]
enum PathCacheSlot {
    Present(DirectoryEntry),
    Negative { inserted: Instant },
}

pub struct PathCache {
    inner: Mutex<LruCache<PathHash, PathCacheSlot>>,
    negative_ttl: Duration,
    pub counters: CacheCounters,
}

/// A path cache hit: either the entry, or a still-fresh negative.
pub enum PathLookup {
    Present(DirectoryEntry),
    Negative,
}

impl PathCache {
    pub fn new(capacity: NonZeroUsize, negative_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            negative_ttl,
            counters: CacheCounters::default(),
        }
    }

    pub fn get(&self, hash: &PathHash) -> Option<PathLookup> {
        let mut inner = self.inner.lock();
        match inner.get(hash).cloned() {
            Some(PathCacheSlot::Present(entry)) => {
                self.counters.hit();
                Some(PathLookup::Present(entry))
            }
            Some(PathCacheSlot::Negative { inserted }) => {
                if inserted.elapsed() < self.negative_ttl {
                    self.counters.hit();
                    Some(PathLookup::Negative)
                } else {
                    inner.pop(hash);
                    self.counters.miss();
                    None
                }
            }
            None => {
                self.counters.miss();
                None
            }
        }
    }

    pub fn insert(&self, hash: PathHash, entry: DirectoryEntry) {
        self.inner.lock().put(hash, PathCacheSlot::Present(entry));
    }

    pub fn insert_negative(&self, hash: PathHash) {
        self.inner.lock().put(
            hash,
            PathCacheSlot::Negative {
                inserted: Instant::now(),
            },
        );
    }

    pub fn drop_all(&self) {
        self.inner.lock().clear();
    }
}

/// (parent inode, name) → child inode.
pub struct DentryCache {
    inner: Mutex<LruCache<(u64, String), u64>>,
    pub counters: CacheCounters,
}

impl DentryCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            counters: CacheCounters::default(),
        }
    }

    pub fn get(&self, parent: u64, name: &str) -> Option<u64> {
        match self.inner.lock().get(&(parent, name.to_string())).copied() {
            Some(ino) => {
                self.counters.hit();
                Some(ino)
            }
            None => {
                self.counters.miss();
                None
            }
        }
    }

    pub fn insert(&self, parent: u64, name: String, inode: u64) {
        self.inner.lock().put((parent, name), inode);
    }

    pub fn drop_all(&self) {
        self.inner.lock().clear();
    }
}

/// The three caches, sized independently at construction.
pub struct MetaCaches {
    pub inode: InodeCache,
    pub path: PathCache,
    pub dentry: DentryCache,
}

impl MetaCaches {
    pub fn new(inode_capacity: usize, path_capacity: usize, dentry_capacity: usize) -> Self {
        Self {
            inode: InodeCache::new(bounded(inode_capacity)),
            path: PathCache::new(bounded(path_capacity), DEFAULT_NEGATIVE_TTL),
            dentry: DentryCache::new(bounded(dentry_capacity)),
        }
    }

    /// Wholesale invalidation, used when the root catalog digest changes.
    pub fn drop_all(&self) {
        self.inode.drop_all();
        self.path.drop_all();
        self.dentry.drop_all();
    }
}

fn bounded(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity.max(1)).unwrap()
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::time::Duration;

    use super::{DentryCache, InodeCache, MetaCaches, PathCache, PathLookup};
    use crate::dirent::{DirectoryEntry, EntryKind};
    use crate::path_hash::PathHash;
    use stratofs_castore::ObjectDigest;

    fn entry(name: &str) -> DirectoryEntry {
        DirectoryEntry {
            name: name.to_string(),
            kind: EntryKind::Regular,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: 1,
            mtime: 0,
            checksum: ObjectDigest::NULL,
            symlink_target: String::new(),
            hardlinks: 0,
            is_nested_root: false,
            is_nested_mountpoint: false,
            inode: DirectoryEntry::INVALID_INODE,
        }
    }

    #[test]
    fn inode_cache_evicts_least_recently_used() {
        let cache = InodeCache::new(NonZeroUsize::new(2).unwrap());
        cache.insert(1, entry("a"), "/a".into());
        cache.insert(2, entry("b"), "/b".into());

        // touch 1, then insert a third element: 2 must go
        assert!(cache.get(1).is_some());
        cache.insert(3, entry("c"), "/c".into());

        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn negative_entries_expire() {
        let cache = PathCache::new(
            NonZeroUsize::new(8).unwrap(),
            Duration::from_millis(10),
        );
        let hash = PathHash::of("/missing");
        cache.insert_negative(hash);

        match cache.get(&hash) {
            Some(PathLookup::Negative) => {}
            _ => panic!("fresh negative entry expected"),
        }

        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&hash).is_none());
    }

    #[test]
    fn dentry_cache_maps_names() {
        let cache = DentryCache::new(NonZeroUsize::new(4).unwrap());
        cache.insert(1, "bin".into(), 256);
        assert_eq!(Some(256), cache.get(1, "bin"));
        assert_eq!(None, cache.get(1, "lib"));
        assert_eq!(None, cache.get(2, "bin"));
    }

    #[test]
    fn drop_all_empties_everything() {
        let caches = MetaCaches::new(4, 4, 4);
        caches.inode.insert(1, entry("a"), "/a".into());
        caches.path.insert(PathHash::of("/a"), entry("a"));
        caches.dentry.insert(1, "a".into(), 2);

        caches.drop_all();

        assert!(caches.inode.get(1).is_none());
        assert!(caches.path.get(&PathHash::of("/a")).is_none());
        assert_eq!(None, caches.dentry.get(1, "a"));
    }
}
