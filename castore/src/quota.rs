use std::{
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument, warn};

use crate::{Error, ObjectDigest, ObjectStore};

/// How many eviction candidates are pulled from the index per pass.
const EVICT_BATCH: usize = 64;

/// Accounts all committed objects and enforces a byte budget over the
/// object store with least-recently-used eviction.
///
/// The index lives in a SQLite file next to the cache so the LRU ordering
/// and the accounted total survive restarts. Access recency is a monotone
/// sequence number rather than a wall clock, which keeps the eviction order
/// total (ties are broken by digest). Pins are runtime state and are
/// cleared on startup.
///
/// All mutating operations serialize through one writer lock; the accounted
/// total is published as an atomic snapshot for lock-free readers.
pub struct QuotaManager {
    store: Arc<ObjectStore>,
    limit: u64,
    threshold: u64,
    total: AtomicU64,
    evict_failures: AtomicU64,
    inner: Mutex<Inner>,
}

struct Inner {
    conn: Connection,
    acseq: i64,
}

impl QuotaManager {
    /// Opens (or creates) the index for the given store. `limit` of zero
    /// disables eviction; `threshold` is the level eviction drains down to,
    /// typically half the limit.
    pub fn open(store: Arc<ObjectStore>, limit: u64, threshold: u64) -> Result<Self, Error> {
        let conn = Connection::open(store.root().join("quota_index.db"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS objects \
             (digest TEXT, size INTEGER NOT NULL, acseq INTEGER NOT NULL, \
              pinned INTEGER NOT NULL DEFAULT 0, \
              CONSTRAINT pk_objects PRIMARY KEY (digest)); \
             CREATE INDEX IF NOT EXISTS idx_objects_acseq ON objects (acseq); \
             CREATE TABLE IF NOT EXISTS properties (key TEXT, value TEXT, \
              CONSTRAINT pk_properties PRIMARY KEY (key)); \
             INSERT OR REPLACE INTO properties (key, value) VALUES ('schema', '1.0'); \
             UPDATE objects SET pinned = 0;",
        )?;

        let total: i64 =
            conn.query_row("SELECT coalesce(sum(size), 0) FROM objects;", [], |row| {
                row.get(0)
            })?;
        let acseq: i64 =
            conn.query_row("SELECT coalesce(max(acseq), 0) FROM objects;", [], |row| {
                row.get(0)
            })?;

        Ok(Self {
            store,
            limit,
            threshold,
            total: AtomicU64::new(total as u64),
            evict_failures: AtomicU64::new(0),
            inner: Mutex::new(Inner { conn, acseq }),
        })
    }

    /// Currently accounted bytes.
    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Unlink failures seen during eviction so far.
    pub fn evict_failures(&self) -> u64 {
        self.evict_failures.load(Ordering::Relaxed)
    }

    /// Records a freshly committed object. If the accounted total exceeds
    /// the limit, unpinned objects are evicted in LRU order until the total
    /// is at or below the threshold.
    #[instrument(skip_all, fields(object.digest=%digest, object.size=size))]
    pub fn on_insert(&self, digest: &ObjectDigest, size: u64) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        inner.acseq += 1;
        let seq = inner.acseq;

        let prev: Option<i64> = inner
            .conn
            .query_row(
                "SELECT size FROM objects WHERE digest = ?1;",
                params![digest.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        match prev {
            Some(prev_size) => {
                // re-insert of a known object, adjust accounting only
                inner.conn.execute(
                    "UPDATE objects SET size = ?2, acseq = ?3 WHERE digest = ?1;",
                    params![digest.to_hex(), size as i64, seq],
                )?;
                self.total
                    .fetch_sub(prev_size as u64, Ordering::Relaxed);
                self.total.fetch_add(size, Ordering::Relaxed);
            }
            None => {
                inner.conn.execute(
                    "INSERT INTO objects (digest, size, acseq, pinned) VALUES (?1, ?2, ?3, 0);",
                    params![digest.to_hex(), size as i64, seq],
                )?;
                self.total.fetch_add(size, Ordering::Relaxed);
            }
        }

        self.maybe_evict(&mut inner, digest)
    }

    /// Moves the object to the most-recently-used position.
    pub fn on_touch(&self, digest: &ObjectDigest) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        inner.acseq += 1;
        let seq = inner.acseq;
        inner.conn.execute(
            "UPDATE objects SET acseq = ?2 WHERE digest = ?1;",
            params![digest.to_hex(), seq],
        )?;
        Ok(())
    }

    /// Exempts the object from eviction while in use (open file
    /// descriptors, loaded catalogs). Pins nest.
    pub fn pin(&self, digest: &ObjectDigest) -> Result<(), Error> {
        let inner = self.inner.lock();
        inner.conn.execute(
            "UPDATE objects SET pinned = pinned + 1 WHERE digest = ?1;",
            params![digest.to_hex()],
        )?;
        Ok(())
    }

    pub fn unpin(&self, digest: &ObjectDigest) -> Result<(), Error> {
        let inner = self.inner.lock();
        inner.conn.execute(
            "UPDATE objects SET pinned = max(pinned - 1, 0) WHERE digest = ?1;",
            params![digest.to_hex()],
        )?;
        Ok(())
    }

    /// Evicts unpinned objects in ascending recency until the accounted
    /// total is at or below the threshold. The object whose insertion
    /// triggered the pass is exempt: callers have not had a chance to pin
    /// or open it yet.
    fn maybe_evict(&self, inner: &mut Inner, just_inserted: &ObjectDigest) -> Result<(), Error> {
        if self.limit == 0 || self.total.load(Ordering::Relaxed) <= self.limit {
            return Ok(());
        }
        let protected = just_inserted.to_hex();
        debug!(
            total = self.total.load(Ordering::Relaxed),
            limit = self.limit,
            "cache above limit, evicting"
        );

        while self.total.load(Ordering::Relaxed) > self.threshold {
            let candidates: Vec<(String, i64)> = {
                let mut stmt = inner.conn.prepare_cached(
                    "SELECT digest, size FROM objects WHERE pinned = 0 \
                     ORDER BY acseq ASC, digest ASC LIMIT ?1;",
                )?;
                let rows = stmt.query_map(params![EVICT_BATCH as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                rows.collect::<Result<_, _>>()?
            };
            if candidates.is_empty() {
                warn!("nothing evictable below threshold, cache stays above quota");
                return Ok(());
            }

            let mut progressed = false;
            for (hex, size) in candidates {
                if self.total.load(Ordering::Relaxed) <= self.threshold {
                    break;
                }
                if hex == protected {
                    continue;
                }
                let digest = ObjectDigest::from_hex(&hex)
                    .map_err(|e| Error::StorageError(e.to_string()))?;
                if let Err(e) = std::fs::remove_file(self.store.object_path(&digest)) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(object.digest=%digest, err=%e, "unable to unlink object");
                        self.evict_failures.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }
                inner
                    .conn
                    .execute("DELETE FROM objects WHERE digest = ?1;", params![hex])?;
                self.total.fetch_sub(size as u64, Ordering::Relaxed);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        Ok(())
    }

    /// Walks the on-disk tree and the index: drops index entries without a
    /// file, unlinks files without an entry, and rebuilds the accounted
    /// total. Run on startup.
    #[instrument(skip_all, err)]
    pub fn reconcile(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();

        let indexed: Vec<(String, i64)> = {
            let mut stmt = inner
                .conn
                .prepare_cached("SELECT digest, size FROM objects;")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        let mut on_disk = std::collections::HashMap::new();
        for shard in read_shard_dirs(self.store.root())? {
            for entry in std::fs::read_dir(&shard)? {
                let entry = entry?;
                let name = entry.file_name();
                let hex = format!(
                    "{}{}",
                    shard.file_name().unwrap().to_string_lossy(),
                    name.to_string_lossy()
                );
                if let Ok(meta) = entry.metadata() {
                    on_disk.insert(hex, meta.len());
                }
            }
        }

        for (hex, _) in &indexed {
            if !on_disk.contains_key(hex) {
                debug!(object.digest=%hex, "dropping index entry without file");
                inner
                    .conn
                    .execute("DELETE FROM objects WHERE digest = ?1;", params![hex])?;
            }
        }

        let known: std::collections::HashSet<&String> =
            indexed.iter().map(|(hex, _)| hex).collect();
        for (hex, _) in &on_disk {
            if !known.contains(hex) {
                debug!(object.digest=%hex, "unlinking file without index entry");
                if let Ok(digest) = ObjectDigest::from_hex(hex) {
                    if let Err(e) = std::fs::remove_file(self.store.object_path(&digest)) {
                        warn!(object.digest=%hex, err=%e, "unable to unlink object");
                        self.evict_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        let total: i64 = inner
            .conn
            .query_row("SELECT coalesce(sum(size), 0) FROM objects;", [], |row| {
                row.get(0)
            })?;
        self.total.store(total as u64, Ordering::Relaxed);
        Ok(())
    }
}

fn read_shard_dirs(root: &Path) -> std::io::Result<Vec<std::path::PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        // object shards are the two-hex-digit directories; skip txn/ and
        // the index file itself
        if name.len() == 2
            && name.bytes().all(|b| b.is_ascii_hexdigit())
            && entry.file_type()?.is_dir()
        {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncWriteExt;

    use super::QuotaManager;
    use crate::{ObjectDigest, ObjectStore};

    const MIB: u64 = 1024 * 1024;

    async fn insert_object(
        store: &ObjectStore,
        quota: &QuotaManager,
        content: &[u8],
    ) -> ObjectDigest {
        let digest = ObjectDigest::of(content);
        let mut w = store.stage(digest).await.unwrap();
        w.write_all(content).await.unwrap();
        let size = w.commit().await.unwrap();
        quota.on_insert(&digest, size).unwrap();
        digest
    }

    fn blob(i: u8, len: usize) -> Vec<u8> {
        vec![i; len]
    }

    #[tokio::test]
    async fn eviction_under_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ObjectStore::open(dir.path()).await.unwrap());
        let quota = QuotaManager::open(store.clone(), 10 * MIB, 5 * MIB).unwrap();

        let mut digests = Vec::new();
        for i in 0..16u8 {
            digests.push(insert_object(&store, &quota, &blob(i, MIB as usize)).await);
        }

        // footprint bounded, most recently inserted object still present
        assert!(quota.total_bytes() <= 10 * MIB);
        assert!(store.contains(digests.last().unwrap()).await);
        // the eldest object is gone
        assert!(!store.contains(&digests[0]).await);
    }

    #[tokio::test]
    async fn touched_objects_survive() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ObjectStore::open(dir.path()).await.unwrap());
        let quota = QuotaManager::open(store.clone(), 4 * MIB, 2 * MIB).unwrap();

        let a = insert_object(&store, &quota, &blob(1, MIB as usize)).await;
        let b = insert_object(&store, &quota, &blob(2, MIB as usize)).await;
        insert_object(&store, &quota, &blob(10, MIB as usize)).await;
        insert_object(&store, &quota, &blob(11, MIB as usize)).await;

        // make `a` the most recently used, then push past the limit
        quota.on_touch(&a).unwrap();
        insert_object(&store, &quota, &blob(12, MIB as usize)).await;

        assert!(store.contains(&a).await);
        assert!(!store.contains(&b).await);
    }

    #[tokio::test]
    async fn pinned_objects_are_never_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ObjectStore::open(dir.path()).await.unwrap());
        let quota = QuotaManager::open(store.clone(), 2 * MIB, MIB).unwrap();

        let pinned = insert_object(&store, &quota, &blob(1, MIB as usize)).await;
        quota.pin(&pinned).unwrap();

        for i in 2..8u8 {
            insert_object(&store, &quota, &blob(i, MIB as usize)).await;
        }
        assert!(store.contains(&pinned).await);

        // once unpinned, the object becomes evictable again
        quota.unpin(&pinned).unwrap();
        for i in 8..12u8 {
            insert_object(&store, &quota, &blob(i, MIB as usize)).await;
        }
        assert!(!store.contains(&pinned).await);
    }

    #[tokio::test]
    async fn reconcile_repairs_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ObjectStore::open(dir.path()).await.unwrap());
        let quota = QuotaManager::open(store.clone(), 0, 0).unwrap();

        let kept = insert_object(&store, &quota, b"kept").await;
        let vanished = insert_object(&store, &quota, b"vanished").await;

        // file disappears behind the index's back
        std::fs::remove_file(store.object_path(&vanished)).unwrap();
        // and a stray file appears without an entry
        let stray = ObjectDigest::of(b"stray");
        std::fs::create_dir_all(store.object_path(&stray).parent().unwrap()).unwrap();
        std::fs::write(store.object_path(&stray), b"stray").unwrap();

        quota.reconcile().unwrap();

        assert_eq!(b"kept".len() as u64, quota.total_bytes());
        assert!(store.contains(&kept).await);
        assert!(!store.contains(&stray).await);
    }

    #[tokio::test]
    async fn index_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ObjectStore::open(dir.path()).await.unwrap());
        {
            let quota = QuotaManager::open(store.clone(), 0, 0).unwrap();
            insert_object(&store, &quota, b"persisted").await;
            assert_eq!(b"persisted".len() as u64, quota.total_bytes());
        }

        let quota = QuotaManager::open(store, 0, 0).unwrap();
        assert_eq!(b"persisted".len() as u64, quota.total_bytes());
    }
}
