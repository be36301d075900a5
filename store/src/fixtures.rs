//! Shared test fixtures: a write side for catalog files, an in-memory
//! object source and manifest signing helpers. Repository construction
//! proper lives in the server tooling; these helpers produce just enough
//! of its output to exercise the read path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ed25519_dalek::{Signer as _, SigningKey};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use sha1::{Digest as _, Sha1};
use tokio::io::AsyncWriteExt;

use stratofs_castore::{
    DownloadError, ManifestSource, ObjectDigest, ObjectKind, ObjectSource, ObjectStore,
};

use crate::dirent::CatalogFlags;
use crate::path_hash::{parent_path, PathHash};

/// Directories report this size, like the repository builder emits them.
pub const DIRECTORY_SIZE: u64 = 4096;

pub fn test_signing_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

/// Appends the signature block to a manifest body. The signature covers
/// the SHA-1 digest of the body.
pub fn sign_manifest(body: &str, key: &SigningKey) -> String {
    let digest = Sha1::digest(body.as_bytes());
    let signature = key.sign(digest.as_slice());
    format!(
        "{}--\n{}\n",
        body,
        data_encoding::BASE64.encode(&signature.to_bytes())
    )
}

pub fn manifest_text(
    root: &ObjectDigest,
    revision: u64,
    timestamp: u64,
    ttl_secs: u64,
    key: &SigningKey,
) -> String {
    sign_manifest(
        &format!("C {}\nT {}\nD {}\nS {}\n", root, timestamp, ttl_secs, revision),
        key,
    )
}

/// Builds a catalog file the way the repository side lays it out.
pub struct CatalogBuilder {
    conn: Option<Connection>,
    path: PathBuf,
}

impl CatalogBuilder {
    pub fn new(path: &Path) -> Self {
        let conn = Connection::open(path).expect("create catalog file");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS catalog \
             (md5path_1 INTEGER, md5path_2 INTEGER, parent_1 INTEGER, parent_2 INTEGER, \
              inode INTEGER, hash BLOB, size INTEGER, mode INTEGER, mtime INTEGER, \
              flags INTEGER, name TEXT, symlink TEXT, \
              CONSTRAINT pk_catalog PRIMARY KEY (md5path_1, md5path_2)); \
             CREATE INDEX IF NOT EXISTS idx_catalog_parent ON catalog (parent_1, parent_2); \
             CREATE TABLE IF NOT EXISTS properties (key TEXT, value TEXT, \
              CONSTRAINT pk_properties PRIMARY KEY (key)); \
             CREATE TABLE IF NOT EXISTS nested_catalogs (path TEXT, sha1 TEXT, \
              CONSTRAINT pk_nested_catalogs PRIMARY KEY (path)); \
             INSERT OR REPLACE INTO properties (key, value) VALUES ('schema', '2.0'); \
             INSERT OR IGNORE INTO properties (key, value) VALUES ('revision', 0);",
        )
        .expect("create catalog schema");
        Self {
            conn: Some(conn),
            path: path.to_path_buf(),
        }
    }

    pub fn set_revision(&mut self, revision: u64) -> &mut Self {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO properties (key, value) VALUES ('revision', ?1);",
                params![revision.to_string()],
            )
            .expect("set revision");
        self
    }

    pub fn add_directory(&mut self, path: &str, mode: u32, mtime: i64) -> &mut Self {
        self.insert(
            path,
            None,
            DIRECTORY_SIZE,
            libc::S_IFDIR as u32 | mode,
            mtime,
            CatalogFlags::DIRECTORY,
            0,
            "",
        )
    }

    /// Directory entry flagged as mountpoint of a nested catalog.
    pub fn add_mountpoint(&mut self, path: &str, mode: u32, mtime: i64) -> &mut Self {
        self.insert(
            path,
            None,
            DIRECTORY_SIZE,
            libc::S_IFDIR as u32 | mode,
            mtime,
            CatalogFlags::DIRECTORY | CatalogFlags::NESTED_MOUNTPOINT,
            0,
            "",
        )
    }

    /// The root entry of a nested catalog; must mirror the mountpoint
    /// entry of the parent.
    pub fn add_nested_root(&mut self, path: &str, mode: u32, mtime: i64) -> &mut Self {
        self.insert(
            path,
            None,
            DIRECTORY_SIZE,
            libc::S_IFDIR as u32 | mode,
            mtime,
            CatalogFlags::DIRECTORY | CatalogFlags::NESTED_ROOT,
            0,
            "",
        )
    }

    pub fn add_file(
        &mut self,
        path: &str,
        mode: u32,
        mtime: i64,
        size: u64,
        digest: ObjectDigest,
    ) -> &mut Self {
        self.insert(
            path,
            Some(digest),
            size,
            libc::S_IFREG as u32 | mode,
            mtime,
            CatalogFlags::FILE,
            0,
            "",
        )
    }

    pub fn add_hardlink(
        &mut self,
        path: &str,
        mode: u32,
        mtime: i64,
        size: u64,
        digest: ObjectDigest,
        hardlinks: u64,
    ) -> &mut Self {
        self.insert(
            path,
            Some(digest),
            size,
            libc::S_IFREG as u32 | mode,
            mtime,
            CatalogFlags::FILE,
            hardlinks,
            "",
        )
    }

    pub fn add_symlink(&mut self, path: &str, mode: u32, mtime: i64, target: &str) -> &mut Self {
        self.insert(
            path,
            None,
            0,
            libc::S_IFLNK as u32 | mode,
            mtime,
            CatalogFlags::FILE | CatalogFlags::SYMLINK,
            0,
            target,
        )
    }

    pub fn add_nested_catalog(&mut self, path: &str, digest: &ObjectDigest) -> &mut Self {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO nested_catalogs (path, sha1) VALUES (?1, ?2);",
                params![path, digest.to_hex()],
            )
            .expect("insert nested catalog reference");
        self
    }

    #[allow(clippy::too_many_arguments)]
    fn insert(
        &mut self,
        path: &str,
        digest: Option<ObjectDigest>,
        size: u64,
        mode: u32,
        mtime: i64,
        flags: CatalogFlags,
        hardlinks: u64,
        symlink: &str,
    ) -> &mut Self {
        let (md5_1, md5_2) = PathHash::of(path).to_columns();
        let (p_1, p_2) = if path.is_empty() {
            (0, 0)
        } else {
            PathHash::of(parent_path(path)).to_columns()
        };
        let name = path.rsplit('/').next().unwrap_or("");
        let hash: Vec<u8> = digest.map(|d| d.as_slice().to_vec()).unwrap_or_default();

        self.conn()
            .execute(
                "INSERT OR IGNORE INTO catalog \
                 (md5path_1, md5path_2, parent_1, parent_2, hash, inode, size, mode, mtime, \
                  flags, name, symlink) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12);",
                params![
                    md5_1,
                    md5_2,
                    p_1,
                    p_2,
                    hash,
                    hardlinks as i64,
                    size as i64,
                    mode as i64,
                    mtime,
                    flags.bits() as i64,
                    name,
                    symlink
                ],
            )
            .expect("insert catalog entry");
        self
    }

    fn conn(&mut self) -> &Connection {
        self.conn.as_ref().expect("builder already finished")
    }

    /// Closes the file and returns its bytes; their digest addresses the
    /// catalog.
    pub fn finish(&mut self) -> Vec<u8> {
        drop(self.conn.take());
        std::fs::read(&self.path).expect("read catalog file")
    }
}

/// Serves objects and the manifest from memory, counting requests. Stands
/// in for the HTTP downloader wherever the wire is not under test.
pub struct MemorySource {
    store: Arc<ObjectStore>,
    objects: Mutex<HashMap<ObjectDigest, Vec<u8>>>,
    manifest: Mutex<Option<String>>,
    pub object_fetches: AtomicU64,
    pub manifest_fetches: AtomicU64,
}

impl MemorySource {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self {
            store,
            objects: Mutex::new(HashMap::new()),
            manifest: Mutex::new(None),
            object_fetches: AtomicU64::new(0),
            manifest_fetches: AtomicU64::new(0),
        }
    }

    pub fn insert_object(&self, content: &[u8]) -> ObjectDigest {
        let digest = ObjectDigest::of(content);
        self.objects.lock().insert(digest, content.to_vec());
        digest
    }

    /// Registers content under a digest it does not hash to, like a
    /// corrupted mirror would.
    pub fn insert_corrupt_object(&self, digest: ObjectDigest, content: &[u8]) {
        self.objects.lock().insert(digest, content.to_vec());
    }

    pub fn remove_object(&self, digest: &ObjectDigest) {
        self.objects.lock().remove(digest);
    }

    pub fn set_manifest(&self, text: String) {
        *self.manifest.lock() = Some(text);
    }
}

#[async_trait]
impl ObjectSource for MemorySource {
    async fn fetch_object(
        &self,
        digest: &ObjectDigest,
        _kind: ObjectKind,
    ) -> Result<u64, DownloadError> {
        self.object_fetches.fetch_add(1, Ordering::SeqCst);
        let content = self
            .objects
            .lock()
            .get(digest)
            .cloned()
            .ok_or(DownloadError::NotFound)?;
        let mut writer = self
            .store
            .stage(*digest)
            .await
            .map_err(|e| DownloadError::Storage(e.to_string()))?;
        writer
            .write_all(&content)
            .await
            .map_err(|e| DownloadError::Storage(e.to_string()))?;
        Ok(writer.commit().await?)
    }
}

#[async_trait]
impl ManifestSource for MemorySource {
    async fn fetch_manifest(&self) -> Result<String, DownloadError> {
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        self.manifest.lock().clone().ok_or(DownloadError::NotFound)
    }
}
