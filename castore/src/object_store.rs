use std::{
    io,
    path::{Path, PathBuf},
    pin::pin,
    sync::atomic::{AtomicU64, Ordering},
    task::Poll,
};

use bytes::Buf;
use data_encoding::HEXLOWER;
use pin_project_lite::pin_project;
use sha1::{Digest as _, Sha1};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::{Error, ObjectDigest};

/// Content-addressed blob store on a local filesystem.
///
/// Objects are addressed by the digest of their uncompressed bytes and live
/// at `<root>/<2 hex>/<38 hex>` in a sharding style, e.g. `abcdef` gets
/// turned into `ab/cdef`. In-progress downloads are staged under
/// `<root>/txn/` and only ever renamed **atomically** into place after their
/// running hash matched the announced digest, so a canonical path never
/// holds a partial or unverified object.
pub struct ObjectStore {
    root: PathBuf,
    next_txn_id: AtomicU64,
}

fn derive_object_path(root: &Path, digest: &ObjectDigest) -> PathBuf {
    let hex = digest.to_hex();
    root.join(&hex[..2]).join(&hex[2..])
}

impl ObjectStore {
    /// Opens (or creates) a store at the given directory and collects
    /// leftovers of interrupted transactions.
    pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        tokio::fs::create_dir_all(root.join("txn")).await?;

        let store = Self {
            root,
            next_txn_id: AtomicU64::new(0),
        };
        store.collect_transactions().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The canonical path an object with the given digest is stored at.
    /// The file only exists once the object has been committed.
    pub fn object_path(&self, digest: &ObjectDigest) -> PathBuf {
        derive_object_path(&self.root, digest)
    }

    /// Removes staged files of transactions that did not reach commit.
    async fn collect_transactions(&self) -> io::Result<()> {
        let mut entries = tokio::fs::read_dir(self.root.join("txn")).await?;
        while let Some(entry) = entries.next_entry().await? {
            debug!(path=?entry.path(), "removing stale transaction file");
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                warn!(path=?entry.path(), err=%e, "unable to remove transaction file");
            }
        }
        Ok(())
    }

    #[instrument(skip_all, ret, fields(object.digest=%digest))]
    pub async fn contains(&self, digest: &ObjectDigest) -> bool {
        tokio::fs::try_exists(self.object_path(digest))
            .await
            .unwrap_or(false)
    }

    /// Opens the object read-only, or returns `Ok(None)` if it is absent.
    #[instrument(skip_all, err, fields(object.digest=%digest))]
    pub async fn open_read(&self, digest: &ObjectDigest) -> io::Result<Option<tokio::fs::File>> {
        match tokio::fs::File::open(self.object_path(digest)).await {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Creates a staging file under `txn/` for the announced digest and
    /// returns a writer that hashes everything written through it.
    #[instrument(skip_all, err, fields(object.digest=%digest))]
    pub async fn stage(&self, digest: ObjectDigest) -> io::Result<ObjectWriter> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let path = self.root.join("txn").join(format!(
            "{}.{}",
            txn_id,
            HEXLOWER.encode(&digest.as_slice()[..4])
        ));
        let file = tokio::fs::File::create(&path).await?;

        Ok(ObjectWriter {
            root: self.root.clone(),
            expected: digest,
            path,
            file: Some(file),
            hasher: Sha1::new(),
            size: 0,
        })
    }

    /// Unlinks the object. Absent objects are ignored.
    #[instrument(skip_all, fields(object.digest=%digest))]
    pub async fn evict(&self, digest: &ObjectDigest) -> io::Result<()> {
        match tokio::fs::remove_file(self.object_path(digest)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Places the canonical empty object for the null digest. Zero-length
    /// files carry the null digest as their sentinel, and serving them must
    /// not touch the network.
    pub async fn ensure_zero_object(&self) -> io::Result<()> {
        let path = self.object_path(&ObjectDigest::NULL);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        tokio::fs::create_dir_all(path.parent().unwrap()).await?;
        let staged = self.root.join("txn").join("zero");
        tokio::fs::File::create(&staged).await?.sync_all().await?;
        tokio::fs::rename(staged, path).await
    }
}

pin_project! {
    /// Streaming writer for one staged object. Obtained from
    /// [ObjectStore::stage], finished with [ObjectWriter::commit].
    pub struct ObjectWriter {
        root: PathBuf,
        expected: ObjectDigest,
        path: PathBuf,
        file: Option<tokio::fs::File>,
        hasher: Sha1,
        size: u64,
    }
}

impl ObjectWriter {
    /// The digest this writer was staged for.
    pub fn expected_digest(&self) -> &ObjectDigest {
        &self.expected
    }

    /// Closes the staging file. If the running hash equals the announced
    /// digest, renames it into place and returns the object size; otherwise
    /// the staged file is unlinked and an integrity error is returned.
    pub async fn commit(mut self) -> Result<u64, Error> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| Error::InvalidRequest("commit on closed writer".into()))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let actual = ObjectDigest::from_bytes(self.hasher.finalize().into());
        if actual != self.expected {
            if let Err(e) = tokio::fs::remove_file(&self.path).await {
                warn!(path=?self.path, err=%e, "unable to unlink staged object");
            }
            return Err(Error::Integrity {
                expected: self.expected,
                actual,
            });
        }

        let dst = derive_object_path(&self.root, &self.expected);
        tokio::fs::create_dir_all(dst.parent().unwrap()).await?;
        tokio::fs::rename(&self.path, dst).await?;
        Ok(self.size)
    }

    /// Abandons the staged file.
    pub async fn discard(mut self) {
        drop(self.file.take());
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            warn!(path=?self.path, err=%e, "unable to unlink staged object");
        }
    }
}

impl tokio::io::AsyncWrite for ObjectWriter {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.project();
        let Some(file) = this.file.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "this writer is already closed",
            )));
        };
        match pin!(file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.hasher.update(buf.take(n).into_inner());
                *this.size += n as u64;
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        let this = self.project();
        let Some(file) = this.file.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "this writer is already closed",
            )));
        };
        pin!(file).poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        let this = self.project();
        let Some(file) = this.file.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "this writer is already closed",
            )));
        };
        pin!(file).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::ObjectStore;
    use crate::fixtures::{BLOB_A, BLOB_A_DIGEST, BLOB_B_DIGEST};
    use crate::{Error, ObjectDigest};

    #[tokio::test]
    async fn stage_commit_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).await.unwrap();

        assert!(!store.contains(&BLOB_A_DIGEST).await);
        assert!(store.open_read(&BLOB_A_DIGEST).await.unwrap().is_none());

        let mut w = store.stage(*BLOB_A_DIGEST).await.unwrap();
        w.write_all(&BLOB_A).await.unwrap();
        let size = w.commit().await.unwrap();
        assert_eq!(BLOB_A.len() as u64, size);

        assert!(store.contains(&BLOB_A_DIGEST).await);
        let mut f = store
            .open_read(&BLOB_A_DIGEST)
            .await
            .unwrap()
            .expect("must exist");
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut f, &mut buf)
            .await
            .unwrap();
        assert_eq!(&BLOB_A[..], &buf[..]);
    }

    #[tokio::test]
    async fn commit_rejects_wrong_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).await.unwrap();

        // announce BLOB_B's digest, write BLOB_A
        let mut w = store.stage(*BLOB_B_DIGEST).await.unwrap();
        w.write_all(&BLOB_A).await.unwrap();
        match w.commit().await {
            Err(Error::Integrity { expected, actual }) => {
                assert_eq!(*BLOB_B_DIGEST, expected);
                assert_eq!(*BLOB_A_DIGEST, actual);
            }
            other => panic!("expected integrity error, got {:?}", other.map(|_| ())),
        }

        // the bad bytes must not have been persisted, neither canonically
        // nor in the staging area.
        assert!(!store.contains(&BLOB_B_DIGEST).await);
        let mut entries = tokio::fs::read_dir(dir.path().join("txn")).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn interrupted_transactions_are_collected() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ObjectStore::open(dir.path()).await.unwrap();
            let mut w = store.stage(*BLOB_A_DIGEST).await.unwrap();
            w.write_all(b"partial").await.unwrap();
            // writer dropped without commit, simulating a crash
            drop(w);
        }

        let store = ObjectStore::open(dir.path()).await.unwrap();
        assert!(!store.contains(&BLOB_A_DIGEST).await);
        let mut entries = tokio::fs::read_dir(dir.path().join("txn")).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());

        // the store still works after collection
        let mut w = store.stage(*BLOB_A_DIGEST).await.unwrap();
        w.write_all(&BLOB_A).await.unwrap();
        w.commit().await.unwrap();
        assert!(store.contains(&BLOB_A_DIGEST).await);
    }

    #[tokio::test]
    async fn evict_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).await.unwrap();

        let mut w = store.stage(*BLOB_A_DIGEST).await.unwrap();
        w.write_all(&BLOB_A).await.unwrap();
        w.commit().await.unwrap();

        store.evict(&BLOB_A_DIGEST).await.unwrap();
        assert!(!store.contains(&BLOB_A_DIGEST).await);
        // absent objects are ignored
        store.evict(&BLOB_A_DIGEST).await.unwrap();
    }

    #[tokio::test]
    async fn zero_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).await.unwrap();

        store.ensure_zero_object().await.unwrap();
        let mut f = store
            .open_read(&ObjectDigest::NULL)
            .await
            .unwrap()
            .expect("must exist");
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut f, &mut buf)
            .await
            .unwrap();
        assert!(buf.is_empty());
    }
}
