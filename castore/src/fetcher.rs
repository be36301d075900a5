use std::{collections::HashMap, path::PathBuf, sync::Arc};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::{
    DownloadError, Error, ObjectDigest, ObjectKind, ObjectSource, ObjectStore, QuotaManager,
};

/// Errors surfaced by [Fetcher::fetch]. Clonable so a single download
/// outcome can be shared with every waiter.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum FetchError {
    #[error("object not found")]
    NotFound,
    #[error("integrity failure: {0}")]
    Integrity(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no space left in the cache directory")]
    NoSpace,
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DownloadError> for FetchError {
    fn from(value: DownloadError) -> Self {
        match value {
            DownloadError::NotFound => FetchError::NotFound,
            DownloadError::Integrity(msg) => FetchError::Integrity(msg),
            DownloadError::Transport(msg) => FetchError::Transport(msg),
            DownloadError::Config(msg) => FetchError::Transport(msg),
            DownloadError::NoSpace => FetchError::NoSpace,
            DownloadError::Storage(msg) => FetchError::Storage(msg),
        }
    }
}

impl From<Error> for FetchError {
    fn from(value: Error) -> Self {
        match value {
            Error::NotFound => FetchError::NotFound,
            e @ Error::Integrity { .. } => FetchError::Integrity(e.to_string()),
            Error::NoSpace => FetchError::NoSpace,
            e => FetchError::Storage(e.to_string()),
        }
    }
}

/// Coordinates object fetches between the filesystem layer, the local
/// object store and a remote [ObjectSource].
///
/// Guarantees single-flight per digest: at most one download runs for a
/// given object at any time, all concurrent callers for it attach to that
/// download and observe its outcome.
pub struct Fetcher {
    store: Arc<ObjectStore>,
    quota: Arc<QuotaManager>,
    source: Arc<dyn ObjectSource>,
    in_flight: Mutex<HashMap<ObjectDigest, broadcast::Sender<Result<u64, FetchError>>>>,
}

impl Fetcher {
    pub fn new(
        store: Arc<ObjectStore>,
        quota: Arc<QuotaManager>,
        source: Arc<dyn ObjectSource>,
    ) -> Self {
        Self {
            store,
            quota,
            source,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub fn quota(&self) -> &Arc<QuotaManager> {
        &self.quota
    }

    /// Makes sure the object is present and verified in the local store and
    /// returns its canonical path.
    #[instrument(skip(self), fields(object.digest=%digest), err)]
    pub async fn fetch(
        &self,
        digest: &ObjectDigest,
        kind: ObjectKind,
    ) -> Result<PathBuf, FetchError> {
        // zero-length files carry the null digest; they never hit the
        // network
        if digest.is_null() {
            self.store
                .ensure_zero_object()
                .await
                .map_err(|e| FetchError::Storage(e.to_string()))?;
            return Ok(self.store.object_path(digest));
        }

        if self.store.contains(digest).await {
            if let Err(e) = self.quota.on_touch(digest) {
                warn!(err=%e, "unable to record cache hit");
            }
            return Ok(self.store.object_path(digest));
        }

        let lead = {
            let mut in_flight = self.in_flight.lock();
            let existing = in_flight.get(digest).map(|tx| tx.subscribe());
            match existing {
                Some(rx) => Err(rx),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    in_flight.insert(*digest, tx);
                    Ok(())
                }
            }
        };
        let mut rx = match lead {
            Err(rx) => rx,
            Ok(()) => return self.lead_download(digest, kind).await,
        };

        debug!("attaching to in-flight download");
        match rx.recv().await {
            Ok(Ok(_size)) => Ok(self.store.object_path(digest)),
            Ok(Err(e)) => Err(e),
            // the leading task died without an outcome
            Err(_) => Err(FetchError::Storage("download task vanished".into())),
        }
    }

    async fn lead_download(
        &self,
        digest: &ObjectDigest,
        kind: ObjectKind,
    ) -> Result<PathBuf, FetchError> {
        // someone may have committed the object between our existence check
        // and the registration
        let result = if self.store.contains(digest).await {
            Ok(0)
        } else {
            match self.source.fetch_object(digest, kind).await {
                Ok(size) => {
                    if let Err(e) = self.quota.on_insert(digest, size) {
                        warn!(err=%e, "unable to account fetched object");
                    }
                    Ok(size)
                }
                Err(e) => Err(FetchError::from(e)),
            }
        };

        let tx = self
            .in_flight
            .lock()
            .remove(digest)
            .expect("in-flight entry must exist");
        // no other waiters is fine
        let _ = tx.send(result.clone());

        result.map(|_| self.store.object_path(digest))
    }
}
