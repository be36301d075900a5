
use std::sync::Arc;

use ed25519_dalek::SigningKey;

use stratofs_castore::{Fetcher, ObjectDigest, ObjectStore, QuotaManager};

use crate::caches::MetaCaches;
use crate::catalog::manager::CatalogManager;
use crate::catalog::QueryContext;
use crate::fixtures::{manifest_text, test_signing_key, MemorySource};
use crate::fs::StratoFs;
use crate::manifest::ManifestVerifier;
use crate::settings::ClientSettings;

/// One mounted repository against an in-memory origin.
pub(crate) struct Harness {
    _dir: tempfile::TempDir,
    pub store: Arc<ObjectStore>,
    pub quota: Arc<QuotaManager>,
    pub source: Arc<MemorySource>,
    pub fetcher: Arc<Fetcher>,
    pub caches: Arc<MetaCaches>,
    pub key: SigningKey,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_quota(0, 0).await
    }

    pub async fn with_quota(limit: u64, threshold: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ObjectStore::open(dir.path().join("cache")).await.unwrap());
        let quota = Arc::new(QuotaManager::open(store.clone(), limit, threshold).unwrap());
        let source = Arc::new(MemorySource::new(store.clone()));
        let fetcher = Arc::new(Fetcher::new(
            store.clone(),
            quota.clone(),
            source.clone(),
        ));
        Self {
            _dir: dir,
            store,
            quota,
            source,
            fetcher,
            caches: Arc::new(MetaCaches::new(1000, 1000, 1000)),
            key: test_signing_key(),
        }
    }

    pub fn publish(&self, root: &ObjectDigest, revision: u64) {
        self.source
            .set_manifest(manifest_text(root, revision, 1700000000, 240, &self.key));
    }

    pub fn context(&self) -> Arc<QueryContext> {
        Arc::new(QueryContext {
            symlink_env: [("ARCH", "x86_64")].into_iter().collect(),
            uid: 0,
            gid: 0,
        })
    }

    pub async fn mount(&self) -> Arc<CatalogManager> {
        CatalogManager::mount(
            self.fetcher.clone(),
            self.source.clone(),
            ManifestVerifier::new(self.key.verifying_key()),
            self.context(),
            self.caches.clone(),
            None,
            None,
        )
        .await
        .expect("mount must succeed")
    }

    pub fn adapter(&self, mgr: &Arc<CatalogManager>) -> StratoFs {
        StratoFs::new(
            mgr.clone(),
            self.fetcher.clone(),
            self.caches.clone(),
            &ClientSettings::default(),
        )
    }

    /// A scratch path for building catalog files.
    pub fn scratch(&self, name: &str) -> std::path::PathBuf {
        self._dir.path().join(name)
    }
}
