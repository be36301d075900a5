use std::{
    collections::HashSet,
    io,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use flate2::read::ZlibDecoder;
use futures::TryStreamExt;
use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::{Error, ObjectDigest, ObjectStore};

/// Well-known name of the signed repository manifest on every server.
pub const MANIFEST_NAME: &str = ".stratopublished";

/// What is being fetched; selects the path suffix of the repository layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Catalog,
}

impl ObjectKind {
    fn suffix(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "",
            ObjectKind::Catalog => "C",
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("object not found on any mirror")]
    NotFound,
    #[error("integrity failure: {0}")]
    Integrity(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid download configuration: {0}")]
    Config(String),
    #[error("no space left in the cache directory")]
    NoSpace,
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<Error> for DownloadError {
    fn from(value: Error) -> Self {
        match value {
            Error::Integrity { expected, actual } => DownloadError::Integrity(format!(
                "expected {}, got {}",
                expected, actual
            )),
            Error::NoSpace => DownloadError::NoSpace,
            e => DownloadError::Storage(e.to_string()),
        }
    }
}

/// Something that can materialize a verified object in the local object
/// store. Implemented by [Downloader]; tests substitute in-memory sources.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Fetches the object, verifies it against `digest` and commits it to
    /// the object store. Returns the uncompressed size.
    async fn fetch_object(
        &self,
        digest: &ObjectDigest,
        kind: ObjectKind,
    ) -> Result<u64, DownloadError>;
}

/// Something that can produce the current (still unverified) manifest text.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch_manifest(&self) -> Result<String, DownloadError>;
}

/// Failover and retry tuning for [Downloader].
#[derive(Clone, Debug)]
pub struct DownloadConfig {
    /// Origin servers (or mirrors), in failover order.
    pub servers: Vec<Url>,
    /// Proxy groups. Requests round-robin within a group and fail over
    /// across groups; an empty list means direct connections only.
    pub proxy_groups: Vec<Vec<String>>,
    /// Per-attempt timeout when going through a proxy.
    pub timeout: Duration,
    /// Per-attempt timeout on direct connections.
    pub timeout_direct: Duration,
    /// How often transient failures are retried on top of the first pass.
    pub retries: u32,
    pub backoff_init: Duration,
    pub backoff_max: Duration,
}

impl DownloadConfig {
    pub fn new(servers: Vec<Url>) -> Self {
        Self {
            servers,
            proxy_groups: vec![],
            timeout: Duration::from_secs(5),
            timeout_direct: Duration::from_secs(10),
            retries: 2,
            backoff_init: Duration::from_secs(1),
            backoff_max: Duration::from_secs(16),
        }
    }
}

struct ProxyEndpoint {
    /// Proxy URL, or "DIRECT".
    name: String,
    client: reqwest::Client,
}

/// HTTP downloader for content-addressed objects.
///
/// Response bodies are the zlib-compressed object; they are streamed
/// through the decompressor into the object store's staging writer, and
/// only a verified, committed object counts as success. Proxy/server pairs
/// that failed permanently (404, integrity mismatch) are not tried again;
/// transient failures back off exponentially.
pub struct Downloader {
    store: Arc<ObjectStore>,
    servers: Vec<Url>,
    /// Endpoints of all groups, flattened in failover order.
    endpoints: Vec<ProxyEndpoint>,
    /// (offset, len) of each proxy group within `endpoints`.
    groups: Vec<(usize, usize)>,
    round_robin: Vec<AtomicUsize>,
    retries: u32,
    backoff_init: Duration,
    backoff_max: Duration,

    requests: AtomicU64,
    retried_requests: AtomicU64,
    bytes_fetched: AtomicU64,
}

impl Downloader {
    pub fn new(store: Arc<ObjectStore>, config: DownloadConfig) -> Result<Self, DownloadError> {
        if config.servers.is_empty() {
            return Err(DownloadError::Config("no servers configured".into()));
        }

        let mut endpoints = Vec::new();
        let mut groups = Vec::new();

        let proxy_groups = if config.proxy_groups.is_empty() {
            vec![vec![]]
        } else {
            config.proxy_groups.clone()
        };
        for group in &proxy_groups {
            let offset = endpoints.len();
            if group.is_empty() {
                endpoints.push(ProxyEndpoint {
                    name: "DIRECT".into(),
                    client: reqwest::Client::builder()
                        .no_proxy()
                        .timeout(config.timeout_direct)
                        .build()
                        .map_err(|e| DownloadError::Config(e.to_string()))?,
                });
            } else {
                for proxy in group {
                    let client = if proxy == "DIRECT" {
                        reqwest::Client::builder()
                            .no_proxy()
                            .timeout(config.timeout_direct)
                    } else {
                        reqwest::Client::builder()
                            .proxy(
                                reqwest::Proxy::all(proxy.as_str())
                                    .map_err(|e| DownloadError::Config(e.to_string()))?,
                            )
                            .timeout(config.timeout)
                    }
                    .build()
                    .map_err(|e| DownloadError::Config(e.to_string()))?;
                    endpoints.push(ProxyEndpoint {
                        name: proxy.clone(),
                        client,
                    });
                }
            }
            groups.push((offset, endpoints.len() - offset));
        }

        Ok(Self {
            store,
            servers: config.servers,
            round_robin: groups.iter().map(|_| AtomicUsize::new(0)).collect(),
            endpoints,
            groups,
            retries: config.retries,
            backoff_init: config.backoff_init,
            backoff_max: config.backoff_max,
            requests: AtomicU64::new(0),
            retried_requests: AtomicU64::new(0),
            bytes_fetched: AtomicU64::new(0),
        })
    }

    /// Total bytes of uncompressed object data fetched so far.
    pub fn bytes_fetched(&self) -> u64 {
        self.bytes_fetched.load(Ordering::Relaxed)
    }

    /// Number of HTTP requests issued so far.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Number of requests that were retries of an earlier failed attempt.
    pub fn retried_requests(&self) -> u64 {
        self.retried_requests.load(Ordering::Relaxed)
    }

    /// The endpoint indices to try for one request: round-robin within each
    /// group, groups in failover order.
    fn endpoint_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.endpoints.len());
        for (gi, &(offset, len)) in self.groups.iter().enumerate() {
            let start = self.round_robin[gi].fetch_add(1, Ordering::Relaxed) % len;
            for i in 0..len {
                order.push(offset + (start + i) % len);
            }
        }
        order
    }

    fn object_url(&self, server: &Url, digest: &ObjectDigest, kind: ObjectKind) -> Url {
        let hex = digest.to_hex();
        let raw = format!(
            "{}/data/{}/{}{}",
            server.as_str().trim_end_matches('/'),
            &hex[..2],
            &hex[2..],
            kind.suffix()
        );
        // both parts are well-formed by construction
        Url::parse(&raw).expect("object url must parse")
    }

    /// One GET against one proxy/server pair, streamed through
    /// decompression and hashing into a staged object.
    async fn attempt(
        &self,
        endpoint: &ProxyEndpoint,
        url: Url,
        digest: &ObjectDigest,
    ) -> Result<u64, AttemptError> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let resp = endpoint
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT_ENCODING, "identity")
            .send()
            .await
            .map_err(|e| AttemptError::transient(DownloadError::Transport(e.to_string())))?;

        match resp.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(AttemptError::permanent(DownloadError::NotFound));
            }
            s if s.is_server_error() => {
                return Err(AttemptError::transient(DownloadError::Transport(format!(
                    "{} responded {}",
                    url, s
                ))));
            }
            s => {
                return Err(AttemptError::permanent(DownloadError::Transport(format!(
                    "{} responded {}",
                    url, s
                ))));
            }
        }

        let body = StreamReader::new(resp.bytes_stream().map_err(|e| {
            let e = e.without_url();
            io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())
        }));

        let writer = self
            .store
            .stage(*digest)
            .await
            .map_err(|e| AttemptError::transient(DownloadError::Storage(e.to_string())))?;

        // The body is the *compressed* object; decompression and hashing
        // run synchronously off the async worker.
        let body = SyncIoBridge::new(body);
        let writer = SyncIoBridge::new(writer);
        let (copied, writer) = tokio::task::spawn_blocking(move || {
            let mut decoder = ZlibDecoder::new(body);
            let mut writer = writer;
            let res = io::copy(&mut decoder, &mut writer);
            (res, writer)
        })
        .await
        .map_err(|e| AttemptError::transient(DownloadError::Storage(e.to_string())))?;

        let writer = writer.into_inner();
        match copied {
            Ok(_) => match writer.commit().await {
                Ok(size) => {
                    self.bytes_fetched.fetch_add(size, Ordering::Relaxed);
                    Ok(size)
                }
                // a full body that hashes wrong will hash wrong on this
                // pair again, do not retry it here
                Err(e @ Error::Integrity { .. }) => {
                    warn!(url=%url, err=%e, "integrity failure, discarding attempt");
                    Err(AttemptError::permanent(e.into()))
                }
                Err(e) => Err(AttemptError::transient(e.into())),
            },
            Err(e) => {
                // truncated/corrupt stream; the staged bytes are dropped
                writer.discard().await;
                Err(AttemptError::transient(DownloadError::Transport(
                    e.to_string(),
                )))
            }
        }
    }
}

struct AttemptError {
    error: DownloadError,
    permanent: bool,
}

impl AttemptError {
    fn transient(error: DownloadError) -> Self {
        Self {
            error,
            permanent: false,
        }
    }
    fn permanent(error: DownloadError) -> Self {
        Self {
            error,
            permanent: true,
        }
    }
}

#[async_trait]
impl ObjectSource for Downloader {
    #[instrument(skip(self), fields(object.digest=%digest), err)]
    async fn fetch_object(
        &self,
        digest: &ObjectDigest,
        kind: ObjectKind,
    ) -> Result<u64, DownloadError> {
        let mut failed_pairs: HashSet<(usize, usize)> = HashSet::new();
        let mut last_error = DownloadError::NotFound;
        let mut backoff = self.backoff_init;
        let pair_count = self.endpoints.len() * self.servers.len();

        for round in 0..=self.retries {
            if round > 0 {
                self.retried_requests.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, self.backoff_max);
            }

            for ei in self.endpoint_order() {
                for (si, server) in self.servers.iter().enumerate() {
                    if failed_pairs.contains(&(ei, si)) {
                        continue;
                    }
                    let url = self.object_url(server, digest, kind);
                    debug!(url=%url, proxy=%self.endpoints[ei].name, round, "fetching object");
                    match self.attempt(&self.endpoints[ei], url, digest).await {
                        Ok(size) => return Ok(size),
                        Err(AttemptError { error, permanent }) => {
                            warn!(proxy=%self.endpoints[ei].name, err=%error, permanent, "attempt failed");
                            if permanent {
                                failed_pairs.insert((ei, si));
                            }
                            last_error = error;
                        }
                    }
                }
            }

            // nothing left worth retrying
            if failed_pairs.len() == pair_count {
                break;
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl ManifestSource for Downloader {
    #[instrument(skip(self), err)]
    async fn fetch_manifest(&self) -> Result<String, DownloadError> {
        let mut last_error = DownloadError::NotFound;

        for ei in self.endpoint_order() {
            for server in &self.servers {
                let url = Url::parse(&format!(
                    "{}/{}",
                    server.as_str().trim_end_matches('/'),
                    MANIFEST_NAME
                ))
                .expect("manifest url must parse");
                self.requests.fetch_add(1, Ordering::Relaxed);
                let resp = match self.endpoints[ei].client.get(url.clone()).send().await {
                    Ok(resp) => resp,
                    Err(e) => {
                        last_error = DownloadError::Transport(e.to_string());
                        continue;
                    }
                };
                match resp.status() {
                    s if s.is_success() => match resp.text().await {
                        Ok(text) => return Ok(text),
                        Err(e) => {
                            last_error = DownloadError::Transport(e.to_string());
                        }
                    },
                    StatusCode::NOT_FOUND => {
                        last_error = DownloadError::NotFound;
                    }
                    s => {
                        last_error =
                            DownloadError::Transport(format!("{} responded {}", url, s));
                    }
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    use super::{DownloadConfig, DownloadError, Downloader, ObjectKind, ObjectSource};
    use crate::fixtures::{BLOB_A, BLOB_A_DIGEST};
    use crate::ObjectStore;

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut enc =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[derive(Clone, Default)]
    struct Origin {
        objects: Arc<HashMap<String, Vec<u8>>>,
        hits: Arc<AtomicU64>,
        flaky_until: Arc<AtomicU64>,
    }

    async fn serve_object(
        State(origin): State<Origin>,
        Path((prefix, rest)): Path<(String, String)>,
    ) -> (StatusCode, Vec<u8>) {
        origin.hits.fetch_add(1, Ordering::SeqCst);
        if origin.flaky_until.load(Ordering::SeqCst) >= origin.hits.load(Ordering::SeqCst) {
            return (StatusCode::INTERNAL_SERVER_ERROR, vec![]);
        }
        match origin.objects.get(&format!("{}/{}", prefix, rest)) {
            Some(body) => (StatusCode::OK, body.clone()),
            None => (StatusCode::NOT_FOUND, vec![]),
        }
    }

    async fn spawn_origin(origin: Origin) -> url::Url {
        let app = Router::new()
            .route("/data/:prefix/:rest", get(serve_object))
            .with_state(origin);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        url::Url::parse(&format!("http://{}", addr)).unwrap()
    }

    fn wire_key(digest: &crate::ObjectDigest, kind: ObjectKind) -> String {
        let hex = digest.to_hex();
        let suffix = match kind {
            ObjectKind::Blob => "",
            ObjectKind::Catalog => "C",
        };
        format!("{}/{}{}", &hex[..2], &hex[2..], suffix)
    }

    fn quick_config(servers: Vec<url::Url>) -> DownloadConfig {
        let mut config = DownloadConfig::new(servers);
        config.retries = 1;
        config.backoff_init = std::time::Duration::from_millis(10);
        config
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_verified_object() {
        let mut objects = HashMap::new();
        objects.insert(wire_key(&BLOB_A_DIGEST, ObjectKind::Blob), compress(&BLOB_A));
        let origin = Origin {
            objects: Arc::new(objects),
            ..Default::default()
        };
        let url = spawn_origin(origin).await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ObjectStore::open(dir.path()).await.unwrap());
        let downloader = Downloader::new(store.clone(), quick_config(vec![url])).unwrap();

        let size = downloader
            .fetch_object(&BLOB_A_DIGEST, ObjectKind::Blob)
            .await
            .unwrap();
        assert_eq!(BLOB_A.len() as u64, size);
        assert!(store.contains(&BLOB_A_DIGEST).await);
        assert_eq!(BLOB_A.len() as u64, downloader.bytes_fetched());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn corrupt_mirror_fails_over() {
        // first mirror serves bytes whose hash does not match, second one
        // is good
        let mut bad = HashMap::new();
        bad.insert(
            wire_key(&BLOB_A_DIGEST, ObjectKind::Blob),
            compress(b"not the announced content"),
        );
        let bad_url = spawn_origin(Origin {
            objects: Arc::new(bad),
            ..Default::default()
        })
        .await;

        let mut good = HashMap::new();
        good.insert(wire_key(&BLOB_A_DIGEST, ObjectKind::Blob), compress(&BLOB_A));
        let good_url = spawn_origin(Origin {
            objects: Arc::new(good),
            ..Default::default()
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ObjectStore::open(dir.path()).await.unwrap());
        let downloader =
            Downloader::new(store.clone(), quick_config(vec![bad_url, good_url])).unwrap();

        downloader
            .fetch_object(&BLOB_A_DIGEST, ObjectKind::Blob)
            .await
            .unwrap();

        // the committed object is the verified one, and no partials remain
        let mut f = store.open_read(&BLOB_A_DIGEST).await.unwrap().unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut f, &mut buf)
            .await
            .unwrap();
        assert_eq!(&BLOB_A[..], &buf[..]);
        let mut entries = tokio::fs::read_dir(dir.path().join("txn")).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_object_is_not_found() {
        let url = spawn_origin(Origin::default()).await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ObjectStore::open(dir.path()).await.unwrap());
        let downloader = Downloader::new(store, quick_config(vec![url])).unwrap();

        match downloader
            .fetch_object(&BLOB_A_DIGEST, ObjectKind::Blob)
            .await
        {
            Err(DownloadError::NotFound) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_errors_are_retried() {
        let mut objects = HashMap::new();
        objects.insert(wire_key(&BLOB_A_DIGEST, ObjectKind::Blob), compress(&BLOB_A));
        let origin = Origin {
            objects: Arc::new(objects),
            ..Default::default()
        };
        // the first request sees a 500
        origin.flaky_until.store(1, Ordering::SeqCst);
        let url = spawn_origin(origin.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ObjectStore::open(dir.path()).await.unwrap());
        let downloader = Downloader::new(store.clone(), quick_config(vec![url])).unwrap();

        downloader
            .fetch_object(&BLOB_A_DIGEST, ObjectKind::Blob)
            .await
            .unwrap();
        assert!(store.contains(&BLOB_A_DIGEST).await);
        assert!(downloader.retried_requests() > 0);
    }
}
