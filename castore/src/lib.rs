mod digests;
mod errors;
mod hashing_reader;
mod object_store;

pub mod download;
pub mod fetcher;
pub mod fixtures;
pub mod quota;

pub use digests::{ObjectDigest, DIGEST_LEN};
pub use download::{
    DownloadConfig, DownloadError, Downloader, ManifestSource, ObjectKind, ObjectSource,
    MANIFEST_NAME,
};
pub use errors::Error;
pub use fetcher::{FetchError, Fetcher};
pub use hashing_reader::{HashingReader, Sha1HashingReader};
pub use object_store::{ObjectStore, ObjectWriter};
pub use quota::QuotaManager;
