//! The signed repository manifest.
//!
//! Over the wire, a manifest is formatted as line-oriented `key value`
//! pairs followed by a signature block:
//!
//! ```text
//! C 4ec91b4c42a07d02b67ba56b5b2ac6210a9a0ad9
//! R d41d8cd98f00b204e9800998ecf8427e
//! T 1700000000
//! D 240
//! S 42
//! --
//! <base64 ed25519 signature>
//! ```
//!
//! The signature covers the SHA-1 digest of everything above the sentinel
//! line. The trust anchor is the repository's public key, configured out
//! of band.

use std::time::{Duration, SystemTime};

use data_encoding::BASE64;
use ed25519_dalek::{Signature, VerifyingKey, SIGNATURE_LENGTH};
use sha1::{Digest as _, Sha1};
use thiserror::Error;
use tracing::{instrument, warn};

use stratofs_castore::ObjectDigest;

use crate::path_hash::PathHash;

/// Line separating the covered fields from the signature block.
pub const SIGNATURE_SENTINEL: &str = "--";

/// Publish timestamps further in the future than this are rejected as
/// bogus.
const MAX_CLOCK_SKEW: Duration = Duration::from_secs(24 * 3600);

#[derive(Clone, Debug, PartialEq)]
pub struct Manifest {
    /// Digest of the current root catalog (`C`).
    pub root_catalog: ObjectDigest,
    /// Path hash of the root prefix, if the repository is not rooted at
    /// `/` (`R`).
    pub root_path_hash: Option<PathHash>,
    /// Publish time in seconds since the epoch (`T`).
    pub publish_timestamp: u64,
    /// How long this manifest may be served from cache (`D`).
    pub ttl: Duration,
    /// Repository revision (`S`).
    pub revision: u64,
}

#[derive(Debug, Error, PartialEq)]
pub enum ManifestError {
    #[error("invalid manifest line: {0:?}")]
    InvalidLine(String),
    #[error("duplicate field {0:?}")]
    DuplicateField(String),
    #[error("missing field {0:?}")]
    MissingField(&'static str),
    #[error("missing signature block")]
    MissingSignature,
    #[error("malformed signature: {0}")]
    SignatureFormat(String),
    #[error("signature verification failed")]
    BadSignature,
    #[error("publish timestamp {0} lies in the distant future")]
    FromTheFuture(u64),
    #[error("manifest revision {seen} older than accepted revision {accepted}")]
    OlderThanAccepted { seen: u64, accepted: u64 },
}

impl Manifest {
    /// Parses the covered fields (everything above the signature
    /// sentinel). Unknown keys are skipped so newer repositories stay
    /// readable.
    fn parse_fields(body: &str) -> Result<Self, ManifestError> {
        let mut root_catalog = None;
        let mut root_path_hash = None;
        let mut publish_timestamp = None;
        let mut ttl = None;
        let mut revision = None;

        for line in body.lines() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(' ')
                .ok_or_else(|| ManifestError::InvalidLine(line.to_string()))?;

            match key {
                "C" => {
                    let digest = ObjectDigest::from_hex(value)
                        .map_err(|_| ManifestError::InvalidLine(line.to_string()))?;
                    if root_catalog.replace(digest).is_some() {
                        return Err(ManifestError::DuplicateField(key.to_string()));
                    }
                }
                "R" => {
                    if !value.is_empty() {
                        let hash = PathHash::from_hex(value)
                            .ok_or_else(|| ManifestError::InvalidLine(line.to_string()))?;
                        if root_path_hash.replace(hash).is_some() {
                            return Err(ManifestError::DuplicateField(key.to_string()));
                        }
                    }
                }
                "T" => {
                    let t = value
                        .parse::<u64>()
                        .map_err(|_| ManifestError::InvalidLine(line.to_string()))?;
                    if publish_timestamp.replace(t).is_some() {
                        return Err(ManifestError::DuplicateField(key.to_string()));
                    }
                }
                "D" => {
                    let d = value
                        .parse::<u64>()
                        .map_err(|_| ManifestError::InvalidLine(line.to_string()))?;
                    if ttl.replace(Duration::from_secs(d)).is_some() {
                        return Err(ManifestError::DuplicateField(key.to_string()));
                    }
                }
                "S" => {
                    let s = value
                        .parse::<u64>()
                        .map_err(|_| ManifestError::InvalidLine(line.to_string()))?;
                    if revision.replace(s).is_some() {
                        return Err(ManifestError::DuplicateField(key.to_string()));
                    }
                }
                _ => {}
            }
        }

        Ok(Manifest {
            root_catalog: root_catalog.ok_or(ManifestError::MissingField("C"))?,
            root_path_hash,
            publish_timestamp: publish_timestamp.ok_or(ManifestError::MissingField("T"))?,
            ttl: ttl.ok_or(ManifestError::MissingField("D"))?,
            revision: revision.ok_or(ManifestError::MissingField("S"))?,
        })
    }
}

/// Verifies manifest texts against the configured repository key and
/// yields the trusted root digest and freshness parameters.
pub struct ManifestVerifier {
    key: Option<VerifyingKey>,
    allow_older: bool,
}

impl ManifestVerifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self {
            key: Some(key),
            allow_older: false,
        }
    }

    /// Skips signature verification entirely. Only for repositories
    /// explicitly mounted with signatures disabled.
    pub fn insecure() -> Self {
        Self {
            key: None,
            allow_older: false,
        }
    }

    /// Accept manifests older than the last accepted one (explicit
    /// rollback).
    pub fn allow_older(mut self, allow: bool) -> Self {
        self.allow_older = allow;
        self
    }

    #[instrument(skip_all, err)]
    pub fn verify(
        &self,
        text: &str,
        last_accepted: Option<&Manifest>,
    ) -> Result<Manifest, ManifestError> {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.verify_at(text, last_accepted, now)
    }

    /// Like [ManifestVerifier::verify], with an explicit clock.
    pub fn verify_at(
        &self,
        text: &str,
        last_accepted: Option<&Manifest>,
        now: u64,
    ) -> Result<Manifest, ManifestError> {
        let (body, signature_block) = split_signature(text)?;

        if let Some(key) = &self.key {
            let signature = parse_signature(signature_block)?;
            let body_digest = Sha1::digest(body.as_bytes());
            if key.verify_strict(body_digest.as_slice(), &signature).is_err() {
                warn!("manifest signature does not verify against the repository key");
                return Err(ManifestError::BadSignature);
            }
        }

        let manifest = Manifest::parse_fields(body)?;

        if manifest.publish_timestamp > now + MAX_CLOCK_SKEW.as_secs() {
            return Err(ManifestError::FromTheFuture(manifest.publish_timestamp));
        }
        if let Some(last) = last_accepted {
            if manifest.revision < last.revision && !self.allow_older {
                return Err(ManifestError::OlderThanAccepted {
                    seen: manifest.revision,
                    accepted: last.revision,
                });
            }
        }

        Ok(manifest)
    }
}

fn split_signature(text: &str) -> Result<(&str, &str), ManifestError> {
    let mut offset = 0;
    for line in text.lines() {
        if line == SIGNATURE_SENTINEL {
            let body = &text[..offset];
            let rest = &text[offset + line.len()..];
            return Ok((body, rest.trim_start_matches('\n')));
        }
        offset += line.len() + 1;
    }
    Err(ManifestError::MissingSignature)
}

fn parse_signature(block: &str) -> Result<Signature, ManifestError> {
    let line = block
        .lines()
        .find(|l| !l.is_empty())
        .ok_or(ManifestError::MissingSignature)?;
    let bytes = BASE64
        .decode(line.as_bytes())
        .map_err(|e| ManifestError::SignatureFormat(e.to_string()))?;
    let bytes: [u8; SIGNATURE_LENGTH] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| ManifestError::SignatureFormat(format!("bad length {}", bytes.len())))?;
    Ok(Signature::from_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Manifest, ManifestError, ManifestVerifier};
    use crate::fixtures::{sign_manifest, test_signing_key};
    use stratofs_castore::ObjectDigest;

    const NOW: u64 = 1700000000;

    fn manifest_body(revision: u64, timestamp: u64) -> String {
        format!(
            "C {}\nT {}\nD 240\nS {}\n",
            ObjectDigest::of(b"root catalog"),
            timestamp,
            revision
        )
    }

    #[test]
    fn verifies_and_parses() {
        let key = test_signing_key();
        let text = sign_manifest(&manifest_body(42, NOW), &key);

        let verifier = ManifestVerifier::new(key.verifying_key());
        let manifest = verifier.verify_at(&text, None, NOW).unwrap();
        assert_eq!(ObjectDigest::of(b"root catalog"), manifest.root_catalog);
        assert_eq!(42, manifest.revision);
        assert_eq!(Duration::from_secs(240), manifest.ttl);
        assert_eq!(None, manifest.root_path_hash);
    }

    #[test]
    fn rejects_tampered_body() {
        let key = test_signing_key();
        let text = sign_manifest(&manifest_body(42, NOW), &key);
        let tampered = text.replace("S 42", "S 43");

        let verifier = ManifestVerifier::new(key.verifying_key());
        assert_eq!(
            Err(ManifestError::BadSignature),
            verifier.verify_at(&tampered, None, NOW)
        );
    }

    #[test]
    fn rejects_missing_signature() {
        let verifier = ManifestVerifier::new(test_signing_key().verifying_key());
        assert_eq!(
            Err(ManifestError::MissingSignature),
            verifier.verify_at(&manifest_body(1, NOW), None, NOW)
        );
    }

    #[test]
    fn rejects_distant_future() {
        let key = test_signing_key();
        let text = sign_manifest(&manifest_body(1, NOW + 7 * 24 * 3600), &key);
        let verifier = ManifestVerifier::new(key.verifying_key());
        match verifier.verify_at(&text, None, NOW) {
            Err(ManifestError::FromTheFuture(_)) => {}
            other => panic!("expected FromTheFuture, got {:?}", other),
        }
    }

    #[test]
    fn rejects_rollback_unless_allowed() {
        let key = test_signing_key();
        let old = sign_manifest(&manifest_body(10, NOW), &key);
        let newer = sign_manifest(&manifest_body(20, NOW), &key);

        let verifier = ManifestVerifier::new(key.verifying_key());
        let accepted = verifier.verify_at(&newer, None, NOW).unwrap();
        assert_eq!(
            Err(ManifestError::OlderThanAccepted {
                seen: 10,
                accepted: 20
            }),
            verifier.verify_at(&old, Some(&accepted), NOW)
        );

        let permissive = ManifestVerifier::new(key.verifying_key()).allow_older(true);
        assert!(permissive.verify_at(&old, Some(&accepted), NOW).is_ok());
    }

    #[test]
    fn insecure_skips_signature_check() {
        let verifier = ManifestVerifier::insecure();
        let text = format!("{}--\n", manifest_body(1, NOW));
        assert!(verifier.verify_at(&text, None, NOW).is_ok());
    }

    #[test]
    fn missing_fields_are_reported() {
        let key = test_signing_key();
        let text = sign_manifest("T 1\nD 2\nS 3\n", &key);
        let verifier = ManifestVerifier::new(key.verifying_key());
        assert_eq!(
            Err(ManifestError::MissingField("C")),
            verifier.verify_at(&text, None, NOW)
        );
    }
}
