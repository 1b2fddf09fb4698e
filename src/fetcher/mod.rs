//! Artifact download.
//!
//! The fetcher walks its sources in order (local find-links directories
//! first, then HTTP), retries transient failures with exponential backoff,
//! bounds every attempt with a timeout and checks the bytes against the
//! expected digest before handing them to the cache.

pub mod parallel;
pub mod sources;

pub use parallel::ParallelFetcher;
pub use sources::{FindLinksSource, HttpSource};

use crate::cache::digest::{digest_like, ChecksumAlgorithm};
use crate::config::FetchConfig;
use crate::core::{FetchError, Version};
use crate::di::ArtifactSource;
use crate::resolver::ResolvedPackage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What a source is asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub name: String,
    pub version: Version,
    pub filename: String,
    /// Download URL published by the index
    pub url: Option<String>,
    /// Bytes already on disk, found by a local index
    pub local_path: Option<PathBuf>,
}

impl From<&ResolvedPackage> for FetchRequest {
    fn from(package: &ResolvedPackage) -> Self {
        Self {
            name: package.name.clone(),
            version: package.version.clone(),
            filename: package.artifact.filename.clone(),
            url: package.artifact.url.clone(),
            local_path: package.artifact.local_path.clone(),
        }
    }
}

/// Downloaded bytes with the digest they were accepted under.
#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    pub bytes: Vec<u8>,
    pub digest: String,
    pub origin: String,
}

/// The digests fetched bytes must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpectedDigest {
    /// Pinned in the manifest: the bytes must match at least one
    pub pinned: Vec<String>,
    /// Trusted baseline (first-seen or index-published): must match exactly
    pub baseline: Option<String>,
}

impl ExpectedDigest {
    /// Check `bytes` and return the digest to record for them.
    ///
    /// With nothing expected the bytes are trusted as first seen and digested
    /// with `algorithm`.
    pub fn verify(&self, bytes: &[u8], algorithm: ChecksumAlgorithm) -> Result<String, FetchError> {
        if let Some(baseline) = &self.baseline {
            let actual = digest_like(bytes, baseline).map_err(|e| FetchError::Storage(e.to_string()))?;
            if &actual != baseline {
                return Err(FetchError::DigestMismatch {
                    expected: baseline.clone(),
                    actual,
                });
            }
        }

        let mut matched_pin = None;
        if let Some(first) = self.pinned.first() {
            for pin in &self.pinned {
                let actual = digest_like(bytes, pin).map_err(|e| FetchError::Storage(e.to_string()))?;
                if &actual == pin {
                    matched_pin = Some(actual);
                    break;
                }
            }
            if matched_pin.is_none() {
                let actual = digest_like(bytes, first).map_err(|e| FetchError::Storage(e.to_string()))?;
                return Err(FetchError::DigestMismatch {
                    expected: self.pinned.join(" or "),
                    actual,
                });
            }
        }

        Ok(self
            .baseline
            .clone()
            .or(matched_pin)
            .unwrap_or_else(|| algorithm.digest(bytes)))
    }
}

/// Retry budget for one source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first
    pub retries: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            retries: config.retries,
            backoff: Duration::from_millis(config.backoff_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Delay before retry number `attempt` (0-based): `backoff * 2^attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&FetchConfig::default())
    }
}

pub struct Fetcher {
    sources: Vec<Arc<dyn ArtifactSource>>,
    policy: RetryPolicy,
    offline: bool,
    algorithm: ChecksumAlgorithm,
}

impl Fetcher {
    pub fn new(
        sources: Vec<Arc<dyn ArtifactSource>>,
        policy: RetryPolicy,
        offline: bool,
        algorithm: ChecksumAlgorithm,
    ) -> Self {
        Self {
            sources,
            policy,
            offline,
            algorithm,
        }
    }

    /// A fetcher that consults `source` before the existing sources.
    pub fn with_local_first(&self, source: Arc<dyn ArtifactSource>) -> Self {
        let mut sources = vec![source];
        sources.extend(self.sources.iter().cloned());
        Self::new(sources, self.policy, self.offline, self.algorithm)
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Produce verified bytes for `request`.
    ///
    /// A digest mismatch fails at once. Other failures move on to the next
    /// source; the last one is reported if no source succeeds.
    pub async fn download(
        &self,
        request: &FetchRequest,
        expected: &ExpectedDigest,
    ) -> Result<FetchedArtifact, FetchError> {
        if let Some(path) = &request.local_path {
            if path.is_file() {
                let bytes = tokio::fs::read(path).await?;
                let digest = expected.verify(&bytes, self.algorithm)?;
                debug!("{} {}: read from {}", request.name, request.version, path.display());
                return Ok(FetchedArtifact {
                    bytes,
                    digest,
                    origin: path.display().to_string(),
                });
            }
        }

        let mut tried = Vec::new();
        let mut skipped_remote = false;
        let mut last_error = None;

        for source in &self.sources {
            if self.offline && source.is_remote() {
                skipped_remote = true;
                continue;
            }
            tried.push(source.describe());

            match self.fetch_with_retry(source.as_ref(), request).await {
                Ok(Some(bytes)) => {
                    let digest = expected.verify(&bytes, self.algorithm)?;
                    return Ok(FetchedArtifact {
                        bytes,
                        digest,
                        origin: source.describe(),
                    });
                }
                Ok(None) => {
                    debug!("{} does not provide {} {}", source.describe(), request.name, request.version);
                }
                Err(e) if e.is_digest_mismatch() => return Err(e),
                Err(e) => {
                    warn!("{} failed for {} {}: {}", source.describe(), request.name, request.version, e);
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            return Err(e);
        }
        if skipped_remote {
            return Err(FetchError::Offline);
        }
        Err(FetchError::NotFound {
            tried: if tried.is_empty() {
                "no sources configured".to_string()
            } else {
                tried.join(", ")
            },
        })
    }

    async fn fetch_with_retry(
        &self,
        source: &dyn ArtifactSource,
        request: &FetchRequest,
    ) -> Result<Option<Vec<u8>>, FetchError> {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.policy.timeout, source.fetch(request)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout {
                    origin: source.describe(),
                    seconds: self.policy.timeout.as_secs(),
                }),
            };

            match result {
                Err(e) if e.is_transient() && attempt < self.policy.retries => {
                    let delay = self.policy.delay(attempt);
                    warn!(
                        "{} {}: attempt {} failed ({}), retrying in {:?}",
                        request.name,
                        request.version,
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(FetchError::Exhausted {
                        attempts: attempt + 1,
                        last: Box::new(e),
                    })
                }
                other => return other,
            }
        }
    }
}
