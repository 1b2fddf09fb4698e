pub mod digest;
pub mod index;

use crate::core::path::ensure_dir;
use crate::core::{FetchError, ProvisionError, ProvisionResult, Version};
use crate::fetcher::{ExpectedDigest, FetchRequest, Fetcher};
use crate::index::LocalDirIndex;
use crate::resolver::ResolvedPackage;
use chrono::Utc;
use digest::ChecksumAlgorithm;
use index::{write_atomic, CacheEntry, CacheIndexFile};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const ARTIFACTS_DIR: &str = "artifacts";

/// A verified artifact held by the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub version: Version,
    pub digest: String,
    pub path: PathBuf,
    pub size: u64,
    /// File name as published
    pub filename: String,
    pub requires: Vec<String>,
}

impl ArtifactRecord {
    fn from_entry(root: &Path, entry: &CacheEntry) -> Self {
        Self {
            name: entry.name.clone(),
            version: entry.version.clone(),
            digest: entry.digest.clone(),
            path: root.join(&entry.path),
            size: entry.size,
            filename: entry.filename.clone(),
            requires: entry.requires.clone(),
        }
    }
}

/// Version-addressed artifact store shared by all fetch workers.
///
/// Layout: `<root>/artifacts/<name>-<version>.artifact` plus `<root>/index.json`
/// recording each artifact's trusted digest. Entries persist across runs and
/// are only removed by `prune`.
#[derive(Clone)]
pub struct ArtifactCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    root: PathBuf,
    index: Mutex<CacheIndexFile>,
    /// One lock per (name, version); unrelated keys never wait on each other
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArtifactCache {
    /// Open (creating if needed) the cache rooted at `root`.
    pub fn open(root: &Path) -> ProvisionResult<Self> {
        ensure_dir(&root.join(ARTIFACTS_DIR))?;
        let index = CacheIndexFile::load(root)?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                root: root.to_path_buf(),
                index: Mutex::new(index),
                locks: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// The cache viewed as a package index, so warm entries resolve offline.
    pub fn as_index(&self) -> LocalDirIndex {
        LocalDirIndex::new(self.root(), "cache")
    }

    pub fn artifact_path(&self, name: &str, version: &Version) -> PathBuf {
        self.inner.root.join(Self::relative_path(name, version))
    }

    fn relative_path(name: &str, version: &Version) -> String {
        format!("{}/{}-{}.artifact", ARTIFACTS_DIR, name, version)
    }

    fn index(&self) -> MutexGuard<'_, CacheIndexFile> {
        self.inner
            .index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    pub fn lookup(&self, name: &str, version: &Version) -> Option<CacheEntry> {
        self.index().get(name, version).cloned()
    }

    /// Return a verified record for `package`, downloading through `fetcher`
    /// on a miss.
    ///
    /// A hit re-hashes the stored bytes against the recorded digest, so bytes
    /// altered after caching fail with a digest mismatch. The recorded digest
    /// outlives the file: a re-download must reproduce it.
    pub async fn ensure(
        &self,
        package: &ResolvedPackage,
        fetcher: &Fetcher,
    ) -> ProvisionResult<ArtifactRecord> {
        let fetch_error = |error: FetchError| ProvisionError::Fetch {
            package: package.name.clone(),
            version: package.version.to_string(),
            error,
        };

        let key = format!("{}=={}", package.name, package.version);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let existing = self.lookup(&package.name, &package.version);
        let mut expected = ExpectedDigest {
            pinned: package.artifact.pinned.clone(),
            baseline: package.artifact.published_digest.clone(),
        };

        if let Some(entry) = existing {
            let stored = entry
                .located_in(&self.inner.root)
                .filter(|path| path.is_file());
            if let Some(path) = stored {
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|e| fetch_error(e.into()))?;
                expected.baseline = Some(entry.digest.clone());
                expected
                    .verify(&bytes, ChecksumAlgorithm::default())
                    .map_err(fetch_error)?;
                debug!("cache hit: {}", key);
                return Ok(ArtifactRecord::from_entry(&self.inner.root, &entry));
            }
            debug!("cache entry {} lost its bytes, re-fetching", key);
            expected.baseline = Some(entry.digest);
        }

        info!("fetching {}", key);
        let fetched = fetcher
            .download(&FetchRequest::from(package), &expected)
            .await
            .map_err(fetch_error)?;

        let relative = Self::relative_path(&package.name, &package.version);
        write_atomic(&self.inner.root.join(&relative), &fetched.bytes)
            .map_err(|e| fetch_error(FetchError::Storage(e.to_string())))?;

        let entry = CacheEntry {
            name: package.name.clone(),
            version: package.version.clone(),
            digest: fetched.digest,
            filename: package.artifact.filename.clone(),
            path: relative,
            size: fetched.bytes.len() as u64,
            requires: package.requires.clone(),
            fetched_at: Utc::now(),
        };
        let record = ArtifactRecord::from_entry(&self.inner.root, &entry);
        {
            let mut index = self.index();
            index.upsert(entry);
            index
                .save(&self.inner.root)
                .map_err(|e| fetch_error(FetchError::Storage(e.to_string())))?;
        }
        debug!("cached {} from {}", key, fetched.origin);
        Ok(record)
    }

    /// Every cached artifact, sorted by name then version.
    pub fn entries(&self) -> Vec<ArtifactRecord> {
        self.index()
            .entries
            .iter()
            .map(|e| ArtifactRecord::from_entry(&self.inner.root, e))
            .collect()
    }

    /// Remove every entry not listed in `keep`, returning what was removed.
    pub fn prune(&self, keep: &[(String, Version)]) -> ProvisionResult<Vec<ArtifactRecord>> {
        let keep: HashSet<(&str, &Version)> = keep.iter().map(|(n, v)| (n.as_str(), v)).collect();
        let mut index = self.index();

        let (kept, dropped): (Vec<CacheEntry>, Vec<CacheEntry>) = index
            .entries
            .drain(..)
            .partition(|e| keep.contains(&(e.name.as_str(), &e.version)));
        index.entries = kept;

        let mut removed = Vec::with_capacity(dropped.len());
        for entry in dropped {
            let record = ArtifactRecord::from_entry(&self.inner.root, &entry);
            if record.path.exists() {
                fs::remove_file(&record.path).map_err(|e| {
                    ProvisionError::Cache(format!(
                        "Failed to remove {}: {}",
                        record.path.display(),
                        e
                    ))
                })?;
            }
            removed.push(record);
        }
        index.save(&self.inner.root)?;

        let referenced: HashSet<PathBuf> = index
            .entries
            .iter()
            .map(|e| self.inner.root.join(&e.path))
            .collect();
        drop(index);
        self.sweep_orphans(&referenced)?;
        Ok(removed)
    }

    /// Delete files under `artifacts/` that no index entry points at, such
    /// as partial downloads left by an interrupted run.
    fn sweep_orphans(&self, referenced: &HashSet<PathBuf>) -> ProvisionResult<usize> {
        use walkdir::WalkDir;

        let mut swept = 0;
        for entry in WalkDir::new(self.inner.root.join(ARTIFACTS_DIR))
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() || referenced.contains(entry.path()) {
                continue;
            }
            fs::remove_file(entry.path()).map_err(|e| {
                ProvisionError::Cache(format!(
                    "Failed to remove {}: {}",
                    entry.path().display(),
                    e
                ))
            })?;
            debug!("swept orphaned cache file {}", entry.path().display());
            swept += 1;
        }
        Ok(swept)
    }
}
