//! Available-artifact indexes.
//!
//! Every source answers the same question: which releases of a package exist,
//! where their bytes live, what digest they were published with and what
//! they require. Local sources (the artifact cache, find-links directories,
//! the wheelhouse scope) are queried before remote ones.

pub mod http;
pub mod local;

pub use http::HttpIndex;
pub use local::LocalDirIndex;

use crate::core::path::is_plain_file_name;
use crate::core::{ProvisionResult, Version};
use crate::di::PackageIndex;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One published version of a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub version: Version,
    /// Artifact file name as published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Absolute download URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Published digest in `algo:hex` form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Dependency specifiers of this release
    #[serde(default)]
    pub requires: Vec<String>,
    /// Set by local indexes: the artifact is already on disk here
    #[serde(skip)]
    pub local_path: Option<PathBuf>,
}

impl Release {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            filename: None,
            url: None,
            digest: None,
            requires: Vec::new(),
            local_path: None,
        }
    }

    pub fn with_requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// File name to store the artifact under. Falls back to the default
    /// when the index gave none or gave one that is not a bare file name.
    pub fn filename_or_default(&self, name: &str) -> String {
        self.filename
            .as_deref()
            .filter(|f| is_plain_file_name(f))
            .map(str::to_string)
            .unwrap_or_else(|| default_filename(name, &self.version))
    }
}

/// `<name>-<version>.artifact`
pub fn default_filename(name: &str, version: &Version) -> String {
    format!("{}-{}.artifact", name, version)
}

/// Document served at `{index_url}/{name}/index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDocument {
    pub name: String,
    #[serde(default)]
    pub releases: Vec<Release>,
}

/// Queries several indexes in order; the first source to list a version
/// wins for that version. Results are memoised for the life of the index so
/// one run sees one consistent view.
pub struct CompositeIndex {
    indexes: Vec<Arc<dyn PackageIndex>>,
    offline: bool,
    memo: Mutex<HashMap<String, Vec<Release>>>,
}

impl CompositeIndex {
    pub fn new(indexes: Vec<Arc<dyn PackageIndex>>, offline: bool) -> Self {
        Self {
            indexes,
            offline,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// A new composite with `extra` queried before the existing sources.
    pub fn with_local_first(&self, extra: Arc<dyn PackageIndex>) -> Self {
        let mut indexes = vec![extra];
        indexes.extend(self.indexes.iter().cloned());
        Self::new(indexes, self.offline)
    }

    pub fn sources(&self) -> &[Arc<dyn PackageIndex>] {
        &self.indexes
    }
}

#[async_trait]
impl PackageIndex for CompositeIndex {
    fn describe(&self) -> String {
        let names: Vec<String> = self.indexes.iter().map(|i| i.describe()).collect();
        format!("composite[{}]", names.join(", "))
    }

    async fn releases(&self, name: &str) -> ProvisionResult<Vec<Release>> {
        let mut memo = self.memo.lock().await;
        if let Some(cached) = memo.get(name) {
            return Ok(cached.clone());
        }

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        let mut queried = 0;
        let mut failed = 0;
        let mut last_error = None;
        for index in &self.indexes {
            if self.offline && index.is_remote() {
                debug!("offline: skipping {} for {}", index.describe(), name);
                continue;
            }
            queried += 1;
            let releases = match index.releases(name).await {
                Ok(releases) => releases,
                Err(e) => {
                    warn!("{} failed for {}: {}", index.describe(), name, e);
                    failed += 1;
                    last_error = Some(e);
                    continue;
                }
            };
            for release in releases {
                if seen.insert(release.version.clone()) {
                    merged.push(release);
                }
            }
        }
        // Unreachable sources are tolerated while at least one answered
        if failed == queried {
            if let Some(error) = last_error {
                return Err(error);
            }
        }
        merged.sort_by(|a, b| b.version.cmp(&a.version));

        memo.insert(name.to_string(), merged.clone());
        Ok(merged)
    }
}
