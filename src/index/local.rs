use crate::cache::index::CacheIndexFile;
use crate::core::ProvisionResult;
use crate::di::PackageIndex;
use crate::index::Release;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Index over a directory carrying an `index.json` in cache format: the
/// artifact cache root, a find-links directory or the wheelhouse scope.
///
/// Releases point at the bytes already on disk, so fetching them needs no
/// network.
pub struct LocalDirIndex {
    dir: PathBuf,
    label: String,
}

impl LocalDirIndex {
    pub fn new(dir: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            label: label.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl PackageIndex for LocalDirIndex {
    fn describe(&self) -> String {
        format!("{} ({})", self.label, self.dir.display())
    }

    async fn releases(&self, name: &str) -> ProvisionResult<Vec<Release>> {
        let index = CacheIndexFile::load(&self.dir)?;
        let releases = index
            .for_package(name)
            .filter_map(|entry| {
                let Some(path) = entry.located_in(&self.dir) else {
                    warn!(
                        "{}: ignoring {} {} stored outside the directory at '{}'",
                        self.describe(),
                        entry.name,
                        entry.version,
                        entry.path
                    );
                    return None;
                };
                // Entries whose bytes are gone are not available from here
                if !path.is_file() {
                    return None;
                }
                Some(Release {
                    version: entry.version.clone(),
                    filename: entry.plain_filename().map(str::to_string),
                    url: None,
                    digest: Some(entry.digest.clone()),
                    requires: entry.requires.clone(),
                    local_path: Some(path),
                })
            })
            .collect();
        Ok(releases)
    }
}
