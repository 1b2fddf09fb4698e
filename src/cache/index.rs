//! On-disk `index.json` shared by the artifact cache, the wheelhouse scope
//! and find-links directories.

use crate::core::path::{is_contained_path, is_plain_file_name};
use crate::core::{ProvisionError, ProvisionResult, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const INDEX_FILE: &str = "index.json";

const INDEX_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub name: String,
    pub version: Version,
    /// Trusted digest (`algo:hex`), fixed the first time the bytes were seen
    pub digest: String,
    /// Artifact file name as published
    pub filename: String,
    /// Location of the bytes relative to the directory holding `index.json`
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub requires: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Location of the bytes under `dir`; `None` when `path` would leave it.
    pub fn located_in(&self, dir: &Path) -> Option<PathBuf> {
        is_contained_path(&self.path).then(|| dir.join(&self.path))
    }

    /// The published file name, when it is safe to reuse as one.
    pub fn plain_filename(&self) -> Option<&str> {
        is_plain_file_name(&self.filename).then_some(self.filename.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheIndexFile {
    #[serde(default = "default_format")]
    pub format: u32,
    #[serde(default)]
    pub entries: Vec<CacheEntry>,
}

fn default_format() -> u32 {
    INDEX_FORMAT
}

impl Default for CacheIndexFile {
    fn default() -> Self {
        Self {
            format: INDEX_FORMAT,
            entries: Vec::new(),
        }
    }
}

impl CacheIndexFile {
    /// Load `<dir>/index.json`; a missing file is an empty index.
    pub fn load(dir: &Path) -> ProvisionResult<Self> {
        let path = dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| {
            ProvisionError::Cache(format!("Corrupt index {}: {}", path.display(), e))
        })
    }

    /// Write `<dir>/index.json` through a temp file and rename.
    pub fn save(&self, dir: &Path) -> ProvisionResult<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(&dir.join(INDEX_FILE), &json)
    }

    pub fn get(&self, name: &str, version: &Version) -> Option<&CacheEntry> {
        self.entries
            .iter()
            .find(|e| e.name == name && &e.version == version)
    }

    /// Insert or replace the entry for (name, version), keeping entries sorted.
    pub fn upsert(&mut self, entry: CacheEntry) {
        self.entries
            .retain(|e| !(e.name == entry.name && e.version == entry.version));
        self.entries.push(entry);
        self.entries
            .sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
    }

    pub fn remove(&mut self, name: &str, version: &Version) -> Option<CacheEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.name == name && &e.version == version)?;
        Some(self.entries.remove(pos))
    }

    pub fn for_package<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a CacheEntry> + 'a {
        self.entries.iter().filter(move |e| e.name == name)
    }
}

/// Write `data` to `path` so readers only ever see the old or the new file.
pub fn write_atomic(path: &Path, data: &[u8]) -> ProvisionResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| ProvisionError::Cache(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent)?;
    let tmp = temp_path(path);
    fs::write(&tmp, data)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()))
}
