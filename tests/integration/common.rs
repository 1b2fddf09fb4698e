//! Common utilities for integration tests

use chrono::Utc;
use provision::cache::digest::ChecksumAlgorithm;
use provision::cache::index::{CacheEntry, CacheIndexFile};
use provision::config::{Config, ScopeConfig};
use provision::core::{Tier, Version};
use provision::di::mocks::{MockArtifactSource, MockImportProbe, MockPackageIndex};
use provision::di::ServiceContainer;
use provision::index::Release;
use provision::installer::TierScopes;
use provision::ledger::{read_records, InstallationRecord, LEDGER_FILE};
use provision::manifest::ManifestStore;
use provision::orchestrator::Orchestrator;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

pub fn provision_command() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_provision"));
    command.env_remove("PROVISION_CONFIG");
    command.env_remove("PROVISION_OFFLINE");
    command.env_remove("RUST_LOG");
    command
}

/// Library-level pipeline over mock providers and temporary directories.
pub struct Harness {
    pub temp: TempDir,
    pub index: Arc<MockPackageIndex>,
    pub source: Arc<MockArtifactSource>,
    pub probe: Arc<MockImportProbe>,
    pub config: Config,
    manifest: String,
}

impl Harness {
    pub fn new(manifest: &str) -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let config = Config {
            cache_dir: Some(root.join("cache").to_string_lossy().into_owned()),
            state_dir: Some(root.join("state").to_string_lossy().into_owned()),
            scopes: ScopeConfig::under(&root.join("scopes")),
            ..Default::default()
        };
        Self {
            temp,
            index: Arc::new(MockPackageIndex::new("primary").remote()),
            source: Arc::new(MockArtifactSource::new("primary").remote()),
            probe: Arc::new(MockImportProbe::new()),
            config,
            manifest: manifest.to_string(),
        }
    }

    pub fn publish(&self, name: &str, version: &str, requires: &[&str]) {
        self.index.add_release(
            name,
            Release::new(Version::parse(version).unwrap())
                .with_requires(requires.iter().copied()),
        );
        self.source
            .add_artifact(name, version, format!("{} {}", name, version).into_bytes());
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_for(self.config.clone())
    }

    /// Same providers and manifest, different configuration.
    pub fn orchestrator_for(&self, config: Config) -> Orchestrator {
        let services = ServiceContainer::with_providers(
            config,
            vec![self.index.clone()],
            vec![self.source.clone()],
            self.probe.clone(),
        )
        .unwrap();
        let manifest =
            ManifestStore::parse_str(Path::new("tiers.txt"), &self.manifest).unwrap();
        Orchestrator::new(services, manifest)
    }

    pub fn scopes(&self) -> TierScopes {
        TierScopes::from_config(&self.config.scopes).unwrap()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.temp.path().join("state")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.temp.path().join("cache")
    }

    /// Every ledger record written so far, across runs.
    pub fn ledger(&self) -> Vec<InstallationRecord> {
        read_records(&self.state_dir().join(LEDGER_FILE)).unwrap()
    }
}

/// Lay out a find-links directory holding `(name, version, requires)`
/// entries as opaque payloads. `requires` is comma separated.
pub fn write_find_links(dir: &Path, packages: &[(&str, &str, &str)]) {
    fs::create_dir_all(dir).unwrap();
    let mut index = CacheIndexFile::default();
    for (name, version, requires) in packages {
        let version = Version::parse(version).unwrap();
        let filename = format!("{}-{}.artifact", name, version);
        let bytes = format!("{} {}", name, version).into_bytes();
        fs::write(dir.join(&filename), &bytes).unwrap();
        index.upsert(CacheEntry {
            name: name.to_string(),
            version,
            digest: ChecksumAlgorithm::Sha256.digest(&bytes),
            filename: filename.clone(),
            path: filename,
            size: bytes.len() as u64,
            requires: requires
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect(),
            fetched_at: Utc::now(),
        });
    }
    index.save(dir).unwrap();
}

/// Configuration file pointing every directory the binary touches into `root`.
pub fn write_config(root: &Path, find_links: &Path) -> PathBuf {
    let path = root.join("config.yaml");
    let scopes = root.join("scopes");
    fs::write(
        &path,
        format!(
            "sources:\n  find_links:\n    - {}\nscopes:\n  global: {}\n  wheelhouse: {}\n  local: {}\n",
            find_links.display(),
            scopes.join("global").display(),
            scopes.join("wheelhouse").display(),
            scopes.join("local").display(),
        ),
    )
    .unwrap();
    path
}

pub fn tier_records(records: &[InstallationRecord], tier: Tier) -> Vec<&InstallationRecord> {
    records.iter().filter(|r| r.tier == tier).collect()
}
