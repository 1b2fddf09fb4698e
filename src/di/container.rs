//! Service container for dependency injection

use super::traits::{ArtifactSource, ImportProbe, PackageIndex};
use crate::cache::digest::ChecksumAlgorithm;
use crate::cache::ArtifactCache;
use crate::config::Config;
use crate::core::ProvisionResult;
use crate::fetcher::sources::{FindLinksSource, HttpSource};
use crate::fetcher::{Fetcher, RetryPolicy};
use crate::index::http::HttpIndex;
use crate::index::local::LocalDirIndex;
use crate::index::CompositeIndex;
use crate::installer::{Installer, TierScopes};
use crate::net::HttpClients;
use crate::verifier::{CommandProbe, MarkerProbe, Verifier};
use std::sync::Arc;
use std::time::Duration;

/// Every service a provisioning run needs, built once from a [`Config`].
///
/// Indexes and sources are held as trait objects in priority order, so
/// tests can swap in the in-memory implementations from
/// [`mocks`](crate::di::mocks) while keeping the real cache and installer
/// on a temporary directory.
///
/// # Example (Production)
///
/// ```no_run
/// use provision::config::Config;
/// use provision::di::ServiceContainer;
///
/// # fn example() -> provision::ProvisionResult<()> {
/// let container = ServiceContainer::new(Config::load(None)?)?;
/// println!("cache at {}", container.cache().root().display());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ServiceContainer {
    pub config: Arc<Config>,
    /// Configured indexes: find-links directories, then the primary URL,
    /// then extra URLs. The cache index is added in front by [`Self::index`].
    pub indexes: Vec<Arc<dyn PackageIndex>>,
    /// Configured artifact sources in the order they are tried
    pub sources: Vec<Arc<dyn ArtifactSource>>,
    pub probe: Arc<dyn ImportProbe>,
    pub cache: ArtifactCache,
    pub installer: Arc<Installer>,
}

impl ServiceContainer {
    /// Create a container with production implementations
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - An HTTP client cannot be built
    /// - The cache directory cannot be created or its index is unreadable
    /// - A scope directory cannot be determined
    pub fn new(config: Config) -> ProvisionResult<Self> {
        let clients = HttpClients::new(
            &config.sources,
            Duration::from_secs(config.fetch.timeout_secs),
        )?;

        let mut indexes: Vec<Arc<dyn PackageIndex>> = Vec::new();
        let mut sources: Vec<Arc<dyn ArtifactSource>> = Vec::new();
        for dir in config.sources.find_links_dirs() {
            indexes.push(Arc::new(LocalDirIndex::new(dir.clone(), "find-links")));
            sources.push(Arc::new(FindLinksSource::new(dir)));
        }
        let urls = config.sources.index_urls();
        for url in &urls {
            indexes.push(Arc::new(HttpIndex::new(url, clients.clone())));
        }
        // Release URLs published by an index are tried even without index_url
        sources.push(Arc::new(HttpSource::new(urls, clients)));

        let probe: Arc<dyn ImportProbe> = match &config.verify.command {
            Some(command) => Arc::new(CommandProbe::new(command.clone())),
            None => Arc::new(MarkerProbe),
        };

        Self::with_providers(config, indexes, sources, probe)
    }

    /// Create a container with custom providers; the cache and installer are
    /// still built from `config`.
    pub fn with_providers(
        config: Config,
        indexes: Vec<Arc<dyn PackageIndex>>,
        sources: Vec<Arc<dyn ArtifactSource>>,
        probe: Arc<dyn ImportProbe>,
    ) -> ProvisionResult<Self> {
        let cache = ArtifactCache::open(&config.get_cache_dir()?)?;
        let installer = Arc::new(Installer::new(TierScopes::from_config(&config.scopes)?));
        Ok(Self {
            config: Arc::new(config),
            indexes,
            sources,
            probe,
            cache,
            installer,
        })
    }

    pub fn config(&self) -> &Config {
        self.config.as_ref()
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn installer(&self) -> Arc<Installer> {
        Arc::clone(&self.installer)
    }

    /// Cache first, then the configured indexes. Offline mode drops the
    /// remote ones at query time.
    pub fn index(&self) -> CompositeIndex {
        let mut indexes: Vec<Arc<dyn PackageIndex>> = vec![Arc::new(self.cache.as_index())];
        indexes.extend(self.indexes.iter().cloned());
        CompositeIndex::new(indexes, self.config.offline)
    }

    pub fn fetcher(&self) -> ProvisionResult<Fetcher> {
        let algorithm: ChecksumAlgorithm = self.config.checksum_algorithm.parse()?;
        Ok(Fetcher::new(
            self.sources.clone(),
            RetryPolicy::from_config(&self.config.fetch),
            self.config.offline,
            algorithm,
        ))
    }

    pub fn verifier(&self) -> Verifier {
        Verifier::new(self.installer(), Arc::clone(&self.probe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScopeConfig;
    use crate::core::Tier;
    use crate::di::mocks::{MockArtifactSource, MockImportProbe, MockPackageIndex};
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> Config {
        Config {
            cache_dir: Some(temp.path().join("cache").to_string_lossy().into_owned()),
            scopes: ScopeConfig::under(&temp.path().join("scopes")),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_wires_configured_sources() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp);
        config.sources.index_url = Some("https://packages.internal/simple".to_string());
        config.sources.extra_index_urls = vec!["https://mirror.internal/simple".to_string()];
        config.sources.find_links = vec![temp.path().join("wheels").to_string_lossy().into_owned()];

        let container = ServiceContainer::new(config).unwrap();
        // find-links, primary, extra
        assert_eq!(container.indexes.len(), 3);
        assert!(!container.indexes[0].is_remote());
        assert!(container.indexes[1].is_remote());
        // find-links, http
        assert_eq!(container.sources.len(), 2);
        assert!(container.cache().root().exists());
        assert_eq!(
            container.installer().scopes().dir(Tier::Local),
            temp.path().join("scopes/local")
        );
    }

    #[test]
    fn test_with_providers_uses_injected_services() {
        let temp = TempDir::new().unwrap();
        let container = ServiceContainer::with_providers(
            config(&temp),
            vec![Arc::new(MockPackageIndex::new("primary"))],
            vec![Arc::new(MockArtifactSource::new("primary"))],
            Arc::new(MockImportProbe::new()),
        )
        .unwrap();

        assert_eq!(container.probe.describe(), "mock");
        // The cache index always comes first
        let index = container.index();
        assert_eq!(index.sources().len(), 2);
        assert!(index.sources()[0].describe().starts_with("cache"));
        assert_eq!(container.fetcher().unwrap().algorithm(), ChecksumAlgorithm::Sha256);
    }
}
