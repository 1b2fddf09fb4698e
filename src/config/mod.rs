use crate::core::path::{self, expand_home};
use crate::core::{ProvisionError, ProvisionResult, Tier};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable that forces offline mode.
pub const OFFLINE_ENV: &str = "PROVISION_OFFLINE";

/// Environment variable selecting the configuration file.
pub const CONFIG_ENV: &str = "PROVISION_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Package sources read by every tier's fetcher and index
    #[serde(default)]
    pub sources: SourceConfig,

    /// Target directory for each tier's scope
    #[serde(default)]
    pub scopes: ScopeConfig,

    /// Tiers whose failure only logs a warning instead of aborting the run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_tiers: Vec<Tier>,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub verify: VerifyConfig,

    /// Artifact cache directory (defaults to platform-specific cache directory)
    ///
    /// Default locations:
    /// - Windows: %LOCALAPPDATA%\provision\cache
    /// - Linux: ~/.cache/provision
    /// - macOS: ~/Library/Caches/provision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,

    /// Directory for the ledger, run lock and last report
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,

    /// Remove a tier's freshly materialised payloads when its install stage fails
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,

    /// Digest algorithm for first-seen artifacts
    /// - "sha256": SHA-256 (default, matches index-published hashes)
    /// - "blake3": BLAKE3
    #[serde(default = "default_checksum_algorithm")]
    pub checksum_algorithm: String,

    /// Treat every cache miss as fatal instead of reaching the network.
    /// Never read from the file; set from `PROVISION_OFFLINE` or `--offline`.
    #[serde(skip)]
    pub offline: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: SourceConfig::default(),
            scopes: ScopeConfig::default(),
            optional_tiers: Vec::new(),
            fetch: FetchConfig::default(),
            verify: VerifyConfig::default(),
            cache_dir: None,
            state_dir: None,
            rollback_on_failure: default_true(),
            checksum_algorithm: default_checksum_algorithm(),
            offline: false,
        }
    }
}

/// Recognised package-source options, shared by all tiers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Primary artifact source
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_url: Option<String>,

    /// Fallback sources, queried after the primary
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_index_urls: Vec<String>,

    /// Hosts for which TLS certificate verification is disabled
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trusted_hosts: Vec<String>,

    /// Local directories treated as additional sources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub find_links: Vec<String>,
}

impl SourceConfig {
    /// All remote index URLs, primary first.
    pub fn index_urls(&self) -> Vec<String> {
        self.index_url
            .iter()
            .chain(self.extra_index_urls.iter())
            .map(|u| u.trim_end_matches('/').to_string())
            .collect()
    }

    pub fn find_links_dirs(&self) -> Vec<PathBuf> {
        self.find_links.iter().map(|d| expand_home(d)).collect()
    }

    pub fn is_trusted_host(&self, host: &str) -> bool {
        self.trusted_hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(host))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wheelhouse: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
}

impl ScopeConfig {
    /// Directory for a tier's scope, falling back to the data directory.
    pub fn dir(&self, tier: Tier) -> ProvisionResult<PathBuf> {
        let configured = match tier {
            Tier::Global => self.global.as_deref(),
            Tier::Wheelhouse => self.wheelhouse.as_deref(),
            Tier::Local => self.local.as_deref(),
        };
        match configured {
            Some(dir) => Ok(expand_home(dir)),
            None => path::default_scope_dir(tier),
        }
    }

    /// Point every scope below `root` (`<root>/global`, `<root>/wheelhouse`, ...).
    pub fn under(root: &Path) -> Self {
        let dir = |tier: Tier| Some(root.join(tier.as_str()).to_string_lossy().into_owned());
        Self {
            global: dir(Tier::Global),
            wheelhouse: dir(Tier::Wheelhouse),
            local: dir(Tier::Local),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Worker pool size for a tier's fetch stage
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Extra attempts after the first for transient failures
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Base delay; attempt `n` waits `backoff_ms * 2^n`
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Upper bound for a single attempt
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Import probe, e.g. `["python3", "-c", "import {module}"]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    /// Skip the verification stage entirely
    #[serde(default)]
    pub skip: bool,
}

fn default_true() -> bool {
    true
}

fn default_checksum_algorithm() -> String {
    "sha256".to_string()
}

fn default_max_concurrent() -> usize {
    8
}

fn default_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_timeout_secs() -> u64 {
    60
}

impl Config {
    /// Load config from an explicit path, `PROVISION_CONFIG`, or the
    /// platform-specific config directory, in that order.
    ///
    /// A missing file yields the defaults; loading never writes.
    pub fn load(explicit: Option<&Path>) -> ProvisionResult<Self> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => match std::env::var(CONFIG_ENV) {
                Ok(p) if !p.trim().is_empty() => Some(expand_home(p.trim())),
                _ => path::config_file().ok(),
            },
        };

        let mut config = match path {
            Some(p) if p.exists() => Self::from_file(&p)?,
            Some(p) if explicit.is_some() => {
                return Err(ProvisionError::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )))
            }
            _ => Self::default(),
        };

        config.offline = offline_from_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ProvisionResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
            .map_err(|e| ProvisionError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(content: &str) -> ProvisionResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
            .map_err(|e| ProvisionError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> ProvisionResult<()> {
        if self.fetch.max_concurrent == 0 {
            return Err(ProvisionError::Config(
                "fetch.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.fetch.timeout_secs == 0 {
            return Err(ProvisionError::Config(
                "fetch.timeout_secs must be at least 1".to_string(),
            ));
        }
        for url in self.sources.index_urls() {
            reqwest::Url::parse(&url).map_err(|e| {
                ProvisionError::Config(format!("Invalid index URL '{}': {}", url, e))
            })?;
        }
        match self.checksum_algorithm.as_str() {
            "sha256" | "blake3" => {}
            other => {
                return Err(ProvisionError::Config(format!(
                    "Unknown checksum_algorithm '{}'. Must be 'sha256' or 'blake3'",
                    other
                )))
            }
        }
        if let Some(command) = &self.verify.command {
            if command.is_empty() {
                return Err(ProvisionError::Config(
                    "verify.command must name a program".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Get the cache directory path
    pub fn get_cache_dir(&self) -> ProvisionResult<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(expand_home(dir)),
            None => path::cache_dir(),
        }
    }

    /// Get the state directory path
    pub fn get_state_dir(&self) -> ProvisionResult<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_home(dir)),
            None => path::state_dir(),
        }
    }

    pub fn is_optional(&self, tier: Tier) -> bool {
        self.optional_tiers.contains(&tier)
    }
}

/// Whether `PROVISION_OFFLINE` is set to a truthy value.
pub fn offline_from_env() -> bool {
    std::env::var(OFFLINE_ENV)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
