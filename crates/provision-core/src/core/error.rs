use crate::core::tier::{Stage, Tier};
use std::path::PathBuf;
use thiserror::Error;

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Malformed line, duplicate (name, tier) pair or unknown tier header.
    /// `line` is 1-based; 0 means the error concerns the whole file.
    #[error("Manifest error in {path} (line {line}): {message}")]
    ManifestParse {
        path: String,
        line: usize,
        message: String,
    },

    #[error("Cannot resolve '{package}' for tier {tier}: {message}{}", format_conflicts(.conflicting))]
    Unresolvable {
        tier: Tier,
        package: String,
        message: String,
        /// Every constraint that mentioned the package, with who required it.
        conflicting: Vec<String>,
    },

    #[error("Failed to fetch {package} {version}: {error}")]
    Fetch {
        package: String,
        version: String,
        #[source]
        error: FetchError,
    },

    #[error("Failed to install {package} into {tier} scope at {}: {message}", .path.display())]
    Install {
        tier: Tier,
        package: String,
        path: PathBuf,
        message: String,
    },

    /// The bytes are in place but the installed unit is not usable.
    #[error("Verification failed for {package} in {tier} scope: {message}")]
    Verification {
        tier: Tier,
        package: String,
        message: String,
    },

    /// A component error annotated by the orchestrator with where it happened.
    #[error("{tier} tier failed while {stage}: {error}")]
    Staged {
        tier: Tier,
        stage: Stage,
        #[source]
        error: Box<ProvisionError>,
    },

    #[error("Another provisioning run holds the lock at {}", .path.display())]
    RunLocked { path: PathBuf },

    #[error("Provisioning run cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Path error: {0}")]
    Path(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

fn format_conflicts(conflicting: &[String]) -> String {
    if conflicting.is_empty() {
        String::new()
    } else {
        format!(" [{}]", conflicting.join("; "))
    }
}

impl ProvisionError {
    /// Process exit code for this error.
    ///
    /// `0` success, `1` manifest, `2` resolution, `3` fetch, `4` install,
    /// `5` verification, `6` run lock held, `7` cancelled.
    pub fn exit_code(&self) -> u8 {
        match self {
            ProvisionError::ManifestParse { .. } | ProvisionError::Config(_) => 1,
            ProvisionError::Unresolvable { .. } => 2,
            ProvisionError::Fetch { .. } => 3,
            ProvisionError::Install { .. } => 4,
            ProvisionError::Verification { .. } => 5,
            ProvisionError::RunLocked { .. } => 6,
            ProvisionError::Cancelled => 7,
            ProvisionError::Staged { stage, error, .. } => {
                error.taxonomy_code().unwrap_or(stage.exit_code())
            }
            _ => 1,
        }
    }

    fn taxonomy_code(&self) -> Option<u8> {
        match self {
            ProvisionError::ManifestParse { .. }
            | ProvisionError::Unresolvable { .. }
            | ProvisionError::Fetch { .. }
            | ProvisionError::Install { .. }
            | ProvisionError::Verification { .. }
            | ProvisionError::RunLocked { .. }
            | ProvisionError::Cancelled
            | ProvisionError::Staged { .. } => Some(self.exit_code()),
            _ => None,
        }
    }

    /// Wrap an error with the tier and stage it surfaced in.
    pub fn staged(self, tier: Tier, stage: Stage) -> Self {
        match self {
            already @ ProvisionError::Staged { .. } => already,
            ProvisionError::Cancelled => ProvisionError::Cancelled,
            error => ProvisionError::Staged {
                tier,
                stage,
                error: Box::new(error),
            },
        }
    }

    /// The innermost component error, looking through orchestrator annotations.
    pub fn root(&self) -> &ProvisionError {
        match self {
            ProvisionError::Staged { error, .. } => error.root(),
            other => other,
        }
    }

    /// Package named by the error, if any.
    pub fn package(&self) -> Option<&str> {
        match self.root() {
            ProvisionError::Unresolvable { package, .. }
            | ProvisionError::Fetch { package, .. }
            | ProvisionError::Install { package, .. }
            | ProvisionError::Verification { package, .. } => Some(package),
            _ => None,
        }
    }
}

/// Errors from downloading or validating a single artifact.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Connection reset, 5xx and similar; retried with backoff.
    #[error("transient failure from {origin}: {message}")]
    Transient { origin: String, message: String },

    /// A single attempt exceeded its timeout; retried with backoff.
    #[error("attempt against {origin} timed out after {seconds}s")]
    Timeout { origin: String, seconds: u64 },

    #[error("no source provides the artifact (tried: {tried})")]
    NotFound { tried: String },

    /// Never retried: the bytes may have been tampered with.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("offline mode: artifact is not cached and no local source provides it")]
    Offline,

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },

    #[error("cache storage failed: {0}")]
    Storage(String),
}

impl FetchError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. } | FetchError::Timeout { .. })
    }

    pub fn is_digest_mismatch(&self) -> bool {
        match self {
            FetchError::DigestMismatch { .. } => true,
            FetchError::Exhausted { last, .. } => last.is_digest_mismatch(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        FetchError::Storage(e.to_string())
    }
}
