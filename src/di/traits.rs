//! Trait definitions for dependency injection

use crate::core::{FetchError, ProvisionResult, Tier};
use crate::fetcher::FetchRequest;
use crate::index::Release;
use crate::installer::InstalledMarker;
use async_trait::async_trait;
use std::path::PathBuf;

/// Trait for available-artifact indexes
///
/// Lists the releases a source knows for one package. Implementations
/// must be thread-safe (Send + Sync); the resolver queries them from async
/// code.
#[async_trait]
pub trait PackageIndex: Send + Sync {
    /// Short label used in logs and error messages
    fn describe(&self) -> String;

    /// Whether querying needs network access (skipped in offline mode)
    fn is_remote(&self) -> bool {
        false
    }

    /// All releases of `name` (normalised) this source knows, in any order.
    /// An unknown package yields an empty list, not an error.
    async fn releases(&self, name: &str) -> ProvisionResult<Vec<Release>>;
}

/// Trait for artifact byte sources
///
/// A source either produces the artifact's bytes, reports that it does not
/// carry the artifact (`Ok(None)`), or fails. Digest checking happens in the
/// fetcher, not here.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    fn describe(&self) -> String;

    /// Whether fetching needs network access (skipped in offline mode)
    fn is_remote(&self) -> bool;

    async fn fetch(&self, request: &FetchRequest) -> Result<Option<Vec<u8>>, FetchError>;
}

/// Trait for post-install import checks
#[async_trait]
pub trait ImportProbe: Send + Sync {
    fn describe(&self) -> String;

    /// Check that `marker`'s package loads from `lookup_path` (nearest scope
    /// first). The error string explains what went wrong.
    async fn probe(
        &self,
        tier: Tier,
        marker: &InstalledMarker,
        lookup_path: &[PathBuf],
    ) -> Result<(), String>;
}
