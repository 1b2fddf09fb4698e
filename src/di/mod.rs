//! Dependency injection infrastructure for Provision
//!
//! The pipeline talks to the outside world through three trait seams:
//! [`PackageIndex`] (which versions exist), [`ArtifactSource`] (where the
//! bytes come from) and [`ImportProbe`] (is an installed package usable).
//! [`ServiceContainer`] wires production implementations from a [`Config`];
//! tests inject the in-memory versions from [`mocks`].
//!
//! # Example (Testing)
//! ```
//! use provision::config::Config;
//! use provision::di::{mocks::*, ServiceContainer};
//! use std::sync::Arc;
//!
//! # fn example() -> provision::ProvisionResult<()> {
//! let index = Arc::new(MockPackageIndex::new("primary"));
//! let source = Arc::new(MockArtifactSource::new("primary"));
//! let probe = Arc::new(MockImportProbe::new());
//!
//! let container =
//!     ServiceContainer::with_providers(Config::default(), vec![index], vec![source], probe)?;
//! # Ok(())
//! # }
//! ```
//!
//! [`Config`]: crate::config::Config

pub mod container;
pub mod mocks;
pub mod traits;

// Re-export key types
pub use container::ServiceContainer;
pub use traits::{ArtifactSource, ImportProbe, PackageIndex};
