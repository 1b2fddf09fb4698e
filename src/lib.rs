//! Provision: tiered, offline-safe dependency provisioning
//!
//! This crate provides the provisioning library used by the `provision`
//! binary, re-exporting core types from `provision-core` and organizing the
//! pipeline components (manifest, resolver, cache, fetcher, installer,
//! verifier) driven by the orchestrator.

pub use provision_core::{
    format_error_with_help, ErrorHelp, FetchError, ProvisionError, ProvisionResult, Stage, Tier,
    Version, VersionConstraint,
};

/// Core module re-exported from provision-core.
pub mod core {
    pub use provision_core::core::*;
    pub use provision_core::*;

    /// Path helpers re-exported from provision-core.
    pub mod path {
        pub use provision_core::core::path::*;
    }
}

/// Configuration management.
pub mod config;

/// HTTP clients shared by the index and the fetcher.
pub mod net;

/// Tier manifest parsing.
pub mod manifest;

/// Available-artifact indexes.
pub mod index;

/// Per-tier dependency resolution.
pub mod resolver;

/// Content-verified artifact cache.
pub mod cache;

/// Artifact download with retry, timeout and digest checks.
pub mod fetcher;

/// Materialising artifacts into tier scopes.
pub mod installer;

/// Post-install import checks.
pub mod verifier;

/// Append-only installation ledger.
pub mod ledger;

/// Tier-by-tier run state machine.
pub mod orchestrator;

/// Dependency injection infrastructure.
pub mod di;

