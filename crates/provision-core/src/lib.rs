//! Core types shared by every Provision component: the error taxonomy,
//! tiers, versions and constraints, and filesystem path helpers.

pub mod core;

pub use crate::core::error::{FetchError, ProvisionError, ProvisionResult};
pub use crate::core::error_help::{format_error_with_help, ErrorHelp};
pub use crate::core::tier::{Stage, Tier};
pub use crate::core::version::{Version, VersionConstraint};
