use crate::core::error::{ProvisionError, ProvisionResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Installation scope, totally ordered from widest to narrowest.
///
/// The set is closed: tiers cannot be added at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// System-wide scope
    Global,
    /// Offline artifact cache exposed to narrower tiers
    Wheelhouse,
    /// Per-user scope
    Local,
}

impl Tier {
    /// All tiers in processing order
    pub const ALL: [Tier; 3] = [Tier::Global, Tier::Wheelhouse, Tier::Local];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Global => "global",
            Tier::Wheelhouse => "wheelhouse",
            Tier::Local => "local",
        }
    }

    /// Tiers whose scopes sit beneath this tier's own on its lookup path,
    /// nearest first.
    ///
    /// LOCAL layers WHEELHOUSE then GLOBAL, WHEELHOUSE layers GLOBAL, and
    /// GLOBAL sees only itself.
    pub fn inherited(&self) -> &'static [Tier] {
        match self {
            Tier::Global => &[],
            Tier::Wheelhouse => &[Tier::Global],
            Tier::Local => &[Tier::Wheelhouse, Tier::Global],
        }
    }

    /// The full lookup path for this tier: itself, then inherited scopes.
    pub fn lookup_layers(&self) -> Vec<Tier> {
        std::iter::once(*self)
            .chain(self.inherited().iter().copied())
            .collect()
    }

    /// The tier processed immediately before this one, if any.
    pub fn previous(&self) -> Option<Tier> {
        match self {
            Tier::Global => None,
            Tier::Wheelhouse => Some(Tier::Global),
            Tier::Local => Some(Tier::Wheelhouse),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

impl FromStr for Tier {
    type Err = ProvisionError;

    fn from_str(s: &str) -> ProvisionResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "global" => Ok(Tier::Global),
            "wheelhouse" => Ok(Tier::Wheelhouse),
            "local" => Ok(Tier::Local),
            other => Err(ProvisionError::Config(format!(
                "Unknown tier '{}'. Expected one of: global, wheelhouse, local",
                other
            ))),
        }
    }
}

/// Per-tier pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Resolving,
    Fetching,
    Installing,
    Verifying,
}

impl Stage {
    /// Exit code reported when a run stops in this stage.
    pub fn exit_code(&self) -> u8 {
        match self {
            Stage::Resolving => 2,
            Stage::Fetching => 3,
            Stage::Installing => 4,
            Stage::Verifying => 5,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Resolving => "resolving",
            Stage::Fetching => "fetching",
            Stage::Installing => "installing",
            Stage::Verifying => "verifying",
        };
        f.write_str(s)
    }
}
