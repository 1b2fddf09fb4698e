use crate::core::{Tier, Version};
use std::collections::BTreeMap;

/// Packages already present in some tier's scope: resolved earlier in this
/// run or recorded as installed by a previous one.
///
/// A tier only sees the entries of the tiers layered beneath it on its
/// lookup path (`Tier::inherited`), nearest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironmentState {
    packages: BTreeMap<(Tier, String), Version>,
}

impl EnvironmentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `name` at `version` in `tier`'s scope, replacing any earlier entry.
    pub fn record(&mut self, tier: Tier, name: impl Into<String>, version: Version) {
        self.packages.insert((tier, name.into()), version);
    }

    /// Version of `name` inherited by `tier`, with the tier it comes from.
    pub fn visible_from(&self, tier: Tier, name: &str) -> Option<(Tier, &Version)> {
        tier.inherited().iter().find_map(|from| {
            self.packages
                .get(&(*from, name.to_string()))
                .map(|version| (*from, version))
        })
    }

    pub fn in_tier(&self, tier: Tier) -> impl Iterator<Item = (&str, &Version)> {
        self.packages
            .iter()
            .filter(move |((t, _), _)| *t == tier)
            .map(|((_, name), version)| (name.as_str(), version))
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}
