//! Per-tier dependency resolution.
//!
//! Resolution is a worklist over package names. Every requirement that
//! mentions a package adds a constraint to it; the selected version is the
//! highest release satisfying all of them. When a new constraint rules out
//! a selection, the package is re-selected and the constraints its old
//! release contributed are withdrawn. Packages already provided by a wider
//! tier are reported as inherited instead of being resolved again, unless
//! the inherited version fails the constraints of this tier.
//!
//! Selection is greedy and never backtracks: a conflict that only an older
//! release of the requiring package would avoid is still reported as
//! unresolvable. Pin that package in the manifest to steer around it.

mod environment;

pub use environment::EnvironmentState;

use crate::core::version::VersionConstraint;
use crate::core::{ProvisionError, ProvisionResult, Tier, Version};
use crate::di::PackageIndex;
use crate::index::Release;
use crate::manifest::{parse_requirement, DependencySpec};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Upper bound on how often one package may be (re)evaluated in a run.
const MAX_EVALUATIONS: usize = 64;

/// Where the bytes of a resolved package come from and what they must hash to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactRef {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Set when a local index already holds the bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    /// Digest published by the index, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_digest: Option<String>,
    /// Digests pinned in the manifest; the bytes must match one of them
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pinned: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: Version,
    /// Tier this package is resolved for (and installed into)
    pub tier: Tier,
    pub artifact: ArtifactRef,
    pub requires: Vec<String>,
    /// Declared in the manifest, as opposed to pulled in transitively
    pub declared: bool,
}

/// A requirement satisfied by a wider tier's scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InheritedPackage {
    pub name: String,
    pub version: Version,
    pub from: Tier,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub tier: Tier,
    /// Declaration order of roots, then discovery order of transitive packages
    pub packages: Vec<ResolvedPackage>,
    pub inherited: Vec<InheritedPackage>,
}

impl Resolution {
    pub fn get(&self, name: &str) -> Option<&ResolvedPackage> {
        self.packages.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirer {
    Manifest { line: usize },
    Package { name: String, version: Version },
}

impl fmt::Display for Requirer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirer::Manifest { line } => write!(f, "manifest line {}", line),
            Requirer::Package { name, version } => write!(f, "{} {}", name, version),
        }
    }
}

#[derive(Debug, Clone)]
struct ConstraintEntry {
    constraint: VersionConstraint,
    text: String,
    requirer: Requirer,
}

/// Resolves one tier at a time against an available-artifact index.
pub struct Resolver {
    index: Arc<dyn PackageIndex>,
}

impl Resolver {
    pub fn new(index: Arc<dyn PackageIndex>) -> Self {
        Self { index }
    }

    /// Resolve `specs` (all declared for `tier`) into a concrete version set.
    ///
    /// Deterministic for a fixed manifest, index and environment.
    pub async fn resolve(
        &self,
        tier: Tier,
        specs: &[DependencySpec],
        env: &EnvironmentState,
    ) -> ProvisionResult<Resolution> {
        let mut state = State::new(tier);

        for spec in specs {
            state.declared.push(spec.name.clone());
            state.pins.insert(spec.name.clone(), spec.hashes.clone());
            state.add_constraint(
                &spec.name,
                ConstraintEntry {
                    constraint: spec.constraint.clone(),
                    text: spec.constraint_text.clone(),
                    requirer: Requirer::Manifest { line: spec.line },
                },
            );
        }

        while let Some(name) = state.queue.pop_front() {
            let evaluations = state.evaluations.entry(name.clone()).or_insert(0);
            *evaluations += 1;
            if *evaluations > MAX_EVALUATIONS {
                return Err(state.unresolvable(
                    &name,
                    format!(
                        "selection did not settle after {} attempts",
                        MAX_EVALUATIONS
                    ),
                ));
            }

            let entries = state.constraints.get(&name).cloned().unwrap_or_default();
            if entries.is_empty() {
                // Nothing requires it any more
                state.inherited.remove(&name);
                state.unselect(&name);
                continue;
            }
            let combined = entries
                .iter()
                .map(|e| e.constraint.clone())
                .fold(VersionConstraint::Any, VersionConstraint::and);

            if let Some((from, version)) = env.visible_from(tier, &name) {
                if combined.matches(version) {
                    debug!("{}: {} {} inherited from {}", tier, name, version, from);
                    state.unselect(&name);
                    state.inherited.insert(name.clone(), (from, version.clone()));
                    continue;
                }
                debug!(
                    "{}: inherited {} {} does not satisfy {}, resolving locally",
                    tier, name, version, combined
                );
            }
            state.inherited.remove(&name);

            let releases = self.index.releases(&name).await?;
            let best = releases
                .iter()
                .filter(|r| combined.matches(&r.version))
                .max_by(|a, b| a.version.cmp(&b.version))
                .cloned();

            let best = match best {
                Some(best) => best,
                None => {
                    let message = if releases.is_empty() {
                        "no releases found in any configured source".to_string()
                    } else {
                        let mut available: Vec<&Version> =
                            releases.iter().map(|r| &r.version).collect();
                        available.sort_by(|a, b| b.cmp(a));
                        let listed: Vec<String> =
                            available.iter().take(10).map(|v| v.to_string()).collect();
                        format!(
                            "no available version satisfies {} (available: {})",
                            combined,
                            listed.join(", ")
                        )
                    };
                    return Err(state.unresolvable(&name, message));
                }
            };

            if state
                .selected
                .get(&name)
                .is_some_and(|current| current.version == best.version)
            {
                continue;
            }

            state.unselect(&name);
            debug!("{}: selected {} {}", tier, name, best.version);

            for requirement in &best.requires {
                let req = parse_requirement(requirement).map_err(|e| {
                    state.unresolvable(
                        &name,
                        format!(
                            "release {} declares invalid requirement '{}': {}",
                            best.version, requirement, e
                        ),
                    )
                })?;
                state.add_constraint(
                    &req.name,
                    ConstraintEntry {
                        constraint: req.constraint,
                        text: req.constraint_text,
                        requirer: Requirer::Package {
                            name: name.clone(),
                            version: best.version.clone(),
                        },
                    },
                );
            }
            state.selected.insert(name, best);
        }

        Ok(state.finish())
    }
}

struct State {
    tier: Tier,
    declared: Vec<String>,
    pins: HashMap<String, Vec<String>>,
    constraints: HashMap<String, Vec<ConstraintEntry>>,
    /// Discovery order of every name ever mentioned
    order: Vec<String>,
    selected: HashMap<String, Release>,
    inherited: HashMap<String, (Tier, Version)>,
    evaluations: HashMap<String, usize>,
    queue: VecDeque<String>,
}

impl State {
    fn new(tier: Tier) -> Self {
        Self {
            tier,
            declared: Vec::new(),
            pins: HashMap::new(),
            constraints: HashMap::new(),
            order: Vec::new(),
            selected: HashMap::new(),
            inherited: HashMap::new(),
            evaluations: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    fn enqueue(&mut self, name: &str) {
        if !self.queue.iter().any(|n| n == name) {
            self.queue.push_back(name.to_string());
        }
    }

    fn add_constraint(&mut self, name: &str, entry: ConstraintEntry) {
        if !self.constraints.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.constraints
            .entry(name.to_string())
            .or_default()
            .push(entry);
        self.enqueue(name);
    }

    /// Drop the selection for `name` and withdraw the constraints its release
    /// placed on other packages.
    fn unselect(&mut self, name: &str) {
        if self.selected.remove(name).is_none() {
            return;
        }
        let mut affected = Vec::new();
        for (dep, entries) in self.constraints.iter_mut() {
            let before = entries.len();
            entries.retain(|e| !matches!(&e.requirer, Requirer::Package { name: n, .. } if n == name));
            if entries.len() != before {
                affected.push(dep.clone());
            }
        }
        affected.sort_by_key(|dep| self.order.iter().position(|n| n == dep));
        for dep in affected {
            self.enqueue(&dep);
        }
    }

    fn unresolvable(&self, name: &str, message: String) -> ProvisionError {
        let conflicting = self
            .constraints
            .get(name)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| {
                        let text = if e.text.is_empty() { "(any)" } else { &e.text };
                        format!("{} requires {}{}", e.requirer, name, text)
                    })
                    .collect()
            })
            .unwrap_or_default();

        ProvisionError::Unresolvable {
            tier: self.tier,
            package: name.to_string(),
            message,
            conflicting,
        }
    }

    /// Keep only what the declared roots still reach, in discovery order.
    fn finish(self) -> Resolution {
        let mut reached: HashSet<String> = HashSet::new();
        let mut pending: VecDeque<String> = self.declared.iter().cloned().collect();
        while let Some(name) = pending.pop_front() {
            if !reached.insert(name.clone()) {
                continue;
            }
            if let Some(release) = self.selected.get(&name) {
                for requirement in &release.requires {
                    if let Ok(req) = parse_requirement(requirement) {
                        pending.push_back(req.name);
                    }
                }
            }
        }

        let declared: HashSet<&String> = self.declared.iter().collect();
        let mut packages = Vec::new();
        let mut inherited = Vec::new();

        for name in self.order.iter().filter(|n| reached.contains(*n)) {
            if let Some(release) = self.selected.get(name) {
                packages.push(ResolvedPackage {
                    name: name.clone(),
                    version: release.version.clone(),
                    tier: self.tier,
                    artifact: ArtifactRef {
                        filename: release.filename_or_default(name),
                        url: release.url.clone(),
                        local_path: release.local_path.clone(),
                        published_digest: release.digest.clone(),
                        pinned: self.pins.get(name).cloned().unwrap_or_default(),
                    },
                    requires: release.requires.clone(),
                    declared: declared.contains(name),
                });
            } else if let Some((from, version)) = self.inherited.get(name) {
                inherited.push(InheritedPackage {
                    name: name.clone(),
                    version: version.clone(),
                    from: *from,
                });
            }
        }

        Resolution {
            tier: self.tier,
            packages,
            inherited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::di::mocks::MockPackageIndex;
    use crate::manifest::ManifestStore;
    use std::path::Path;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn release(version: &str, requires: &[&str]) -> Release {
        Release::new(v(version)).with_requires(requires.iter().copied())
    }

    fn specs(tier: Tier, content: &str) -> Vec<DependencySpec> {
        let manifest = format!("[{}]\n{}", tier.as_str(), content);
        ManifestStore::parse_str(Path::new("test.txt"), &manifest)
            .unwrap()
            .load(tier)
    }

    fn example_index() -> Arc<MockPackageIndex> {
        let index = MockPackageIndex::new("primary");
        index.add_release("pytest", release("8.0.0", &["pluggy>=1.3"]));
        index.add_release("pytest", release("8.1.1", &["pluggy>=1.4"]));
        index.add_release("pluggy", release("1.4.0", &[]));
        index.add_release("pandas", release("2.2.1", &["numpy>=1.22.4"]));
        index.add_release("pandas", release("2.1.4", &["numpy>=1.22.4"]));
        index.add_release("pandas", release("3.0.0", &["numpy>=1.26"]));
        index.add_release("numpy", release("1.26.4", &[]));
        index.add_release("myapp-cli", release("1.2.0", &["pandas>=2.0"]));
        Arc::new(index)
    }

    fn names(resolution: &Resolution) -> Vec<(String, String)> {
        resolution
            .packages
            .iter()
            .map(|p| (p.name.clone(), p.version.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_resolves_highest_satisfying_version() {
        let resolver = Resolver::new(example_index());
        let resolution = resolver
            .resolve(
                Tier::Wheelhouse,
                &specs(Tier::Wheelhouse, "pandas>=2.0,<3.0"),
                &EnvironmentState::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            names(&resolution),
            vec![
                ("pandas".to_string(), "2.2.1".to_string()),
                ("numpy".to_string(), "1.26.4".to_string())
            ]
        );
        assert!(resolution.get("pandas").unwrap().declared);
        assert!(!resolution.get("numpy").unwrap().declared);
    }

    #[tokio::test]
    async fn test_resolution_is_deterministic() {
        let resolver = Resolver::new(example_index());
        let declared = specs(Tier::Global, "pytest==8.0.0\npandas<3");
        let first = resolver
            .resolve(Tier::Global, &declared, &EnvironmentState::new())
            .await
            .unwrap();
        for _ in 0..5 {
            let again = resolver
                .resolve(Tier::Global, &declared, &EnvironmentState::new())
                .await
                .unwrap();
            assert_eq!(first, again);
        }
    }

    #[tokio::test]
    async fn test_example_scenario_local_inherits_pandas() {
        let resolver = Resolver::new(example_index());
        let mut env = EnvironmentState::new();

        let global = resolver
            .resolve(Tier::Global, &specs(Tier::Global, "pytest==8.0.0"), &env)
            .await
            .unwrap();
        for p in &global.packages {
            env.record(Tier::Global, p.name.clone(), p.version.clone());
        }

        let wheelhouse = resolver
            .resolve(
                Tier::Wheelhouse,
                &specs(Tier::Wheelhouse, "pandas>=2.0,<3.0"),
                &env,
            )
            .await
            .unwrap();
        for p in &wheelhouse.packages {
            env.record(Tier::Wheelhouse, p.name.clone(), p.version.clone());
        }

        let local = resolver
            .resolve(Tier::Local, &specs(Tier::Local, "myapp-cli==1.2.0"), &env)
            .await
            .unwrap();

        assert_eq!(
            names(&local),
            vec![("myapp-cli".to_string(), "1.2.0".to_string())]
        );
        assert_eq!(
            local.inherited,
            vec![InheritedPackage {
                name: "pandas".to_string(),
                version: v("2.2.1"),
                from: Tier::Wheelhouse,
            }]
        );
    }

    #[tokio::test]
    async fn test_stricter_local_constraint_takes_precedence() {
        let resolver = Resolver::new(example_index());
        let mut env = EnvironmentState::new();
        env.record(Tier::Wheelhouse, "pandas", v("2.2.1"));

        let local = resolver
            .resolve(Tier::Local, &specs(Tier::Local, "pandas==2.1.4"), &env)
            .await
            .unwrap();

        assert_eq!(local.get("pandas").unwrap().version, v("2.1.4"));
        assert!(local.inherited.is_empty());
        // The wider tier's environment is untouched
        assert_eq!(
            env.visible_from(Tier::Local, "pandas"),
            Some((Tier::Wheelhouse, &v("2.2.1")))
        );
    }

    #[tokio::test]
    async fn test_missing_package_is_unresolvable() {
        let resolver = Resolver::new(example_index());
        let err = resolver
            .resolve(
                Tier::Global,
                &specs(Tier::Global, "does-not-exist"),
                &EnvironmentState::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("no releases found"));
    }

    #[tokio::test]
    async fn test_transitive_conflict_lists_constraints() {
        let index = MockPackageIndex::new("primary");
        index.add_release("app", release("1.0.0", &["numpy<1.20"]));
        index.add_release("numpy", release("1.26.4", &[]));
        index.add_release("numpy", release("1.19.5", &[]));
        let resolver = Resolver::new(Arc::new(index));

        let err = resolver
            .resolve(
                Tier::Local,
                &specs(Tier::Local, "numpy>=1.22\napp"),
                &EnvironmentState::new(),
            )
            .await
            .unwrap_err();

        match err {
            ProvisionError::Unresolvable {
                package,
                conflicting,
                tier,
                ..
            } => {
                assert_eq!(package, "numpy");
                assert_eq!(tier, Tier::Local);
                assert_eq!(
                    conflicting,
                    vec![
                        "manifest line 2 requires numpy>=1.22".to_string(),
                        "app 1.0.0 requires numpy<1.20".to_string()
                    ]
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reselection_withdraws_stale_constraints() {
        let index = MockPackageIndex::new("primary");
        index.add_release("lib", release("2.0.0", &["helper>=2"]));
        index.add_release("lib", release("1.5.0", &["helper<2"]));
        index.add_release("app", release("1.0.0", &["lib<2.0"]));
        index.add_release("helper", release("2.1.0", &[]));
        index.add_release("helper", release("1.0.0", &[]));
        let resolver = Resolver::new(Arc::new(index));

        let resolution = resolver
            .resolve(
                Tier::Global,
                &specs(Tier::Global, "lib\napp"),
                &EnvironmentState::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            names(&resolution),
            vec![
                ("lib".to_string(), "1.5.0".to_string()),
                ("app".to_string(), "1.0.0".to_string()),
                ("helper".to_string(), "1.0.0".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_cycles_are_tolerated() {
        let index = MockPackageIndex::new("primary");
        index.add_release("a", release("1.0.0", &["b"]));
        index.add_release("b", release("1.0.0", &["a>=1.0"]));
        let resolver = Resolver::new(Arc::new(index));

        let resolution = resolver
            .resolve(Tier::Global, &specs(Tier::Global, "a"), &EnvironmentState::new())
            .await
            .unwrap();
        assert_eq!(resolution.packages.len(), 2);
    }

    #[tokio::test]
    async fn test_prereleases_only_when_named() {
        let index = MockPackageIndex::new("primary");
        index.add_release("numpy", release("2.0.0rc1", &[]));
        index.add_release("numpy", release("1.26.4", &[]));
        let resolver = Resolver::new(Arc::new(index));
        let env = EnvironmentState::new();

        let stable = resolver
            .resolve(Tier::Global, &specs(Tier::Global, "numpy"), &env)
            .await
            .unwrap();
        assert_eq!(stable.packages[0].version, v("1.26.4"));

        let pre = resolver
            .resolve(Tier::Global, &specs(Tier::Global, "numpy>=2.0.0rc1"), &env)
            .await
            .unwrap();
        assert_eq!(pre.packages[0].version, v("2.0.0rc1"));
    }

    #[tokio::test]
    async fn test_manifest_pins_flow_into_artifact_ref() {
        let digest = "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
        let resolver = Resolver::new(example_index());
        let resolution = resolver
            .resolve(
                Tier::Global,
                &specs(Tier::Global, &format!("pytest==8.0.0 --hash={}", digest)),
                &EnvironmentState::new(),
            )
            .await
            .unwrap();

        let pytest = resolution.get("pytest").unwrap();
        assert_eq!(pytest.artifact.pinned, vec![digest.to_string()]);
        assert_eq!(pytest.artifact.filename, "pytest-8.0.0.artifact");
        assert!(resolution.get("pluggy").unwrap().artifact.pinned.is_empty());
    }
}
