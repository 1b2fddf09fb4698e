//! Post-install checks: is each freshly installed package actually usable
//! from its tier's lookup path?

use crate::core::{ProvisionError, ProvisionResult, Tier};
use crate::di::ImportProbe;
use crate::installer::{InstalledMarker, Installer};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

/// Environment variable carrying a tier's lookup path to verify commands
pub const LOOKUP_PATH_ENV: &str = "PROVISION_LOOKUP_PATH";

/// Checks that a package's marker and payload are in place in the tier's own
/// payload directory (the first lookup path entry).
pub struct MarkerProbe;

#[async_trait]
impl ImportProbe for MarkerProbe {
    fn describe(&self) -> String {
        "installed payload".to_string()
    }

    async fn probe(
        &self,
        tier: Tier,
        marker: &InstalledMarker,
        lookup_path: &[PathBuf],
    ) -> Result<(), String> {
        if marker.tier != tier {
            return Err(format!("marker belongs to the {} tier", marker.tier));
        }
        let own = lookup_path
            .first()
            .ok_or_else(|| "empty lookup path".to_string())?;
        if marker.files.is_empty() {
            return Err("marker lists no payload files".to_string());
        }
        for file in &marker.files {
            if !own.join(file).exists() {
                return Err(format!("{} is missing from {}", file, own.display()));
            }
        }
        Ok(())
    }
}

/// Runs an external command per package, e.g.
/// `["python3", "-c", "import {module}"]`.
///
/// `{module}` becomes the package name with `-` replaced by `_`; `{name}` and
/// `{version}` are also substituted. The tier's lookup path is exported as
/// `PROVISION_LOOKUP_PATH` and `PYTHONPATH`.
pub struct CommandProbe {
    command: Vec<String>,
}

impl CommandProbe {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn render(&self, marker: &InstalledMarker) -> Vec<String> {
        let module = marker.name.replace('-', "_");
        let version = marker.version.to_string();
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{module}", &module)
                    .replace("{name}", &marker.name)
                    .replace("{version}", &version)
            })
            .collect()
    }
}

#[async_trait]
impl ImportProbe for CommandProbe {
    fn describe(&self) -> String {
        format!("command `{}`", self.command.join(" "))
    }

    async fn probe(
        &self,
        _tier: Tier,
        marker: &InstalledMarker,
        lookup_path: &[PathBuf],
    ) -> Result<(), String> {
        let argv = self.render(marker);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| "verify command is empty".to_string())?;
        let program = which::which(program)
            .map_err(|_| format!("verify program '{}' not found on PATH", program))?;
        let joined = std::env::join_paths(lookup_path)
            .map_err(|e| format!("invalid lookup path: {}", e))?;

        debug!("probing {} with {}", marker.name, program.display());
        let output = Command::new(&program)
            .args(args)
            .env(LOOKUP_PATH_ENV, &joined)
            .env("PYTHONPATH", &joined)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", program.display(), e))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no output");
        Err(format!("{} ({})", detail.trim(), output.status))
    }
}

/// Result of checking one package.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageCheck {
    pub name: String,
    pub version: String,
    /// `None` when the package passed
    pub failure: Option<String>,
}

impl PackageCheck {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Pass/fail per package for one tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub tier: Tier,
    pub checks: Vec<PackageCheck>,
}

impl VerificationReport {
    pub fn is_success(&self) -> bool {
        self.checks.iter().all(PackageCheck::passed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &PackageCheck> {
        self.checks.iter().filter(|c| !c.passed())
    }

    /// The first failure as a `Verification` error.
    pub fn into_result(self) -> ProvisionResult<Self> {
        if let Some(check) = self.failed().next() {
            return Err(ProvisionError::Verification {
                tier: self.tier,
                package: check.name.clone(),
                message: check.failure.clone().unwrap_or_default(),
            });
        }
        Ok(self)
    }
}

pub struct Verifier {
    installer: Arc<Installer>,
    probe: Arc<dyn ImportProbe>,
}

impl Verifier {
    pub fn new(installer: Arc<Installer>, probe: Arc<dyn ImportProbe>) -> Self {
        Self { installer, probe }
    }

    /// Check every package just installed in `tier`.
    ///
    /// The marker on disk must still match what the install stage produced
    /// before the probe runs. All packages are checked; failures do not stop
    /// the remaining checks.
    pub async fn verify(
        &self,
        tier: Tier,
        installed: &[InstalledMarker],
    ) -> ProvisionResult<VerificationReport> {
        let lookup_path = self.installer.scopes().lookup_path(tier);
        let mut checks = Vec::with_capacity(installed.len());

        for expected in installed {
            let failure = match self.installer.marker(tier, &expected.name)? {
                None => Some("installed marker is missing".to_string()),
                Some(on_disk) if on_disk.version != expected.version => Some(format!(
                    "marker records version {}, expected {}",
                    on_disk.version, expected.version
                )),
                Some(on_disk) if on_disk.digest != expected.digest => {
                    Some("marker digest differs from the installed artifact".to_string())
                }
                Some(on_disk) => self.probe.probe(tier, &on_disk, &lookup_path).await.err(),
            };
            if let Some(reason) = &failure {
                warn!(
                    "{} {} failed verification in {}: {}",
                    expected.name, expected.version, tier, reason
                );
            }
            checks.push(PackageCheck {
                name: expected.name.clone(),
                version: expected.version.to_string(),
                failure,
            });
        }

        debug!("verified {} packages in {} via {}", checks.len(), tier, self.probe.describe());
        Ok(VerificationReport { tier, checks })
    }
}
