use crate::cache::index::write_atomic;
use crate::core::path::ensure_dir;
use crate::core::{ProvisionResult, Stage, Tier};
use crate::ledger::{InstallStatus, InstallationRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const REPORT_FILE: &str = "last-run.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierOutcome {
    /// Passed verification
    Done,
    /// Stopped the run
    Failed,
    /// Optional tier that failed; the run carried on
    Skipped,
    /// Dry run: resolved only
    Planned,
    /// Never reached
    NotRun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageReport {
    pub name: String,
    pub version: String,
    /// Set when a wider tier already provides the package
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherited_from: Option<Tier>,
    /// Final ledger status; absent for inherited and planned packages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InstallStatus>,
    /// The same version and digest were already installed
    #[serde(default)]
    pub unchanged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Verification result: `Some(true)` passed, `Some(false)` failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PackageReport {
    pub fn planned(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            inherited_from: None,
            status: None,
            unchanged: false,
            digest: None,
            verified: None,
            error: None,
        }
    }

    pub fn inherited(name: &str, version: &str, from: Tier) -> Self {
        Self {
            inherited_from: Some(from),
            ..Self::planned(name, version)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierReport {
    pub tier: Tier,
    pub outcome: TierOutcome,
    #[serde(default)]
    pub optional: bool,
    pub packages: Vec<PackageReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Payloads from this run's failed install stage were removed again
    #[serde(default)]
    pub rolled_back: bool,
}

impl TierReport {
    pub fn new(tier: Tier, optional: bool) -> Self {
        Self {
            tier,
            outcome: TierOutcome::NotRun,
            optional,
            packages: Vec::new(),
            failed_stage: None,
            failed_package: None,
            error: None,
            rolled_back: false,
        }
    }

    pub fn package_mut(&mut self, name: &str) -> Option<&mut PackageReport> {
        self.packages
            .iter_mut()
            .find(|p| p.name == name && p.inherited_from.is_none())
    }
}

/// Outcome of a provisioning run, per tier and per package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub offline: bool,
    /// Final state, e.g. `DONE` or `FAILED(WHEELHOUSE, fetching)`
    pub final_state: String,
    /// Last tier that passed verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Tier>,
    pub exit_code: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tiers: Vec<TierReport>,
    /// Terminal ledger records of this run, FAILED ones included
    pub records: Vec<InstallationRecord>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn tier(&self, tier: Tier) -> Option<&TierReport> {
        self.tiers.iter().find(|t| t.tier == tier)
    }

    pub fn save(&self, state_dir: &Path) -> ProvisionResult<()> {
        ensure_dir(state_dir)?;
        write_atomic(
            &state_dir.join(REPORT_FILE),
            &serde_json::to_vec_pretty(self)?,
        )
    }

    pub fn load(state_dir: &Path) -> ProvisionResult<Option<Self>> {
        let path = state_dir.join(REPORT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_report_persists() {
        let temp = TempDir::new().unwrap();
        let mut tier = TierReport::new(Tier::Local, false);
        tier.outcome = TierOutcome::Failed;
        tier.failed_stage = Some(Stage::Verifying);
        tier.packages
            .push(PackageReport::inherited("pandas", "2.2.1", Tier::Wheelhouse));
        let report = RunReport {
            run_id: "run-1".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            dry_run: false,
            offline: true,
            final_state: "FAILED(LOCAL, verifying)".to_string(),
            checkpoint: Some(Tier::Wheelhouse),
            exit_code: 5,
            error: Some("boom".to_string()),
            tiers: vec![tier],
            records: vec![],
        };

        report.save(temp.path()).unwrap();
        let loaded = RunReport::load(temp.path()).unwrap().unwrap();
        assert_eq!(loaded, report);
        assert!(!loaded.is_success());
        assert_eq!(
            loaded.tier(Tier::Local).unwrap().packages[0].inherited_from,
            Some(Tier::Wheelhouse)
        );
    }

    #[test]
    fn test_load_without_report() {
        let temp = TempDir::new().unwrap();
        assert!(RunReport::load(temp.path()).unwrap().is_none());
    }
}
