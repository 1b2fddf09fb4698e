//! Append-only installation ledger.
//!
//! One JSON object per line in `<state_dir>/ledger.jsonl`. A (tier, package)
//! pair gets a PENDING event when its install starts and exactly one terminal
//! event (INSTALLED or FAILED) when it ends. Events are never rewritten, so
//! the file doubles as the audit trail and as the record of what an
//! interrupted run left unfinished.

use crate::core::path::ensure_dir;
use crate::core::{ProvisionError, ProvisionResult, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const LEDGER_FILE: &str = "ledger.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstallStatus {
    Pending,
    Installed,
    Failed,
}

impl InstallStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstallStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationRecord {
    pub run_id: String,
    pub tier: Tier,
    pub name: String,
    pub version: String,
    pub status: InstallStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub struct Ledger {
    path: PathBuf,
    run_id: String,
    /// Status per (tier, package) in this run
    current: HashMap<(Tier, String), InstallStatus>,
    records: Vec<InstallationRecord>,
}

impl Ledger {
    /// Open (creating if needed) the ledger in `state_dir` for a new run.
    pub fn open(state_dir: &Path, run_id: &str) -> ProvisionResult<Self> {
        ensure_dir(state_dir)?;
        Ok(Self {
            path: state_dir.join(LEDGER_FILE),
            run_id: run_id.to_string(),
            current: HashMap::new(),
            records: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Record that installing `name` into `tier` has started.
    pub fn begin(&mut self, tier: Tier, name: &str, version: &str) -> ProvisionResult<()> {
        let key = (tier, name.to_string());
        if let Some(status) = self.current.get(&key) {
            return Err(ProvisionError::Ledger(format!(
                "{} already has a {:?} record for {} in run {}",
                name, status, tier, self.run_id
            )));
        }
        self.append(InstallationRecord {
            run_id: self.run_id.clone(),
            tier,
            name: name.to_string(),
            version: version.to_string(),
            status: InstallStatus::Pending,
            timestamp: Utc::now(),
            message: None,
        })?;
        self.current.insert(key, InstallStatus::Pending);
        Ok(())
    }

    /// Move a PENDING record to its terminal status. Allowed exactly once.
    pub fn complete(
        &mut self,
        tier: Tier,
        name: &str,
        status: InstallStatus,
        message: Option<String>,
    ) -> ProvisionResult<InstallationRecord> {
        if !status.is_terminal() {
            return Err(ProvisionError::Ledger(format!(
                "{} in {}: PENDING is not a terminal status",
                name, tier
            )));
        }
        let key = (tier, name.to_string());
        let version = match self.current.get(&key) {
            Some(InstallStatus::Pending) => self
                .records
                .iter()
                .rev()
                .find(|r| r.tier == tier && r.name == name)
                .map(|r| r.version.clone())
                .unwrap_or_default(),
            Some(done) => {
                return Err(ProvisionError::Ledger(format!(
                    "{} in {} is already {:?}",
                    name, tier, done
                )))
            }
            None => {
                return Err(ProvisionError::Ledger(format!(
                    "{} in {} was never started",
                    name, tier
                )))
            }
        };

        let record = InstallationRecord {
            run_id: self.run_id.clone(),
            tier,
            name: name.to_string(),
            version,
            status,
            timestamp: Utc::now(),
            message,
        };
        self.append(record.clone())?;
        self.current.insert(key, status);
        Ok(record)
    }

    fn append(&mut self, record: InstallationRecord) -> ProvisionResult<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        self.records.push(record);
        Ok(())
    }

    /// Every event written by this run, in order.
    pub fn records(&self) -> &[InstallationRecord] {
        &self.records
    }

    /// The terminal event of every (tier, package) this run finished.
    pub fn terminal_records(&self) -> Vec<InstallationRecord> {
        self.records
            .iter()
            .filter(|r| r.status.is_terminal())
            .cloned()
            .collect()
    }

    /// (tier, package) pairs whose latest event in earlier runs is PENDING:
    /// an interrupted install that must be redone, not trusted.
    pub fn pending_from_previous(&self) -> ProvisionResult<HashSet<(Tier, String)>> {
        let mut last: HashMap<(Tier, String), InstallStatus> = HashMap::new();
        for record in read_records(&self.path)? {
            if record.run_id == self.run_id {
                continue;
            }
            last.insert((record.tier, record.name), record.status);
        }
        Ok(last
            .into_iter()
            .filter(|(_, status)| *status == InstallStatus::Pending)
            .map(|(key, _)| key)
            .collect())
    }
}

/// Read every event from a ledger file. Unparseable lines (a torn final
/// write) are skipped with a warning.
pub fn read_records(path: &Path) -> ProvisionResult<Vec<InstallationRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    let mut records = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!("skipping ledger line {}: {}", i + 1, e),
        }
    }
    Ok(records)
}
