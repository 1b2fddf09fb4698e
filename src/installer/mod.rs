//! Materialising cached artifacts into tier scopes.
//!
//! GLOBAL and LOCAL unpack payloads into `<scope>/site`, the directory their
//! lookup paths expose. WHEELHOUSE keeps artifacts verbatim next to an
//! `index.json` in cache format, which turns the scope into a find-links
//! source for narrower tiers. Every install ends with a marker in
//! `<scope>/.provision/installed/<name>.json`; the marker is written last so
//! its presence means the payload is complete.

pub mod extract;
pub mod rollback;

pub use rollback::RollbackJournal;

use crate::cache::index::{write_atomic, CacheEntry, CacheIndexFile};
use crate::cache::ArtifactRecord;
use crate::config::ScopeConfig;
use crate::core::path::{
    ensure_dir, installed_markers_dir, is_plain_file_name, scope_metadata_dir, site_dir,
};
use crate::core::{ProvisionError, ProvisionResult, Tier, Version};
use chrono::{DateTime, Utc};
use rollback::{Change, Previous};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Scope directory of every tier.
#[derive(Debug, Clone, PartialEq)]
pub struct TierScopes {
    global: PathBuf,
    wheelhouse: PathBuf,
    local: PathBuf,
}

impl TierScopes {
    pub fn new(global: PathBuf, wheelhouse: PathBuf, local: PathBuf) -> Self {
        Self {
            global,
            wheelhouse,
            local,
        }
    }

    pub fn from_config(config: &ScopeConfig) -> ProvisionResult<Self> {
        Ok(Self::new(
            config.dir(Tier::Global)?,
            config.dir(Tier::Wheelhouse)?,
            config.dir(Tier::Local)?,
        ))
    }

    /// `<root>/global`, `<root>/wheelhouse`, `<root>/local`
    pub fn under(root: &Path) -> Self {
        Self::new(
            root.join(Tier::Global.as_str()),
            root.join(Tier::Wheelhouse.as_str()),
            root.join(Tier::Local.as_str()),
        )
    }

    pub fn dir(&self, tier: Tier) -> &Path {
        match tier {
            Tier::Global => &self.global,
            Tier::Wheelhouse => &self.wheelhouse,
            Tier::Local => &self.local,
        }
    }

    /// Where a tier's payloads live.
    pub fn payload_dir(&self, tier: Tier) -> PathBuf {
        match tier {
            Tier::Wheelhouse => self.wheelhouse.clone(),
            other => site_dir(self.dir(other)),
        }
    }

    /// Payload directories visible from `tier`, its own first.
    pub fn lookup_path(&self, tier: Tier) -> Vec<PathBuf> {
        tier.lookup_layers()
            .into_iter()
            .map(|t| self.payload_dir(t))
            .collect()
    }
}

/// Proof that a package's payload is fully in place in a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledMarker {
    pub name: String,
    pub version: Version,
    pub digest: String,
    pub tier: Tier,
    pub installed_at: DateTime<Utc>,
    /// Top-level entries owned by this package, relative to the payload dir
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstallOutcome {
    Installed(InstalledMarker),
    /// Same version and digest were already in place; nothing was touched
    AlreadyInstalled(InstalledMarker),
}

impl InstallOutcome {
    pub fn marker(&self) -> &InstalledMarker {
        match self {
            InstallOutcome::Installed(m) | InstallOutcome::AlreadyInstalled(m) => m,
        }
    }

    pub fn was_noop(&self) -> bool {
        matches!(self, InstallOutcome::AlreadyInstalled(_))
    }
}

pub struct Installer {
    scopes: TierScopes,
}

impl Installer {
    pub fn new(scopes: TierScopes) -> Self {
        Self { scopes }
    }

    pub fn scopes(&self) -> &TierScopes {
        &self.scopes
    }

    fn marker_path(&self, tier: Tier, name: &str) -> PathBuf {
        installed_markers_dir(self.scopes.dir(tier)).join(format!("{}.json", name))
    }

    pub fn marker(&self, tier: Tier, name: &str) -> ProvisionResult<Option<InstalledMarker>> {
        let path = self.marker_path(tier, name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Every package with a marker in `tier`'s scope, sorted by name.
    /// Unreadable markers are skipped with a warning.
    pub fn installed(&self, tier: Tier) -> ProvisionResult<Vec<InstalledMarker>> {
        let dir = installed_markers_dir(self.scopes.dir(tier));
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut markers = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(ProvisionError::from)
                .and_then(|c| serde_json::from_str::<InstalledMarker>(&c).map_err(Into::into))
            {
                Ok(marker) => markers.push(marker),
                Err(e) => warn!("ignoring unreadable marker {}: {}", path.display(), e),
            }
        }
        markers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(markers)
    }

    /// Whether every entry the marker lists still exists.
    pub fn payload_present(&self, tier: Tier, marker: &InstalledMarker) -> bool {
        let payload_dir = self.scopes.payload_dir(tier);
        !marker.files.is_empty() && marker.files.iter().all(|f| payload_dir.join(f).exists())
    }

    /// Start recording an install stage for `tier`.
    pub fn begin(&self, tier: Tier) -> RollbackJournal {
        let stamp = format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S%.f"), std::process::id());
        let backup_root = scope_metadata_dir(self.scopes.dir(tier))
            .join("backup")
            .join(stamp);
        RollbackJournal::new(tier, backup_root)
    }

    /// Materialise `record` into `tier`'s scope.
    ///
    /// Re-installing the same version and digest is a no-op unless `force`
    /// is set (used for packages an interrupted run left PENDING).
    pub fn install(
        &self,
        journal: &mut RollbackJournal,
        record: &ArtifactRecord,
        force: bool,
    ) -> ProvisionResult<InstallOutcome> {
        let tier = journal.tier;
        let existing = self.marker(tier, &record.name).map_err(|e| self.install_error(tier, record, e))?;

        if !force {
            if let Some(marker) = &existing {
                if marker.version == record.version
                    && marker.digest == record.digest
                    && self.payload_present(tier, marker)
                {
                    debug!("{} {} already installed in {}", record.name, record.version, tier);
                    return Ok(InstallOutcome::AlreadyInstalled(marker.clone()));
                }
            }
        }

        self.materialise(journal, record, existing, force)
            .map(InstallOutcome::Installed)
            .map_err(|e| self.install_error(tier, record, e))
    }

    fn install_error(&self, tier: Tier, record: &ArtifactRecord, error: ProvisionError) -> ProvisionError {
        match error {
            already @ ProvisionError::Install { .. } => already,
            other => ProvisionError::Install {
                tier,
                package: record.name.clone(),
                path: self.scopes.payload_dir(tier),
                message: other.to_string(),
            },
        }
    }

    fn materialise(
        &self,
        journal: &mut RollbackJournal,
        record: &ArtifactRecord,
        existing: Option<InstalledMarker>,
        force: bool,
    ) -> ProvisionResult<InstalledMarker> {
        let tier = journal.tier;
        let scope = self.scopes.dir(tier).to_path_buf();
        let payload_dir = self.scopes.payload_dir(tier);
        if !is_plain_file_name(&record.filename) {
            return Err(ProvisionError::Install {
                tier,
                package: record.name.clone(),
                path: payload_dir,
                message: format!("refusing artifact file name '{}'", record.filename),
            });
        }
        ensure_dir(&payload_dir)?;

        // Stage inside the scope so placing entries is a rename
        let staging = scope_metadata_dir(&scope).join("staging").join(&record.name);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        ensure_dir(&staging)?;
        match tier {
            Tier::Wheelhouse => {
                fs::copy(&record.path, staging.join(&record.filename))?;
            }
            _ => {
                extract::unpack_into(&record.path, &record.filename, &staging)?;
            }
        }
        let mut new_entries: Vec<String> = fs::read_dir(&staging)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        new_entries.sort();
        if new_entries.is_empty() {
            fs::remove_dir_all(&staging)?;
            return Err(ProvisionError::Install {
                tier,
                package: record.name.clone(),
                path: payload_dir,
                message: "artifact contains no files".to_string(),
            });
        }

        let previous = match existing {
            Some(old) => Some(self.move_aside(journal, &scope, &payload_dir, old)?),
            None => None,
        };
        let change = journal.changes.len();
        journal.changes.push(Change {
            name: record.name.clone(),
            new_files: Vec::new(),
            previous,
        });

        for entry in &new_entries {
            let dest = payload_dir.join(entry);
            if dest.exists() {
                if !force {
                    return Err(ProvisionError::Install {
                        tier,
                        package: record.name.clone(),
                        path: dest,
                        message: "path already exists and is not owned by this package"
                            .to_string(),
                    });
                }
                remove_path(&dest)?;
            }
            fs::rename(staging.join(entry), &dest)?;
            journal.changes[change].new_files.push(entry.clone());
        }
        fs::remove_dir_all(&staging)?;

        if tier == Tier::Wheelhouse {
            let mut index = CacheIndexFile::load(&scope)?;
            index.upsert(CacheEntry {
                name: record.name.clone(),
                version: record.version.clone(),
                digest: record.digest.clone(),
                filename: record.filename.clone(),
                path: record.filename.clone(),
                size: record.size,
                requires: record.requires.clone(),
                fetched_at: Utc::now(),
            });
            index.save(&scope)?;
        }

        let marker = InstalledMarker {
            name: record.name.clone(),
            version: record.version.clone(),
            digest: record.digest.clone(),
            tier,
            installed_at: Utc::now(),
            files: new_entries,
        };
        write_atomic(
            &self.marker_path(tier, &record.name),
            &serde_json::to_vec_pretty(&marker)?,
        )?;
        info!("installed {} {} into {}", record.name, record.version, tier);
        Ok(marker)
    }

    /// Move a previous install's entries into the journal's backup area.
    fn move_aside(
        &self,
        journal: &RollbackJournal,
        scope: &Path,
        payload_dir: &Path,
        old: InstalledMarker,
    ) -> ProvisionResult<Previous> {
        let backup_dir = journal.backup_root.join(&old.name);
        ensure_dir(&backup_dir)?;
        for file in &old.files {
            let src = payload_dir.join(file);
            if src.exists() {
                fs::rename(&src, backup_dir.join(file))?;
            }
        }

        let index_entry = if journal.tier == Tier::Wheelhouse {
            let mut index = CacheIndexFile::load(scope)?;
            let removed = index.remove(&old.name, &old.version);
            index.save(scope)?;
            removed
        } else {
            None
        };

        let marker_path = self.marker_path(journal.tier, &old.name);
        if marker_path.exists() {
            fs::remove_file(&marker_path)?;
        }
        debug!("moved {} {} aside", old.name, old.version);

        Ok(Previous {
            marker: old,
            backup_dir,
            index_entry,
        })
    }

    /// Undo every change recorded in `journal`, newest first. Returns how
    /// many packages were rolled back.
    pub fn rollback(&self, journal: RollbackJournal) -> ProvisionResult<usize> {
        let tier = journal.tier;
        let scope = self.scopes.dir(tier).to_path_buf();
        let payload_dir = self.scopes.payload_dir(tier);
        let count = journal.changes.len();

        for change in journal.changes.into_iter().rev() {
            for file in &change.new_files {
                remove_path(&payload_dir.join(file))?;
            }
            let marker_path = self.marker_path(tier, &change.name);
            if marker_path.exists() {
                fs::remove_file(&marker_path)?;
            }
            if tier == Tier::Wheelhouse {
                let mut index = CacheIndexFile::load(&scope)?;
                index.entries.retain(|e| e.name != change.name);
                if let Some(entry) = change.previous.as_ref().and_then(|p| p.index_entry.clone()) {
                    index.upsert(entry);
                }
                index.save(&scope)?;
            }

            if let Some(previous) = change.previous {
                for file in &previous.marker.files {
                    let saved = previous.backup_dir.join(file);
                    if saved.exists() {
                        fs::rename(&saved, payload_dir.join(file))?;
                    }
                }
                write_atomic(&marker_path, &serde_json::to_vec_pretty(&previous.marker)?)?;
            }
            info!("rolled back {} in {}", change.name, tier);
        }

        if journal.backup_root.exists() {
            fs::remove_dir_all(&journal.backup_root)?;
        }
        Ok(count)
    }

    /// Keep the stage's changes and drop the backups.
    pub fn commit(&self, journal: RollbackJournal) -> ProvisionResult<()> {
        if journal.backup_root.exists() {
            fs::remove_dir_all(&journal.backup_root)?;
        }
        Ok(())
    }
}

fn remove_path(path: &Path) -> ProvisionResult<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}
