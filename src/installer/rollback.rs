use crate::cache::index::CacheEntry;
use crate::core::Tier;
use crate::installer::InstalledMarker;
use std::path::PathBuf;

/// Everything one tier's install stage changed in its scope, so a failed
/// stage can put the scope back the way it was.
#[derive(Debug)]
pub struct RollbackJournal {
    pub(crate) tier: Tier,
    /// Directory holding payloads replaced during this stage
    pub(crate) backup_root: PathBuf,
    pub(crate) changes: Vec<Change>,
}

#[derive(Debug)]
pub(crate) struct Change {
    pub name: String,
    /// Entries placed into the payload directory, relative to it
    pub new_files: Vec<String>,
    pub previous: Option<Previous>,
}

/// An install that was moved aside to make room for a new version.
#[derive(Debug)]
pub(crate) struct Previous {
    pub marker: InstalledMarker,
    pub backup_dir: PathBuf,
    pub index_entry: Option<CacheEntry>,
}

impl RollbackJournal {
    pub(crate) fn new(tier: Tier, backup_root: PathBuf) -> Self {
        Self {
            tier,
            backup_root,
            changes: Vec::new(),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Packages materialised (or partly materialised) in this stage.
    pub fn touched(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
