use crate::core::path::{ensure_dir, scope_metadata_dir};
use crate::core::{ProvisionError, ProvisionResult};
use chrono::Utc;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCK_FILE: &str = "provision.lock";

/// Exclusive claim on a directory for the length of one run.
///
/// Held as an OS advisory lock on `<dir>/provision.lock`, so a second run
/// fails at start instead of racing, and a run that dies without cleaning
/// up (killed, out of memory, power loss) does not block the next one. The
/// file itself stays behind and only records who held it last.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    _file: File,
}

impl RunLock {
    pub fn acquire(dir: &Path) -> ProvisionResult<Self> {
        ensure_dir(dir)?;
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        if let Err(e) = file.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Err(ProvisionError::RunLocked { path });
            }
            return Err(e.into());
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "pid={}", std::process::id())?;
        writeln!(file, "started={}", Utc::now().to_rfc3339())?;
        debug!("acquired run lock {}", path.display());
        Ok(Self { path, _file: file })
    }

    /// Lock the state directory, then each scope in the order given.
    ///
    /// Scopes shared by several tiers are locked once. Every lock is taken
    /// before any work starts; on failure the ones already held are released.
    pub fn acquire_run(state_dir: &Path, scopes: &[&Path]) -> ProvisionResult<Vec<Self>> {
        let mut locks = vec![Self::acquire(state_dir)?];
        for scope in scopes {
            let dir = scope_metadata_dir(scope);
            if locks.iter().any(|l| l.path.parent() == Some(dir.as_path())) {
                continue;
            }
            locks.push(Self::acquire(&dir)?);
        }
        Ok(locks)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
