use crate::core::{ProvisionError, ProvisionResult};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use tar::Archive;

/// Payload kinds recognised by their leading bytes; cached artifacts carry
/// no meaningful extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Zip,
    TarGz,
    /// Anything else is copied verbatim
    Opaque,
}

impl PayloadKind {
    pub fn detect(path: &Path) -> ProvisionResult<Self> {
        let mut magic = [0u8; 4];
        let mut file = File::open(path)?;
        let read = file.read(&mut magic)?;
        Ok(match &magic[..read] {
            [b'P', b'K', 3, 4] => PayloadKind::Zip,
            [0x1f, 0x8b, ..] => PayloadKind::TarGz,
            _ => PayloadKind::Opaque,
        })
    }
}

/// Unpack (or copy) `artifact` into the empty directory `dest`.
///
/// Opaque payloads land as `dest/<filename>`.
pub fn unpack_into(artifact: &Path, filename: &str, dest: &Path) -> ProvisionResult<PayloadKind> {
    let kind = PayloadKind::detect(artifact)?;
    match kind {
        PayloadKind::TarGz => {
            let file = File::open(artifact)?;
            let mut archive = Archive::new(GzDecoder::new(file));
            archive.unpack(dest)?;
        }
        PayloadKind::Zip => {
            let file = File::open(artifact)?;
            let mut archive = zip::ZipArchive::new(file)
                .map_err(|e| ProvisionError::Cache(format!("Invalid zip: {}", e)))?;
            archive
                .extract(dest)
                .map_err(|e| ProvisionError::Cache(format!("Extract failed: {}", e)))?;
        }
        PayloadKind::Opaque => {
            fs::copy(artifact, dest.join(filename))?;
        }
    }
    Ok(kind)
}
