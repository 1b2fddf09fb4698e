use crate::core::{ProvisionError, ProvisionResult};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Digest algorithm for artifact integrity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlgorithm {
    /// SHA-256 (default, matches digests published by package indexes)
    #[default]
    Sha256,
    /// BLAKE3
    Blake3,
}

impl ChecksumAlgorithm {
    pub fn prefix(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Blake3 => "blake3",
        }
    }

    /// Parse algorithm from a prefixed digest string (`sha256:...`)
    pub fn from_digest(digest: &str) -> ProvisionResult<Self> {
        let (algo, _) = digest.split_once(':').ok_or_else(|| {
            ProvisionError::Cache(format!("digest '{}' has no algorithm prefix", digest))
        })?;
        algo.parse()
    }

    /// Digest `data`, returning `algo:hex`
    pub fn digest(&self, data: &[u8]) -> String {
        let hex_digest = match self {
            ChecksumAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                hex::encode(hasher.finalize())
            }
            ChecksumAlgorithm::Blake3 => blake3::hash(data).to_hex().to_string(),
        };
        format!("{}:{}", self.prefix(), hex_digest)
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = ProvisionError;

    fn from_str(s: &str) -> ProvisionResult<Self> {
        match s.to_lowercase().as_str() {
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "blake3" => Ok(ChecksumAlgorithm::Blake3),
            other => Err(ProvisionError::Config(format!(
                "Unknown checksum algorithm '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Digest `data` with the algorithm named by `expected` and compare.
///
/// Returns the actual digest so callers can report it on mismatch.
pub fn digest_like(data: &[u8], expected: &str) -> ProvisionResult<String> {
    Ok(ChecksumAlgorithm::from_digest(expected)?.digest(data))
}
