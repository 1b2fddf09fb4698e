//! Operator-facing hints attached to errors at the CLI boundary.

use crate::core::error::{FetchError, ProvisionError};

/// Supplies a short "what to check next" hint for an error.
pub trait ErrorHelp {
    fn help(&self) -> Option<String>;
}

impl ErrorHelp for ProvisionError {
    fn help(&self) -> Option<String> {
        match self.root() {
            ProvisionError::ManifestParse { .. } => Some(
                "Each line must be `<name><comparator><version>` under a [global], \
                 [wheelhouse] or [local] header; a name may appear once per tier."
                    .to_string(),
            ),
            ProvisionError::Unresolvable { .. } => Some(
                "Relax one of the listed constraints or make the missing version \
                 available through index_url, extra_index_urls or find_links."
                    .to_string(),
            ),
            ProvisionError::Fetch { error, .. } => error.help(),
            ProvisionError::Install { .. } => Some(
                "Check that the scope directory exists and is writable by this user."
                    .to_string(),
            ),
            ProvisionError::Verification { .. } => Some(
                "The artifact was installed but cannot be loaded; a native dependency \
                 outside the package may be missing."
                    .to_string(),
            ),
            ProvisionError::RunLocked { path } => Some(format!(
                "Wait for the run holding {} to finish; the lock is released when that process exits.",
                path.display()
            )),
            ProvisionError::Config(_) => {
                Some("Check the configuration file and command-line flags.".to_string())
            }
            _ => None,
        }
    }
}

impl ErrorHelp for FetchError {
    fn help(&self) -> Option<String> {
        match self {
            FetchError::DigestMismatch { .. } => Some(
                "The artifact bytes differ from the trusted digest. Treat this as possible \
                 tampering; remove the cache entry only after confirming the new bytes."
                    .to_string(),
            ),
            FetchError::Offline => Some(
                "Populate the cache on a connected host first, or add the wheelhouse \
                 directory to find_links."
                    .to_string(),
            ),
            FetchError::Exhausted { .. }
            | FetchError::Transient { .. }
            | FetchError::Timeout { .. } => {
                Some("Check network access to the configured index URLs.".to_string())
            }
            FetchError::NotFound { .. } => {
                Some("No configured source serves this artifact.".to_string())
            }
            FetchError::Storage(_) => {
                Some("Check that the cache directory is writable.".to_string())
            }
        }
    }
}

/// Render an error followed by its hint, if one exists.
pub fn format_error_with_help(error: &ProvisionError) -> String {
    match error.help() {
        Some(help) => format!("error: {}\n  help: {}", error, help),
        None => format!("error: {}", error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tier::{Stage, Tier};

    #[test]
    fn test_help_looks_through_staging() {
        let err = ProvisionError::Fetch {
            package: "pandas".to_string(),
            version: "2.2.1".to_string(),
            error: FetchError::Offline,
        }
        .staged(Tier::Wheelhouse, Stage::Fetching);
        let text = format_error_with_help(&err);
        assert!(text.starts_with("error: WHEELHOUSE tier failed while fetching"));
        assert!(text.contains("find_links"));
    }

    #[test]
    fn test_no_help_for_generic_io() {
        let err = ProvisionError::Io(std::io::Error::other("boom"));
        assert_eq!(format_error_with_help(&err), "error: IO error: boom");
    }
}
