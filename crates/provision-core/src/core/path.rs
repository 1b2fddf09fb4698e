use crate::core::error::{ProvisionError, ProvisionResult};
use crate::core::tier::Tier;
use std::path::{Component, Path, PathBuf};

/// Get the Provision config directory
///
/// Platform-specific locations:
/// - Windows: %APPDATA%\provision
/// - Linux: ~/.config/provision
/// - macOS: ~/Library/Application Support/provision
pub fn provision_home() -> ProvisionResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| ProvisionError::Path("Could not determine config directory".to_string()))?;
    Ok(config_dir.join("provision"))
}

/// Get the config file path (`<provision_home>/config.yaml`)
pub fn config_file() -> ProvisionResult<PathBuf> {
    Ok(provision_home()?.join("config.yaml"))
}

/// Get the default artifact cache directory
///
/// Platform-specific locations:
/// - Windows: %LOCALAPPDATA%\provision\cache
/// - Linux: ~/.cache/provision
/// - macOS: ~/Library/Caches/provision
pub fn cache_dir() -> ProvisionResult<PathBuf> {
    let cache_dir = dirs::cache_dir()
        .ok_or_else(|| ProvisionError::Path("Could not determine cache directory".to_string()))?;
    Ok(cache_dir.join("provision"))
}

/// Get the data directory holding run state and default scopes
///
/// - Linux: ~/.local/share/provision
/// - macOS: ~/Library/Application Support/provision
/// - Windows: %APPDATA%\provision
pub fn data_dir() -> ProvisionResult<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| ProvisionError::Path("Could not determine data directory".to_string()))?;
    Ok(data_dir.join("provision"))
}

/// Default state directory (ledger, run lock, last report)
pub fn state_dir() -> ProvisionResult<PathBuf> {
    Ok(data_dir()?.join("state"))
}

/// Default target scope directory for a tier
pub fn default_scope_dir(tier: Tier) -> ProvisionResult<PathBuf> {
    Ok(data_dir()?.join("scopes").join(tier.as_str()))
}

/// Metadata directory inside a scope (`<scope>/.provision`)
pub fn scope_metadata_dir(scope: &Path) -> PathBuf {
    scope.join(".provision")
}

/// Installed-package markers inside a scope
pub fn installed_markers_dir(scope: &Path) -> PathBuf {
    scope_metadata_dir(scope).join("installed")
}

/// Directory that unpacked payloads land in for importable scopes
pub fn site_dir(scope: &Path) -> PathBuf {
    scope.join("site")
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> ProvisionResult<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// A bare file name: exactly one normal component, no separators, no `..`.
///
/// Names published by an index or read from an `index.json` must pass this
/// before being joined onto a scope, staging or find-links directory.
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// A relative path that stays beneath the directory it is joined onto.
pub fn is_contained_path(path: &str) -> bool {
    let path = Path::new(path);
    path.components().next().is_some()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Expand a leading `~/` against the home directory
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
