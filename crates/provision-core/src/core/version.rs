use crate::core::error::{ProvisionError, ProvisionResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Version constraint types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// No comparator: any release
    Any,
    /// Exact version: "==1.2.3"
    Exact(Version),
    /// Excluded version: "!=1.2.3"
    NotEqual(Version),
    /// Greater than or equal: ">=1.2.3"
    GreaterOrEqual(Version),
    /// Less than or equal: "<=1.2.3"
    LessOrEqual(Version),
    /// Strictly greater: ">1.2.3"
    GreaterThan(Version),
    /// Strictly less: "<2.0.0"
    LessThan(Version),
    /// Compatible release: "~=2.2" (>=2.2, ==2.*)
    Compatible(Version),
    /// Prefix match: "==1.2.*"
    Prefix(Version),
    /// Every clause must hold (comma-separated clauses)
    All(Vec<VersionConstraint>),
}

/// A release version.
///
/// The release segments are compared numerically with missing trailing
/// segments treated as zero, so `2.0 == 2.0.0`. Local metadata after `+`
/// is kept for display but ignored for ordering and equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub release: Vec<u64>,
    /// Pre-release label, normalised to dot form (e.g. "rc.1", "a.2", "beta")
    pub prerelease: Option<String>,
    /// Build/local metadata (e.g., "build.123")
    pub build_metadata: Option<String>,
    text: String,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            release: vec![major, minor, patch],
            prerelease: None,
            build_metadata: None,
            text: format!("{}.{}.{}", major, minor, patch),
        }
    }

    /// Create a new version with pre-release metadata
    pub fn with_prerelease(major: u64, minor: u64, patch: u64, prerelease: String) -> Self {
        let text = format!("{}.{}.{}-{}", major, minor, patch, prerelease);
        Self {
            release: vec![major, minor, patch],
            prerelease: Some(prerelease),
            build_metadata: None,
            text,
        }
    }

    pub fn major(&self) -> u64 {
        self.segment(0)
    }

    pub fn minor(&self) -> u64 {
        self.segment(1)
    }

    pub fn patch(&self) -> u64 {
        self.segment(2)
    }

    fn segment(&self, i: usize) -> u64 {
        self.release.get(i).copied().unwrap_or(0)
    }

    /// Release segments with trailing zeros removed, the canonical form used
    /// for equality and hashing.
    fn canonical_release(&self) -> &[u64] {
        let mut end = self.release.len();
        while end > 1 && self.release[end - 1] == 0 {
            end -= 1;
        }
        &self.release[..end]
    }

    /// Parse a version string.
    ///
    /// Accepts "2.2.1", "2.0", "1.0.0-rc.1", "2.0.0rc1", "1.4b2" and
    /// "1.0+local.7". A leading "v" is ignored.
    pub fn parse(s: &str) -> ProvisionResult<Self> {
        let text = s.trim();
        let body = text.strip_prefix('v').unwrap_or(text);

        if body.is_empty() {
            return Err(ProvisionError::Config(format!(
                "Invalid version format: '{}'",
                s
            )));
        }

        // Split by '+' to separate build metadata
        let (version_prerelease, build_metadata) = match body.split_once('+') {
            Some((v, build)) => (v, Some(build.to_string())),
            None => (body, None),
        };

        // The release part ends at the first character that is neither a
        // digit nor a dot.
        let split_at = version_prerelease
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(version_prerelease.len());
        let release_part = version_prerelease[..split_at].trim_end_matches('.');
        let suffix = &version_prerelease[split_at..];

        if release_part.is_empty() {
            return Err(ProvisionError::Config(format!(
                "Invalid version format: '{}'",
                s
            )));
        }

        let release = release_part
            .split('.')
            .map(|part| {
                part.parse::<u64>().map_err(|_| {
                    ProvisionError::Config(format!("Invalid version segment in '{}'", s))
                })
            })
            .collect::<ProvisionResult<Vec<u64>>>()?;

        let prerelease = if suffix.is_empty() {
            None
        } else {
            Some(normalize_prerelease(suffix).ok_or_else(|| {
                ProvisionError::Config(format!("Invalid pre-release in version '{}'", s))
            })?)
        };

        Ok(Self {
            release,
            prerelease,
            build_metadata,
            text: text.to_string(),
        })
    }

    /// Check if this version satisfies a constraint
    pub fn satisfies(&self, constraint: &VersionConstraint) -> bool {
        constraint.matches(self)
    }

    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }
}

/// Normalise "-rc.1", "rc1", ".beta2", "a1" into dot-separated identifiers
/// ("rc.1", "beta.2", "a.1").
fn normalize_prerelease(suffix: &str) -> Option<String> {
    let trimmed = suffix.trim_start_matches(['-', '.', '_']);
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains('.') {
        return Some(trimmed.to_string());
    }
    let digits_at = trimmed.find(|c: char| c.is_ascii_digit());
    match digits_at {
        Some(0) => Some(trimmed.to_string()),
        Some(pos) => {
            let (label, number) = trimmed.split_at(pos);
            let label = label.trim_end_matches(['-', '_']);
            if number.chars().all(|c| c.is_ascii_digit()) {
                Some(format!("{}.{}", label, number))
            } else {
                Some(trimmed.to_string())
            }
        }
        None => Some(trimmed.to_string()),
    }
}

// Equality ignores build_metadata and trailing zero segments
impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_release().hash(state);
        self.prerelease.hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.release.len().max(other.release.len());
        for i in 0..len {
            match self.segment(i).cmp(&other.segment(i)) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        // Pre-release versions have lower precedence than normal versions
        match (&self.prerelease, &other.prerelease) {
            (None, None) => Ordering::Equal,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(a), Some(b)) => compare_prerelease_identifiers(a, b),
        }
    }
}

/// Compare pre-release identifiers: numeric parts numerically, numeric
/// before alphanumeric, longer wins when all shared parts are equal.
fn compare_prerelease_identifiers(a: &str, b: &str) -> Ordering {
    let a_parts: Vec<&str> = a.split('.').collect();
    let b_parts: Vec<&str> = b.split('.').collect();

    for (a_part, b_part) in a_parts.iter().zip(b_parts.iter()) {
        let ordering = match (a_part.parse::<u64>(), b_part.parse::<u64>()) {
            (Ok(a_num), Ok(b_num)) => a_num.cmp(&b_num),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => a_part.cmp(b_part),
        };

        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    a_parts.len().cmp(&b_parts.len())
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl TryFrom<String> for Version {
    type Error = ProvisionError;

    fn try_from(value: String) -> ProvisionResult<Self> {
        Version::parse(&value)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.text
    }
}

impl VersionConstraint {
    /// Whether `version` satisfies every clause.
    ///
    /// Pre-releases only match when some clause itself names a pre-release.
    pub fn matches(&self, version: &Version) -> bool {
        if version.is_prerelease() && !self.allows_prerelease() {
            return false;
        }
        self.matches_clause(version)
    }

    fn matches_clause(&self, v: &Version) -> bool {
        match self {
            VersionConstraint::Any => true,
            VersionConstraint::Exact(c) => v == c,
            VersionConstraint::NotEqual(c) => v != c,
            VersionConstraint::GreaterOrEqual(c) => v >= c,
            VersionConstraint::LessOrEqual(c) => v <= c,
            VersionConstraint::GreaterThan(c) => v > c,
            VersionConstraint::LessThan(c) => v < c,
            VersionConstraint::Compatible(c) => {
                let prefix_len = c.release.len().saturating_sub(1).max(1);
                v >= c && has_prefix(v, &c.release[..prefix_len])
            }
            VersionConstraint::Prefix(c) => has_prefix(v, &c.release),
            VersionConstraint::All(clauses) => clauses.iter().all(|c| c.matches_clause(v)),
        }
    }

    /// True if any clause names a pre-release version.
    pub fn allows_prerelease(&self) -> bool {
        match self {
            VersionConstraint::Any => false,
            VersionConstraint::All(clauses) => clauses.iter().any(|c| c.allows_prerelease()),
            VersionConstraint::Exact(v)
            | VersionConstraint::NotEqual(v)
            | VersionConstraint::GreaterOrEqual(v)
            | VersionConstraint::LessOrEqual(v)
            | VersionConstraint::GreaterThan(v)
            | VersionConstraint::LessThan(v)
            | VersionConstraint::Compatible(v)
            | VersionConstraint::Prefix(v) => v.is_prerelease(),
        }
    }

    /// Combine two constraints into one that requires both.
    pub fn and(self, other: VersionConstraint) -> VersionConstraint {
        let mut clauses = Vec::new();
        for c in [self, other] {
            match c {
                VersionConstraint::Any => {}
                VersionConstraint::All(inner) => clauses.extend(inner),
                single => clauses.push(single),
            }
        }
        match clauses.len() {
            0 => VersionConstraint::Any,
            1 => clauses.remove(0),
            _ => VersionConstraint::All(clauses),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, VersionConstraint::Any)
    }
}

fn has_prefix(v: &Version, prefix: &[u64]) -> bool {
    prefix.iter().enumerate().all(|(i, p)| v.segment(i) == *p)
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Any => write!(f, "*"),
            VersionConstraint::Exact(v) => write!(f, "=={}", v),
            VersionConstraint::NotEqual(v) => write!(f, "!={}", v),
            VersionConstraint::GreaterOrEqual(v) => write!(f, ">={}", v),
            VersionConstraint::LessOrEqual(v) => write!(f, "<={}", v),
            VersionConstraint::GreaterThan(v) => write!(f, ">{}", v),
            VersionConstraint::LessThan(v) => write!(f, "<{}", v),
            VersionConstraint::Compatible(v) => write!(f, "~={}", v),
            VersionConstraint::Prefix(v) => write!(f, "=={}.*", v),
            VersionConstraint::All(clauses) => {
                let parts: Vec<String> = clauses.iter().map(|c| c.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

/// Parse a single comparator clause ("==1.2", ">=2.0", "~=1.4.5", "==1.2.*").
///
/// A bare version without comparator is treated as an exact pin.
pub fn parse_constraint(s: &str) -> ProvisionResult<VersionConstraint> {
    let s = s.trim();

    if s.is_empty() || s == "*" {
        return Ok(VersionConstraint::Any);
    }

    if let Some(rest) = s.strip_prefix("~=") {
        let version = Version::parse(rest)?;
        if version.release.len() < 2 {
            return Err(ProvisionError::Config(format!(
                "Compatible release '{}' needs at least two release segments",
                s
            )));
        }
        Ok(VersionConstraint::Compatible(version))
    } else if let Some(rest) = s.strip_prefix("===") {
        Ok(VersionConstraint::Exact(Version::parse(rest)?))
    } else if let Some(rest) = s.strip_prefix("==") {
        match rest.trim().strip_suffix(".*") {
            Some(base) => Ok(VersionConstraint::Prefix(Version::parse(base)?)),
            None => Ok(VersionConstraint::Exact(Version::parse(rest)?)),
        }
    } else if let Some(rest) = s.strip_prefix("!=") {
        Ok(VersionConstraint::NotEqual(Version::parse(rest)?))
    } else if let Some(rest) = s.strip_prefix(">=") {
        Ok(VersionConstraint::GreaterOrEqual(Version::parse(rest)?))
    } else if let Some(rest) = s.strip_prefix("<=") {
        Ok(VersionConstraint::LessOrEqual(Version::parse(rest)?))
    } else if let Some(rest) = s.strip_prefix('>') {
        Ok(VersionConstraint::GreaterThan(Version::parse(rest)?))
    } else if let Some(rest) = s.strip_prefix('<') {
        Ok(VersionConstraint::LessThan(Version::parse(rest)?))
    } else {
        Ok(VersionConstraint::Exact(Version::parse(s)?))
    }
}

/// Parse a comma-separated list of clauses, all of which must hold.
///
/// Examples: `==8.0.0`, `>=2.0,<3.0`, `~=1.4.5, !=1.4.7`, `` (unconstrained)
pub fn parse_compound_constraint(s: &str) -> ProvisionResult<VersionConstraint> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(VersionConstraint::Any);
    }

    let clauses = s
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(parse_constraint)
        .collect::<ProvisionResult<Vec<_>>>()?;

    Ok(clauses
        .into_iter()
        .fold(VersionConstraint::Any, VersionConstraint::and))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        let v = Version::parse("1.2.3").unwrap();
        assert_eq!(v.major(), 1);
        assert_eq!(v.minor(), 2);
        assert_eq!(v.patch(), 3);
        assert_eq!(v.to_string(), "1.2.3");
    }

    #[test]
    fn test_version_short_forms_pad_with_zero() {
        let v = Version::parse("2.0").unwrap();
        assert_eq!(v, Version::new(2, 0, 0));
        assert_eq!(v.to_string(), "2.0");
    }

    #[test]
    fn test_version_four_segments() {
        let a = Version::parse("2023.10.1.1").unwrap();
        let b = Version::parse("2023.10.1").unwrap();
        assert!(a > b);
    }

    #[test]
    fn test_version_pep440_prerelease() {
        let v = Version::parse("2.0.0rc1").unwrap();
        assert_eq!(v.prerelease.as_deref(), Some("rc.1"));
        assert!(v < Version::new(2, 0, 0));
        assert!(Version::parse("2.0.0a1").unwrap() < Version::parse("2.0.0b1").unwrap());
        assert!(Version::parse("2.0.0b1").unwrap() < v);
    }

    #[test]
    fn test_version_ordering_with_prerelease() {
        let v1 = Version::parse("1.0.0-alpha").unwrap();
        let v2 = Version::parse("1.0.0-alpha.1").unwrap();
        let v3 = Version::parse("1.0.0-alpha.beta").unwrap();
        let v4 = Version::parse("1.0.0-beta").unwrap();
        let v5 = Version::parse("1.0.0-beta.2").unwrap();
        let v6 = Version::parse("1.0.0-beta.11").unwrap();
        let v7 = Version::parse("1.0.0-rc.1").unwrap();
        let v8 = Version::parse("1.0.0").unwrap();

        assert!(v1 < v2);
        assert!(v2 < v3);
        assert!(v3 < v4);
        assert!(v4 < v5);
        assert!(v5 < v6);
        assert!(v6 < v7);
        assert!(v7 < v8);
    }

    #[test]
    fn test_version_build_metadata_ignored_in_comparison() {
        let v1 = Version::parse("1.0.0+build.1").unwrap();
        let v2 = Version::parse("1.0.0+build.2").unwrap();
        let v3 = Version::parse("1.0.0").unwrap();

        assert_eq!(v1, v3);
        assert_eq!(v2, v3);
        assert_eq!(v1.build_metadata.as_deref(), Some("build.1"));
    }

    #[test]
    fn test_version_rejects_garbage() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("latest").is_err());
        assert!(Version::parse("1..2").is_err());
    }

    #[test]
    fn test_version_serde_as_string() {
        let v = Version::parse("2.2.1").unwrap();
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"2.2.1\"");
        let back: Version = serde_json::from_str("\"2.2.1\"").unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_parse_constraint_comparators() {
        assert!(matches!(
            parse_constraint("==8.0.0").unwrap(),
            VersionConstraint::Exact(_)
        ));
        assert!(matches!(
            parse_constraint(">=2.0").unwrap(),
            VersionConstraint::GreaterOrEqual(_)
        ));
        assert!(matches!(
            parse_constraint("<=1.5").unwrap(),
            VersionConstraint::LessOrEqual(_)
        ));
        assert!(matches!(
            parse_constraint("==1.2.*").unwrap(),
            VersionConstraint::Prefix(_)
        ));
        assert!(matches!(
            parse_constraint("~=2.2").unwrap(),
            VersionConstraint::Compatible(_)
        ));
        assert!(matches!(parse_constraint("").unwrap(), VersionConstraint::Any));
        assert!(parse_constraint("~=2").is_err());
    }

    #[test]
    fn test_compound_range() {
        let c = parse_compound_constraint(">=2.0,<3.0").unwrap();
        assert!(Version::parse("2.2.1").unwrap().satisfies(&c));
        assert!(Version::parse("2.0").unwrap().satisfies(&c));
        assert!(!Version::parse("3.0.0").unwrap().satisfies(&c));
        assert!(!Version::parse("1.9.9").unwrap().satisfies(&c));
        assert_eq!(c.to_string(), ">=2.0,<3.0");
    }

    #[test]
    fn test_compatible_release() {
        let c = parse_constraint("~=2.2").unwrap();
        assert!(Version::parse("2.2").unwrap().satisfies(&c));
        assert!(Version::parse("2.9.1").unwrap().satisfies(&c));
        assert!(!Version::parse("3.0").unwrap().satisfies(&c));

        let c = parse_constraint("~=1.4.5").unwrap();
        assert!(Version::parse("1.4.9").unwrap().satisfies(&c));
        assert!(!Version::parse("1.5.0").unwrap().satisfies(&c));
        assert!(!Version::parse("1.4.4").unwrap().satisfies(&c));
    }

    #[test]
    fn test_prefix_and_not_equal() {
        let c = parse_compound_constraint("==1.2.*,!=1.2.3").unwrap();
        assert!(Version::parse("1.2.0").unwrap().satisfies(&c));
        assert!(!Version::parse("1.2.3").unwrap().satisfies(&c));
        assert!(!Version::parse("1.3.0").unwrap().satisfies(&c));
    }

    #[test]
    fn test_prereleases_excluded_unless_named() {
        let rc = Version::parse("3.0.0rc1").unwrap();
        assert!(!rc.satisfies(&parse_compound_constraint(">=2.0").unwrap()));
        assert!(!rc.satisfies(&VersionConstraint::Any));
        assert!(rc.satisfies(&parse_compound_constraint(">=3.0.0rc1").unwrap()));
    }

    #[test]
    fn test_and_flattens_clauses() {
        let c = parse_constraint(">=1.0")
            .unwrap()
            .and(parse_compound_constraint("<2.0,!=1.5").unwrap());
        match &c {
            VersionConstraint::All(clauses) => assert_eq!(clauses.len(), 3),
            other => panic!("expected All, got {:?}", other),
        }
        assert!(VersionConstraint::Any.and(VersionConstraint::Any).is_any());
    }
}
