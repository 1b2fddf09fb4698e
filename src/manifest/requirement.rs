//! Single dependency-specifier parsing (`pandas>=2.0,<3.0 --hash=sha256:...`).

use crate::core::version::{parse_compound_constraint, VersionConstraint};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use tracing::warn;

/// Digest algorithms accepted in `--hash=` options and cache records.
pub const HASH_ALGORITHMS: [&str; 2] = ["sha256", "blake3"];

/// A parsed `<name><constraint>` specifier, independent of any tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Normalised name (lower-case, `_`/`.` folded to `-`)
    pub name: String,
    /// Constraint as written, whitespace removed; empty when unconstrained
    pub constraint_text: String,
    pub constraint: VersionConstraint,
    /// Pinned digests in `algo:hex` form
    pub hashes: Vec<String>,
    /// Environment marker after `;`, kept for reporting but never evaluated
    pub marker: Option<String>,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.constraint_text)
    }
}

// name, optional [extras], then everything else is the constraint
static REQUIREMENT_RE: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(?:\[[^\]]*\])?\s*(.*)$")
});

/// Normalise a package name so `Foo_Bar`, `foo.bar` and `foo-bar` compare equal.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            if !last_dash {
                out.push('-');
            }
            last_dash = true;
        } else {
            out.extend(c.to_lowercase());
            last_dash = false;
        }
    }
    out
}

/// Strip a trailing `# comment`. A `#` only starts a comment at the start of
/// the line or after whitespace, so URLs with fragments survive.
pub fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

/// Parse one logical specifier line (comment already removed).
///
/// Extras in `[...]` are ignored. Environment markers after `;` are kept on
/// the result but not evaluated, so the requirement applies everywhere; a
/// warning names each one. `--hash=algo:hex` options are collected; any other option is
/// rejected.
pub fn parse_requirement(line: &str) -> Result<Requirement, String> {
    let mut spec_part = String::new();
    let mut hashes = Vec::new();

    for token in line.split_whitespace() {
        if let Some(option) = token.strip_prefix("--") {
            match option.split_once('=') {
                Some(("hash", value)) => hashes.push(parse_hash(value)?),
                _ => return Err(format!("unsupported option '{}'", token)),
            }
        } else if !hashes.is_empty() {
            return Err(format!("unexpected '{}' after --hash options", token));
        } else {
            spec_part.push_str(token);
            spec_part.push(' ');
        }
    }

    let (spec_part, marker) = match spec_part.split_once(';') {
        Some((spec, marker)) => (spec.trim(), Some(marker.trim().to_string())),
        None => (spec_part.trim(), None),
    };
    if spec_part.is_empty() {
        return Err("missing package name".to_string());
    }

    let re = REQUIREMENT_RE
        .as_ref()
        .map_err(|e| format!("invalid regex: {}", e))?;
    let caps = re
        .captures(spec_part)
        .ok_or_else(|| format!("invalid package name in '{}'", spec_part))?;
    let raw_name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    let rest = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

    let mut constraint_text: String = rest.chars().filter(|c| !c.is_whitespace()).collect();
    if constraint_text.starts_with('(') && constraint_text.ends_with(')') {
        constraint_text = constraint_text[1..constraint_text.len() - 1].to_string();
    }
    if let Some(first) = constraint_text.chars().next() {
        if !matches!(first, '=' | '<' | '>' | '!' | '~') {
            return Err(format!(
                "expected a comparator after '{}', found '{}'",
                raw_name, constraint_text
            ));
        }
    }

    let constraint = parse_compound_constraint(&constraint_text).map_err(|e| e.to_string())?;
    let name = normalize_name(raw_name);
    if let Some(marker) = &marker {
        warn!(
            "{}: environment marker '{}' is not evaluated; installing unconditionally",
            name, marker
        );
    }

    Ok(Requirement {
        name,
        constraint_text,
        constraint,
        hashes,
        marker,
    })
}

/// Validate an `algo:hex` digest and return it lower-cased.
pub fn parse_hash(value: &str) -> Result<String, String> {
    let (algo, hex_digest) = value
        .split_once(':')
        .ok_or_else(|| format!("hash '{}' must be written as <algorithm>:<hex>", value))?;
    let algo = algo.to_lowercase();
    if !HASH_ALGORITHMS.contains(&algo.as_str()) {
        return Err(format!(
            "unsupported hash algorithm '{}' (expected sha256 or blake3)",
            algo
        ));
    }
    if hex_digest.len() != 64 || hex::decode(hex_digest).is_err() {
        return Err(format!("hash '{}' is not a 64-digit hex digest", value));
    }
    Ok(format!("{}:{}", algo, hex_digest.to_lowercase()))
}
