//! Tier manifests.
//!
//! A manifest is either a single file split into `[global]`, `[wheelhouse]`
//! and `[local]` sections, or a directory holding `global.txt`,
//! `wheelhouse.txt` and `local.txt`. Each non-blank, non-comment line is a
//! dependency specifier for the enclosing tier.

pub mod requirement;

use crate::core::version::VersionConstraint;
use crate::core::{ProvisionError, ProvisionResult, Tier};
pub use requirement::{normalize_name, parse_requirement, Requirement};
use requirement::strip_comment;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// One declared dependency of one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub name: String,
    /// Constraint as declared (`>=2.0,<3.0`), empty when unconstrained
    pub constraint_text: String,
    pub constraint: VersionConstraint,
    pub tier: Tier,
    /// Digests pinned with `--hash=`; when present the fetched bytes must match one
    pub hashes: Vec<String>,
    /// 1-based line of the declaration
    pub line: usize,
}

impl DependencySpec {
    /// The specifier as it would appear in a manifest line.
    pub fn specifier(&self) -> String {
        format!("{}{}", self.name, self.constraint_text)
    }
}

/// Parsed manifest for every declared tier.
///
/// Loading reads and validates everything up front; `load` afterwards is a
/// pure lookup.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    source: PathBuf,
    tiers: BTreeMap<Tier, Vec<DependencySpec>>,
}

impl ManifestStore {
    /// Open a manifest file or directory.
    pub fn open(path: &Path) -> ProvisionResult<Self> {
        if path.is_dir() {
            Self::open_dir(path)
        } else if path.is_file() {
            let content = fs::read_to_string(path).map_err(|e| ProvisionError::ManifestParse {
                path: path.display().to_string(),
                line: 0,
                message: format!("cannot read manifest: {}", e),
            })?;
            Self::parse_str(path, &content)
        } else {
            Err(ProvisionError::ManifestParse {
                path: path.display().to_string(),
                line: 0,
                message: "manifest not found".to_string(),
            })
        }
    }

    fn open_dir(dir: &Path) -> ProvisionResult<Self> {
        let mut tiers = BTreeMap::new();
        for tier in Tier::ALL {
            let file = dir.join(format!("{}.txt", tier.as_str()));
            if !file.is_file() {
                continue;
            }
            let content = fs::read_to_string(&file)?;
            let mut parser = SectionParser::new(&file);
            parser.current = Some(tier);
            parser.declare(tier);
            for (index, line) in logical_lines(&content) {
                if section_header(&line).is_some() {
                    return Err(parser.error(
                        index,
                        "section headers are not allowed in per-tier manifest files",
                    ));
                }
                parser.spec_line(index, &line)?;
            }
            tiers.append(&mut parser.finish());
        }

        if tiers.is_empty() {
            return Err(ProvisionError::ManifestParse {
                path: dir.display().to_string(),
                line: 0,
                message: "directory contains none of global.txt, wheelhouse.txt, local.txt"
                    .to_string(),
            });
        }

        Ok(Self {
            source: dir.to_path_buf(),
            tiers,
        })
    }

    /// Parse the single-file form.
    pub fn parse_str(source: &Path, content: &str) -> ProvisionResult<Self> {
        let mut parser = SectionParser::new(source);

        for (index, line) in logical_lines(content) {
            match section_header(&line) {
                Some(header) => {
                    let tier: Tier = header.parse().map_err(|_| {
                        parser.error(index, &format!("unknown tier '[{}]'", header))
                    })?;
                    if parser.tiers.contains_key(&tier) {
                        return Err(parser.error(index, &format!("tier '[{}]' declared twice", header)));
                    }
                    parser.declare(tier);
                    parser.current = Some(tier);
                }
                None => parser.spec_line(index, &line)?,
            }
        }

        Ok(Self {
            source: source.to_path_buf(),
            tiers: parser.finish(),
        })
    }

    /// Declared specs of `tier`, in declaration order. Undeclared tiers yield
    /// an empty list.
    pub fn load(&self, tier: Tier) -> Vec<DependencySpec> {
        self.tiers.get(&tier).cloned().unwrap_or_default()
    }

    /// Tiers with a section (or file), in tier order.
    pub fn declared_tiers(&self) -> Vec<Tier> {
        self.tiers.keys().copied().collect()
    }

    pub fn is_declared(&self, tier: Tier) -> bool {
        self.tiers.contains_key(&tier)
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

struct SectionParser<'a> {
    source: &'a Path,
    current: Option<Tier>,
    tiers: BTreeMap<Tier, Vec<DependencySpec>>,
    seen: HashMap<(String, Tier), usize>,
}

impl<'a> SectionParser<'a> {
    fn new(source: &'a Path) -> Self {
        Self {
            source,
            current: None,
            tiers: BTreeMap::new(),
            seen: HashMap::new(),
        }
    }

    fn declare(&mut self, tier: Tier) {
        self.tiers.entry(tier).or_default();
    }

    fn error(&self, line: usize, message: &str) -> ProvisionError {
        ProvisionError::ManifestParse {
            path: self.source.display().to_string(),
            line,
            message: message.to_string(),
        }
    }

    fn spec_line(&mut self, line: usize, text: &str) -> ProvisionResult<()> {
        let tier = self.current.ok_or_else(|| {
            self.error(
                line,
                "dependency declared before any [global], [wheelhouse] or [local] header",
            )
        })?;

        let req = parse_requirement(text).map_err(|e| self.error(line, &e))?;

        if let Some(first) = self.seen.get(&(req.name.clone(), tier)) {
            return Err(self.error(
                line,
                &format!(
                    "'{}' is already declared for tier {} on line {}",
                    req.name, tier, first
                ),
            ));
        }
        self.seen.insert((req.name.clone(), tier), line);

        self.tiers.entry(tier).or_default().push(DependencySpec {
            name: req.name,
            constraint_text: req.constraint_text,
            constraint: req.constraint,
            tier,
            hashes: req.hashes,
            line,
        });
        Ok(())
    }

    fn finish(self) -> BTreeMap<Tier, Vec<DependencySpec>> {
        self.tiers
    }
}

fn section_header(line: &str) -> Option<&str> {
    line.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .map(str::trim)
}

/// Non-empty lines with comments removed and `\` continuations joined,
/// paired with the 1-based number of the line they start on.
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (i, raw) in content.lines().enumerate() {
        let text = strip_comment(raw).trim_end();
        let (start, mut joined) = pending.take().unwrap_or((i + 1, String::new()));

        match text.strip_suffix('\\') {
            Some(head) => {
                joined.push_str(head);
                joined.push(' ');
                pending = Some((start, joined));
            }
            None => {
                joined.push_str(text);
                let trimmed = joined.trim();
                if !trimmed.is_empty() {
                    out.push((start, trimmed.to_string()));
                }
            }
        }
    }

    if let Some((start, joined)) = pending {
        let trimmed = joined.trim();
        if !trimmed.is_empty() {
            out.push((start, trimmed.to_string()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const EXAMPLE: &str = r#"
# provisioning manifest
[global]
pytest==8.0.0   # test runner

[wheelhouse]
pandas>=2.0,<3.0

[LOCAL]
myapp-cli==1.2.0
"#;

    fn parse(content: &str) -> ProvisionResult<ManifestStore> {
        ManifestStore::parse_str(Path::new("tiers.txt"), content)
    }

    fn line_of(err: ProvisionError) -> usize {
        match err {
            ProvisionError::ManifestParse { line, .. } => line,
            other => panic!("expected manifest error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_sections() {
        let store = parse(EXAMPLE).unwrap();
        assert_eq!(
            store.declared_tiers(),
            vec![Tier::Global, Tier::Wheelhouse, Tier::Local]
        );

        let global = store.load(Tier::Global);
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].name, "pytest");
        assert_eq!(global[0].tier, Tier::Global);
        assert_eq!(global[0].line, 4);

        let wheelhouse = store.load(Tier::Wheelhouse);
        assert_eq!(wheelhouse[0].specifier(), "pandas>=2.0,<3.0");
        assert_eq!(store.load(Tier::Local)[0].name, "myapp-cli");
    }

    #[test]
    fn test_same_name_in_different_tiers_is_allowed() {
        let store = parse("[global]\nrequests>=2.0\n[local]\nrequests==2.31.0\n").unwrap();
        assert_eq!(store.load(Tier::Global)[0].constraint_text, ">=2.0");
        assert_eq!(store.load(Tier::Local)[0].constraint_text, "==2.31.0");
    }

    #[test]
    fn test_duplicate_name_in_tier_rejected() {
        let err = parse("[global]\nrequests>=2.0\nRequests==2.31.0\n").unwrap_err();
        assert_eq!(line_of(err), 3);
    }

    #[test]
    fn test_unknown_tier_rejected() {
        let err = parse("[system]\nrequests\n").unwrap_err();
        assert_eq!(line_of(err), 1);
    }

    #[test]
    fn test_spec_before_header_rejected() {
        let err = parse("requests\n[global]\n").unwrap_err();
        assert_eq!(line_of(err), 1);
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let err = parse("[global]\n\n# ok\npytest 8.0.0\n").unwrap_err();
        assert_eq!(line_of(err), 4);
        assert_eq!(
            ProvisionError::ManifestParse {
                path: String::new(),
                line: 1,
                message: String::new()
            }
            .exit_code(),
            1
        );
    }

    #[test]
    fn test_empty_section_is_declared() {
        let store = parse("[global]\n[local]\nrich\n").unwrap();
        assert!(store.is_declared(Tier::Global));
        assert!(store.load(Tier::Global).is_empty());
        assert!(!store.is_declared(Tier::Wheelhouse));
        assert!(store.load(Tier::Wheelhouse).is_empty());
    }

    #[test]
    fn test_line_continuation() {
        let store = parse("[global]\npytest==8.0.0 \\\n  --hash=sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08\n").unwrap();
        let spec = &store.load(Tier::Global)[0];
        assert_eq!(spec.hashes.len(), 1);
        assert_eq!(spec.line, 2);
    }

    #[test]
    fn test_open_directory_form() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("global.txt"), "pytest==8.0.0\n").unwrap();
        fs::write(temp.path().join("local.txt"), "# nothing yet\n").unwrap();

        let store = ManifestStore::open(temp.path()).unwrap();
        assert_eq!(store.declared_tiers(), vec![Tier::Global, Tier::Local]);
        assert_eq!(store.load(Tier::Global)[0].name, "pytest");
    }

    #[test]
    fn test_directory_form_rejects_headers() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("global.txt"), "[global]\npytest\n").unwrap();
        assert!(ManifestStore::open(temp.path()).is_err());
    }

    #[test]
    fn test_open_missing_path() {
        let temp = TempDir::new().unwrap();
        let err = ManifestStore::open(&temp.path().join("missing.txt")).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
