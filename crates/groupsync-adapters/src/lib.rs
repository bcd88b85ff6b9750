//! Import source adapters: tarball + plainlist payload parsing and identity normalization.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Component;

use flate2::read::GzDecoder;
use groupsync_core::{
    is_valid_group_local_name, qualified_group_name, Identity, ImportSource, ParseError,
    PlainlistSource, TarballSource, ValidationError, EXTERNAL_SYSTEM,
};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "groupsync-adapters";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Raw member files of an archive: `system -> local-name -> bytes`.
pub type MemberFiles = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// Which of a system's groups an import is authoritative for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "groups", rename_all = "snake_case")]
pub enum ImportScope {
    /// Every group owned by the system.
    WholeSystem,
    /// Only these qualified names (plainlists share the `external` system).
    Groups(BTreeSet<String>),
}

impl ImportScope {
    pub fn covers(&self, name: &str) -> bool {
        match self {
            Self::WholeSystem => true,
            Self::Groups(names) => names.contains(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemImport {
    pub scope: ImportScope,
    /// Qualified group name -> normalized members.
    pub groups: BTreeMap<String, BTreeSet<Identity>>,
}

/// Normalized result of parsing one source payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSnapshot {
    pub source_id: String,
    pub source_url: String,
    pub systems: BTreeMap<String, SystemImport>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("group {group}: {source}")]
    Validation {
        group: String,
        #[source]
        source: ValidationError,
    },
}

/// Turns a fetched payload into an [`ImportSnapshot`].
pub trait ImportAdapter: Send + Sync {
    fn source_id(&self) -> String;

    fn parse(&self, payload: &[u8]) -> Result<ImportSnapshot, AdapterError>;
}

pub struct TarballAdapter {
    source: TarballSource,
}

impl TarballAdapter {
    pub fn new(source: TarballSource) -> Self {
        Self { source }
    }
}

impl ImportAdapter for TarballAdapter {
    fn source_id(&self) -> String {
        ImportSource::Tarball(self.source.clone()).source_id()
    }

    fn parse(&self, payload: &[u8]) -> Result<ImportSnapshot, AdapterError> {
        let files = parse_tarball(payload, &self.source.systems, &self.source.groups)?;
        let domain = self.source.domain.as_deref();

        let mut systems = BTreeMap::new();
        for system in &self.source.systems {
            let mut groups = BTreeMap::new();
            for (local_name, body) in files.get(system).into_iter().flatten() {
                let name = qualified_group_name(system, local_name);
                let members = load_members(&name, body, domain)?;
                groups.insert(name, members);
            }
            systems.insert(
                system.clone(),
                SystemImport {
                    scope: ImportScope::WholeSystem,
                    groups,
                },
            );
        }

        Ok(ImportSnapshot {
            source_id: self.source_id(),
            source_url: self.source.url.clone(),
            systems,
        })
    }
}

pub struct PlainlistAdapter {
    source: PlainlistSource,
}

impl PlainlistAdapter {
    pub fn new(source: PlainlistSource) -> Self {
        Self { source }
    }
}

impl ImportAdapter for PlainlistAdapter {
    fn source_id(&self) -> String {
        ImportSource::Plainlist(self.source.clone()).source_id()
    }

    fn parse(&self, payload: &[u8]) -> Result<ImportSnapshot, AdapterError> {
        let name = qualified_group_name(EXTERNAL_SYSTEM, &self.source.group);
        let members = load_members(&name, payload, self.source.domain.as_deref())?;

        let system = SystemImport {
            scope: ImportScope::Groups(BTreeSet::from([name.clone()])),
            groups: BTreeMap::from([(name, members)]),
        };
        Ok(ImportSnapshot {
            source_id: self.source_id(),
            source_url: self.source.url.clone(),
            systems: BTreeMap::from([(EXTERNAL_SYSTEM.to_string(), system)]),
        })
    }
}

pub fn adapter_for_source(source: &ImportSource) -> Box<dyn ImportAdapter> {
    match source {
        ImportSource::Tarball(t) => Box::new(TarballAdapter::new(t.clone())),
        ImportSource::Plainlist(p) => Box::new(PlainlistAdapter::new(p.clone())),
    }
}

/// Decodes a (optionally gzipped) tar archive of `<system>/<group>` member files.
///
/// Entries under systems outside `systems` are ignored. When `groups` is non-empty
/// only those qualified names are kept.
pub fn parse_tarball(
    bytes: &[u8],
    systems: &BTreeSet<String>,
    groups: &BTreeSet<String>,
) -> Result<MemberFiles, ParseError> {
    let reader: Box<dyn Read + '_> = if bytes.starts_with(&GZIP_MAGIC) {
        Box::new(GzDecoder::new(bytes))
    } else {
        Box::new(bytes)
    };
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(malformed)?;

    let mut out: MemberFiles = BTreeMap::new();
    for entry in entries {
        let mut entry = entry.map_err(malformed)?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            continue;
        }

        let path = entry.path().map_err(malformed)?.into_owned();
        let mut parts = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => parts.push(
                    part.to_str()
                        .ok_or_else(|| ParseError::Malformed(format!("non UTF-8 path {}", path.display())))?
                        .to_string(),
                ),
                Component::CurDir => {}
                _ => {
                    return Err(ParseError::Malformed(format!(
                        "path {} escapes the archive",
                        path.display()
                    )))
                }
            }
        }

        let Some(system) = parts.first() else {
            continue;
        };
        if !systems.contains(system) {
            debug!(path = %path.display(), "skipping entry of undeclared system");
            continue;
        }
        if parts.len() != 2 {
            return Err(ParseError::Malformed(format!(
                "path {} is not <system>/<group>",
                path.display()
            )));
        }
        if !entry_type.is_file() {
            debug!(path = %path.display(), "skipping non-file entry");
            continue;
        }

        let local_name = &parts[1];
        if !is_valid_group_local_name(local_name) {
            return Err(ParseError::Malformed(format!(
                "invalid group name in path {}",
                path.display()
            )));
        }
        if !groups.is_empty() && !groups.contains(&qualified_group_name(system, local_name)) {
            continue;
        }

        let mut body = Vec::new();
        entry.read_to_end(&mut body).map_err(malformed)?;
        let previous = out
            .entry(system.clone())
            .or_default()
            .insert(local_name.clone(), body);
        if previous.is_some() {
            return Err(ParseError::Malformed(format!(
                "duplicate entry {}",
                path.display()
            )));
        }
    }
    Ok(out)
}

fn malformed(err: std::io::Error) -> ParseError {
    ParseError::Malformed(err.to_string())
}

/// Splits a newline-delimited list, dropping blank lines and `#` comments.
pub fn parse_plainlist(bytes: &[u8]) -> Result<Vec<String>, ParseError> {
    let text = std::str::from_utf8(bytes).map_err(|err| ParseError::Encoding(err.to_string()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Converts one imported line into a canonical identity.
///
/// Bare names get `@domain` appended when a domain is configured; anything with an
/// `@` becomes a lowercased `user:` identity.
pub fn normalize_identity(raw: &str, domain: Option<&str>) -> Result<Identity, ValidationError> {
    let raw = raw.trim();
    if let Some(email) = raw.strip_prefix("user:") {
        let email = match domain {
            Some(domain) if !email.contains('@') && !email.is_empty() => format!("{email}@{domain}"),
            _ => email.to_string(),
        };
        return Identity::parse(&format!("user:{}", email.to_ascii_lowercase()));
    }
    if raw.contains(':') {
        return Identity::parse(raw);
    }

    let value = match domain {
        Some(domain) if !raw.contains('@') && !raw.is_empty() => format!("{raw}@{domain}"),
        _ => raw.to_string(),
    };
    if value.contains('@') {
        Identity::parse(&format!("user:{}", value.to_ascii_lowercase()))
    } else {
        Identity::parse(&value)
    }
}

/// Parses and normalizes a member list; a single bad line fails the whole group.
pub fn load_members(
    group: &str,
    bytes: &[u8],
    domain: Option<&str>,
) -> Result<BTreeSet<Identity>, AdapterError> {
    parse_plainlist(bytes)?
        .iter()
        .map(|line| {
            normalize_identity(line, domain).map_err(|source| AdapterError::Validation {
                group: group.to_string(),
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn idents(items: &[&str]) -> BTreeSet<Identity> {
        items
            .iter()
            .map(|s| Identity::parse(s).expect("identity"))
            .collect()
    }

    fn tarball(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, body) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, body.as_bytes())
                .expect("append");
        }
        builder.into_inner().expect("finish tar")
    }

    fn tarball_source(systems: &[&str], groups: &[&str], domain: Option<&str>) -> TarballSource {
        TarballSource {
            url: "https://groups.example.com/export.tar".into(),
            oauth_scopes: BTreeSet::new(),
            domain: domain.map(str::to_string),
            systems: set(systems),
            groups: set(groups),
        }
    }

    #[test]
    fn tarball_members_get_domain_and_user_prefix() {
        let payload = tarball(&[("ldap/eng", "alice\nbob\n")]);
        let adapter = TarballAdapter::new(tarball_source(&["ldap"], &[], Some("example.com")));
        let snapshot = adapter.parse(&payload).expect("parse");

        let ldap = &snapshot.systems["ldap"];
        assert_eq!(ldap.scope, ImportScope::WholeSystem);
        assert_eq!(
            ldap.groups["ldap/eng"],
            idents(&["user:alice@example.com", "user:bob@example.com"])
        );
    }

    #[test]
    fn tarball_ignores_undeclared_systems_and_applies_allow_list() {
        let payload = tarball(&[
            ("ldap/eng", "alice@example.com\n"),
            ("ldap/ops", "bob@example.com\n"),
            ("hr/payroll", "carol@example.com\n"),
            ("README", "not a group"),
        ]);
        let files = parse_tarball(&payload, &set(&["ldap"]), &set(&["ldap/eng"])).expect("parse");
        assert_eq!(files.len(), 1);
        assert_eq!(
            files["ldap"].keys().cloned().collect::<Vec<_>>(),
            vec!["eng".to_string()]
        );
    }

    #[test]
    fn declared_system_missing_from_archive_is_present_and_empty() {
        let payload = tarball(&[("ldap/eng", "alice@example.com\n")]);
        let adapter = TarballAdapter::new(tarball_source(&["ldap", "corp"], &[], None));
        let snapshot = adapter.parse(&payload).expect("parse");
        assert!(snapshot.systems["corp"].groups.is_empty());
        assert_eq!(snapshot.systems["ldap"].groups.len(), 1);
    }

    #[test]
    fn gzipped_tarball_is_detected() {
        let raw = tarball(&[("./ldap/eng", "alice@example.com\n")]);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, &raw).expect("gzip");
        let gz = encoder.finish().expect("gzip finish");

        let files = parse_tarball(&gz, &set(&["ldap"]), &BTreeSet::new()).expect("parse");
        assert_eq!(files["ldap"]["eng"], b"alice@example.com\n".to_vec());
    }

    #[test]
    fn tarball_rejects_nested_paths_and_garbage() {
        let nested = tarball(&[("ldap/eng/extra", "alice\n")]);
        assert!(matches!(
            parse_tarball(&nested, &set(&["ldap"]), &BTreeSet::new()),
            Err(ParseError::Malformed(_))
        ));

        let bad_name = tarball(&[("ldap/Eng Team", "alice\n")]);
        assert!(matches!(
            parse_tarball(&bad_name, &set(&["ldap"]), &BTreeSet::new()),
            Err(ParseError::Malformed(_))
        ));

        let garbage = vec![0x42u8; 1024];
        assert!(matches!(
            parse_tarball(&garbage, &set(&["ldap"]), &BTreeSet::new()),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn plainlist_drops_comments_and_blank_lines() {
        let adapter = PlainlistAdapter::new(PlainlistSource {
            url: "https://lists.example.com/admins.txt".into(),
            oauth_scopes: BTreeSet::new(),
            domain: None,
            group: "admins".into(),
        });
        let snapshot = adapter.parse(b"carol\n#comment\n\ndave\n").expect("parse");
        let external = &snapshot.systems["external"];
        assert_eq!(external.groups["external/admins"], idents(&["carol", "dave"]));
        assert!(external.scope.covers("external/admins"));
        assert!(!external.scope.covers("external/other"));
        assert_eq!(snapshot.source_id, "plainlist:admins");
    }

    #[test]
    fn plainlist_rejects_invalid_utf8() {
        assert!(matches!(
            parse_plainlist(&[0xff, 0xfe, b'\n']),
            Err(ParseError::Encoding(_))
        ));
    }

    #[test]
    fn normalizer_shapes() {
        assert_eq!(
            normalize_identity("Alice", Some("example.com")).unwrap().as_str(),
            "user:alice@example.com"
        );
        assert_eq!(
            normalize_identity("bob@corp.example.com", Some("example.com"))
                .unwrap()
                .as_str(),
            "user:bob@corp.example.com"
        );
        assert_eq!(normalize_identity("carol", None).unwrap().as_str(), "carol");
        assert_eq!(
            normalize_identity("user:Alice", Some("example.com")).unwrap().as_str(),
            "user:alice@example.com"
        );
        assert!(normalize_identity("user:alice", None).is_err());
        assert_eq!(
            normalize_identity("bot:ci-runner", Some("example.com")).unwrap().as_str(),
            "bot:ci-runner"
        );
        assert!(normalize_identity("a@b@c", None).is_err());
        assert!(normalize_identity("robot:x", None).is_err());
        assert!(normalize_identity("two words", Some("example.com")).is_err());
    }

    #[test]
    fn one_bad_line_fails_the_whole_group() {
        let err = load_members("ldap/eng", b"alice@example.com\nnot an email\n", None).unwrap_err();
        match err {
            AdapterError::Validation { group, source } => {
                assert_eq!(group, "ldap/eng");
                assert!(matches!(source, ValidationError::BadIdentity { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn snapshot_serializes_for_dry_runs() {
        let payload = tarball(&[("ldap/eng", "alice@example.com\n")]);
        let adapter = TarballAdapter::new(tarball_source(&["ldap"], &[], None));
        let snapshot = adapter.parse(&payload).expect("parse");
        let json = serde_json::to_value(&snapshot).expect("json");
        assert_eq!(json["systems"]["ldap"]["scope"]["kind"], "whole_system");
        assert_eq!(json["systems"]["ldap"]["groups"]["ldap/eng"][0], "user:alice@example.com");
    }
}
