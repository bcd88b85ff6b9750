// Parses the checked-in fixtures under fixtures/ through the public adapter API.

use std::collections::BTreeSet;
use std::path::PathBuf;

use groupsync_adapters::{adapter_for_source, ImportScope};
use groupsync_core::{ImportSource, PlainlistSource, TarballSource};

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn tarball_from_fixture_dir() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(".", fixtures_root().join("tarball"))
        .expect("append fixture tree");
    builder.into_inner().expect("finish tar")
}

#[test]
fn fixture_tarball_imports_only_declared_systems() {
    let source = ImportSource::Tarball(TarballSource {
        url: "https://groups.example.com/export.tar".into(),
        oauth_scopes: BTreeSet::new(),
        domain: Some("example.com".into()),
        systems: BTreeSet::from(["ldap".to_string()]),
        groups: BTreeSet::new(),
    });
    let snapshot = adapter_for_source(&source)
        .parse(&tarball_from_fixture_dir())
        .expect("parse fixture tarball");

    assert_eq!(snapshot.systems.len(), 1);
    let ldap = &snapshot.systems["ldap"];
    assert_eq!(ldap.scope, ImportScope::WholeSystem);
    let names: Vec<_> = ldap.groups.keys().cloned().collect();
    assert_eq!(names, vec!["ldap/eng".to_string(), "ldap/oncall".to_string()]);

    let oncall: Vec<_> = ldap.groups["ldap/oncall"]
        .iter()
        .map(|i| i.as_str().to_string())
        .collect();
    assert_eq!(
        oncall,
        vec![
            "user:bob@example.com".to_string(),
            "user:carol@partner.example.org".to_string()
        ]
    );
}

#[test]
fn fixture_plainlist_keeps_exact_names_without_domain() {
    let source = ImportSource::Plainlist(PlainlistSource {
        url: "https://lists.example.com/admins.txt".into(),
        oauth_scopes: BTreeSet::new(),
        domain: None,
        group: "admins".into(),
    });
    let body = std::fs::read(fixtures_root().join("plainlist/admins.txt")).expect("read fixture");
    let snapshot = adapter_for_source(&source).parse(&body).expect("parse plainlist");

    let members: Vec<_> = snapshot.systems["external"].groups["external/admins"]
        .iter()
        .map(|i| i.as_str().to_string())
        .collect();
    assert_eq!(members, vec!["carol".to_string(), "dave".to_string()]);
}
