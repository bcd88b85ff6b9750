use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use groupsync_core::{Group, GroupImporterConfig, Identity, Outcome};
use groupsync_storage::{
    payload_sha256, BackoffPolicy, FetchError, FetchedPayload, FileGroupStore, GroupStore,
    PayloadFetcher,
};
use groupsync_sync::{ImportOrchestrator, OrchestratorSettings};

const TARBALL_URL: &str = "https://groups.example.com/export.tar.gz";

/// Serves whatever body is currently registered for a URL.
#[derive(Default)]
struct StubFetcher {
    bodies: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl StubFetcher {
    fn set(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(url.to_string(), body);
    }
}

#[async_trait]
impl PayloadFetcher for StubFetcher {
    async fn fetch(
        &self,
        url: &str,
        _oauth_scopes: &BTreeSet<String>,
    ) -> Result<FetchedPayload, FetchError> {
        let body = self.bodies.lock().unwrap().get(url).cloned();
        match body {
            Some(body) => Ok(FetchedPayload {
                status: 200,
                final_url: url.to_string(),
                body,
                fetched_at: Utc::now(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, path, body.as_bytes())
            .expect("append entry");
    }
    let raw = builder.into_inner().expect("finish tar");
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&raw).expect("gzip");
    gz.finish().expect("finish gzip")
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        fetch_backoff: BackoffPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
        ..OrchestratorSettings::default()
    }
}

fn tarball_config() -> GroupImporterConfig {
    GroupImporterConfig::from_yaml_str(&format!(
        "tarball:\n  - url: {TARBALL_URL}\n    domain: example.com\n    systems: [ldap]\n"
    ))
    .expect("config")
}

fn members(items: &[&str]) -> BTreeSet<Identity> {
    items
        .iter()
        .map(|s| Identity::parse(s).expect("identity"))
        .collect()
}

async fn ldap_groups(store: &FileGroupStore) -> BTreeMap<String, Group> {
    store
        .list_groups_by_owner("ldap")
        .await
        .expect("list")
        .into_iter()
        .map(|g| (g.name.clone(), g))
        .collect()
}

#[tokio::test]
async fn tarball_import_round_trips_and_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(FileGroupStore::open(dir.path()).await.expect("open store"));
    let now = Utc::now();
    let mut payroll = Group::manual("hr/payroll", members(&["user:pat@example.com"]), now);
    payroll.owning_system = Some("hr".into());
    store
        .put_groups([
            Group::manual("admins", members(&["user:root@example.com"]), now),
            payroll.clone(),
        ])
        .await
        .expect("seed");

    let payload = tarball(&[
        ("ldap/eng", "alice\nBob@Example.com\n"),
        ("ldap/oncall", "# rotation\nbob\n"),
        ("hr/payroll", "mallory\n"),
    ]);
    let fetcher = Arc::new(StubFetcher::default());
    fetcher.set(TARBALL_URL, payload.clone());
    let orchestrator = ImportOrchestrator::new(store.clone(), fetcher, settings());
    let config = tarball_config();
    let source_id = format!("tarball:{TARBALL_URL}");

    let first = orchestrator.run(&config).await.expect("first run");
    match &first.per_source_results[&source_id] {
        Outcome::Success {
            groups_changed,
            groups_removed,
            payload_sha256: sha,
            ..
        } => {
            assert_eq!(*groups_changed, 2);
            assert_eq!(*groups_removed, 0);
            assert_eq!(sha, &payload_sha256(&payload));
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let stored = ldap_groups(&store).await;
    assert_eq!(
        stored.keys().cloned().collect::<Vec<_>>(),
        vec!["ldap/eng".to_string(), "ldap/oncall".to_string()]
    );
    assert_eq!(
        stored["ldap/eng"].members,
        members(&["user:alice@example.com", "user:bob@example.com"])
    );
    assert_eq!(stored["ldap/eng"].last_import_run, Some(first.run_id));
    assert_eq!(stored["ldap/eng"].source_url.as_deref(), Some(TARBALL_URL));

    // Groups outside the imported system keep their state.
    let untouched = store
        .get_groups(&BTreeSet::from(["admins".to_string(), "hr/payroll".to_string()]))
        .await
        .expect("get");
    assert_eq!(untouched.len(), 2);
    assert!(untouched.iter().any(|g| *g == payroll));

    let second = orchestrator.run(&config).await.expect("second run");
    assert_eq!(second.totals(), (0, 0));
    let after = ldap_groups(&store).await;
    assert_eq!(after, stored);
}

#[tokio::test]
async fn dropping_a_group_from_the_payload_deletes_only_that_group() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(FileGroupStore::open(dir.path()).await.expect("open store"));
    let fetcher = Arc::new(StubFetcher::default());
    let orchestrator = ImportOrchestrator::new(store.clone(), fetcher.clone(), settings());
    let config = tarball_config();

    fetcher.set(TARBALL_URL, tarball(&[("ldap/a", "alice\n"), ("ldap/b", "bob\n")]));
    orchestrator.run(&config).await.expect("seed run");
    let before = ldap_groups(&store).await;

    fetcher.set(TARBALL_URL, tarball(&[("ldap/a", "alice\n")]));
    let run = orchestrator.run(&config).await.expect("second run");
    assert_eq!(run.totals(), (0, 1));

    let after = ldap_groups(&store).await;
    assert_eq!(after.len(), 1);
    assert_eq!(after["ldap/a"], before["ldap/a"]);
}

#[tokio::test]
async fn plainlists_only_touch_their_own_group() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(FileGroupStore::open(dir.path()).await.expect("open store"));
    let fetcher = Arc::new(StubFetcher::default());
    fetcher.set("https://lists.example.org/admins.txt", b"carol\n#comment\n\ndave\n".to_vec());
    fetcher.set("https://lists.example.org/readers.txt", b"erin\n".to_vec());
    let orchestrator = ImportOrchestrator::new(store.clone(), fetcher.clone(), settings());

    let both = GroupImporterConfig::from_yaml_str(
        "plainlist:\n  - url: https://lists.example.org/admins.txt\n    group: admins\n  - url: https://lists.example.org/readers.txt\n    group: readers\n",
    )
    .expect("config");
    let run = orchestrator.run(&both).await.expect("run");
    assert!(!run.has_failures());

    let external: BTreeMap<String, Group> = store
        .list_groups_by_owner("external")
        .await
        .expect("list")
        .into_iter()
        .map(|g| (g.name.clone(), g))
        .collect();
    assert_eq!(external["external/admins"].members, members(&["carol", "dave"]));
    assert_eq!(external["external/readers"].members, members(&["erin"]));

    fetcher.set("https://lists.example.org/admins.txt", b"carol\n".to_vec());
    let admins_only = GroupImporterConfig::from_yaml_str(
        "plainlist:\n  - url: https://lists.example.org/admins.txt\n    group: admins\n",
    )
    .expect("config");
    let run = orchestrator.run(&admins_only).await.expect("run");
    assert_eq!(run.totals(), (1, 0));

    let readers = store
        .get_groups(&BTreeSet::from(["external/readers".to_string()]))
        .await
        .expect("get");
    assert_eq!(readers, vec![external["external/readers"].clone()]);
}

#[tokio::test]
async fn runs_and_audit_trail_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fetcher = Arc::new(StubFetcher::default());
    fetcher.set(TARBALL_URL, tarball(&[("ldap/eng", "alice\n")]));

    let run_id = {
        let store = Arc::new(FileGroupStore::open(dir.path()).await.expect("open store"));
        let orchestrator = ImportOrchestrator::new(store, fetcher, settings());
        orchestrator.run(&tarball_config()).await.expect("run").run_id
    };

    let reopened = FileGroupStore::open(dir.path()).await.expect("reopen");
    let runs = reopened.list_runs(10).await.expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, run_id);
    assert_eq!(ldap_groups(&reopened).await.len(), 1);

    let audit = std::fs::read_to_string(dir.path().join("audit.jsonl")).expect("audit log");
    let entries: Vec<serde_json::Value> = audit
        .lines()
        .map(|line| serde_json::from_str(line).expect("audit json"))
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0]["comment"],
        format!("Importing ldap from {TARBALL_URL}")
    );
    assert_eq!(entries[0]["created"][0], "ldap/eng");
}

#[tokio::test]
async fn malformed_line_leaves_that_sources_groups_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(FileGroupStore::open(dir.path()).await.expect("open store"));
    let fetcher = Arc::new(StubFetcher::default());
    let orchestrator = ImportOrchestrator::new(store.clone(), fetcher.clone(), settings());
    let config = GroupImporterConfig::from_yaml_str(
        "tarball:\n  - url: https://groups.example.com/export.tar.gz\n    domain: example.com\n    systems: [ldap]\n\
         plainlist:\n  - url: https://lists.example.org/admins.txt\n    group: admins\n",
    )
    .expect("config");

    fetcher.set(TARBALL_URL, tarball(&[("ldap/eng", "alice\n")]));
    fetcher.set("https://lists.example.org/admins.txt", b"carol\ndave\n".to_vec());
    let seeded = orchestrator.run(&config).await.expect("seed run");
    assert!(!seeded.has_failures());
    let admins_before = store
        .get_groups(&BTreeSet::from(["external/admins".to_string()]))
        .await
        .expect("get");
    assert_eq!(admins_before.len(), 1);

    fetcher.set(TARBALL_URL, tarball(&[("ldap/eng", "alice\nbob\n")]));
    fetcher.set(
        "https://lists.example.org/admins.txt",
        b"carol\nnot an account\nerin\n".to_vec(),
    );
    let run = orchestrator.run(&config).await.expect("second run");

    assert!(run.has_failures());
    assert!(matches!(
        run.per_source_results[&format!("tarball:{TARBALL_URL}")],
        Outcome::Success { groups_changed: 1, .. }
    ));
    match &run.per_source_results["plainlist:admins"] {
        Outcome::Failure { reason } => assert!(reason.contains("external/admins")),
        other => panic!("unexpected outcome {other:?}"),
    }

    let admins_after = store
        .get_groups(&BTreeSet::from(["external/admins".to_string()]))
        .await
        .expect("get");
    assert_eq!(admins_after, admins_before);
    assert_eq!(
        ldap_groups(&store).await["ldap/eng"].members,
        members(&["user:alice@example.com", "user:bob@example.com"])
    );
}
