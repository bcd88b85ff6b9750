//! Group store backends + authenticated HTTP fetch utilities for groupsync.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use groupsync_core::{AuditEntry, CommitReceipt, Group, GroupTransaction, ImportRun, StoreError};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "groupsync-storage";

const GROUPS_FILE: &str = "groups.json";
const AUDIT_FILE: &str = "audit.jsonl";
const RUNS_DIR: &str = "runs";

/// Authoritative group store consumed by the reconciliation engine.
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn list_groups_by_owner(&self, system: &str) -> Result<Vec<Group>, StoreError>;

    /// Looks up groups by qualified name regardless of owner; missing names are omitted.
    async fn get_groups(&self, names: &BTreeSet<String>) -> Result<Vec<Group>, StoreError>;

    /// Maps each of `names` to the groups that list it in their `nested` set.
    async fn nesting_references(
        &self,
        names: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, BTreeSet<String>>, StoreError>;

    /// Commits every mutation in `tx` or none of them.
    async fn apply_transaction(&self, tx: GroupTransaction) -> Result<CommitReceipt, StoreError>;

    async fn record_audit(&self, entry: AuditEntry) -> Result<(), StoreError>;

    async fn record_run(&self, run: &ImportRun) -> Result<(), StoreError>;

    /// Most recent runs first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<ImportRun>, StoreError>;
}

/// In-memory group table with the commit rules shared by every backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupTable {
    groups: BTreeMap<String, Group>,
}

impl GroupTable {
    pub fn from_groups(groups: impl IntoIterator<Item = Group>) -> Self {
        Self {
            groups: groups.into_iter().map(|g| (g.name.clone(), g)).collect(),
        }
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn owned_by(&self, system: &str) -> Vec<Group> {
        self.groups
            .values()
            .filter(|g| g.is_owned_by(system))
            .cloned()
            .collect()
    }

    pub fn get_many(&self, names: &BTreeSet<String>) -> Vec<Group> {
        names
            .iter()
            .filter_map(|name| self.groups.get(name))
            .cloned()
            .collect()
    }

    pub fn nesting_references(&self, names: &BTreeSet<String>) -> BTreeMap<String, BTreeSet<String>> {
        let mut refs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for group in self.groups.values() {
            for nested in group.nested.intersection(names) {
                refs.entry(nested.clone())
                    .or_default()
                    .insert(group.name.clone());
            }
        }
        refs
    }

    /// Validates the whole transaction against current versions, then applies it.
    pub fn commit(
        &mut self,
        tx: GroupTransaction,
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<CommitReceipt, StoreError> {
        if let Some(limit) = limit {
            if tx.mutation_count() > limit {
                return Err(StoreError::TransactionTooLarge {
                    mutations: tx.mutation_count(),
                    limit,
                });
            }
        }

        {
            let mut touched = BTreeSet::new();
            let names = tx
                .creates
                .iter()
                .map(|g| g.name.as_str())
                .chain(tx.updates.iter().map(|g| g.name.as_str()))
                .chain(tx.deletes.iter().map(|d| d.name.as_str()));
            for name in names {
                if !touched.insert(name) {
                    return Err(StoreError::Conflict {
                        name: name.to_string(),
                        reason: "group appears twice in one transaction".into(),
                    });
                }
            }
        }

        for group in &tx.creates {
            if self.groups.contains_key(&group.name) {
                return Err(StoreError::Conflict {
                    name: group.name.clone(),
                    reason: "group already exists".into(),
                });
            }
        }
        for group in &tx.updates {
            let current = self.check_version(&group.name, group.version)?;
            if current.owning_system != group.owning_system {
                return Err(StoreError::Conflict {
                    name: group.name.clone(),
                    reason: "group ownership changed".into(),
                });
            }
        }
        for deletion in &tx.deletes {
            self.check_version(&deletion.name, deletion.expected_version)?;
        }

        let receipt = CommitReceipt {
            created: tx.creates.len(),
            updated: tx.updates.len(),
            deleted: tx.deletes.len(),
            committed_at: now,
        };

        for mut group in tx.creates {
            group.version = 1;
            self.groups.insert(group.name.clone(), group);
        }
        for mut group in tx.updates {
            if let Some(current) = self.groups.get(&group.name) {
                group.version = current.version + 1;
                group.created_at = current.created_at;
                group.nested = current.nested.clone();
            }
            self.groups.insert(group.name.clone(), group);
        }
        for deletion in tx.deletes {
            self.groups.remove(&deletion.name);
        }
        Ok(receipt)
    }

    fn check_version(&self, name: &str, expected: u64) -> Result<&Group, StoreError> {
        match self.groups.get(name) {
            None => Err(StoreError::Conflict {
                name: name.to_string(),
                reason: "group no longer exists".into(),
            }),
            Some(current) if current.version != expected => Err(StoreError::Conflict {
                name: name.to_string(),
                reason: format!(
                    "version moved from {expected} to {}",
                    current.version
                ),
            }),
            Some(current) => Ok(current),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    table: GroupTable,
    audit: Vec<AuditEntry>,
    runs: Vec<ImportRun>,
}

/// Process-local store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryGroupStore {
    state: Mutex<MemoryState>,
    max_mutations: Option<usize>,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_groups(groups: impl IntoIterator<Item = Group>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                table: GroupTable::from_groups(groups),
                ..Default::default()
            }),
            max_mutations: None,
        }
    }

    pub fn with_max_mutations(mut self, limit: usize) -> Self {
        self.max_mutations = Some(limit.max(1));
        self
    }

    pub async fn all_groups(&self) -> Vec<Group> {
        self.state.lock().await.table.groups().cloned().collect()
    }

    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.state.lock().await.audit.clone()
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn list_groups_by_owner(&self, system: &str) -> Result<Vec<Group>, StoreError> {
        Ok(self.state.lock().await.table.owned_by(system))
    }

    async fn get_groups(&self, names: &BTreeSet<String>) -> Result<Vec<Group>, StoreError> {
        Ok(self.state.lock().await.table.get_many(names))
    }

    async fn nesting_references(
        &self,
        names: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, BTreeSet<String>>, StoreError> {
        Ok(self.state.lock().await.table.nesting_references(names))
    }

    async fn apply_transaction(&self, tx: GroupTransaction) -> Result<CommitReceipt, StoreError> {
        let mut state = self.state.lock().await;
        state.table.commit(tx, Utc::now(), self.max_mutations)
    }

    async fn record_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.state.lock().await.audit.push(entry);
        Ok(())
    }

    async fn record_run(&self, run: &ImportRun) -> Result<(), StoreError> {
        self.state.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<ImportRun>, StoreError> {
        let state = self.state.lock().await;
        let mut runs = state.runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

/// Directory-backed store: `groups.json` rewritten atomically per commit,
/// `audit.jsonl` appended, one JSON file per run under `runs/`.
#[derive(Debug)]
pub struct FileGroupStore {
    root: PathBuf,
    table: Mutex<GroupTable>,
    max_mutations: Option<usize>,
}

impl FileGroupStore {
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(RUNS_DIR))
            .await
            .with_context(|| format!("creating state directory {}", root.display()))?;

        let groups_path = root.join(GROUPS_FILE);
        let table = if fs::try_exists(&groups_path)
            .await
            .with_context(|| format!("checking {}", groups_path.display()))?
        {
            let bytes = fs::read(&groups_path)
                .await
                .with_context(|| format!("reading {}", groups_path.display()))?;
            let groups: Vec<Group> = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", groups_path.display()))?;
            GroupTable::from_groups(groups)
        } else {
            GroupTable::default()
        };

        Ok(Self {
            root,
            table: Mutex::new(table),
            max_mutations: None,
        })
    }

    pub fn with_max_mutations(mut self, limit: usize) -> Self {
        self.max_mutations = Some(limit.max(1));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Inserts or replaces groups outside of the import path (manual administration).
    pub async fn put_groups(&self, groups: impl IntoIterator<Item = Group>) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        for group in groups {
            next.groups.insert(group.name.clone(), group);
        }
        self.persist(&next).await?;
        *table = next;
        Ok(())
    }

    async fn persist(&self, table: &GroupTable) -> Result<(), StoreError> {
        let groups: Vec<&Group> = table.groups().collect();
        let bytes = serde_json::to_vec_pretty(&groups).map_err(backend)?;
        write_atomic(&self.root.join(GROUPS_FILE), &bytes)
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl GroupStore for FileGroupStore {
    async fn list_groups_by_owner(&self, system: &str) -> Result<Vec<Group>, StoreError> {
        Ok(self.table.lock().await.owned_by(system))
    }

    async fn get_groups(&self, names: &BTreeSet<String>) -> Result<Vec<Group>, StoreError> {
        Ok(self.table.lock().await.get_many(names))
    }

    async fn nesting_references(
        &self,
        names: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, BTreeSet<String>>, StoreError> {
        Ok(self.table.lock().await.nesting_references(names))
    }

    async fn apply_transaction(&self, tx: GroupTransaction) -> Result<CommitReceipt, StoreError> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let receipt = next.commit(tx, Utc::now(), self.max_mutations)?;
        self.persist(&next).await?;
        *table = next;
        Ok(receipt)
    }

    async fn record_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&entry).map_err(backend)?;
        line.push(b'\n');
        let path = self.root.join(AUDIT_FILE);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(backend)?;
        file.write_all(&line).await.map_err(backend)?;
        file.flush().await.map_err(backend)
    }

    async fn record_run(&self, run: &ImportRun) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(run).map_err(backend)?;
        let path = self.root.join(RUNS_DIR).join(format!("{}.json", run.run_id));
        write_atomic(&path, &bytes).await.map_err(backend)
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<ImportRun>, StoreError> {
        let dir = self.root.join(RUNS_DIR);
        let mut entries = fs::read_dir(&dir).await.map_err(backend)?;
        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(backend)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await.map_err(backend)?;
            let run: ImportRun = serde_json::from_slice(&bytes)
                .map_err(|err| StoreError::Backend(format!("parsing {}: {err}", path.display())))?;
            runs.push(run);
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Writes `bytes` to `path` via a sibling temp file and rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

pub fn payload_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("no access token for scopes {scopes:?}: {reason}")]
    Credentials { scopes: Vec<String>, reason: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Network { source, .. } => classify_reqwest_error(source),
            Self::Timeout { .. } => RetryDisposition::Retryable,
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Credentials { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// Supplies bearer tokens for sources that declare OAuth scopes.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self, scopes: &BTreeSet<String>) -> Result<String, FetchError>;
}

/// Hands out one pre-minted token regardless of scopes.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self, _scopes: &BTreeSet<String>) -> Result<String, FetchError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

#[async_trait]
impl TokenProvider for NoCredentials {
    async fn access_token(&self, scopes: &BTreeSet<String>) -> Result<String, FetchError> {
        Err(FetchError::Credentials {
            scopes: scopes.iter().cloned().collect(),
            reason: "no credential provider configured".into(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

/// Retrieves the raw bytes of one import source. Implementations do not retry.
#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    async fn fetch(&self, url: &str, oauth_scopes: &BTreeSet<String>)
        -> Result<FetchedPayload, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

pub struct HttpFetcher {
    client: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig, tokens: Arc<dyn TokenProvider>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, tokens })
    }

    fn request_error(url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Network {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

#[async_trait]
impl PayloadFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        oauth_scopes: &BTreeSet<String>,
    ) -> Result<FetchedPayload, FetchError> {
        let span = info_span!("http_fetch", url, scopes = oauth_scopes.len());
        async move {
            let mut request = self.client.get(url);
            if !oauth_scopes.is_empty() {
                let token = self.tokens.access_token(oauth_scopes).await?;
                request = request.bearer_auth(token);
            }

            let resp = request
                .send()
                .await
                .map_err(|err| Self::request_error(url, err))?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|err| Self::request_error(url, err))?
                .to_vec();
            debug!(bytes = body.len(), status = status.as_u16(), "fetched payload");
            Ok::<_, FetchError>(FetchedPayload {
                status: status.as_u16(),
                final_url,
                body,
                fetched_at: Utc::now(),
            })
        }
        .instrument(span)
        .await
    }
}
