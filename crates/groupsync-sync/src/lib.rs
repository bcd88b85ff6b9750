//! Group import reconciliation: per-system planning, transactional apply and run orchestration.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use groupsync_adapters::{
    adapter_for_source, parse_plainlist, AdapterError, ImportSnapshot, SystemImport,
};
use groupsync_core::{
    AuditEntry, Group, GroupDeletion, GroupImporterConfig, GroupTransaction, Identity,
    ImportRun, ImportSource, Outcome, RunStateError, StoreError,
};
use groupsync_storage::{
    payload_sha256, BackoffPolicy, FetchError, FetchedPayload, FileGroupStore, GroupStore,
    HttpClientConfig, HttpFetcher, NoCredentials, PayloadFetcher, RetryDisposition,
    StaticTokenProvider, TokenProvider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "groupsync-sync";

/// Plan + apply attempts per system; a stale snapshot is replanned once.
const MAX_SYSTEM_ATTEMPTS: usize = 2;

/// What to do with an HTTP 200 whose body is blank, or a plain list with only comments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyPayloadPolicy {
    /// Fail the source; nothing is changed.
    #[default]
    Reject,
    /// Record the source as skipped; nothing is changed.
    Skip,
    /// Treat the payload as an empty import (removes every group in scope).
    Wipe,
}

impl FromStr for EmptyPayloadPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "skip" => Ok(Self::Skip),
            "wipe" => Ok(Self::Wipe),
            other => Err(format!("unknown empty payload policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImporterSettings {
    pub config_path: PathBuf,
    pub state_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub max_concurrency: usize,
    pub run_deadline_secs: u64,
    pub fetch_retries: usize,
    pub empty_payload: EmptyPayloadPolicy,
    pub max_tx_mutations: usize,
    pub access_token: Option<String>,
    pub scheduler_enabled: bool,
    pub cron: String,
}

impl ImporterSettings {
    pub fn from_env() -> Self {
        Self {
            config_path: std::env::var("GROUPSYNC_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./imports.yaml")),
            state_dir: std::env::var("GROUPSYNC_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state")),
            http_timeout_secs: env_parse("GROUPSYNC_HTTP_TIMEOUT_SECS").unwrap_or(60),
            user_agent: std::env::var("GROUPSYNC_USER_AGENT")
                .unwrap_or_else(|_| "groupsync/0.1".to_string()),
            max_concurrency: env_parse("GROUPSYNC_MAX_CONCURRENCY").unwrap_or(4),
            run_deadline_secs: env_parse("GROUPSYNC_RUN_DEADLINE_SECS").unwrap_or(600),
            fetch_retries: env_parse("GROUPSYNC_FETCH_RETRIES").unwrap_or(2),
            empty_payload: env_parse("GROUPSYNC_EMPTY_PAYLOAD").unwrap_or_default(),
            max_tx_mutations: env_parse("GROUPSYNC_MAX_TX_MUTATIONS").unwrap_or(500),
            access_token: std::env::var("GROUPSYNC_ACCESS_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            scheduler_enabled: std::env::var("GROUPSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cron: std::env::var("GROUPSYNC_CRON").unwrap_or_else(|_| "0 */15 * * * *".to_string()),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_concurrency: self.max_concurrency.max(1),
            run_deadline: Duration::from_secs(self.run_deadline_secs),
            fetch_backoff: BackoffPolicy {
                max_retries: self.fetch_retries,
                ..BackoffPolicy::default()
            },
            empty_payload: self.empty_payload,
            max_tx_mutations: self.max_tx_mutations.max(1),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

pub fn load_config(path: &Path) -> Result<GroupImporterConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    GroupImporterConfig::from_yaml_str(&text).with_context(|| format!("validating {}", path.display()))
}

/// Identifies the run and source a plan is computed for; stamped into provenance fields.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub run_id: Uuid,
    pub source_id: String,
    pub source_url: String,
    pub now: DateTime<Utc>,
}

/// Mutations that turn one system's stored groups into the imported view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationPlan {
    pub system: String,
    pub source_id: String,
    pub source_url: String,
    pub run_id: Uuid,
    pub to_create: Vec<Group>,
    pub to_update: Vec<Group>,
    pub to_delete: BTreeSet<String>,
    /// Snapshot versions of every in-scope group the plan was computed against.
    pub base_versions: BTreeMap<String, u64>,
    /// Stale groups still nested elsewhere; emptied instead of deleted.
    pub retained_for_nesting: BTreeSet<String>,
    /// The import leaves no member in any group of its scope.
    pub wipe: bool,
}

impl ReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.mutation_count() == 0
    }

    pub fn mutation_count(&self) -> usize {
        self.to_create.len() + self.to_update.len() + self.to_delete.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("group {name} already exists and is owned by {}", .owner.as_deref().unwrap_or("nobody (manually managed)"))]
    OwnershipCollision { name: String, owner: Option<String> },
    #[error("group {name} does not belong to system {system}")]
    ForeignName { name: String, system: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Pure planning step.
///
/// `current` holds the groups the store attributes to `system`; `existing_desired`
/// holds whatever the store has under the desired names, whoever owns it.
/// `nesting` maps stale names to the groups that still nest them.
pub fn compute_plan(
    ctx: &PlanContext,
    system: &str,
    import: &SystemImport,
    current: Vec<Group>,
    existing_desired: Vec<Group>,
    nesting: &BTreeMap<String, BTreeSet<String>>,
) -> Result<ReconciliationPlan, PlanError> {
    let prefix = format!("{system}/");
    if let Some(name) = import.groups.keys().find(|name| !name.starts_with(&prefix)) {
        return Err(PlanError::ForeignName {
            name: name.clone(),
            system: system.to_string(),
        });
    }

    for group in existing_desired {
        if !group.is_owned_by(system) {
            return Err(PlanError::OwnershipCollision {
                name: group.name,
                owner: group.owning_system,
            });
        }
    }

    let current: BTreeMap<String, Group> = current
        .into_iter()
        .filter(|g| g.is_owned_by(system) && import.scope.covers(&g.name))
        .map(|g| (g.name.clone(), g))
        .collect();

    let mut plan = ReconciliationPlan {
        system: system.to_string(),
        source_id: ctx.source_id.clone(),
        source_url: ctx.source_url.clone(),
        run_id: ctx.run_id,
        to_create: Vec::new(),
        to_update: Vec::new(),
        to_delete: BTreeSet::new(),
        base_versions: current.iter().map(|(n, g)| (n.clone(), g.version)).collect(),
        retained_for_nesting: BTreeSet::new(),
        wipe: is_wipe(import, &current),
    };

    for (name, members) in &import.groups {
        match current.get(name) {
            None => plan
                .to_create
                .push(imported_group(ctx, system, name, members, None)),
            Some(existing) if existing.members != *members => plan
                .to_update
                .push(imported_group(ctx, system, name, members, Some(existing))),
            Some(_) => {}
        }
    }

    for (name, existing) in &current {
        if import.groups.contains_key(name) {
            continue;
        }
        let still_nested = nesting.get(name).is_some_and(|refs| !refs.is_empty());
        if still_nested {
            plan.retained_for_nesting.insert(name.clone());
            if !existing.members.is_empty() {
                plan.to_update.push(imported_group(
                    ctx,
                    system,
                    name,
                    &BTreeSet::new(),
                    Some(existing),
                ));
            }
        } else {
            plan.to_delete.insert(name.clone());
        }
    }

    Ok(plan)
}

/// True when nothing in scope keeps a member: either every owned group goes away,
/// or groups that had members all end up empty.
fn is_wipe(import: &SystemImport, current: &BTreeMap<String, Group>) -> bool {
    if current.is_empty() || import.groups.values().any(|members| !members.is_empty()) {
        return false;
    }
    import.groups.is_empty() || current.values().any(|g| !g.members.is_empty())
}

fn imported_group(
    ctx: &PlanContext,
    system: &str,
    name: &str,
    members: &BTreeSet<Identity>,
    existing: Option<&Group>,
) -> Group {
    Group {
        name: name.to_string(),
        members: members.clone(),
        nested: existing.map(|e| e.nested.clone()).unwrap_or_default(),
        owning_system: Some(system.to_string()),
        created_at: existing.map_or(ctx.now, |e| e.created_at),
        last_updated_at: ctx.now,
        last_import_run: Some(ctx.run_id),
        source_url: Some(ctx.source_url.clone()),
        version: existing.map_or(0, |e| e.version),
    }
}

/// Reads the system's snapshot from `store` and plans against it.
pub async fn plan_system(
    store: &dyn GroupStore,
    ctx: &PlanContext,
    system: &str,
    import: &SystemImport,
) -> Result<ReconciliationPlan, PlanError> {
    let current = store.list_groups_by_owner(system).await?;
    let desired: BTreeSet<String> = import.groups.keys().cloned().collect();
    let existing_desired = store.get_groups(&desired).await?;

    let stale: BTreeSet<String> = current
        .iter()
        .filter(|g| import.scope.covers(&g.name) && !import.groups.contains_key(&g.name))
        .map(|g| g.name.clone())
        .collect();
    let nesting = if stale.is_empty() {
        BTreeMap::new()
    } else {
        store.nesting_references(&stale).await?
    };

    compute_plan(ctx, system, import, current, existing_desired, &nesting)
}

/// What an applied plan actually committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedResult {
    pub system: String,
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub partitions_committed: usize,
    pub partitions_total: usize,
    pub wiped: bool,
    /// Set when some partitions committed and a later one failed.
    pub failure: Option<StoreError>,
}

impl AppliedResult {
    fn empty(system: &str, wiped: bool) -> Self {
        Self {
            system: system.to_string(),
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            partitions_committed: 0,
            partitions_total: 0,
            wiped,
            failure: None,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.failure.is_some()
    }

    pub fn groups_changed(&self) -> usize {
        self.created.len() + self.updated.len()
    }

    pub fn groups_removed(&self) -> usize {
        self.deleted.len()
    }

    fn absorb(&mut self, later: AppliedResult) {
        self.created.extend(later.created);
        self.updated.extend(later.updated);
        self.deleted.extend(later.deleted);
        self.partitions_committed += later.partitions_committed;
        self.partitions_total += later.partitions_total;
        self.wiped |= later.wiped;
        self.failure = later.failure;
    }
}

enum Write {
    Create(Group),
    Update(Group),
}

/// Commits reconciliation plans, partitioning those larger than one transaction.
#[derive(Debug, Clone)]
pub struct StoreApplier {
    max_mutations: usize,
}

impl StoreApplier {
    pub fn new(max_mutations: usize) -> Self {
        Self {
            max_mutations: max_mutations.max(1),
        }
    }

    /// A plan that fits in `limit` becomes one transaction; otherwise creates and
    /// updates are chunked first and deletes follow in later partitions.
    pub fn partition(&self, plan: &ReconciliationPlan, limit: usize) -> Vec<GroupTransaction> {
        let writes = plan
            .to_create
            .iter()
            .cloned()
            .map(Write::Create)
            .chain(plan.to_update.iter().cloned().map(Write::Update))
            .collect();
        let deletes = plan
            .to_delete
            .iter()
            .map(|name| GroupDeletion {
                name: name.clone(),
                expected_version: plan.base_versions.get(name).copied().unwrap_or_default(),
            })
            .collect();
        chunk_mutations(writes, deletes, limit.max(1))
    }

    /// Applies `plan`. Fails only when nothing was committed; a failure after at
    /// least one committed partition is reported through [`AppliedResult::failure`].
    pub async fn apply(
        &self,
        store: &dyn GroupStore,
        plan: &ReconciliationPlan,
    ) -> Result<AppliedResult, StoreError> {
        let mut result = AppliedResult::empty(&plan.system, plan.wipe);
        if plan.is_empty() {
            return Ok(result);
        }

        let mut limit = self.max_mutations;
        let mut partitions = self.partition(plan, limit);
        result.partitions_total = partitions.len();
        let mut resplit = false;
        let mut index = 0;

        while index < partitions.len() {
            let tx = partitions[index].clone();
            let names = TransactionNames::of(&tx);
            match store.apply_transaction(tx).await {
                Ok(receipt) => {
                    debug!(
                        system = %plan.system,
                        partition = index,
                        created = receipt.created,
                        updated = receipt.updated,
                        deleted = receipt.deleted,
                        "committed partition"
                    );
                    self.record_audit(store, plan, &names, receipt.committed_at).await;
                    result.created.extend(names.created);
                    result.updated.extend(names.updated);
                    result.deleted.extend(names.deleted);
                    result.partitions_committed += 1;
                    index += 1;
                }
                Err(StoreError::TransactionTooLarge { limit: store_limit, .. })
                    if !resplit && store_limit > 0 && store_limit < limit =>
                {
                    warn!(
                        system = %plan.system,
                        configured = limit,
                        store_limit,
                        "store rejected transaction size; repartitioning"
                    );
                    resplit = true;
                    limit = store_limit;
                    let remaining = partitions.split_off(index);
                    partitions.extend(repartition(remaining, limit));
                    result.partitions_total = partitions.len();
                }
                Err(err) => {
                    if result.partitions_committed == 0 {
                        return Err(err);
                    }
                    warn!(
                        system = %plan.system,
                        committed = result.partitions_committed,
                        total = result.partitions_total,
                        error = %err,
                        "plan only partially applied"
                    );
                    result.failure = Some(err);
                    break;
                }
            }
        }
        Ok(result)
    }

    async fn record_audit(
        &self,
        store: &dyn GroupStore,
        plan: &ReconciliationPlan,
        names: &TransactionNames,
        recorded_at: DateTime<Utc>,
    ) {
        let entry = AuditEntry {
            entry_id: Uuid::new_v4(),
            run_id: plan.run_id,
            system: plan.system.clone(),
            source_id: plan.source_id.clone(),
            source_url: plan.source_url.clone(),
            created: names.created.clone(),
            updated: names.updated.clone(),
            deleted: names.deleted.clone(),
            comment: format!("Importing {} from {}", plan.system, plan.source_url),
            recorded_at,
        };
        if let Err(err) = store.record_audit(entry).await {
            warn!(system = %plan.system, error = %err, "failed to record audit entry");
        }
    }
}

struct TransactionNames {
    created: Vec<String>,
    updated: Vec<String>,
    deleted: Vec<String>,
}

impl TransactionNames {
    fn of(tx: &GroupTransaction) -> Self {
        Self {
            created: tx.creates.iter().map(|g| g.name.clone()).collect(),
            updated: tx.updates.iter().map(|g| g.name.clone()).collect(),
            deleted: tx.deletes.iter().map(|d| d.name.clone()).collect(),
        }
    }
}

fn chunk_mutations(writes: Vec<Write>, deletes: Vec<GroupDeletion>, limit: usize) -> Vec<GroupTransaction> {
    let mut out = Vec::new();
    let mut tx = GroupTransaction::default();
    let fits_in_one = writes.len() + deletes.len() <= limit;

    for write in writes {
        match write {
            Write::Create(g) => tx.creates.push(g),
            Write::Update(g) => tx.updates.push(g),
        }
        if !fits_in_one && tx.mutation_count() == limit {
            out.push(std::mem::take(&mut tx));
        }
    }
    if !fits_in_one && !tx.is_empty() {
        out.push(std::mem::take(&mut tx));
    }
    for deletion in deletes {
        tx.deletes.push(deletion);
        if !fits_in_one && tx.mutation_count() == limit {
            out.push(std::mem::take(&mut tx));
        }
    }
    if !tx.is_empty() {
        out.push(tx);
    }
    out
}

fn repartition(remaining: Vec<GroupTransaction>, limit: usize) -> Vec<GroupTransaction> {
    let mut writes = Vec::new();
    let mut deletes = Vec::new();
    for tx in remaining {
        writes.extend(tx.creates.into_iter().map(Write::Create));
        writes.extend(tx.updates.into_iter().map(Write::Update));
        deletes.extend(tx.deletes);
    }
    chunk_mutations(writes, deletes, limit)
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_concurrency: usize,
    pub run_deadline: Duration,
    pub fetch_backoff: BackoffPolicy,
    pub empty_payload: EmptyPayloadPolicy,
    pub max_tx_mutations: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            run_deadline: Duration::from_secs(600),
            fetch_backoff: BackoffPolicy::default(),
            empty_payload: EmptyPayloadPolicy::default(),
            max_tx_mutations: 500,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("empty payload from {url}")]
    EmptyPayload { url: String },
    #[error("timeout: run deadline exceeded while fetching or parsing")]
    Timeout,
    #[error("system {system}: {source}")]
    Plan {
        system: String,
        #[source]
        source: PlanError,
    },
    #[error("system {system}: {source}")]
    Store {
        system: String,
        #[source]
        source: StoreError,
    },
}

enum Prepared {
    Ready {
        snapshot: ImportSnapshot,
        payload_sha256: String,
    },
    Skipped(String),
}

/// Dry-run result for one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourcePlans {
    pub source_id: String,
    pub plans: Vec<ReconciliationPlan>,
    pub skipped: Option<String>,
    pub error: Option<String>,
}

/// Runs fetch → parse → plan → apply for every configured source.
#[derive(Clone)]
pub struct ImportOrchestrator {
    store: Arc<dyn GroupStore>,
    fetcher: Arc<dyn PayloadFetcher>,
    applier: StoreApplier,
    settings: OrchestratorSettings,
}

impl ImportOrchestrator {
    pub fn new(
        store: Arc<dyn GroupStore>,
        fetcher: Arc<dyn PayloadFetcher>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            applier: StoreApplier::new(settings.max_tx_mutations),
            settings,
        }
    }

    /// Imports every source; one failing source never aborts the others.
    pub async fn run(&self, config: &GroupImporterConfig) -> Result<ImportRun, RunStateError> {
        let mut run = ImportRun::new(Uuid::new_v4(), Utc::now());
        let run_id = run.run_id;
        run.begin()?;

        let sources = config.sources();
        info!(%run_id, sources = sources.len(), "starting group import run");

        let deadline = Instant::now() + self.settings.run_deadline;
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut pending: BTreeSet<String> = sources.iter().map(ImportSource::source_id).collect();
        let mut tasks = JoinSet::new();

        for source in sources {
            let this = self.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let source_id = source.source_id();
                let span = info_span!("import_source", %run_id, source_id = %source_id);
                let outcome = async {
                    let Ok(_permit) = Arc::clone(&permits).acquire_owned().await else {
                        return Outcome::Failure {
                            reason: "worker pool closed".into(),
                        };
                    };
                    this.import_source(run_id, &source, deadline).await
                }
                .instrument(span)
                .await;
                (source_id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((source_id, outcome)) => {
                    pending.remove(&source_id);
                    run.record(source_id, outcome)?;
                }
                Err(err) => error!(%run_id, error = %err, "import task aborted"),
            }
        }
        for source_id in pending {
            run.record(
                source_id,
                Outcome::Failure {
                    reason: "import task aborted".into(),
                },
            )?;
        }

        run.complete(Utc::now())?;
        let (changed, removed) = run.totals();
        info!(
            %run_id,
            changed,
            removed,
            failed = run.has_failures(),
            "group import run completed"
        );
        if let Err(err) = self.store.record_run(&run).await {
            warn!(%run_id, error = %err, "failed to persist import run");
        }
        Ok(run)
    }

    /// Fetches, parses and plans every source without applying anything.
    pub async fn plan_only(&self, config: &GroupImporterConfig) -> Vec<SourcePlans> {
        let run_id = Uuid::new_v4();
        let mut out = Vec::new();
        for source in config.sources() {
            let mut report = SourcePlans {
                source_id: source.source_id(),
                plans: Vec::new(),
                skipped: None,
                error: None,
            };
            match self.prepare(&source).await {
                Ok(Prepared::Skipped(reason)) => report.skipped = Some(reason),
                Ok(Prepared::Ready { snapshot, .. }) => {
                    let ctx = self.plan_context(run_id, &snapshot);
                    for (system, import) in &snapshot.systems {
                        match plan_system(self.store.as_ref(), &ctx, system, import).await {
                            Ok(plan) => report.plans.push(plan),
                            Err(err) => {
                                report.error = Some(format!("system {system}: {err}"));
                                break;
                            }
                        }
                    }
                }
                Err(err) => report.error = Some(err.to_string()),
            }
            out.push(report);
        }
        out
    }

    async fn import_source(&self, run_id: Uuid, source: &ImportSource, deadline: Instant) -> Outcome {
        let prepared = match tokio::time::timeout_at(deadline, self.prepare(source)).await {
            Err(_) => Err(SourceError::Timeout),
            Ok(prepared) => prepared,
        };
        let (snapshot, payload_sha256) = match prepared {
            Ok(Prepared::Ready {
                snapshot,
                payload_sha256,
            }) => (snapshot, payload_sha256),
            Ok(Prepared::Skipped(reason)) => {
                info!(%reason, "source skipped");
                return Outcome::Skipped { reason };
            }
            Err(err) => {
                warn!(error = %err, "source import failed");
                return Outcome::Failure {
                    reason: err.to_string(),
                };
            }
        };

        let ctx = self.plan_context(run_id, &snapshot);
        let mut changed = 0;
        let mut removed = 0;
        let mut wiped_systems = Vec::new();
        let mut failures = Vec::new();
        let mut clean_systems = 0;

        for (system, import) in &snapshot.systems {
            match self.reconcile_system(&ctx, system, import).await {
                Ok(applied) => {
                    changed += applied.groups_changed();
                    removed += applied.groups_removed();
                    if applied.wiped {
                        wiped_systems.push(system.clone());
                    }
                    match &applied.failure {
                        Some(err) => failures.push(format!(
                            "system {system}: committed {}/{} partitions: {err}",
                            applied.partitions_committed, applied.partitions_total
                        )),
                        None => clean_systems += 1,
                    }
                }
                Err(err) => {
                    warn!(system = %system, error = %err, "system reconciliation failed");
                    failures.push(err.to_string());
                }
            }
        }

        if failures.is_empty() {
            Outcome::Success {
                groups_changed: changed,
                groups_removed: removed,
                payload_sha256,
                wiped_systems,
            }
        } else if clean_systems > 0 || changed + removed > 0 {
            Outcome::Partial {
                groups_changed: changed,
                groups_removed: removed,
                payload_sha256,
                wiped_systems,
                failures,
            }
        } else {
            Outcome::Failure {
                reason: failures.join("; "),
            }
        }
    }

    async fn prepare(&self, source: &ImportSource) -> Result<Prepared, SourceError> {
        let payload = self.fetch_with_retry(source).await?;
        let payload_sha256 = payload_sha256(&payload.body);

        let mut body = payload.body.as_slice();
        let empty = match source {
            ImportSource::Plainlist(_) => parse_plainlist(body).is_ok_and(|lines| lines.is_empty()),
            ImportSource::Tarball(_) => body.iter().all(u8::is_ascii_whitespace),
        };
        if empty {
            match self.settings.empty_payload {
                EmptyPayloadPolicy::Reject => {
                    return Err(SourceError::EmptyPayload {
                        url: source.url().to_string(),
                    })
                }
                EmptyPayloadPolicy::Skip => {
                    return Ok(Prepared::Skipped(format!("empty payload from {}", source.url())))
                }
                EmptyPayloadPolicy::Wipe => {
                    warn!(url = source.url(), "empty payload treated as an empty import");
                    body = &[];
                }
            }
        }

        let snapshot = adapter_for_source(source).parse(body)?;
        Ok(Prepared::Ready {
            snapshot,
            payload_sha256,
        })
    }

    async fn fetch_with_retry(&self, source: &ImportSource) -> Result<FetchedPayload, FetchError> {
        let backoff = self.settings.fetch_backoff;
        let mut attempt = 0;
        loop {
            match self.fetcher.fetch(source.url(), source.oauth_scopes()).await {
                Ok(payload) => return Ok(payload),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < backoff.max_retries =>
                {
                    warn!(attempt, error = %err, "fetch failed; retrying");
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn reconcile_system(
        &self,
        ctx: &PlanContext,
        system: &str,
        import: &SystemImport,
    ) -> Result<AppliedResult, SourceError> {
        let mut accumulated: Option<AppliedResult> = None;

        for attempt in 0..MAX_SYSTEM_ATTEMPTS {
            let last_attempt = attempt + 1 == MAX_SYSTEM_ATTEMPTS;
            let plan = plan_system(self.store.as_ref(), ctx, system, import)
                .await
                .map_err(|source| SourceError::Plan {
                    system: system.to_string(),
                    source,
                })?;

            if plan.wipe {
                warn!(
                    system,
                    removed = plan.to_delete.len(),
                    retained = plan.retained_for_nesting.len(),
                    "import removes every group owned by this system; check the source for an accidentally empty export"
                );
            }
            if plan.is_empty() {
                debug!(system, "system already up to date");
                let done = AppliedResult::empty(system, plan.wipe);
                return Ok(merge(accumulated, done));
            }

            info!(
                system,
                create = plan.to_create.len(),
                update = plan.to_update.len(),
                delete = plan.to_delete.len(),
                "applying reconciliation plan"
            );
            match self.applier.apply(self.store.as_ref(), &plan).await {
                Ok(applied) => {
                    let conflicted = matches!(applied.failure, Some(StoreError::Conflict { .. }));
                    let applied = merge(accumulated.take(), applied);
                    if conflicted && !last_attempt {
                        warn!(system, "conflict after partial apply; replanning");
                        accumulated = Some(applied);
                        continue;
                    }
                    return Ok(applied);
                }
                Err(StoreError::Conflict { name, reason }) if !last_attempt => {
                    warn!(system, group = %name, %reason, "snapshot went stale; replanning");
                }
                Err(source) => {
                    return match accumulated {
                        Some(mut partial) => {
                            partial.failure = Some(source);
                            Ok(partial)
                        }
                        None => Err(SourceError::Store {
                            system: system.to_string(),
                            source,
                        }),
                    };
                }
            }
        }

        // The loop always returns on its last attempt.
        Err(SourceError::Store {
            system: system.to_string(),
            source: StoreError::Backend("reconciliation retries exhausted".into()),
        })
    }

    fn plan_context(&self, run_id: Uuid, snapshot: &ImportSnapshot) -> PlanContext {
        PlanContext {
            run_id,
            source_id: snapshot.source_id.clone(),
            source_url: snapshot.source_url.clone(),
            now: Utc::now(),
        }
    }
}

fn merge(earlier: Option<AppliedResult>, later: AppliedResult) -> AppliedResult {
    match earlier {
        Some(mut earlier) => {
            earlier.absorb(later);
            earlier
        }
        None => later,
    }
}

/// Builds the file-backed orchestrator described by `settings`.
pub async fn orchestrator_from_settings(settings: &ImporterSettings) -> Result<ImportOrchestrator> {
    let store = FileGroupStore::open(&settings.state_dir)
        .await
        .with_context(|| format!("opening state directory {}", settings.state_dir.display()))?;
    let tokens: Arc<dyn TokenProvider> = match &settings.access_token {
        Some(token) => Arc::new(StaticTokenProvider::new(token.clone())),
        None => Arc::new(NoCredentials),
    };
    let fetcher = HttpFetcher::new(settings.http_client_config(), tokens)?;
    Ok(ImportOrchestrator::new(
        Arc::new(store),
        Arc::new(fetcher),
        settings.orchestrator_settings(),
    ))
}

pub async fn run_import_once(settings: &ImporterSettings) -> Result<ImportRun> {
    let config = load_config(&settings.config_path)?;
    let orchestrator = orchestrator_from_settings(settings).await?;
    orchestrator.run(&config).await.context("driving import run")
}

pub async fn run_import_once_from_env() -> Result<ImportRun> {
    run_import_once(&ImporterSettings::from_env()).await
}

pub async fn maybe_build_scheduler(settings: &ImporterSettings) -> Result<Option<JobScheduler>> {
    if !settings.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_settings = settings.clone();
    let job = Job::new_async(settings.cron.as_str(), move |_uuid, _l| {
        let settings = job_settings.clone();
        Box::pin(async move {
            match run_import_once(&settings).await {
                Ok(run) => info!(run_id = %run.run_id, failed = run.has_failures(), "scheduled import finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled import failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", settings.cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Markdown summary of recent runs, newest first.
pub fn report_markdown(runs: &[ImportRun]) -> String {
    let mut lines = vec!["# Group Import Report".to_string(), String::new()];
    for run in runs {
        let (changed, removed) = run.totals();
        lines.push(format!("## Run `{}`", run.run_id));
        lines.push(format!("- started: {}", run.started_at));
        if let Some(finished_at) = run.finished_at {
            lines.push(format!("- finished: {finished_at}"));
        }
        lines.push(format!("- groups changed: {changed}, removed: {removed}"));
        for (source_id, outcome) in &run.per_source_results {
            let line = match outcome {
                Outcome::Success { wiped_systems, .. } if !wiped_systems.is_empty() => {
                    format!("- `{source_id}`: success, WIPED {}", wiped_systems.join(", "))
                }
                Outcome::Success { .. } => format!("- `{source_id}`: success"),
                Outcome::Partial { failures, .. } => {
                    format!("- `{source_id}`: partial ({})", failures.join("; "))
                }
                Outcome::Failure { reason } => format!("- `{source_id}`: FAILED ({reason})"),
                Outcome::Skipped { reason } => format!("- `{source_id}`: skipped ({reason})"),
            };
            lines.push(line);
        }
        lines.push(String::new());
    }
    lines.join("\n")
}
