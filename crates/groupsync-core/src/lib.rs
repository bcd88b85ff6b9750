//! Core domain model for groupsync: groups, identities, import sources and run records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "groupsync-core";

/// System namespace that owns every plainlist-sourced group.
pub const EXTERNAL_SYSTEM: &str = "external";

const MAX_SYSTEM_NAME_LEN: usize = 64;
const MAX_GROUP_NAME_LEN: usize = 100;

/// Canonical identity reference (`user:<email>`, `bot:<id>`, or an opaque account name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Parses an already-normalized identity, rejecting anything that is not a recognized shape.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let bad = |reason: &str| ValidationError::BadIdentity {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        if value.is_empty() {
            return Err(bad("empty identity"));
        }
        if value.chars().any(char::is_whitespace) {
            return Err(bad("contains whitespace"));
        }

        let Some((kind, rest)) = value.split_once(':') else {
            if value.contains('@') {
                return Err(bad("email identities must carry the user: prefix"));
            }
            if !value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'))
            {
                return Err(bad("unsupported characters in account name"));
            }
            return Ok(Self(value.to_string()));
        };

        match kind {
            "user" => {
                if !is_email(rest) {
                    return Err(bad("user identity must be an email address"));
                }
            }
            "bot" | "service" => {
                if rest.is_empty() || rest.contains(':') {
                    return Err(bad("empty or malformed id"));
                }
            }
            "anonymous" => {
                if rest != "anonymous" {
                    return Err(bad("anonymous identity must be anonymous:anonymous"));
                }
            }
            other => return Err(bad(&format!("unknown identity kind {other:?}"))),
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_email(value: &str) -> bool {
    let mut parts = value.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && domain
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
        }
        _ => false,
    }
}

pub fn is_valid_system_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_SYSTEM_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Local (unqualified) group names: lowercase alphanumerics plus `_ - . @`.
pub fn is_valid_group_local_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_GROUP_NAME_LEN
        && name.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.' | '@')
        })
}

pub fn qualified_group_name(system: &str, local_name: &str) -> String {
    format!("{system}/{local_name}")
}

/// Splits `<system>/<local-name>`; returns `None` for unqualified names.
pub fn split_qualified_name(name: &str) -> Option<(&str, &str)> {
    name.split_once('/')
}

/// Authoritative group record as held by a group store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub members: BTreeSet<Identity>,
    /// Names of nested groups. Never edited by the importer.
    #[serde(default)]
    pub nested: BTreeSet<String>,
    /// `None` marks a manually managed group.
    #[serde(default)]
    pub owning_system: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_import_run: Option<Uuid>,
    #[serde(default)]
    pub source_url: Option<String>,
    /// Optimistic concurrency token, bumped by the store on every commit.
    pub version: u64,
}

impl Group {
    pub fn manual(
        name: impl Into<String>,
        members: impl IntoIterator<Item = Identity>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            members: members.into_iter().collect(),
            nested: BTreeSet::new(),
            owning_system: None,
            created_at: now,
            last_updated_at: now,
            last_import_run: None,
            source_url: None,
            version: 0,
        }
    }

    pub fn is_owned_by(&self, system: &str) -> bool {
        self.owning_system.as_deref() == Some(system)
    }
}

/// Deletion of a group at the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDeletion {
    pub name: String,
    pub expected_version: u64,
}

/// One atomic unit of work handed to a group store.
///
/// `updates` carry the version they were planned against in `Group::version`;
/// the store rejects the whole transaction if any stored version moved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTransaction {
    pub creates: Vec<Group>,
    pub updates: Vec<Group>,
    pub deletes: Vec<GroupDeletion>,
}

impl GroupTransaction {
    pub fn mutation_count(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutation_count() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub committed_at: DateTime<Utc>,
}

/// Change record written for every committed import transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Uuid,
    pub run_id: Uuid,
    pub system: String,
    pub source_id: String,
    pub source_url: String,
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub comment: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TarballSource {
    pub url: String,
    #[serde(default)]
    pub oauth_scopes: BTreeSet<String>,
    #[serde(default)]
    pub domain: Option<String>,
    pub systems: BTreeSet<String>,
    /// Optional allow-list of `<system>/<name>` entries.
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlainlistSource {
    pub url: String,
    #[serde(default)]
    pub oauth_scopes: BTreeSet<String>,
    #[serde(default)]
    pub domain: Option<String>,
    pub group: String,
}

/// One configured origin of external group data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImportSource {
    Tarball(TarballSource),
    Plainlist(PlainlistSource),
}

impl ImportSource {
    /// Stable key used in run reports.
    pub fn source_id(&self) -> String {
        match self {
            Self::Tarball(t) => format!("tarball:{}", t.url),
            Self::Plainlist(p) => format!("plainlist:{}", p.group),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Tarball(t) => &t.url,
            Self::Plainlist(p) => &p.url,
        }
    }

    pub fn oauth_scopes(&self) -> &BTreeSet<String> {
        match self {
            Self::Tarball(t) => &t.oauth_scopes,
            Self::Plainlist(p) => &p.oauth_scopes,
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            Self::Tarball(t) => t.domain.as_deref(),
            Self::Plainlist(p) => p.domain.as_deref(),
        }
    }

    /// Systems whose groups this source is authoritative for.
    pub fn systems(&self) -> BTreeSet<String> {
        match self {
            Self::Tarball(t) => t.systems.clone(),
            Self::Plainlist(_) => BTreeSet::from([EXTERNAL_SYSTEM.to_string()]),
        }
    }
}

/// Parsed and validated group importer configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupImporterConfig {
    #[serde(default)]
    pub tarball: Vec<TarballSource>,
    #[serde(default)]
    pub plainlist: Vec<PlainlistSource>,
}

impl GroupImporterConfig {
    /// Parses a YAML (or JSON) document and validates it.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn sources(&self) -> Vec<ImportSource> {
        self.tarball
            .iter()
            .cloned()
            .map(ImportSource::Tarball)
            .chain(self.plainlist.iter().cloned().map(ImportSource::Plainlist))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_systems = BTreeSet::new();
        for entry in &self.tarball {
            validate_url(&entry.url)?;
            validate_domain(entry.domain.as_deref())?;
            if entry.systems.is_empty() {
                return Err(ConfigError::EmptySystems {
                    url: entry.url.clone(),
                });
            }
            for system in &entry.systems {
                if !is_valid_system_name(system) {
                    return Err(ConfigError::InvalidSystemName {
                        name: system.clone(),
                    });
                }
                if system == EXTERNAL_SYSTEM {
                    return Err(ConfigError::ReservedSystem {
                        name: system.clone(),
                    });
                }
                if !seen_systems.insert(system.clone()) {
                    return Err(ConfigError::DuplicateSystem {
                        name: system.clone(),
                    });
                }
            }
            for filter in &entry.groups {
                let valid = split_qualified_name(filter)
                    .map(|(system, local)| {
                        entry.systems.contains(system) && is_valid_group_local_name(local)
                    })
                    .unwrap_or(false);
                if !valid {
                    return Err(ConfigError::InvalidGroupFilter {
                        url: entry.url.clone(),
                        entry: filter.clone(),
                    });
                }
            }
        }

        let mut seen_groups = BTreeSet::new();
        for entry in &self.plainlist {
            validate_url(&entry.url)?;
            validate_domain(entry.domain.as_deref())?;
            if !is_valid_group_local_name(&entry.group) {
                return Err(ConfigError::InvalidGroupName {
                    name: entry.group.clone(),
                });
            }
            if !seen_groups.insert(entry.group.clone()) {
                return Err(ConfigError::DuplicateGroup {
                    name: entry.group.clone(),
                });
            }
        }
        Ok(())
    }
}

fn validate_url(url: &str) -> Result<(), ConfigError> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    match rest {
        Some(host_and_path) if !host_and_path.is_empty() && !host_and_path.starts_with('/') => {
            Ok(())
        }
        _ => Err(ConfigError::InvalidUrl {
            url: url.to_string(),
        }),
    }
}

fn validate_domain(domain: Option<&str>) -> Result<(), ConfigError> {
    match domain {
        Some(d) if d.is_empty() || d.contains('@') || d.chars().any(char::is_whitespace) => {
            Err(ConfigError::InvalidDomain {
                domain: d.to_string(),
            })
        }
        _ => Ok(()),
    }
}

/// Per-source result recorded in an [`ImportRun`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        groups_changed: usize,
        groups_removed: usize,
        payload_sha256: String,
        /// Systems whose import emptied every previously owned group.
        #[serde(default)]
        wiped_systems: Vec<String>,
    },
    /// Some systems (or transaction partitions) committed, others did not.
    Partial {
        groups_changed: usize,
        groups_removed: usize,
        payload_sha256: String,
        #[serde(default)]
        wiped_systems: Vec<String>,
        failures: Vec<String>,
    },
    Failure {
        reason: String,
    },
    Skipped {
        reason: String,
    },
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. } | Self::Partial { .. })
    }

    /// `(groups_changed, groups_removed)`, zero for failed or skipped sources.
    pub fn counts(&self) -> (usize, usize) {
        match self {
            Self::Success {
                groups_changed,
                groups_removed,
                ..
            }
            | Self::Partial {
                groups_changed,
                groups_removed,
                ..
            } => (*groups_changed, *groups_removed),
            Self::Failure { .. } | Self::Skipped { .. } => (0, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
}

/// Audit record of one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRun {
    pub run_id: Uuid,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub per_source_results: BTreeMap<String, Outcome>,
}

impl ImportRun {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            state: RunState::Pending,
            started_at,
            finished_at: None,
            per_source_results: BTreeMap::new(),
        }
    }

    pub fn begin(&mut self) -> Result<(), RunStateError> {
        self.transition(RunState::Pending, RunState::Running)
    }

    pub fn record(&mut self, source_id: impl Into<String>, outcome: Outcome) -> Result<(), RunStateError> {
        if self.state != RunState::Running {
            return Err(RunStateError::NotRunning {
                run_id: self.run_id,
                state: self.state,
            });
        }
        self.per_source_results.insert(source_id.into(), outcome);
        Ok(())
    }

    pub fn complete(&mut self, finished_at: DateTime<Utc>) -> Result<(), RunStateError> {
        self.transition(RunState::Running, RunState::Completed)?;
        self.finished_at = Some(finished_at);
        Ok(())
    }

    pub fn has_failures(&self) -> bool {
        self.per_source_results.values().any(Outcome::is_failure)
    }

    pub fn totals(&self) -> (usize, usize) {
        self.per_source_results
            .values()
            .map(Outcome::counts)
            .fold((0, 0), |(c, r), (dc, dr)| (c + dc, r + dr))
    }

    fn transition(&mut self, from: RunState, to: RunState) -> Result<(), RunStateError> {
        if self.state != from {
            return Err(RunStateError::InvalidTransition {
                run_id: self.run_id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunStateError {
    #[error("import run {run_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunState,
        to: RunState,
    },
    #[error("import run {run_id} is {state:?}; outcomes are only recorded while running")]
    NotRunning { run_id: Uuid, state: RunState },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("malformed importer config: {0}")]
    Parse(String),
    #[error("invalid source url {url:?}")]
    InvalidUrl { url: String },
    #[error("tarball source {url} declares no systems")]
    EmptySystems { url: String },
    #[error("invalid system name {name:?}")]
    InvalidSystemName { name: String },
    #[error("system name {name:?} is reserved")]
    ReservedSystem { name: String },
    #[error("system {name:?} is imported by more than one tarball source")]
    DuplicateSystem { name: String },
    #[error("group filter {entry:?} of tarball {url} is not <declared-system>/<name>")]
    InvalidGroupFilter { url: String, entry: String },
    #[error("invalid group name {name:?}")]
    InvalidGroupName { name: String },
    #[error("group {name:?} is imported more than once")]
    DuplicateGroup { name: String },
    #[error("invalid domain {domain:?}")]
    InvalidDomain { domain: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("payload is not valid UTF-8: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("bad identity {value:?}: {reason}")]
    BadIdentity { value: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The snapshot a transaction was planned against is stale.
    #[error("conflicting write on group {name}: {reason}")]
    Conflict { name: String, reason: String },
    #[error("transaction of {mutations} mutations exceeds store limit of {limit}")]
    TransactionTooLarge { mutations: usize, limit: usize },
    #[error("store backend failure: {0}")]
    Backend(String),
}
