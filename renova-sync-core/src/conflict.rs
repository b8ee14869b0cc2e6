//! Conflict resolution between a local and a remote version of a record.
//!
//! All strategies are pure functions over record pairs. The only shared state
//! is the active [`ConflictStrategy`], held by [`ConflictPolicy`] so it can be
//! changed at runtime.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{is_empty_value, Record, RecordId, SYNCED_AT_FIELD};

/// Two differing edits closer together than this are reported as a conflict.
pub const DEFAULT_CONFLICT_WINDOW: Duration = Duration::from_millis(5000);

/// How to pick a winner between two versions of the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Greater timestamp wins; ties keep the local version.
    #[default]
    LastWriteWins,
    /// Field union; filled-in local fields take priority.
    Merge,
    LocalWins,
    RemoteWins,
}

impl ConflictStrategy {
    pub const ALL: [ConflictStrategy; 4] = [
        ConflictStrategy::LastWriteWins,
        ConflictStrategy::Merge,
        ConflictStrategy::LocalWins,
        ConflictStrategy::RemoteWins,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriteWins => "last-write-wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::LocalWins => "local-wins",
            ConflictStrategy::RemoteWins => "remote-wins",
        }
    }

    /// Applies this strategy to a pair of versions.
    pub fn resolve(&self, local: &Record, remote: &Record) -> Record {
        match self {
            ConflictStrategy::LastWriteWins => last_write_wins(local, remote),
            ConflictStrategy::Merge => merge(local, remote),
            ConflictStrategy::LocalWins => local.clone(),
            ConflictStrategy::RemoteWins => remote.clone(),
        }
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown conflict strategy '{0}' (expected last-write-wins, merge, local-wins or remote-wins)")]
pub struct ParseStrategyError(String);

impl FromStr for ConflictStrategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConflictStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| ParseStrategyError(s.to_string()))
    }
}

/// Returns the version with the greater timestamp; ties favour `local`.
pub fn last_write_wins(local: &Record, remote: &Record) -> Record {
    if local.timestamp_millis() >= remote.timestamp_millis() {
        local.clone()
    } else {
        remote.clone()
    }
}

/// Shallow field union.
///
/// Every field that is present and non-empty in `local` keeps the local
/// value; everything else comes from `remote`. Fields absent from both stay
/// absent.
pub fn merge(local: &Record, remote: &Record) -> Record {
    let mut fields = remote.fields().clone();
    for (key, value) in local.fields() {
        if !is_empty_value(value) {
            fields.insert(key.clone(), value.clone());
        }
    }
    Record::from_parts(local.id().clone(), fields)
}

/// Reconciles two record sets under `strategy`.
///
/// Ids present on both sides are resolved pairwise, local-only ids are kept
/// as they are and remote-only ids are appended after the local records.
pub fn resolve_list(local: &[Record], remote: &[Record], strategy: ConflictStrategy) -> Vec<Record> {
    let remote_by_id: HashMap<&RecordId, &Record> = remote.iter().map(|r| (r.id(), r)).collect();
    let mut seen: HashSet<&RecordId> = HashSet::with_capacity(local.len());
    let mut resolved = Vec::with_capacity(local.len() + remote.len());

    for record in local {
        if !seen.insert(record.id()) {
            continue;
        }
        match remote_by_id.get(record.id()) {
            Some(other) => resolved.push(strategy.resolve(record, other)),
            None => resolved.push(record.clone()),
        }
    }

    for record in remote {
        if seen.insert(record.id()) {
            resolved.push(record.clone());
        }
    }

    resolved
}

/// True when two timestamps differ but lie within `window` of each other.
///
/// Identical timestamps are presumed to describe the same write.
pub fn within_window(local_ts: i64, remote_ts: i64, window: Duration) -> bool {
    let diff = local_ts.abs_diff(remote_ts);
    diff > 0 && u128::from(diff) < window.as_millis()
}

/// Outcome of resolving one incoming version against a local one.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictDecision {
    Resolved {
        record: Record,
    },
    Conflict {
        local: Record,
        remote: Record,
        resolved: Record,
        strategy: ConflictStrategy,
    },
}

impl ConflictDecision {
    /// The record to store.
    pub fn record(&self) -> &Record {
        match self {
            ConflictDecision::Resolved { record } => record,
            ConflictDecision::Conflict { resolved, .. } => resolved,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ConflictDecision::Conflict { .. })
    }
}

/// True when two versions differ at most in their `syncedAt` stamp, as
/// happens when a pushed record is echoed back by the remote.
fn same_content(local: &Record, remote: &Record) -> bool {
    let strip = |record: &Record| {
        let mut fields = record.fields().clone();
        fields.remove(SYNCED_AT_FIELD);
        fields
    };
    strip(local) == strip(remote)
}

/// Resolves `remote` against `local`, flagging a conflict when both were
/// edited within `window`. Resolution runs whether or not a conflict is
/// flagged.
pub fn decide(
    local: &Record,
    remote: &Record,
    strategy: ConflictStrategy,
    window: Duration,
) -> ConflictDecision {
    let resolved = strategy.resolve(local, remote);
    if within_window(local.timestamp_millis(), remote.timestamp_millis(), window)
        && !same_content(local, remote)
    {
        ConflictDecision::Conflict {
            local: local.clone(),
            remote: remote.clone(),
            resolved,
            strategy,
        }
    } else {
        ConflictDecision::Resolved { record: resolved }
    }
}

/// Process-wide conflict settings, shared by the mirror and realtime ingestion.
#[derive(Debug)]
pub struct ConflictPolicy {
    strategy: RwLock<ConflictStrategy>,
    window: Duration,
}

impl ConflictPolicy {
    pub fn new(strategy: ConflictStrategy, window: Duration) -> Self {
        Self {
            strategy: RwLock::new(strategy),
            window,
        }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        *self.strategy.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_strategy(&self, strategy: ConflictStrategy) {
        *self.strategy.write().unwrap_or_else(PoisonError::into_inner) = strategy;
        tracing::info!("Conflict strategy set to {}", strategy);
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// [`decide`] under the current strategy and window.
    pub fn decide(&self, local: &Record, remote: &Record) -> ConflictDecision {
        decide(local, remote, self.strategy(), self.window)
    }
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self::new(ConflictStrategy::default(), DEFAULT_CONFLICT_WINDOW)
    }
}
