//! Change classification and conflict resolution.
//!
//! Classification compares the current fingerprints with the baselines from
//! the sync record. The local side is compared with the last pushed
//! fingerprint and the remote side with the last pulled one; for lossless
//! mappings the two baselines are equal and this is the plain
//! three-fingerprint comparison.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::config::ConflictStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeClass {
    Unchanged,
    LocalOnly,
    RemoteOnly,
    /// Both sides changed, to identical content.
    Converged,
    Conflict,
}

/// Classify one linked entity. A missing baseline counts as "changed".
#[must_use]
pub fn classify(
    local: &str,
    remote: &str,
    last_pushed: Option<&str>,
    last_pulled: Option<&str>,
) -> ChangeClass {
    let local_changed = last_pushed != Some(local);
    let remote_changed = last_pulled != Some(remote);
    match (local_changed, remote_changed) {
        (false, false) => ChangeClass::Unchanged,
        (true, false) => ChangeClass::LocalOnly,
        (false, true) => ChangeClass::RemoteOnly,
        (true, true) if local == remote => ChangeClass::Converged,
        (true, true) => ChangeClass::Conflict,
    }
}

/// Single-baseline form: local, remote and last-synced fingerprints.
#[must_use]
pub fn classify_against(local: &str, remote: &str, last_synced: &str) -> ChangeClass {
    classify(local, remote, Some(last_synced), Some(last_synced))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    PushLocal,
    PullRemote,
}

/// Last-modified times of both sides, used only by `newer_wins`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    /// `None` when the local file carries no `updated_at`.
    pub local: Option<DateTime<Utc>>,
    pub remote: Option<DateTime<Utc>>,
}

/// Applies one strategy to every conflict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    #[must_use]
    pub const fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    #[must_use]
    pub const fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// `newer_wins` pulls only when the remote is strictly newer; ties and
    /// unknown remote times keep local, and a known remote time beats an
    /// unknown local one. The remote timestamp may already reflect an
    /// earlier push from this same run.
    #[must_use]
    pub fn resolve(&self, times: Timestamps) -> Resolution {
        match self.strategy {
            ConflictStrategy::LocalWins => Resolution::PushLocal,
            ConflictStrategy::RemoteWins => Resolution::PullRemote,
            ConflictStrategy::NewerWins => match (times.local, times.remote) {
                (Some(local), Some(remote)) if remote > local => Resolution::PullRemote,
                (None, Some(_)) => Resolution::PullRemote,
                _ => Resolution::PushLocal,
            },
        }
    }
}
