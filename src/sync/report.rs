//! Per-run sync report.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::backend::BackendError;
use super::conflict::Resolution;
use crate::core::EntityKind;
use crate::error::RoadmapError;

/// Error classes surfaced to the user, one per failed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthError,
    NetworkTransient,
    RateLimited,
    PermanentRejection,
    RemoteDeleted,
    LocalCorruption,
    LocalWriteFailed,
}

impl From<&BackendError> for ErrorKind {
    fn from(error: &BackendError) -> Self {
        match error {
            BackendError::Unauthenticated(_) => Self::AuthError,
            BackendError::RateLimited { .. } => Self::RateLimited,
            BackendError::Transient(_) => Self::NetworkTransient,
            BackendError::Permanent(_) => Self::PermanentRejection,
            BackendError::NotFound(_) => Self::RemoteDeleted,
        }
    }
}

impl From<&RoadmapError> for ErrorKind {
    fn from(error: &RoadmapError) -> Self {
        match error {
            RoadmapError::LocalCorruption(_)
            | RoadmapError::InvalidEntity { .. }
            | RoadmapError::Yaml(_) => Self::LocalCorruption,
            _ => Self::LocalWriteFailed,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::AuthError => "auth_error",
            Self::NetworkTransient => "network_transient",
            Self::RateLimited => "rate_limited",
            Self::PermanentRejection => "permanent_rejection",
            Self::RemoteDeleted => "remote_deleted",
            Self::LocalCorruption => "local_corruption",
            Self::LocalWriteFailed => "local_write_failed",
        })
    }
}

/// What the run did (or planned) for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Action {
    Push { created: bool },
    Pull { created: bool },
    ResolveConflict { resolution: Resolution },
    DeferConflict,
    RemoteDeleted,
    Unlink,
    CloseOrphan,
    /// Failure before any action was chosen (e.g. unreadable file).
    Skip,
}

/// Terminal per-entity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Committed,
    Failed,
    /// Dry run: the action was computed but not executed.
    Planned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportedError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityOutcome {
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<EntityKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub action: Action,
    pub state: EntityState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportedError>,
    pub retries: u32,
}

impl EntityOutcome {
    pub fn committed(entity_id: impl Into<String>, action: Action) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind: None,
            remote_id: None,
            action,
            state: EntityState::Committed,
            error: None,
            retries: 0,
        }
    }

    pub fn failed(
        entity_id: impl Into<String>,
        action: Action,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            state: EntityState::Failed,
            error: Some(ReportedError {
                kind,
                message: message.into(),
            }),
            ..Self::committed(entity_id, action)
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: EntityKind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub const fn planned(mut self) -> Self {
        self.state = EntityState::Planned;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    CompletedCleanly,
    CompletedWithIssues,
}

impl RunOutcome {
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::CompletedCleanly => 0,
            Self::CompletedWithIssues => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub backend: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub cancelled: bool,
    pub pushed: usize,
    pub pulled: usize,
    pub conflicts_resolved: usize,
    pub conflicts_deferred: usize,
    pub orphans_closed: usize,
    pub errors: usize,
    pub retries: u32,
    /// Failure that stopped the run before any entity was processed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_error: Option<ReportedError>,
    pub outcomes: Vec<EntityOutcome>,
}

impl SyncReport {
    pub fn new(backend: impl Into<String>, dry_run: bool) -> Self {
        Self {
            backend: backend.into(),
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            cancelled: false,
            pushed: 0,
            pulled: 0,
            conflicts_resolved: 0,
            conflicts_deferred: 0,
            orphans_closed: 0,
            errors: 0,
            retries: 0,
            run_error: None,
            outcomes: Vec::new(),
        }
    }

    /// Add an outcome and update the counters. Planned outcomes count
    /// towards what the run would do.
    pub fn record(&mut self, outcome: EntityOutcome) {
        self.retries += outcome.retries;
        if outcome.state == EntityState::Failed {
            self.errors += 1;
        } else {
            match &outcome.action {
                Action::Push { .. } => self.pushed += 1,
                Action::Pull { .. } => self.pulled += 1,
                Action::ResolveConflict { resolution } => {
                    self.conflicts_resolved += 1;
                    match resolution {
                        Resolution::PushLocal => self.pushed += 1,
                        Resolution::PullRemote => self.pulled += 1,
                    }
                }
                Action::DeferConflict => self.conflicts_deferred += 1,
                Action::CloseOrphan => self.orphans_closed += 1,
                Action::RemoteDeleted | Action::Unlink | Action::Skip => {}
            }
        }
        self.outcomes.push(outcome);
    }

    /// Record a run-level failure, e.g. rejected credentials.
    pub fn abort_with(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.run_error = Some(ReportedError {
            kind,
            message: message.into(),
        });
    }

    pub fn finish(&mut self) {
        self.outcomes.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        self.finished_at = Some(Utc::now());
    }

    /// No pushes, pulls, conflicts or failures.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty() && self.run_error.is_none()
    }

    /// Outcomes that did not reach `Committed` or need attention.
    pub fn issues(&self) -> impl Iterator<Item = &EntityOutcome> {
        self.outcomes.iter().filter(|o| {
            o.state == EntityState::Failed
                || matches!(o.action, Action::DeferConflict | Action::RemoteDeleted)
        })
    }

    #[must_use]
    pub fn outcome(&self) -> RunOutcome {
        if self.cancelled || self.run_error.is_some() || self.issues().next().is_some() {
            RunOutcome::CompletedWithIssues
        } else {
            RunOutcome::CompletedCleanly
        }
    }
}
