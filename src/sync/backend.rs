//! Transport-independent contract every remote implements.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::{Entity, EntityFields, EntityKind, fingerprint};

/// Failure reported by a backend for one call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("not authenticated: {0}")]
    Unauthenticated(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rejected by remote: {0}")]
    Permanent(String),

    #[error("remote entity not found: {0}")]
    NotFound(String),
}

impl BackendError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }
}

/// A backend error after the retry wrapper gave up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{error} (after {retries} retries)")]
pub struct BackendFailure {
    pub error: BackendError,
    pub retries: u32,
}

impl From<BackendError> for BackendFailure {
    fn from(error: BackendError) -> Self {
        Self { error, retries: 0 }
    }
}

/// A successful value plus how many retries it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub retries: u32,
}

impl<T> Retried<T> {
    pub const fn first_try(value: T) -> Self {
        Self { value, retries: 0 }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Retried<U> {
        Retried {
            value: f(self.value),
            retries: self.retries,
        }
    }
}

pub type BackendResult<T> = Result<Retried<T>, BackendFailure>;

/// An entity as a remote reports it, already mapped into local fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntity {
    pub remote_id: String,
    pub kind: EntityKind,
    /// Local id recovered from the created-by-tool marker, if present.
    pub local_id: Option<String>,
    pub created_by_tool: bool,
    pub closed: bool,
    pub fields: EntityFields,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RemoteEntity {
    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint(self.kind, &self.fields)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed {
        remote_id: String,
        created: bool,
        /// The remote's representation after the write.
        remote: RemoteEntity,
    },
    /// An update targeted a remote entity that no longer exists.
    RemoteDeleted { remote_id: String },
}

#[derive(Debug, Clone)]
pub struct PushRequest {
    pub entity: Entity,
    pub existing_remote_id: Option<String>,
}

/// Capability set of a sync transport.
///
/// Implementations are shared across the worker pool, so every method takes
/// `&self`.
pub trait Backend: Send + Sync {
    /// Key used in `remote_ids` and sync state paths.
    fn name(&self) -> &str;

    fn authenticate(&self) -> Result<(), BackendError>;

    /// Remote entities, optionally only those updated after `since`.
    fn list_remote(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteEntity>, BackendError>;

    /// Create (no `existing_remote_id`) or update one entity.
    fn push_one(&self, entity: &Entity, existing_remote_id: Option<&str>) -> BackendResult<PushOutcome>;

    /// Push several entities. Results are independent per entity and keyed
    /// by local id; the batch is not atomic.
    fn push_batch(&self, requests: &[PushRequest]) -> BTreeMap<String, BackendResult<PushOutcome>> {
        requests
            .iter()
            .map(|req| {
                (
                    req.entity.id.clone(),
                    self.push_one(&req.entity, req.existing_remote_id.as_deref()),
                )
            })
            .collect()
    }

    /// Fetch specific remote entities, or everything when `remote_ids` is
    /// `None`. Ids that no longer exist are omitted.
    fn pull(&self, remote_ids: Option<&[String]>) -> Result<Vec<RemoteEntity>, BackendError>;

    /// Cheap reachability check; `Err` carries a human-readable reason.
    fn check_connectivity(&self) -> Result<(), String>;

    /// Close a remote entity. Used only by orphan closure.
    fn close_remote(&self, remote_id: &str) -> BackendResult<()> {
        Err(BackendError::Permanent(format!(
            "backend {} cannot close remote entity {remote_id}",
            self.name()
        ))
        .into())
    }

    /// Upper bound on concurrent per-entity calls.
    fn max_concurrency(&self) -> usize {
        1
    }

    /// Whether pushes should be grouped into one `push_batch` call.
    fn prefers_batch(&self) -> bool {
        false
    }

    /// Combine pulled fields with the local copy. Backends that cannot carry
    /// some fields keep the local values for them.
    fn merge_pulled(
        &self,
        _kind: EntityKind,
        _local: Option<&EntityFields>,
        remote: &EntityFields,
    ) -> EntityFields {
        remote.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limit_and_transient_retry() {
        assert!(BackendError::Transient("502".into()).is_retryable());
        assert!(
            BackendError::RateLimited {
                retry_after: Duration::from_secs(5)
            }
            .is_retryable()
        );
        assert!(!BackendError::Permanent("422".into()).is_retryable());
        assert!(!BackendError::Unauthenticated("bad token".into()).is_retryable());
        assert!(!BackendError::NotFound("7".into()).is_retryable());
    }

    #[test]
    fn failure_display_includes_retries() {
        let failure = BackendFailure {
            error: BackendError::Transient("timeout".into()),
            retries: 3,
        };
        assert_eq!(failure.to_string(), "transient failure: timeout (after 3 retries)");
    }
}
