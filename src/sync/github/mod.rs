//! GitHub REST backend.
//!
//! Issues and projects sync to repository issues, milestones to repository
//! milestones. Every call goes through the shared retry combinator; the
//! client underneath keeps the rate-limit budget.

pub mod client;
pub mod mapping;

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

pub use client::{GitHubClient, RateLimitState};
pub use mapping::FieldMapping;

use crate::config::GitHubConfig;
use crate::core::{Entity, EntityFields, EntityKind};
use crate::error::Result;
use crate::sync::backend::{
    Backend, BackendError, BackendFailure, BackendResult, PushOutcome, RemoteEntity, Retried,
};
use crate::sync::retry::{RetryPolicy, Sleeper, ThreadSleeper, classify, retry};

pub const BACKEND_NAME: &str = "github";

pub struct GitHubBackend {
    client: GitHubClient,
    mapping: FieldMapping,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    workers: usize,
}

impl GitHubBackend {
    pub fn new(config: &GitHubConfig, rate_limit_budget: u32, token: String) -> Result<Self> {
        Self::with_sleeper(config, rate_limit_budget, token, Arc::new(ThreadSleeper))
    }

    /// Same as [`GitHubBackend::new`] with a custom sleeper for backoff and
    /// rate-limit waits.
    pub fn with_sleeper(
        config: &GitHubConfig,
        rate_limit_budget: u32,
        token: String,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self> {
        let (owner, repo) = config.repository()?;
        let client = GitHubClient::new(
            &config.api_url,
            owner,
            repo,
            token,
            rate_limit_budget,
            Arc::clone(&sleeper),
        )
        .map_err(|e| crate::error::RoadmapError::Http(e.to_string()))?;
        Ok(Self {
            client,
            mapping: FieldMapping::from_config(config),
            policy: RetryPolicy::from_github(config),
            sleeper,
            workers: config.workers.max(1),
        })
    }

    #[must_use]
    pub const fn client(&self) -> &GitHubClient {
        &self.client
    }

    fn call<T>(&self, op: impl Fn() -> std::result::Result<T, BackendError>) -> BackendResult<T> {
        retry(&self.policy, &*self.sleeper, classify, |_| op())
    }

    fn collection(kind: EntityKind) -> &'static str {
        match kind {
            EntityKind::Milestone => "/milestones",
            EntityKind::Issue | EntityKind::Project => "/issues",
        }
    }

    fn parse_remote(
        &self,
        kind: EntityKind,
        value: &Value,
    ) -> std::result::Result<RemoteEntity, BackendError> {
        let parsed = match kind {
            EntityKind::Milestone => self.mapping.milestone_from_json(value),
            EntityKind::Issue | EntityKind::Project => self.mapping.issue_from_json(value),
        };
        parsed
            .ok_or_else(|| BackendError::Permanent(format!("unexpected {kind} response: {value}")))
    }

    fn create(&self, entity: &Entity) -> BackendResult<PushOutcome> {
        let path = self.client.repo_path(Self::collection(entity.kind));
        let payload = match entity.kind {
            EntityKind::Milestone => self.mapping.milestone_payload(entity),
            EntityKind::Issue | EntityKind::Project => self.mapping.issue_payload(entity),
        };
        let created = self.call(|| self.client.post(&path, &payload))?;
        let mut retries = created.retries;
        let mut body = created.value;

        // Issues are always created open; close them in a second call.
        let still_open = body.get("state").and_then(Value::as_str) != Some("closed");
        if payload["state"] == "closed" && still_open {
            if let Some(number) = body.get("number").and_then(Value::as_u64) {
                let closed = self.call(|| {
                    self.client
                        .patch(&format!("{path}/{number}"), &json!({ "state": "closed" }))
                })?;
                retries += closed.retries;
                body = closed.value;
            }
        }

        let remote = self
            .parse_remote(entity.kind, &body)
            .map_err(|error| BackendFailure { error, retries })?;
        info!(id = %entity.id, remote_id = %remote.remote_id, "Created on GitHub");
        Ok(Retried {
            value: PushOutcome::Pushed {
                remote_id: remote.remote_id.clone(),
                created: true,
                remote,
            },
            retries,
        })
    }

    fn update(&self, entity: &Entity, remote_id: &str) -> BackendResult<PushOutcome> {
        let number = mapping::remote_number(remote_id).ok_or_else(|| {
            BackendFailure::from(BackendError::Permanent(format!("malformed remote id {remote_id}")))
        })?;
        let path = format!("{}/{number}", self.client.repo_path(Self::collection(entity.kind)));
        let payload = match entity.kind {
            EntityKind::Milestone => self.mapping.milestone_payload(entity),
            EntityKind::Issue | EntityKind::Project => self.mapping.issue_payload(entity),
        };
        match self.call(|| self.client.patch(&path, &payload)) {
            Ok(updated) => {
                let remote = self
                    .parse_remote(entity.kind, &updated.value)
                    .map_err(|error| BackendFailure {
                        error,
                        retries: updated.retries,
                    })?;
                debug!(id = %entity.id, remote_id, "Updated on GitHub");
                Ok(Retried {
                    value: PushOutcome::Pushed {
                        remote_id: remote_id.to_string(),
                        created: false,
                        remote,
                    },
                    retries: updated.retries,
                })
            }
            Err(BackendFailure {
                error: BackendError::NotFound(_),
                retries,
            }) => {
                warn!(id = %entity.id, remote_id, "Remote entity is gone");
                Ok(Retried {
                    value: PushOutcome::RemoteDeleted {
                        remote_id: remote_id.to_string(),
                    },
                    retries,
                })
            }
            Err(failure) => Err(failure),
        }
    }

    fn fetch_one(&self, remote_id: &str) -> std::result::Result<Option<RemoteEntity>, BackendError> {
        let Some(number) = mapping::remote_number(remote_id) else {
            return Err(BackendError::Permanent(format!("malformed remote id {remote_id}")));
        };
        let kind = if remote_id.starts_with(mapping::MILESTONE_ID_PREFIX) {
            EntityKind::Milestone
        } else {
            EntityKind::Issue
        };
        let path = format!("{}/{number}", self.client.repo_path(Self::collection(kind)));
        match self.call(|| self.client.get(&path)) {
            Ok(found) => Ok(match kind {
                EntityKind::Milestone => self.mapping.milestone_from_json(&found.value),
                _ => self.mapping.issue_from_json(&found.value),
            }),
            Err(BackendFailure {
                error: BackendError::NotFound(_),
                ..
            }) => Ok(None),
            Err(failure) => Err(failure.error),
        }
    }
}

impl Backend for GitHubBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn authenticate(&self) -> std::result::Result<(), BackendError> {
        let path = self.client.repo_path("");
        match self.call(|| self.client.get(&path)) {
            Ok(_) => Ok(()),
            // A private repository the token cannot see answers 404.
            Err(BackendFailure {
                error: BackendError::NotFound(msg),
                ..
            }) => Err(BackendError::Unauthenticated(format!(
                "repository not visible with this token: {msg}"
            ))),
            Err(failure) => Err(failure.error),
        }
    }

    fn list_remote(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> std::result::Result<Vec<RemoteEntity>, BackendError> {
        let mut query = "state=all".to_string();
        if let Some(since) = since {
            let stamp = since.to_rfc3339_opts(SecondsFormat::Secs, true);
            query.push_str("&since=");
            query.push_str(&urlencoding::encode(&stamp));
        }
        let issues_path = self.client.repo_path("/issues");
        let issues = self
            .call(|| self.client.get_all(&issues_path, &query))
            .map_err(|f| f.error)?
            .value;

        let milestones_path = self.client.repo_path("/milestones");
        let milestones = self
            .call(|| self.client.get_all(&milestones_path, "state=all"))
            .map_err(|f| f.error)?
            .value;

        let mut remote: Vec<RemoteEntity> = issues
            .iter()
            .filter_map(|issue| self.mapping.issue_from_json(issue))
            .collect();
        remote.extend(
            milestones
                .iter()
                .filter_map(|m| self.mapping.milestone_from_json(m))
                // The milestones endpoint has no `since` filter.
                .filter(|m| match (since, m.updated_at) {
                    (Some(since), Some(updated)) => updated >= since,
                    _ => true,
                }),
        );
        debug!(count = remote.len(), incremental = since.is_some(), "Listed GitHub entities");
        Ok(remote)
    }

    fn push_one(&self, entity: &Entity, existing_remote_id: Option<&str>) -> BackendResult<PushOutcome> {
        match existing_remote_id {
            None => self.create(entity),
            Some(remote_id) => self.update(entity, remote_id),
        }
    }

    fn pull(&self, remote_ids: Option<&[String]>) -> std::result::Result<Vec<RemoteEntity>, BackendError> {
        let Some(remote_ids) = remote_ids else {
            return self.list_remote(None);
        };
        let mut out = Vec::with_capacity(remote_ids.len());
        for remote_id in remote_ids {
            match self.fetch_one(remote_id)? {
                Some(remote) => out.push(remote),
                None => debug!(remote_id = %remote_id, "Remote entity not found on pull"),
            }
        }
        Ok(out)
    }

    fn check_connectivity(&self) -> std::result::Result<(), String> {
        self.client.ping()
    }

    fn close_remote(&self, remote_id: &str) -> BackendResult<()> {
        let number = mapping::remote_number(remote_id).ok_or_else(|| {
            BackendFailure::from(BackendError::Permanent(format!("malformed remote id {remote_id}")))
        })?;
        let collection = if remote_id.starts_with(mapping::MILESTONE_ID_PREFIX) {
            "/milestones"
        } else {
            "/issues"
        };
        let path = format!("{}/{number}", self.client.repo_path(collection));
        self.call(|| self.client.patch(&path, &json!({ "state": "closed" })))
            .map(|done| done.map(|_| ()))
    }

    fn max_concurrency(&self) -> usize {
        self.workers
    }

    fn merge_pulled(
        &self,
        kind: EntityKind,
        local: Option<&EntityFields>,
        remote: &EntityFields,
    ) -> EntityFields {
        self.mapping.merge(kind, local, remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::retry::tests::RecordingSleeper;
    use httpmock::prelude::*;
    use std::time::Duration;

    fn config(server: &MockServer) -> GitHubConfig {
        GitHubConfig {
            owner: Some("acme".into()),
            repo: Some("widgets".into()),
            api_url: server.base_url(),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..GitHubConfig::default()
        }
    }

    fn backend(server: &MockServer) -> (GitHubBackend, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::default());
        let backend =
            GitHubBackend::with_sleeper(&config(server), 0, "tok".into(), sleeper.clone()).unwrap();
        (backend, sleeper)
    }

    fn issue_json(number: u64, title: &str, state: &str) -> Value {
        json!({
            "number": number,
            "title": title,
            "body": format!("body\n\n<!-- roadmap:id=iss-{number:08} -->"),
            "state": state,
            "labels": [],
            "assignees": [],
            "updated_at": "2026-02-01T10:00:00Z",
        })
    }

    #[test]
    fn create_issue_links_remote_number() {
        let server = MockServer::start();
        let create = server.mock(|when, then| {
            when.method(POST).path("/repos/acme/widgets/issues");
            then.status(201).json_body(issue_json(7, "First", "open"));
        });
        let (backend, _) = backend(&server);
        let entity = Entity::with_id("iss-00000007", EntityKind::Issue, EntityFields::titled("First"));

        let out = backend.push_one(&entity, None).unwrap();
        create.assert_hits(1);
        assert_eq!(out.retries, 0);
        match out.value {
            PushOutcome::Pushed {
                remote_id, created, ..
            } => {
                assert_eq!(remote_id, "7");
                assert!(created);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn closed_issue_is_closed_after_create() {
        let server = MockServer::start();
        let create = server.mock(|when, then| {
            when.method(POST).path("/repos/acme/widgets/issues");
            then.status(201).json_body(issue_json(9, "Done", "open"));
        });
        let close = server.mock(|when, then| {
            when.method(PATCH).path("/repos/acme/widgets/issues/9");
            then.status(200).json_body(issue_json(9, "Done", "closed"));
        });
        let (backend, _) = backend(&server);
        let mut fields = EntityFields::titled("Done");
        fields.status = "closed".into();
        let entity = Entity::with_id("iss-00000009", EntityKind::Issue, fields);

        backend.push_one(&entity, None).unwrap();
        create.assert_hits(1);
        close.assert_hits(1);
    }

    #[test]
    fn update_of_deleted_issue_reports_remote_deleted() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(PATCH).path("/repos/acme/widgets/issues/3");
            then.status(410).json_body(json!({ "message": "This issue was deleted" }));
        });
        let (backend, _) = backend(&server);
        let entity = Entity::with_id("iss-00000003", EntityKind::Issue, EntityFields::titled("x"));

        let out = backend.push_one(&entity, Some("3")).unwrap();
        assert_eq!(
            out.value,
            PushOutcome::RemoteDeleted {
                remote_id: "3".into()
            }
        );
    }

    #[test]
    fn server_errors_retry_until_exhausted() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(PATCH).path("/repos/acme/widgets/issues/4");
            then.status(502).body("bad gateway");
        });
        let (backend, sleeper) = backend(&server);
        let entity = Entity::with_id("iss-00000004", EntityKind::Issue, EntityFields::titled("x"));

        let failure = backend.push_one(&entity, Some("4")).unwrap_err();
        mock.assert_hits(3);
        assert_eq!(failure.retries, 2);
        assert!(matches!(failure.error, BackendError::Transient(_)));
        assert_eq!(sleeper.slept.lock().len(), 2);
    }

    #[test]
    fn unauthorized_is_not_retried() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/repos/acme/widgets/issues");
            then.status(401).json_body(json!({ "message": "Bad credentials" }));
        });
        let (backend, _) = backend(&server);
        let entity = Entity::with_id("iss-00000005", EntityKind::Issue, EntityFields::titled("x"));

        let failure = backend.push_one(&entity, None).unwrap_err();
        mock.assert_hits(1);
        assert!(matches!(failure.error, BackendError::Unauthenticated(_)));
    }

    #[test]
    fn invisible_repository_is_an_auth_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/repos/acme/widgets");
            then.status(404).json_body(json!({ "message": "Not Found" }));
        });
        let (backend, _) = backend(&server);
        assert!(matches!(
            backend.authenticate(),
            Err(BackendError::Unauthenticated(_))
        ));
    }

    #[test]
    fn list_remote_merges_issues_and_milestones() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/repos/acme/widgets/issues")
                .query_param("state", "all")
                .query_param("since", "2026-01-15T00:00:00Z");
            then.status(200).json_body(json!([
                issue_json(1, "Kept", "open"),
                { "number": 2, "title": "A PR", "pull_request": { "url": "x" } },
            ]));
        });
        server.mock(|when, then| {
            when.method(GET).path("/repos/acme/widgets/milestones");
            then.status(200).json_body(json!([
                { "number": 1, "title": "Old", "state": "open", "updated_at": "2026-01-01T00:00:00Z" },
                { "number": 2, "title": "New", "state": "open", "updated_at": "2026-01-20T00:00:00Z" },
            ]));
        });
        let (backend, _) = backend(&server);
        let since = DateTime::parse_from_rfc3339("2026-01-15T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let remote = backend.list_remote(Some(since)).unwrap();
        let ids: Vec<&str> = remote.iter().map(|r| r.remote_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "milestone/2"]);
        assert_eq!(remote[0].local_id.as_deref(), Some("iss-00000001"));
    }

    #[test]
    fn pull_skips_missing_ids() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/repos/acme/widgets/issues/1");
            then.status(200).json_body(issue_json(1, "Here", "open"));
        });
        server.mock(|when, then| {
            when.method(GET).path("/repos/acme/widgets/issues/2");
            then.status(404).json_body(json!({ "message": "Not Found" }));
        });
        let (backend, _) = backend(&server);
        let pulled = backend.pull(Some(&["1".to_string(), "2".to_string()])).unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].fields.title, "Here");
    }

    #[test]
    fn close_remote_patches_state() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(PATCH).path("/repos/acme/widgets/milestones/5");
            then.status(200).json_body(json!({ "number": 5, "title": "m", "state": "closed" }));
        });
        let (backend, _) = backend(&server);
        backend.close_remote("milestone/5").unwrap();
        mock.assert_hits(1);
    }
}
