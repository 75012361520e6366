//! Full runs against a mocked GitHub REST API.

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use roadmap::config::{GitHubConfig, SyncConfig};
use roadmap::core::{Entity, EntityFields, EntityKind, SyncStatus};
use roadmap::storage::{EntityFilter, EntityStore};
use roadmap::sync::{
    CancelToken, ErrorKind, GitHubBackend, SyncOptions, SyncOrchestrator, SyncReport,
    SyncStateTracker,
};

use super::fixture::RecordingSleeper;

fn backend(server: &MockServer) -> GitHubBackend {
    let config = GitHubConfig {
        owner: Some("acme".into()),
        repo: Some("widgets".into()),
        api_url: server.base_url(),
        max_attempts: 2,
        initial_backoff: Duration::from_millis(1),
        ..GitHubConfig::default()
    };
    GitHubBackend::with_sleeper(&config, 0, "test-token".into(), Arc::new(RecordingSleeper::default()))
        .expect("backend")
}

fn reachable_repo(server: &MockServer) {
    server.mock(|when, then| {
        when.method(GET).path("/rate_limit");
        then.status(200).json_body(json!({ "resources": {} }));
    });
    server.mock(|when, then| {
        when.method(GET).path("/repos/acme/widgets");
        then.status(200).json_body(json!({ "full_name": "acme/widgets" }));
    });
}

fn run(store: &EntityStore, backend: &GitHubBackend) -> SyncReport {
    SyncOrchestrator::new(store, backend, &SyncConfig::default())
        .run(&SyncOptions::default(), &CancelToken::new())
        .expect("sync run")
}

#[test]
fn local_issue_is_created_as_github_issue() {
    let server = MockServer::start();
    reachable_repo(&server);
    server.mock(|when, then| {
        when.method(GET).path("/repos/acme/widgets/issues");
        then.status(200).json_body(json!([]));
    });
    server.mock(|when, then| {
        when.method(GET).path("/repos/acme/widgets/milestones");
        then.status(200).json_body(json!([]));
    });
    let dir = TempDir::new().expect("tempdir");
    let store = EntityStore::open(dir.path(), 2).expect("store");
    let entity = Entity::new(EntityKind::Issue, EntityFields::titled("Crash on start"));
    store.save(&entity).expect("save");
    let create = server.mock(|when, then| {
        when.method(POST).path("/repos/acme/widgets/issues");
        then.status(201).json_body(json!({
            "number": 42,
            "title": "Crash on start",
            "body": format!("<!-- roadmap:id={} -->", entity.id),
            "state": "open",
            "labels": [],
            "assignees": [],
            "updated_at": "2026-03-01T09:00:00Z",
        }));
    });

    let report = run(&store, &backend(&server));

    create.assert_calls(1);
    assert_eq!(report.pushed, 1);
    let record = SyncStateTracker::new(store.data_dir())
        .get(&entity.id, "github")
        .expect("read record")
        .expect("record");
    assert_eq!(record.remote_id, "42");
    let saved = store.load(&entity.id).expect("load");
    assert_eq!(saved.remote_id("github"), Some("42"));
    assert_eq!(saved.sync.sync_status, SyncStatus::Synced);
}

#[test]
fn github_issues_and_milestones_are_pulled() {
    let server = MockServer::start();
    reachable_repo(&server);
    server.mock(|when, then| {
        when.method(GET).path("/repos/acme/widgets/issues");
        then.status(200).json_body(json!([
            {
                "number": 7,
                "title": "Remote bug",
                "body": "Steps to reproduce",
                "state": "open",
                "labels": [{ "name": "bug" }, { "name": "priority:high" }],
                "assignees": [{ "login": "octocat" }],
                "updated_at": "2026-03-01T09:00:00Z",
            },
            {
                "number": 8,
                "title": "Website",
                "body": "",
                "state": "open",
                "labels": [{ "name": "roadmap:project" }],
                "assignees": [],
                "updated_at": "2026-03-01T09:00:00Z",
            },
            { "number": 9, "title": "A PR", "pull_request": { "url": "x" } },
        ]));
    });
    server.mock(|when, then| {
        when.method(GET).path("/repos/acme/widgets/milestones");
        then.status(200).json_body(json!([{
            "number": 3,
            "title": "v2.0",
            "description": "",
            "state": "open",
            "due_on": null,
            "updated_at": "2026-03-01T09:00:00Z",
        }]));
    });
    let dir = TempDir::new().expect("tempdir");
    let store = EntityStore::open(dir.path(), 2).expect("store");

    let report = run(&store, &backend(&server));

    assert_eq!(report.pulled, 3);
    let issues: Vec<Entity> = store
        .list(&EntityFilter::kind(EntityKind::Issue))
        .expect("list")
        .collect::<Result<_, _>>()
        .expect("load");
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].fields.title, "Remote bug");
    assert_eq!(issues[0].fields.priority.as_deref(), Some("high"));
    assert_eq!(issues[0].fields.labels, vec!["bug".to_string()]);
    assert_eq!(issues[0].fields.assignees, vec!["octocat".to_string()]);
    assert_eq!(issues[0].remote_id("github"), Some("7"));

    assert_eq!(store.ids(&EntityFilter::kind(EntityKind::Project)).expect("ids").len(), 1);
    let milestones = store.ids(&EntityFilter::kind(EntityKind::Milestone)).expect("ids");
    assert_eq!(milestones.len(), 1);
    let milestone = store.load(&milestones[0]).expect("load");
    assert_eq!(milestone.remote_id("github"), Some("milestone/3"));
}

#[test]
fn bad_credentials_stop_the_run_before_any_write() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/rate_limit");
        then.status(200).json_body(json!({}));
    });
    server.mock(|when, then| {
        when.method(GET).path("/repos/acme/widgets");
        then.status(401).json_body(json!({ "message": "Bad credentials" }));
    });
    let create = server.mock(|when, then| {
        when.method(POST).path("/repos/acme/widgets/issues");
        then.status(201).json_body(json!({}));
    });
    let dir = TempDir::new().expect("tempdir");
    let store = EntityStore::open(dir.path(), 2).expect("store");
    store
        .save(&Entity::new(EntityKind::Issue, EntityFields::titled("Pending")))
        .expect("save");

    let report = run(&store, &backend(&server));

    create.assert_calls(0);
    assert_eq!(
        report.run_error.as_ref().map(|e| e.kind),
        Some(ErrorKind::AuthError)
    );
}
