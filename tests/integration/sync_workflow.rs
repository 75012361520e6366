//! Sync orchestration against the scripted in-memory backend.

use std::fs;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use roadmap::RoadmapError;
use roadmap::core::{EntityFields, EntityKind, SyncStatus};
use roadmap::storage::RunLock;
use roadmap::sync::{
    Action, BackendError, CancelToken, ConflictStrategy, EntityState, ErrorKind,
    RemoteDeletedPolicy, Resolution, RunOutcome, SyncDirection, SyncOptions,
};

use super::fixture::{FAKE_BACKEND, SyncFixture};

fn linked_remote_id(fixture: &SyncFixture, id: &str) -> String {
    fixture
        .record(id)
        .map(|r| r.remote_id)
        .expect("entity has a sync record")
}

#[test]
fn new_local_issue_is_created_remotely_and_linked() {
    let fixture = SyncFixture::new();
    let issue = fixture.create(EntityKind::Issue, "Ship the sync engine");

    let report = fixture.sync();

    assert_eq!(report.pushed, 1);
    assert_eq!(report.outcome(), RunOutcome::CompletedCleanly);
    let record = fixture.record(&issue.id).expect("record created");
    assert!(!record.remote_id.is_empty());
    assert!(record.has_baseline());

    let saved = fixture.load(&issue.id);
    assert_eq!(saved.sync.sync_status, SyncStatus::Synced);
    assert_eq!(saved.remote_id(FAKE_BACKEND), Some(record.remote_id.as_str()));
    assert!(saved.sync.last_synced_at.is_some());

    let remote = fixture.remote.get(&record.remote_id).expect("remote copy");
    assert_eq!(remote.fields.title, "Ship the sync engine");
    assert_eq!(remote.local_id.as_deref(), Some(issue.id.as_str()));
}

#[test]
fn second_run_without_changes_is_empty() {
    let fixture = SyncFixture::new();
    fixture.create(EntityKind::Issue, "First");
    fixture.create(EntityKind::Milestone, "v1.0");
    fixture.create(EntityKind::Project, "Website");

    let first = fixture.sync();
    assert_eq!(first.pushed, 3);
    let calls = fixture.remote.push_calls();

    let second = fixture.sync();
    assert!(second.is_empty(), "unexpected outcomes: {:?}", second.outcomes);
    assert_eq!(fixture.remote.push_calls(), calls);

    let third = fixture.sync_full();
    assert!(third.is_empty(), "unexpected outcomes: {:?}", third.outcomes);
}

#[test]
fn local_edit_is_pushed() {
    let fixture = SyncFixture::new();
    let issue = fixture.create(EntityKind::Issue, "Draft");
    fixture.sync();
    let remote_id = linked_remote_id(&fixture, &issue.id);

    fixture.edit(&issue.id, Utc::now(), |f| {
        f.title = "Final".into();
        f.labels = vec!["docs".into()];
    });
    let report = fixture.sync();

    assert_eq!(report.pushed, 1);
    assert_eq!(report.outcomes[0].action, Action::Push { created: false });
    let remote = fixture.remote.get(&remote_id).expect("remote copy");
    assert_eq!(remote.fields.title, "Final");
    assert_eq!(remote.fields.labels, vec!["docs".to_string()]);
}

#[test]
fn remote_edit_is_pulled_without_touching_unknown_keys() {
    let fixture = SyncFixture::new();
    let issue = fixture.create(EntityKind::Issue, "Draft");
    let path = fixture.store.path_for(EntityKind::Issue, &issue.id).expect("path");
    let text = fs::read_to_string(&path).expect("read");
    fs::write(&path, text.replacen("---\n", "---\nestimate: 3\n", 1)).expect("write");
    fixture.sync();
    let remote_id = linked_remote_id(&fixture, &issue.id);

    fixture.remote.edit(&remote_id, Utc::now(), |f| {
        f.status = "closed".into();
        f.body = "Done upstream.".into();
    });
    let report = fixture.sync();

    assert_eq!(report.pulled, 1);
    let saved = fixture.load(&issue.id);
    assert_eq!(saved.fields.status, "closed");
    assert_eq!(saved.fields.body.trim(), "Done upstream.");
    assert_eq!(saved.sync.sync_status, SyncStatus::Synced);
    assert_eq!(saved.extra("estimate").and_then(serde_yaml::Value::as_u64), Some(3));
}

fn diverge(fixture: &SyncFixture) -> (String, String) {
    let issue = fixture.create(EntityKind::Issue, "L1");
    fixture.sync();
    let remote_id = linked_remote_id(fixture, &issue.id);
    let now = Utc::now();
    fixture.edit(&issue.id, now, |f| f.title = "L2".into());
    fixture
        .remote
        .edit(&remote_id, now + ChronoDuration::hours(1), |f| f.title = "R2".into());
    (issue.id, remote_id)
}

#[test]
fn true_conflict_with_local_wins_pushes_local() {
    let fixture = SyncFixture::new();
    let (id, remote_id) = diverge(&fixture);

    let report = fixture.sync();

    assert_eq!(report.conflicts_resolved, 1);
    assert_eq!(
        report.outcomes[0].action,
        Action::ResolveConflict {
            resolution: Resolution::PushLocal
        }
    );
    assert_eq!(fixture.remote.get(&remote_id).expect("remote").fields.title, "L2");
    assert_eq!(fixture.load(&id).fields.title, "L2");
    assert!(fixture.sync().is_empty());
}

#[test]
fn true_conflict_with_remote_wins_pulls_remote() {
    let mut fixture = SyncFixture::new();
    fixture.config.conflict_strategy = ConflictStrategy::RemoteWins;
    let (id, _) = diverge(&fixture);

    let report = fixture.sync();

    assert_eq!(
        report.outcomes[0].action,
        Action::ResolveConflict {
            resolution: Resolution::PullRemote
        }
    );
    assert_eq!(fixture.load(&id).fields.title, "R2");
}

#[test]
fn newer_wins_takes_the_later_edit() {
    let mut fixture = SyncFixture::new();
    fixture.config.conflict_strategy = ConflictStrategy::NewerWins;
    let (id, _) = diverge(&fixture);

    fixture.sync();

    assert_eq!(fixture.load(&id).fields.title, "R2");
}

#[test]
fn both_sides_making_the_same_edit_converge_silently() {
    let fixture = SyncFixture::new();
    let issue = fixture.create(EntityKind::Issue, "Before");
    fixture.sync();
    let remote_id = linked_remote_id(&fixture, &issue.id);
    let calls = fixture.remote.push_calls();

    fixture.edit(&issue.id, Utc::now(), |f| f.title = "Same".into());
    fixture.remote.edit(&remote_id, Utc::now(), |f| f.title = "Same".into());
    let report = fixture.sync();

    assert!(report.is_empty(), "unexpected outcomes: {:?}", report.outcomes);
    assert_eq!(fixture.remote.push_calls(), calls);
    let record = fixture.record(&issue.id).expect("record");
    assert_eq!(
        record.last_pushed_fingerprint.as_deref(),
        Some(fixture.load(&issue.id).fingerprint().as_str())
    );
}

#[test]
fn pull_only_defers_a_conflict_that_local_would_win() {
    let fixture = SyncFixture::new();
    let (id, remote_id) = diverge(&fixture);

    let report = fixture
        .try_sync(&SyncOptions {
            direction: SyncDirection::PullOnly,
            ..SyncOptions::default()
        })
        .expect("sync");

    assert_eq!(report.conflicts_deferred, 1);
    assert_eq!(report.outcome(), RunOutcome::CompletedWithIssues);
    assert_eq!(fixture.load(&id).sync.sync_status, SyncStatus::Conflict);
    assert!(fixture.record(&id).expect("record").conflict_marker);
    assert_eq!(fixture.remote.get(&remote_id).expect("remote").fields.title, "R2");
}

#[test]
fn push_only_never_creates_local_files() {
    let fixture = SyncFixture::new();
    fixture
        .remote
        .insert_foreign(EntityKind::Issue, EntityFields::titled("Remote only"));

    let report = fixture
        .try_sync(&SyncOptions {
            direction: SyncDirection::PushOnly,
            ..SyncOptions::default()
        })
        .expect("sync");

    assert_eq!(report.pulled, 0);
    assert!(fixture.store.ids(&roadmap::storage::EntityFilter::all()).expect("ids").is_empty());
}

#[test]
fn rate_limited_push_is_retried_after_the_given_delay() {
    let fixture = SyncFixture::new();
    let issue = fixture.create(EntityKind::Issue, "Busy API");
    fixture.remote.fail_push(
        &issue.id,
        [BackendError::RateLimited {
            retry_after: Duration::from_secs(5),
        }],
    );

    let report = fixture.sync();

    assert_eq!(report.pushed, 1);
    assert_eq!(report.retries, 1);
    assert_eq!(report.outcomes[0].state, EntityState::Committed);
    assert_eq!(report.outcomes[0].retries, 1);
    assert_eq!(*fixture.remote.sleeper.slept.lock(), vec![Duration::from_secs(5)]);
}

#[test]
fn one_failing_entity_does_not_stop_the_others() {
    let fixture = SyncFixture::new();
    let bad = fixture.create(EntityKind::Issue, "Rejected");
    let good = fixture.create(EntityKind::Issue, "Accepted");
    fixture
        .remote
        .fail_push(&bad.id, [BackendError::Permanent("422 validation failed".into())]);

    let report = fixture.sync();

    assert_eq!(report.pushed, 1);
    assert_eq!(report.errors, 1);
    assert_eq!(report.outcome(), RunOutcome::CompletedWithIssues);
    let failed = report
        .outcomes
        .iter()
        .find(|o| o.entity_id == bad.id)
        .expect("failure reported");
    assert_eq!(failed.state, EntityState::Failed);
    assert_eq!(
        failed.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::PermanentRejection)
    );
    assert!(fixture.record(&good.id).is_some());
    assert!(fixture.record(&bad.id).is_none());
    assert_eq!(fixture.load(&bad.id).sync.sync_status, SyncStatus::Error);
    assert_eq!(fixture.load(&good.id).sync.sync_status, SyncStatus::Synced);

    // The cursor stays put, so the failed entity is retried next time.
    assert!(fixture.tracker().cursor(FAKE_BACKEND).expect("cursor").is_none());
    let retry = fixture.sync();
    assert_eq!(retry.pushed, 1);
    assert!(fixture.record(&bad.id).is_some());
    assert_eq!(fixture.load(&bad.id).sync.sync_status, SyncStatus::Synced);
}

#[test]
fn failed_update_of_linked_entity_keeps_baselines_and_flags_error() {
    let fixture = SyncFixture::new();
    let issue = fixture.create(EntityKind::Issue, "Linked");
    fixture.sync();
    let before = fixture.record(&issue.id).expect("linked");

    fixture.edit(&issue.id, Utc::now(), |f| f.title = "Linked, edited".into());
    fixture
        .remote
        .fail_push(&issue.id, [BackendError::Permanent("422 validation failed".into())]);
    let report = fixture.sync();

    assert_eq!(report.errors, 1);
    let local = fixture.load(&issue.id);
    assert_eq!(local.sync.sync_status, SyncStatus::Error);
    assert_eq!(local.remote_id(FAKE_BACKEND), Some(before.remote_id.as_str()));
    let after = fixture.record(&issue.id).expect("still linked");
    assert_eq!(after.last_pushed_fingerprint, before.last_pushed_fingerprint);
    assert_eq!(after.last_pulled_fingerprint, before.last_pulled_fingerprint);
    assert!(after.last_error.as_deref().is_some_and(|e| e.contains("422")));
    assert_eq!(
        fixture.remote.get(&before.remote_id).expect("remote").fields.title,
        "Linked"
    );

    assert_eq!(fixture.sync().pushed, 1);
    assert_eq!(fixture.load(&issue.id).sync.sync_status, SyncStatus::Synced);
}

#[test]
fn exhausted_transient_failures_are_reported_with_retries() {
    let fixture = SyncFixture::new();
    let issue = fixture.create(EntityKind::Issue, "Flaky");
    fixture.remote.fail_push(
        &issue.id,
        (0..3).map(|_| BackendError::Transient("502 bad gateway".into())),
    );

    let report = fixture.sync();

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.state, EntityState::Failed);
    assert_eq!(outcome.retries, 2);
    assert_eq!(
        outcome.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::NetworkTransient)
    );
}

#[test]
fn remote_only_entities_are_pulled_into_new_files() {
    let fixture = SyncFixture::new();
    let foreign = fixture
        .remote
        .insert_foreign(EntityKind::Milestone, EntityFields::titled("Q3"));
    let marked = fixture.remote.insert_marked(
        EntityKind::Issue,
        EntityFields::titled("Made on another clone"),
        "iss-0c0ffee0",
    );

    let report = fixture.sync();

    assert_eq!(report.pulled, 2);
    let restored = fixture.load("iss-0c0ffee0");
    assert_eq!(restored.fields.title, "Made on another clone");
    assert_eq!(restored.remote_id(FAKE_BACKEND), Some(marked.as_str()));

    let milestones = fixture
        .store
        .ids(&roadmap::storage::EntityFilter::kind(EntityKind::Milestone))
        .expect("ids");
    assert_eq!(milestones.len(), 1);
    assert!(milestones[0].starts_with("ms-"));
    assert_eq!(linked_remote_id(&fixture, &milestones[0]), foreign);
}

#[test]
fn unlinked_local_entity_adopts_its_marked_remote_copy() {
    let fixture = SyncFixture::new();
    let issue = fixture.create(EntityKind::Issue, "Lost state");
    let remote_id = fixture.remote.insert_marked(
        EntityKind::Issue,
        EntityFields::titled("Lost state"),
        &issue.id,
    );

    let report = fixture.sync();

    assert!(report.is_empty(), "unexpected outcomes: {:?}", report.outcomes);
    assert_eq!(fixture.remote.push_calls(), 0);
    assert_eq!(fixture.remote.all().len(), 1);
    assert_eq!(linked_remote_id(&fixture, &issue.id), remote_id);
    assert_eq!(fixture.load(&issue.id).remote_id(FAKE_BACKEND), Some(remote_id.as_str()));
}

#[test]
fn deleted_remote_is_reported_under_ignore() {
    let fixture = SyncFixture::new();
    let issue = fixture.create(EntityKind::Issue, "Gone upstream");
    fixture.sync();
    let remote_id = linked_remote_id(&fixture, &issue.id);
    fixture.remote.delete(&remote_id);

    // An incremental listing cannot tell a deletion from no change.
    assert!(fixture.sync().is_empty());

    let report = fixture.sync_full();
    let outcome = &report.outcomes[0];
    assert_eq!(outcome.action, Action::RemoteDeleted);
    assert_eq!(
        outcome.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::RemoteDeleted)
    );
    let record = fixture.record(&issue.id).expect("link kept");
    assert!(record.last_error.is_some());
    assert!(fixture.remote.all().is_empty());
    assert_eq!(fixture.load(&issue.id).sync.sync_status, SyncStatus::Error);
}

#[test]
fn deleted_remote_is_unlinked_under_unlink() {
    let mut fixture = SyncFixture::new();
    fixture.config.on_remote_deleted = RemoteDeletedPolicy::Unlink;
    let issue = fixture.create(EntityKind::Issue, "Gone upstream");
    fixture.sync();
    fixture.remote.delete(&linked_remote_id(&fixture, &issue.id));

    let report = fixture.sync_full();

    assert_eq!(report.outcomes[0].action, Action::Unlink);
    assert!(fixture.record(&issue.id).is_none());
    let saved = fixture.load(&issue.id);
    assert_eq!(saved.remote_id(FAKE_BACKEND), None);
    assert_eq!(saved.sync.sync_status, SyncStatus::Pending);
}

#[test]
fn deleted_remote_is_recreated_under_recreate() {
    let mut fixture = SyncFixture::new();
    fixture.config.on_remote_deleted = RemoteDeletedPolicy::Recreate;
    let issue = fixture.create(EntityKind::Issue, "Gone upstream");
    fixture.sync();
    let old = linked_remote_id(&fixture, &issue.id);
    fixture.remote.delete(&old);

    let report = fixture.sync_full();

    assert_eq!(report.outcomes[0].action, Action::Push { created: true });
    let new = linked_remote_id(&fixture, &issue.id);
    assert_ne!(new, old);
    assert!(fixture.remote.get(&new).is_some());
    assert_eq!(fixture.load(&issue.id).remote_id(FAKE_BACKEND), Some(new.as_str()));
}

#[test]
fn orphan_closure_closes_only_tool_created_entities_whose_file_is_gone() {
    let mut fixture = SyncFixture::new();
    fixture.config.orphan_closure = true;
    let doomed = fixture.create(EntityKind::Issue, "Deleted locally");
    let kept = fixture.create(EntityKind::Issue, "Still here");
    fixture
        .remote
        .insert_foreign(EntityKind::Issue, EntityFields::titled("Filed by a human"));
    fixture.sync();
    let doomed_remote = linked_remote_id(&fixture, &doomed.id);

    fs::remove_file(fixture.store.path_for(EntityKind::Issue, &doomed.id).expect("path"))
        .expect("remove");
    let report = fixture.sync();

    assert_eq!(report.orphans_closed, 1);
    assert_eq!(fixture.remote.closed(), vec![doomed_remote.clone()]);
    assert!(fixture.remote.get(&doomed_remote).expect("remote").closed);
    assert!(fixture.record(&kept.id).is_some());
    assert!(!fixture.store.exists(&doomed.id));

    // The closed copy is neither closed again nor pulled back in.
    let again = fixture.sync();
    assert!(again.is_empty(), "unexpected outcomes: {:?}", again.outcomes);
    assert!(!fixture.store.exists(&doomed.id));
}

#[test]
fn without_orphan_closure_a_deleted_file_is_left_alone() {
    let fixture = SyncFixture::new();
    let doomed = fixture.create(EntityKind::Issue, "Deleted locally");
    fixture.sync();
    fs::remove_file(fixture.store.path_for(EntityKind::Issue, &doomed.id).expect("path"))
        .expect("remove");

    let report = fixture.sync_full();

    assert!(report.is_empty(), "unexpected outcomes: {:?}", report.outcomes);
    assert!(fixture.remote.closed().is_empty());
    assert!(!fixture.store.exists(&doomed.id));
}

#[test]
fn dry_run_plans_without_writing() {
    let fixture = SyncFixture::new();
    let issue = fixture.create(EntityKind::Issue, "Planned");
    let before = fs::read_to_string(fixture.store.path_for(EntityKind::Issue, &issue.id).expect("path"))
        .expect("read");

    let report = fixture
        .try_sync(&SyncOptions {
            dry_run: true,
            ..SyncOptions::default()
        })
        .expect("sync");

    assert!(report.dry_run);
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].state, EntityState::Planned);
    assert_eq!(report.outcomes[0].action, Action::Push { created: true });
    assert_eq!(fixture.remote.push_calls(), 0);
    assert!(fixture.record(&issue.id).is_none());
    assert!(fixture.tracker().cursor(FAKE_BACKEND).expect("cursor").is_none());
    let after = fs::read_to_string(fixture.store.path_for(EntityKind::Issue, &issue.id).expect("path"))
        .expect("read");
    assert_eq!(before, after);
}

#[test]
fn rejected_credentials_end_the_run_with_an_auth_error() {
    let fixture = SyncFixture::new();
    fixture.create(EntityKind::Issue, "Waiting");
    fixture
        .remote
        .reject_auth(BackendError::Unauthenticated("bad token".into()));

    let report = fixture.sync();

    let error = report.run_error.as_ref().expect("run error");
    assert_eq!(error.kind, ErrorKind::AuthError);
    assert_eq!(report.outcome(), RunOutcome::CompletedWithIssues);
    assert_eq!(fixture.remote.push_calls(), 0);
}

#[test]
fn unreachable_backend_fails_the_run() {
    let fixture = SyncFixture::new();
    fixture.remote.set_unreachable();

    let result = fixture.try_sync(&SyncOptions::default());

    assert!(matches!(result, Err(RoadmapError::Connectivity(_))));
}

#[test]
fn unreadable_file_is_skipped_and_flagged() {
    let fixture = SyncFixture::new();
    let good = fixture.create(EntityKind::Issue, "Fine");
    let broken = fixture
        .store
        .path_for(EntityKind::Issue, "iss-deadbeef")
        .expect("path");
    fs::write(&broken, "---\ntitle: [unterminated\n").expect("write");

    let report = fixture.sync();

    let skipped = report
        .outcomes
        .iter()
        .find(|o| o.entity_id == "iss-deadbeef")
        .expect("corruption reported");
    assert_eq!(skipped.action, Action::Skip);
    assert_eq!(
        skipped.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::LocalCorruption)
    );
    assert!(fixture.record(&good.id).is_some());
}

#[test]
fn cancelled_run_starts_nothing_and_keeps_the_cursor() {
    let fixture = SyncFixture::new();
    fixture.create(EntityKind::Issue, "Not yet");
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = fixture
        .try_sync_with(&SyncOptions::default(), &cancel)
        .expect("sync");

    assert!(report.cancelled);
    assert_eq!(fixture.remote.push_calls(), 0);
    assert!(fixture.tracker().cursor(FAKE_BACKEND).expect("cursor").is_none());
}

#[test]
fn held_lock_times_out() {
    let mut fixture = SyncFixture::new();
    fixture.config.lock_timeout = Duration::from_millis(100);
    let _held = RunLock::acquire_timeout(fixture.store.data_dir(), Duration::from_secs(1))
        .expect("first lock");

    let result = fixture.try_sync(&SyncOptions::default());

    assert!(matches!(result, Err(RoadmapError::LockTimeout(_))));
}
