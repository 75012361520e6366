//! Two clones syncing through a local bare repository.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use git2::Repository;
use tempfile::TempDir;

use roadmap::config::{GitConfig, SyncConfig};
use roadmap::core::{Entity, EntityFields, EntityKind};
use roadmap::storage::EntityStore;
use roadmap::sync::retry::{RetryPolicy, ThreadSleeper};
use roadmap::sync::{
    Action, Backend, CancelToken, GitBackend, PushOutcome, PushRequest, SyncOptions,
    SyncOrchestrator, SyncReport,
};

fn bare_remote() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    let repo = Repository::init_bare(dir.path()).expect("init bare");
    repo.set_head("refs/heads/main").expect("set head");
    dir
}

struct Checkout {
    _dir: TempDir,
    store: EntityStore,
    backend: GitBackend,
    config: SyncConfig,
}

impl Checkout {
    fn of(remote: &Path) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let store = EntityStore::open(dir.path(), 2).expect("store");
        let git = GitConfig {
            url: Some(remote.to_string_lossy().into_owned()),
            ..GitConfig::default()
        };
        let backend = GitBackend::with_retry(
            &git,
            store.data_dir(),
            None,
            RetryPolicy::none(),
            Arc::new(ThreadSleeper),
        )
        .expect("git backend");
        Self {
            _dir: dir,
            store,
            backend,
            config: SyncConfig::default(),
        }
    }

    fn sync(&self) -> SyncReport {
        SyncOrchestrator::new(&self.store, &self.backend, &self.config)
            .run(&SyncOptions::default(), &CancelToken::new())
            .expect("sync run")
    }

    fn create(&self, title: &str) -> Entity {
        let entity = Entity::new(EntityKind::Issue, EntityFields::titled(title));
        self.store.save(&entity).expect("save");
        entity
    }

    fn retitle(&self, id: &str, title: &str) {
        let mut entity = self.store.load(id).expect("load");
        entity.fields.title = title.to_string();
        entity.updated_at = Some(Utc::now());
        self.store.save(&entity).expect("save");
    }

    fn title(&self, id: &str) -> String {
        self.store.load(id).expect("load").fields.title
    }
}

fn commit_count(remote: &Path) -> usize {
    let repo = Repository::open_bare(remote).expect("open bare");
    let mut walk = repo.revwalk().expect("revwalk");
    walk.push_ref("refs/heads/main").expect("branch exists");
    walk.count()
}

#[test]
fn edits_travel_between_clones() {
    let remote = bare_remote();
    let alice = Checkout::of(remote.path());
    let bob = Checkout::of(remote.path());
    let issue = alice.create("Write the README");

    assert_eq!(alice.sync().pushed, 1);
    let pulled = bob.sync();
    assert_eq!(pulled.pulled, 1);
    assert_eq!(bob.title(&issue.id), "Write the README");

    bob.retitle(&issue.id, "Write the README and CHANGELOG");
    assert_eq!(bob.sync().pushed, 1);
    assert_eq!(alice.sync().pulled, 1);
    assert_eq!(alice.title(&issue.id), "Write the README and CHANGELOG");

    assert!(alice.sync().is_empty());
    assert!(bob.sync().is_empty());
}

#[test]
fn concurrent_edits_resolve_with_local_wins_on_the_second_clone() {
    let remote = bare_remote();
    let alice = Checkout::of(remote.path());
    let bob = Checkout::of(remote.path());
    let issue = alice.create("Original");
    alice.sync();
    bob.sync();

    alice.retitle(&issue.id, "Alice's title");
    bob.retitle(&issue.id, "Bob's title");
    alice.sync();
    let report = bob.sync();

    assert_eq!(report.conflicts_resolved, 1);
    assert!(matches!(report.outcomes[0].action, Action::ResolveConflict { .. }));
    alice.sync();
    assert_eq!(alice.title(&issue.id), "Bob's title");
}

#[test]
fn pushes_of_one_run_share_a_commit() {
    let remote = bare_remote();
    let alice = Checkout::of(remote.path());
    for title in ["One", "Two", "Three"] {
        alice.create(title);
    }

    let report = alice.sync();

    assert_eq!(report.pushed, 3);
    assert_eq!(commit_count(remote.path()), 1);
}

#[test]
fn orphan_closure_marks_the_shared_file_closed() {
    let remote = bare_remote();
    let mut alice = Checkout::of(remote.path());
    alice.config.orphan_closure = true;
    let issue = alice.create("Abandoned");
    alice.sync();

    std::fs::remove_file(
        alice
            .store
            .path_for(EntityKind::Issue, &issue.id)
            .expect("path"),
    )
    .expect("remove");
    let report = alice.sync();
    assert_eq!(report.orphans_closed, 1);

    let bob = Checkout::of(remote.path());
    bob.sync();
    let copy = bob.store.load(&issue.id).expect("pulled");
    assert!(copy.fields.is_closed());
}

#[test]
fn one_bad_request_does_not_sink_its_batch() {
    let remote = bare_remote();
    let alice = Checkout::of(remote.path());
    let good = alice.create("Valid");
    let bad = alice.create("Escaping");
    let requests = [
        PushRequest {
            entity: bad.clone(),
            existing_remote_id: Some("issues/../x.md".to_string()),
        },
        PushRequest {
            entity: good.clone(),
            existing_remote_id: None,
        },
    ];

    let mut results = alice.backend.push_batch(&requests);

    let failure = results.remove(&bad.id).expect("bad result").expect_err("rejected");
    assert!(failure.error.to_string().contains("invalid remote id"));
    let pushed = results.remove(&good.id).expect("good result").expect("pushed");
    assert!(matches!(pushed.value, PushOutcome::Pushed { created: true, .. }));
    assert_eq!(commit_count(remote.path()), 1);
}
