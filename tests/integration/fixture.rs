//! Shared helpers: an isolated entity store and a scripted in-memory
//! backend.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;

use roadmap::config::SyncConfig;
use roadmap::core::{Entity, EntityFields, EntityKind};
use roadmap::storage::EntityStore;
use roadmap::sync::retry::{RetryPolicy, Sleeper, classify, retry};
use roadmap::sync::{
    Backend, BackendError, BackendResult, CancelToken, PushOutcome, RemoteEntity, Retried,
    SyncOptions, SyncOrchestrator, SyncRecord, SyncReport, SyncStateTracker,
};

pub const FAKE_BACKEND: &str = "fake";

/// Records requested delays instead of sleeping.
#[derive(Default)]
pub struct RecordingSleeper {
    pub slept: Mutex<Vec<Duration>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.lock().push(duration);
    }
}

#[derive(Default)]
struct FakeState {
    entities: BTreeMap<String, RemoteEntity>,
    next_number: u64,
    /// Errors returned, in order, by push attempts for a local id.
    push_failures: BTreeMap<String, VecDeque<BackendError>>,
    auth_error: Option<BackendError>,
    unreachable: bool,
    push_calls: usize,
    closed: Vec<String>,
}

/// Lossless in-memory remote. Retries go through the real retry combinator
/// with a recording sleeper.
pub struct FakeRemote {
    state: Mutex<FakeState>,
    policy: RetryPolicy,
    pub sleeper: Arc<RecordingSleeper>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            policy: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                backoff_multiplier: 2.0,
                jitter_factor: 0.0,
            },
            sleeper: Arc::new(RecordingSleeper::default()),
        }
    }
}

impl FakeRemote {
    pub fn fail_push(&self, local_id: &str, errors: impl IntoIterator<Item = BackendError>) {
        self.state
            .lock()
            .push_failures
            .entry(local_id.to_string())
            .or_default()
            .extend(errors);
    }

    pub fn reject_auth(&self, error: BackendError) {
        self.state.lock().auth_error = Some(error);
    }

    pub fn set_unreachable(&self) {
        self.state.lock().unreachable = true;
    }

    pub fn get(&self, remote_id: &str) -> Option<RemoteEntity> {
        self.state.lock().entities.get(remote_id).cloned()
    }

    pub fn all(&self) -> Vec<RemoteEntity> {
        self.state.lock().entities.values().cloned().collect()
    }

    pub fn push_calls(&self) -> usize {
        self.state.lock().push_calls
    }

    pub fn closed(&self) -> Vec<String> {
        self.state.lock().closed.clone()
    }

    /// Simulate someone editing the remote copy.
    pub fn edit(&self, remote_id: &str, at: DateTime<Utc>, f: impl FnOnce(&mut EntityFields)) {
        let mut state = self.state.lock();
        let remote = state.entities.get_mut(remote_id).expect("remote entity exists");
        f(&mut remote.fields);
        remote.closed = remote.fields.is_closed();
        remote.updated_at = Some(at);
    }

    pub fn delete(&self, remote_id: &str) {
        self.state.lock().entities.remove(remote_id);
    }

    /// A remote entity created outside this tool.
    pub fn insert_foreign(&self, kind: EntityKind, fields: EntityFields) -> String {
        self.insert(kind, fields, None)
    }

    /// A remote entity carrying this tool's marker for `local_id`.
    pub fn insert_marked(&self, kind: EntityKind, fields: EntityFields, local_id: &str) -> String {
        self.insert(kind, fields, Some(local_id.to_string()))
    }

    fn insert(&self, kind: EntityKind, fields: EntityFields, local_id: Option<String>) -> String {
        let mut state = self.state.lock();
        state.next_number += 1;
        let remote_id = state.next_number.to_string();
        let entity = RemoteEntity {
            remote_id: remote_id.clone(),
            kind,
            created_by_tool: local_id.is_some(),
            local_id,
            closed: fields.is_closed(),
            fields,
            updated_at: Some(Utc::now()),
        };
        state.entities.insert(remote_id.clone(), entity);
        remote_id
    }

    fn attempt_push(&self, entity: &Entity, existing: Option<&str>) -> Result<PushOutcome, BackendError> {
        let mut state = self.state.lock();
        state.push_calls += 1;
        if let Some(error) = state
            .push_failures
            .get_mut(&entity.id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        let now = Utc::now();
        match existing {
            Some(remote_id) => {
                let Some(remote) = state.entities.get_mut(remote_id) else {
                    return Ok(PushOutcome::RemoteDeleted {
                        remote_id: remote_id.to_string(),
                    });
                };
                remote.fields = entity.fields.clone();
                remote.closed = entity.fields.is_closed();
                remote.updated_at = Some(now);
                Ok(PushOutcome::Pushed {
                    remote_id: remote_id.to_string(),
                    created: false,
                    remote: remote.clone(),
                })
            }
            None => {
                state.next_number += 1;
                let remote_id = state.next_number.to_string();
                let remote = RemoteEntity {
                    remote_id: remote_id.clone(),
                    kind: entity.kind,
                    local_id: Some(entity.id.clone()),
                    created_by_tool: true,
                    closed: entity.fields.is_closed(),
                    fields: entity.fields.clone(),
                    updated_at: Some(now),
                };
                state.entities.insert(remote_id.clone(), remote.clone());
                Ok(PushOutcome::Pushed {
                    remote_id,
                    created: true,
                    remote,
                })
            }
        }
    }
}

impl Backend for FakeRemote {
    fn name(&self) -> &str {
        FAKE_BACKEND
    }

    fn authenticate(&self) -> Result<(), BackendError> {
        match &self.state.lock().auth_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn list_remote(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteEntity>, BackendError> {
        Ok(self
            .state
            .lock()
            .entities
            .values()
            .filter(|r| match (since, r.updated_at) {
                (Some(since), Some(at)) => at >= since,
                _ => true,
            })
            .cloned()
            .collect())
    }

    fn push_one(&self, entity: &Entity, existing_remote_id: Option<&str>) -> BackendResult<PushOutcome> {
        retry(&self.policy, self.sleeper.as_ref(), classify, |_| {
            self.attempt_push(entity, existing_remote_id)
        })
    }

    fn pull(&self, remote_ids: Option<&[String]>) -> Result<Vec<RemoteEntity>, BackendError> {
        let state = self.state.lock();
        Ok(match remote_ids {
            Some(ids) => ids.iter().filter_map(|id| state.entities.get(id).cloned()).collect(),
            None => state.entities.values().cloned().collect(),
        })
    }

    fn check_connectivity(&self) -> Result<(), String> {
        if self.state.lock().unreachable {
            Err("fake remote is unreachable".to_string())
        } else {
            Ok(())
        }
    }

    fn close_remote(&self, remote_id: &str) -> BackendResult<()> {
        let mut state = self.state.lock();
        let Some(remote) = state.entities.get_mut(remote_id) else {
            return Err(BackendError::NotFound(remote_id.to_string()).into());
        };
        remote.closed = true;
        remote.fields.status = "closed".to_string();
        remote.updated_at = Some(Utc::now());
        state.closed.push(remote_id.to_string());
        Ok(Retried::first_try(()))
    }

    fn max_concurrency(&self) -> usize {
        4
    }
}

/// An isolated project with its own store and a fake remote.
pub struct SyncFixture {
    pub dir: TempDir,
    pub store: EntityStore,
    pub config: SyncConfig,
    pub remote: FakeRemote,
}

impl SyncFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let store = EntityStore::open(dir.path(), 2).expect("open store");
        Self {
            dir,
            store,
            config: SyncConfig::default(),
            remote: FakeRemote::default(),
        }
    }

    pub fn create(&self, kind: EntityKind, title: &str) -> Entity {
        let entity = Entity::new(kind, EntityFields::titled(title));
        self.store.save(&entity).expect("save entity");
        entity
    }

    pub fn load(&self, id: &str) -> Entity {
        self.store.load(id).expect("load entity")
    }

    /// Edit the local file as a user would, stamping `updated_at`.
    pub fn edit(&self, id: &str, at: DateTime<Utc>, f: impl FnOnce(&mut EntityFields)) {
        let mut entity = self.load(id);
        f(&mut entity.fields);
        entity.updated_at = Some(at);
        self.store.save(&entity).expect("save entity");
    }

    pub fn tracker(&self) -> SyncStateTracker {
        SyncStateTracker::new(self.store.data_dir())
    }

    pub fn record(&self, id: &str) -> Option<SyncRecord> {
        self.tracker().get(id, FAKE_BACKEND).expect("read record")
    }

    pub fn try_sync(&self, options: &SyncOptions) -> roadmap::Result<SyncReport> {
        self.try_sync_with(options, &CancelToken::new())
    }

    pub fn try_sync_with(&self, options: &SyncOptions, cancel: &CancelToken) -> roadmap::Result<SyncReport> {
        SyncOrchestrator::new(&self.store, &self.remote, &self.config).run(options, cancel)
    }

    pub fn sync(&self) -> SyncReport {
        self.try_sync(&SyncOptions::default()).expect("sync run")
    }

    pub fn sync_full(&self) -> SyncReport {
        self.try_sync(&SyncOptions {
            full: true,
            ..SyncOptions::default()
        })
        .expect("sync run")
    }
}
