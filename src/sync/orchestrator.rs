//! One sync run against one backend.
//!
//! A run takes the per-project lock, checks the remote, builds a local
//! snapshot (from the index when fresh) and a remote listing, plans one
//! step per entity and executes the steps on a worker pool sized by the
//! backend. For every step that touches the remote the order is fixed:
//! backend call, then the sync record, then the entity file. A failed
//! record write aborts the run; everything else fails only its entity.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::backend::{Backend, BackendError, BackendResult, PushOutcome, PushRequest, RemoteEntity, Retried};
use super::config::{RemoteDeletedPolicy, SyncDirection};
use super::conflict::{ChangeClass, ConflictResolver, Resolution, Timestamps, classify};
use super::report::{Action, EntityOutcome, ErrorKind, SyncReport};
use super::state::{SyncRecord, SyncStateTracker};
use crate::config::SyncConfig;
use crate::core::{Entity, EntityKind, SyncStatus, fingerprint};
use crate::error::{Result, RoadmapError};
use crate::storage::{EntityFilter, EntityIndex, EntityStore, IndexQuery, IndexedEntity, RunLock};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Compute and report actions without writing anything.
    pub dry_run: bool,
    /// List everything instead of changes since the last cursor.
    pub full: bool,
    pub direction: SyncDirection,
    /// Stop starting new entities after this long.
    pub timeout: Option<Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            full: false,
            direction: SyncDirection::Bidirectional,
            timeout: None,
        }
    }
}

/// Cooperative cancellation, checked before each entity starts. In-flight
/// entities always finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// What the planner knows about one local entity.
#[derive(Debug, Clone)]
struct LocalEntry {
    id: String,
    kind: EntityKind,
    fingerprint: String,
    remote_id: Option<String>,
}

impl From<IndexedEntity> for LocalEntry {
    fn from(row: IndexedEntity) -> Self {
        Self {
            id: row.id,
            kind: row.kind,
            fingerprint: row.fingerprint,
            remote_id: row.remote_id,
        }
    }
}

#[derive(Debug, Clone)]
enum Step {
    Push { remote_id: Option<String> },
    Pull { remote: RemoteEntity, created: bool },
    /// Both sides changed; decided at execution time after merging.
    Reconcile { remote: RemoteEntity },
    /// Both sides already agree; only baselines move.
    Converged { remote: RemoteEntity },
    RemoteDeleted { remote_id: String },
    CloseOrphan { remote_id: String },
}

#[derive(Debug, Clone)]
struct Task {
    entity_id: String,
    kind: EntityKind,
    record: Option<SyncRecord>,
    step: Step,
}

enum TaskResult {
    Done(Option<EntityOutcome>),
    Skipped,
}

/// Local ids linked through a sync record whose entity file is gone, while
/// the remote copy is still open and was created by this tool. Entities
/// present on disk (even unreadable ones) are never candidates.
#[must_use]
pub fn orphan_candidates(
    remotes: &BTreeMap<String, RemoteEntity>,
    records: &BTreeMap<String, SyncRecord>,
    on_disk: &BTreeSet<String>,
) -> Vec<(String, String)> {
    records
        .values()
        .filter(|record| !on_disk.contains(&record.entity_id))
        .filter_map(|record| {
            let remote = remotes.get(&record.remote_id)?;
            (remote.created_by_tool && !remote.closed)
                .then(|| (record.entity_id.clone(), record.remote_id.clone()))
        })
        .collect()
}

struct Inventory {
    locals: BTreeMap<String, LocalEntry>,
    on_disk: BTreeSet<String>,
    corrupt: BTreeSet<String>,
    records: BTreeMap<String, SyncRecord>,
    remotes: BTreeMap<String, RemoteEntity>,
    /// Remote ids whose absence from `remotes` means deletion.
    authoritative: BTreeSet<String>,
    complete: bool,
}

impl Inventory {
    fn absence_is_deletion(&self, remote_id: &str) -> bool {
        self.complete || self.authoritative.contains(remote_id)
    }
}

pub struct SyncOrchestrator<'a> {
    store: &'a EntityStore,
    backend: &'a dyn Backend,
    settings: &'a SyncConfig,
    tracker: SyncStateTracker,
    resolver: ConflictResolver,
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(store: &'a EntityStore, backend: &'a dyn Backend, settings: &'a SyncConfig) -> Self {
        Self {
            tracker: SyncStateTracker::new(store.data_dir()),
            resolver: ConflictResolver::new(settings.conflict_strategy),
            store,
            backend,
            settings,
        }
    }

    #[must_use]
    pub const fn tracker(&self) -> &SyncStateTracker {
        &self.tracker
    }

    /// Run one sync. `Err` means the run itself failed (lock, connectivity,
    /// listing, or a sync record that could not be written); per-entity
    /// failures are in the report.
    pub fn run(&self, options: &SyncOptions, cancel: &CancelToken) -> Result<SyncReport> {
        let backend = self.backend.name().to_string();
        let mut report = SyncReport::new(&backend, options.dry_run);
        info!(
            backend = %backend,
            dry_run = options.dry_run,
            direction = ?options.direction,
            strategy = %self.settings.conflict_strategy,
            "Starting sync"
        );

        let _lock = if options.dry_run {
            None
        } else {
            Some(RunLock::acquire_timeout(
                self.store.data_dir(),
                self.settings.lock_timeout,
            )?)
        };

        self.backend
            .check_connectivity()
            .map_err(RoadmapError::Connectivity)?;
        if let Err(error) = self.backend.authenticate() {
            warn!(backend = %backend, error = %error, "Authentication failed; nothing synced");
            report.abort_with(ErrorKind::from(&error), error.to_string());
            report.finish();
            return Ok(report);
        }

        let inventory = match self.inventory(options, &mut report)? {
            Some(inventory) => inventory,
            None => {
                report.finish();
                return Ok(report);
            }
        };
        let tasks = self.plan(&inventory, options.direction);
        debug!(tasks = tasks.len(), locals = inventory.locals.len(), remotes = inventory.remotes.len(), "Planned sync");

        if options.dry_run {
            for task in &tasks {
                if let Some(outcome) = self.preview(task, options.direction) {
                    report.record(outcome);
                }
            }
        } else {
            self.execute(tasks, options.direction, cancel, &mut report)?;
            if !report.cancelled && report.errors == 0 {
                self.tracker.set_cursor(&backend, report.started_at)?;
            }
        }

        report.finish();
        info!(
            backend = %backend,
            pushed = report.pushed,
            pulled = report.pulled,
            conflicts_resolved = report.conflicts_resolved,
            conflicts_deferred = report.conflicts_deferred,
            orphans_closed = report.orphans_closed,
            errors = report.errors,
            cancelled = report.cancelled,
            "Sync finished"
        );
        Ok(report)
    }

    /// Local snapshot, sync records and remote listing. `None` when the
    /// listing was refused for credentials (recorded in the report).
    fn inventory(&self, options: &SyncOptions, report: &mut SyncReport) -> Result<Option<Inventory>> {
        let backend = self.backend.name();
        let records = self.tracker.records(backend)?;
        let (locals, on_disk, corrupt) = self.local_snapshot(options.dry_run, report)?;

        let cursor = self.tracker.cursor(backend)?;
        let complete = options.full || self.settings.orphan_closure || cursor.is_none();
        let since = if complete { None } else { cursor };
        let listed = match self.backend.list_remote(since) {
            Ok(listed) => listed,
            Err(error @ BackendError::Unauthenticated(_)) => {
                report.abort_with(ErrorKind::AuthError, error.to_string());
                return Ok(None);
            }
            Err(error) => {
                return Err(RoadmapError::Connectivity(format!("listing {backend} failed: {error}")));
            }
        };
        let mut remotes: BTreeMap<String, RemoteEntity> = listed
            .into_iter()
            .map(|remote| (remote.remote_id.clone(), remote))
            .collect();

        // An incremental listing says nothing about linked entities without
        // a baseline; fetch those explicitly.
        let mut authoritative = BTreeSet::new();
        if !complete {
            let unknown: Vec<String> = locals
                .values()
                .filter_map(|local| {
                    let record = records.get(&local.id);
                    let remote_id = record.map(|r| r.remote_id.clone()).or_else(|| local.remote_id.clone())?;
                    let has_baseline = record.is_some_and(SyncRecord::has_baseline);
                    (!has_baseline && !remotes.contains_key(&remote_id)).then_some(remote_id)
                })
                .collect();
            if !unknown.is_empty() {
                let fetched = self.backend.pull(Some(&unknown)).map_err(|error| {
                    RoadmapError::Connectivity(format!("fetching {backend} entities failed: {error}"))
                })?;
                for remote in fetched {
                    remotes.insert(remote.remote_id.clone(), remote);
                }
                authoritative.extend(unknown);
            }
        }
        debug!(listed = remotes.len(), complete, "Remote listing ready");

        Ok(Some(Inventory {
            locals,
            on_disk,
            corrupt,
            records,
            remotes,
            authoritative,
            complete,
        }))
    }

    /// Entities on disk, preferring index rows and loading the rest. Files
    /// that cannot be read are reported and excluded from planning.
    fn local_snapshot(
        &self,
        dry_run: bool,
        report: &mut SyncReport,
    ) -> Result<(BTreeMap<String, LocalEntry>, BTreeSet<String>, BTreeSet<String>)> {
        let on_disk: BTreeSet<String> = self.store.ids(&EntityFilter::all())?.into_iter().collect();
        let mut locals = BTreeMap::new();
        match self.indexed_entries(dry_run) {
            Ok(rows) => {
                for row in rows {
                    if on_disk.contains(&row.id) {
                        locals.insert(row.id.clone(), LocalEntry::from(row));
                    }
                }
            }
            Err(e) => warn!(error = %e, "Entity index unavailable; scanning files"),
        }

        let mut corrupt = BTreeSet::new();
        for id in &on_disk {
            if locals.contains_key(id) {
                continue;
            }
            match self.store.load(id) {
                Ok(entity) => {
                    locals.insert(
                        id.clone(),
                        LocalEntry {
                            id: id.clone(),
                            kind: entity.kind,
                            fingerprint: entity.fingerprint(),
                            remote_id: entity.remote_id(self.backend.name()).map(str::to_string),
                        },
                    );
                }
                Err(e) => {
                    warn!(entity_id = %id, error = %e, "Skipping unreadable entity");
                    report.record(EntityOutcome::failed(
                        id.clone(),
                        Action::Skip,
                        ErrorKind::LocalCorruption,
                        e.to_string(),
                    ));
                    corrupt.insert(id.clone());
                }
            }
        }
        Ok((locals, on_disk, corrupt))
    }

    fn indexed_entries(&self, dry_run: bool) -> Result<Vec<IndexedEntity>> {
        let data_dir = self.store.data_dir();
        let index = if dry_run {
            EntityIndex::open_existing(data_dir)?
        } else {
            Some(EntityIndex::open(data_dir)?)
        };
        let Some(mut index) = index else {
            return Ok(Vec::new());
        };
        if index.is_stale(self.store)? {
            if dry_run {
                return Ok(Vec::new());
            }
            let stats = index.rebuild_from_store(self.store)?;
            debug!(indexed = stats.indexed, skipped = stats.skipped, "Rebuilt entity index");
        }
        index.snapshot(&IndexQuery::default(), Some(self.backend.name()))
    }

    fn plan(&self, inv: &Inventory, direction: SyncDirection) -> Vec<Task> {
        let owners: BTreeMap<&str, &SyncRecord> = inv
            .records
            .values()
            .map(|record| (record.remote_id.as_str(), record))
            .collect();
        let mut linked: BTreeSet<String> = owners.keys().map(|id| (*id).to_string()).collect();
        linked.extend(inv.locals.values().filter_map(|l| l.remote_id.clone()));

        // Remote copies carrying a local id but linked to nothing yet.
        let mut adoptable: BTreeMap<&str, &RemoteEntity> = BTreeMap::new();
        for remote in inv.remotes.values() {
            if linked.contains(&remote.remote_id) {
                continue;
            }
            if let Some(local_id) = remote.local_id.as_deref() {
                adoptable.entry(local_id).or_insert(remote);
            }
        }

        let mut tasks = Vec::new();
        let mut claimed = BTreeSet::new();
        for local in inv.locals.values() {
            let record = inv.records.get(&local.id);
            let task = |step| Task {
                entity_id: local.id.clone(),
                kind: local.kind,
                record: record.cloned(),
                step,
            };
            let remote_id = record
                .map(|r| r.remote_id.clone())
                .or_else(|| local.remote_id.clone());

            let Some(remote_id) = remote_id else {
                if let Some(remote) = adoptable.get(local.id.as_str()) {
                    claimed.insert(remote.remote_id.clone());
                    debug!(entity_id = %local.id, remote_id = %remote.remote_id, "Adopting remote copy");
                    if let Some(step) = self.plan_linked(local, None, remote, direction) {
                        tasks.push(task(step));
                    }
                } else if direction.allows_push() {
                    tasks.push(task(Step::Push { remote_id: None }));
                }
                continue;
            };
            claimed.insert(remote_id.clone());

            match inv.remotes.get(&remote_id) {
                Some(remote) => {
                    if let Some(step) = self.plan_linked(local, record, remote, direction) {
                        tasks.push(task(step));
                    }
                }
                None if inv.absence_is_deletion(&remote_id) => {
                    tasks.push(task(Step::RemoteDeleted { remote_id }));
                }
                None => {
                    // Not in the incremental listing: the remote is as last pulled.
                    let Some(last_pulled) = record.and_then(|r| r.last_pulled_fingerprint.as_deref()) else {
                        continue;
                    };
                    let class = classify(
                        &local.fingerprint,
                        last_pulled,
                        record.and_then(|r| r.last_pushed_fingerprint.as_deref()),
                        Some(last_pulled),
                    );
                    if class == ChangeClass::LocalOnly && direction.allows_push() {
                        tasks.push(task(Step::Push {
                            remote_id: Some(remote_id),
                        }));
                    }
                }
            }
        }

        if self.settings.orphan_closure && inv.complete && direction.allows_push() {
            for (entity_id, remote_id) in orphan_candidates(&inv.remotes, &inv.records, &inv.on_disk) {
                claimed.insert(remote_id.clone());
                let record = inv.records.get(&entity_id).cloned();
                let kind = inv.remotes.get(&remote_id).map_or(EntityKind::Issue, |r| r.kind);
                info!(entity_id = %entity_id, remote_id = %remote_id, "Orphaned remote entity");
                tasks.push(Task {
                    entity_id,
                    kind,
                    record,
                    step: Step::CloseOrphan { remote_id },
                });
            }
        }

        if direction.allows_pull() {
            let mut taken: BTreeSet<String> = inv.on_disk.clone();
            for remote in inv.remotes.values() {
                if claimed.contains(&remote.remote_id) || owners.contains_key(remote.remote_id.as_str()) {
                    continue;
                }
                let entity_id = match remote.local_id.as_deref() {
                    Some(id) if inv.corrupt.contains(id) => continue,
                    Some(id) if !taken.contains(id) && self.store.path_for(remote.kind, id).is_ok() => {
                        id.to_string()
                    }
                    _ => Entity::allocate_id(remote.kind),
                };
                taken.insert(entity_id.clone());
                tasks.push(Task {
                    entity_id,
                    kind: remote.kind,
                    record: None,
                    step: Step::Pull {
                        remote: remote.clone(),
                        created: true,
                    },
                });
            }
        }
        tasks
    }

    fn plan_linked(
        &self,
        local: &LocalEntry,
        record: Option<&SyncRecord>,
        remote: &RemoteEntity,
        direction: SyncDirection,
    ) -> Option<Step> {
        let class = classify(
            &local.fingerprint,
            &remote.fingerprint(),
            record.and_then(|r| r.last_pushed_fingerprint.as_deref()),
            record.and_then(|r| r.last_pulled_fingerprint.as_deref()),
        );
        debug!(entity_id = %local.id, class = ?class, "Classified");
        match class {
            ChangeClass::Unchanged => None,
            ChangeClass::LocalOnly => direction.allows_push().then(|| Step::Push {
                remote_id: Some(remote.remote_id.clone()),
            }),
            ChangeClass::RemoteOnly => direction.allows_pull().then(|| Step::Pull {
                remote: remote.clone(),
                created: false,
            }),
            ChangeClass::Converged => Some(Step::Converged {
                remote: remote.clone(),
            }),
            ChangeClass::Conflict => Some(Step::Reconcile {
                remote: remote.clone(),
            }),
        }
    }

    fn execute(
        &self,
        tasks: Vec<Task>,
        direction: SyncDirection,
        cancel: &CancelToken,
        report: &mut SyncReport,
    ) -> Result<()> {
        let (batched, pooled): (Vec<Task>, Vec<Task>) = if self.backend.prefers_batch() {
            tasks
                .into_iter()
                .partition(|task| matches!(task.step, Step::Push { .. }))
        } else {
            (Vec::new(), tasks)
        };
        if !batched.is_empty() {
            if cancel.is_cancelled() {
                report.cancelled = true;
            } else {
                self.execute_batch(batched, report)?;
            }
        }

        let workers = self.backend.max_concurrency().max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("roadmap-sync-{i}"))
            .build()
            .map_err(|e| RoadmapError::Config(format!("sync worker pool: {e}")))?;
        let abort = AtomicBool::new(false);
        let results: Vec<Result<TaskResult>> = pool.install(|| {
            pooled
                .par_iter()
                .map(|task| {
                    if abort.load(Ordering::SeqCst) || cancel.is_cancelled() {
                        return Ok(TaskResult::Skipped);
                    }
                    let result = self.execute_task(task, direction).map(TaskResult::Done);
                    if result.is_err() {
                        abort.store(true, Ordering::SeqCst);
                    }
                    result
                })
                .collect()
        });

        let mut fatal = None;
        for result in results {
            match result {
                Ok(TaskResult::Done(Some(outcome))) => report.record(outcome),
                Ok(TaskResult::Done(None)) => {}
                Ok(TaskResult::Skipped) => report.cancelled = true,
                Err(e) => {
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }
        if let Some(error) = fatal {
            return Err(error);
        }
        if report.cancelled && !abort.load(Ordering::SeqCst) {
            warn!("Sync cancelled before all entities were processed");
        }
        Ok(())
    }

    fn execute_batch(&self, tasks: Vec<Task>, report: &mut SyncReport) -> Result<()> {
        let mut requests = Vec::with_capacity(tasks.len());
        let mut pending = Vec::with_capacity(tasks.len());
        for task in tasks {
            let Step::Push { remote_id } = &task.step else {
                continue;
            };
            match self.store.load(&task.entity_id) {
                Ok(entity) => {
                    requests.push(PushRequest {
                        entity,
                        existing_remote_id: remote_id.clone(),
                    });
                    pending.push(task);
                }
                Err(e) => report.record(corruption(&task, &e)),
            }
        }
        let mut results = self.backend.push_batch(&requests);
        for (request, task) in requests.into_iter().zip(pending) {
            let result = results.remove(&request.entity.id).unwrap_or_else(|| {
                Err(BackendError::Permanent(format!("no result for {}", request.entity.id)).into())
            });
            let existing = request.existing_remote_id.clone();
            let outcome = self.finish_push(&task, request.entity, existing.as_deref(), result, None)?;
            report.record(outcome);
        }
        Ok(())
    }

    fn execute_task(&self, task: &Task, direction: SyncDirection) -> Result<Option<EntityOutcome>> {
        match &task.step {
            Step::Push { remote_id } => {
                let entity = match self.store.load(&task.entity_id) {
                    Ok(entity) => entity,
                    Err(e) => return Ok(Some(corruption(task, &e))),
                };
                let result = self.backend.push_one(&entity, remote_id.as_deref());
                self.finish_push(task, entity, remote_id.as_deref(), result, None)
                    .map(Some)
            }
            Step::Pull { remote, created } => self.apply_pull(task, remote, *created, None).map(Some),
            Step::Reconcile { remote } => self.reconcile(task, remote, direction),
            Step::Converged { remote } => {
                let entity = match self.store.load(&task.entity_id) {
                    Ok(entity) => entity,
                    Err(e) => return Ok(Some(corruption(task, &e))),
                };
                self.record_converged(task, entity, remote)
            }
            Step::RemoteDeleted { remote_id } => self.remote_deleted(task, remote_id, direction).map(Some),
            Step::CloseOrphan { remote_id } => self.close_orphan(task, remote_id).map(Some),
        }
    }

    /// Commit the record, then link and save the entity.
    fn finish_push(
        &self,
        task: &Task,
        mut entity: Entity,
        requested_remote_id: Option<&str>,
        result: BackendResult<PushOutcome>,
        resolution: Option<Resolution>,
    ) -> Result<EntityOutcome> {
        let action = |created| resolution.map_or(Action::Push { created }, |r| Action::ResolveConflict { resolution: r });
        match result {
            Ok(Retried {
                value: PushOutcome::Pushed {
                    remote_id,
                    created,
                    remote,
                },
                retries,
            }) => {
                let now = Utc::now();
                let mut record = task
                    .record
                    .clone()
                    .filter(|r| !created || r.remote_id == remote_id)
                    .unwrap_or_else(|| SyncRecord::new(&entity.id, self.backend.name(), &remote_id));
                record.remote_id.clone_from(&remote_id);
                record.entity_kind = Some(entity.kind);
                record.mark_synced(entity.fingerprint(), remote.fingerprint(), now);
                self.tracker.commit(&record)?;

                entity.link_remote(self.backend.name(), remote_id.clone());
                entity.sync.sync_status = SyncStatus::Synced;
                entity.sync.last_synced_at = Some(now);
                let outcome = match self.store.save(&entity) {
                    Ok(()) => EntityOutcome::committed(&entity.id, action(created)),
                    Err(e) => {
                        warn!(entity_id = %entity.id, error = %e, "Pushed but could not update local file");
                        EntityOutcome::failed(&entity.id, action(created), ErrorKind::LocalWriteFailed, e.to_string())
                    }
                };
                Ok(outcome
                    .with_kind(entity.kind)
                    .with_remote_id(remote_id)
                    .with_retries(retries))
            }
            Ok(Retried {
                value: PushOutcome::RemoteDeleted { remote_id },
                retries,
            }) => Ok(self
                .remote_deleted(task, &remote_id, SyncDirection::PushOnly)?
                .with_retries(retries)),
            Err(failure) => {
                warn!(entity_id = %entity.id, error = %failure, "Push failed");
                self.note_failure(task, &failure.error.to_string())?;
                let kind = entity.kind;
                let id = entity.id.clone();
                self.mark_error(entity);
                let mut outcome = EntityOutcome::failed(
                    &id,
                    action(requested_remote_id.is_none()),
                    ErrorKind::from(&failure.error),
                    failure.error.to_string(),
                )
                .with_kind(kind)
                .with_retries(failure.retries);
                if let Some(remote_id) = requested_remote_id {
                    outcome = outcome.with_remote_id(remote_id);
                }
                Ok(outcome)
            }
        }
    }

    /// Save the merged entity, then commit the record.
    fn apply_pull(
        &self,
        task: &Task,
        remote: &RemoteEntity,
        created: bool,
        resolution: Option<Resolution>,
    ) -> Result<EntityOutcome> {
        let action = resolution.map_or(Action::Pull { created }, |r| Action::ResolveConflict { resolution: r });
        let local = if created {
            None
        } else {
            match self.store.load(&task.entity_id) {
                Ok(entity) => Some(entity),
                Err(e) => return Ok(corruption(task, &e)),
            }
        };

        let now = Utc::now();
        let mut entity = match local {
            Some(mut entity) => {
                let merged = self.backend.merge_pulled(entity.kind, Some(&entity.fields), &remote.fields);
                entity.apply_remote(merged, remote.updated_at);
                entity
            }
            None => {
                let merged = self.backend.merge_pulled(remote.kind, None, &remote.fields);
                let mut entity = Entity::with_id(&task.entity_id, remote.kind, merged);
                if remote.updated_at.is_some() {
                    entity.created_at = remote.updated_at;
                    entity.updated_at = remote.updated_at;
                }
                entity
            }
        };
        entity.link_remote(self.backend.name(), remote.remote_id.clone());
        entity.sync.sync_status = SyncStatus::Synced;
        entity.sync.last_synced_at = Some(now);

        if let Err(e) = self.store.save(&entity) {
            warn!(entity_id = %entity.id, error = %e, "Could not write pulled entity");
            return Ok(EntityOutcome::failed(&entity.id, action, ErrorKind::LocalWriteFailed, e.to_string())
                .with_kind(entity.kind)
                .with_remote_id(&remote.remote_id));
        }

        let mut record = task
            .record
            .clone()
            .unwrap_or_else(|| SyncRecord::new(&entity.id, self.backend.name(), &remote.remote_id));
        record.remote_id.clone_from(&remote.remote_id);
        record.entity_kind = Some(entity.kind);
        record.mark_synced(entity.fingerprint(), remote.fingerprint(), now);
        self.tracker.commit(&record)?;

        Ok(EntityOutcome::committed(&entity.id, action)
            .with_kind(entity.kind)
            .with_remote_id(&remote.remote_id))
    }

    fn reconcile(
        &self,
        task: &Task,
        remote: &RemoteEntity,
        direction: SyncDirection,
    ) -> Result<Option<EntityOutcome>> {
        let entity = match self.store.load(&task.entity_id) {
            Ok(entity) => entity,
            Err(e) => return Ok(Some(corruption(task, &e))),
        };
        let merged = self.backend.merge_pulled(entity.kind, Some(&entity.fields), &remote.fields);
        if fingerprint(entity.kind, &merged) == entity.fingerprint() {
            return self.record_converged(task, entity, remote);
        }

        let resolution = self.resolve(&entity, remote);
        if !allowed(resolution, direction) {
            return self.defer(task, entity, remote).map(Some);
        }
        info!(entity_id = %entity.id, resolution = ?resolution, strategy = %self.resolver.strategy(), "Resolving conflict");
        match resolution {
            Resolution::PushLocal => {
                let result = self.backend.push_one(&entity, Some(&remote.remote_id));
                self.finish_push(task, entity, Some(&remote.remote_id), result, Some(resolution))
                    .map(Some)
            }
            Resolution::PullRemote => self.apply_pull(task, remote, false, Some(resolution)).map(Some),
        }
    }

    fn resolve(&self, entity: &Entity, remote: &RemoteEntity) -> Resolution {
        self.resolver.resolve(Timestamps {
            local: entity.updated_at,
            remote: remote.updated_at,
        })
    }

    /// Move both baselines to the agreed content and make sure the local
    /// file carries the link.
    fn record_converged(
        &self,
        task: &Task,
        mut entity: Entity,
        remote: &RemoteEntity,
    ) -> Result<Option<EntityOutcome>> {
        let now = Utc::now();
        let mut record = task
            .record
            .clone()
            .unwrap_or_else(|| SyncRecord::new(&entity.id, self.backend.name(), &remote.remote_id));
        record.remote_id.clone_from(&remote.remote_id);
        record.entity_kind = Some(entity.kind);
        record.mark_synced(entity.fingerprint(), remote.fingerprint(), now);
        self.tracker.commit(&record)?;

        let linked = entity.remote_id(self.backend.name()) == Some(remote.remote_id.as_str());
        if linked && entity.sync.sync_status == SyncStatus::Synced {
            return Ok(None);
        }
        entity.link_remote(self.backend.name(), remote.remote_id.clone());
        entity.sync.sync_status = SyncStatus::Synced;
        entity.sync.last_synced_at = Some(now);
        match self.store.save(&entity) {
            Ok(()) => Ok(None),
            Err(e) => Ok(Some(
                EntityOutcome::failed(&entity.id, Action::Skip, ErrorKind::LocalWriteFailed, e.to_string())
                    .with_kind(entity.kind)
                    .with_remote_id(&remote.remote_id),
            )),
        }
    }

    fn defer(&self, task: &Task, mut entity: Entity, remote: &RemoteEntity) -> Result<EntityOutcome> {
        let mut record = task
            .record
            .clone()
            .unwrap_or_else(|| SyncRecord::new(&entity.id, self.backend.name(), &remote.remote_id));
        record.entity_kind = Some(entity.kind);
        record.conflict_marker = true;
        self.tracker.commit(&record)?;

        warn!(entity_id = %entity.id, remote_id = %remote.remote_id, "Conflict deferred");
        entity.link_remote(self.backend.name(), remote.remote_id.clone());
        entity.sync.sync_status = SyncStatus::Conflict;
        let outcome = match self.store.save(&entity) {
            Ok(()) => EntityOutcome::committed(&entity.id, Action::DeferConflict),
            Err(e) => EntityOutcome::failed(&entity.id, Action::DeferConflict, ErrorKind::LocalWriteFailed, e.to_string()),
        };
        Ok(outcome.with_kind(entity.kind).with_remote_id(&remote.remote_id))
    }

    fn remote_deleted(&self, task: &Task, remote_id: &str, direction: SyncDirection) -> Result<EntityOutcome> {
        let policy = self.settings.on_remote_deleted;
        match policy {
            RemoteDeletedPolicy::Recreate if direction.allows_push() => {
                let entity = match self.store.load(&task.entity_id) {
                    Ok(entity) => entity,
                    Err(e) => return Ok(corruption(task, &e)),
                };
                info!(entity_id = %entity.id, remote_id, "Remote copy deleted; recreating");
                let fresh = Task {
                    record: None,
                    ..task.clone()
                };
                let result = self.backend.push_one(&entity, None);
                self.finish_push(&fresh, entity, None, result, None)
            }
            RemoteDeletedPolicy::Unlink => {
                self.tracker.unlink(&task.entity_id, self.backend.name())?;
                let mut entity = match self.store.load(&task.entity_id) {
                    Ok(entity) => entity,
                    Err(e) => return Ok(corruption(task, &e)),
                };
                info!(entity_id = %entity.id, remote_id, "Remote copy deleted; unlinking");
                entity.unlink_remote(self.backend.name());
                entity.sync.sync_status = SyncStatus::Pending;
                let outcome = match self.store.save(&entity) {
                    Ok(()) => EntityOutcome::committed(&entity.id, Action::Unlink),
                    Err(e) => EntityOutcome::failed(&entity.id, Action::Unlink, ErrorKind::LocalWriteFailed, e.to_string()),
                };
                Ok(outcome.with_kind(entity.kind).with_remote_id(remote_id))
            }
            RemoteDeletedPolicy::Ignore | RemoteDeletedPolicy::Recreate => {
                let message = format!("remote entity {remote_id} no longer exists");
                warn!(entity_id = %task.entity_id, remote_id, "Remote copy deleted");
                self.note_failure(task, &message)?;
                if let Ok(entity) = self.store.load(&task.entity_id) {
                    self.mark_error(entity);
                }
                Ok(EntityOutcome::failed(&task.entity_id, Action::RemoteDeleted, ErrorKind::RemoteDeleted, message)
                    .with_kind(task.kind)
                    .with_remote_id(remote_id))
            }
        }
    }

    fn close_orphan(&self, task: &Task, remote_id: &str) -> Result<EntityOutcome> {
        match self.backend.close_remote(remote_id) {
            // The record stays so the closed copy is not pulled back in.
            Ok(done) => {
                info!(entity_id = %task.entity_id, remote_id, "Closed orphaned remote entity");
                Ok(EntityOutcome::committed(&task.entity_id, Action::CloseOrphan)
                    .with_kind(task.kind)
                    .with_remote_id(remote_id)
                    .with_retries(done.retries))
            }
            Err(failure) => Ok(EntityOutcome::failed(
                &task.entity_id,
                Action::CloseOrphan,
                ErrorKind::from(&failure.error),
                failure.error.to_string(),
            )
            .with_kind(task.kind)
            .with_remote_id(remote_id)
            .with_retries(failure.retries)),
        }
    }

    /// Keep baselines, remember the error on an existing record.
    fn note_failure(&self, task: &Task, message: &str) -> Result<()> {
        let Some(mut record) = task.record.clone() else {
            return Ok(());
        };
        record.last_error = Some(message.to_string());
        self.tracker.commit(&record)
    }

    /// Flag the local file after a terminal failure. Baselines and links
    /// stay as they were, so the next run retries the same step.
    fn mark_error(&self, mut entity: Entity) {
        if entity.sync.sync_status == SyncStatus::Error {
            return;
        }
        entity.sync.sync_status = SyncStatus::Error;
        if let Err(e) = self.store.save(&entity) {
            warn!(entity_id = %entity.id, error = %e, "Could not record sync error locally");
        }
    }

    /// The action a task would take, without side effects.
    fn preview(&self, task: &Task, direction: SyncDirection) -> Option<EntityOutcome> {
        let action = match &task.step {
            Step::Push { remote_id } => Action::Push {
                created: remote_id.is_none(),
            },
            Step::Pull { created, .. } => Action::Pull { created: *created },
            Step::Converged { .. } => return None,
            Step::Reconcile { remote } => {
                let entity = match self.store.load(&task.entity_id) {
                    Ok(entity) => entity,
                    Err(e) => return Some(corruption(task, &e)),
                };
                let merged = self.backend.merge_pulled(entity.kind, Some(&entity.fields), &remote.fields);
                if fingerprint(entity.kind, &merged) == entity.fingerprint() {
                    return None;
                }
                let resolution = self.resolve(&entity, remote);
                if allowed(resolution, direction) {
                    Action::ResolveConflict { resolution }
                } else {
                    Action::DeferConflict
                }
            }
            Step::RemoteDeleted { .. } => match self.settings.on_remote_deleted {
                RemoteDeletedPolicy::Ignore => Action::RemoteDeleted,
                RemoteDeletedPolicy::Unlink => Action::Unlink,
                RemoteDeletedPolicy::Recreate if direction.allows_push() => Action::Push { created: true },
                RemoteDeletedPolicy::Recreate => Action::RemoteDeleted,
            },
            Step::CloseOrphan { .. } => Action::CloseOrphan,
        };
        let mut outcome = EntityOutcome::committed(&task.entity_id, action)
            .with_kind(task.kind)
            .planned();
        if let Some(remote_id) = task_remote_id(task) {
            outcome = outcome.with_remote_id(remote_id);
        }
        Some(outcome)
    }
}

fn task_remote_id(task: &Task) -> Option<&str> {
    match &task.step {
        Step::Push { remote_id } => remote_id.as_deref(),
        Step::Pull { remote, .. } | Step::Reconcile { remote } | Step::Converged { remote } => {
            Some(&remote.remote_id)
        }
        Step::RemoteDeleted { remote_id } | Step::CloseOrphan { remote_id } => Some(remote_id),
    }
}

const fn allowed(resolution: Resolution, direction: SyncDirection) -> bool {
    match resolution {
        Resolution::PushLocal => direction.allows_push(),
        Resolution::PullRemote => direction.allows_pull(),
    }
}

fn corruption(task: &Task, error: &RoadmapError) -> EntityOutcome {
    EntityOutcome::failed(
        &task.entity_id,
        Action::Skip,
        ErrorKind::LocalCorruption,
        error.to_string(),
    )
    .with_kind(task.kind)
}
