//! Plain git remote ("vanilla") backend.
//!
//! Entity files live under `<tracked_dir>/{issues,milestones,projects}/` in
//! a shared repository. A bare cache repository under
//! `.roadmap/sync/remotes/git` fetches the branch, builds new trees in
//! memory and pushes one commit per batch. Remote ids are file paths
//! relative to the tracked directory, e.g. `issues/iss-3f9a0c12.md`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use git2::{
    Commit, Cred, CredentialType, Direction, ErrorClass, ErrorCode, FetchOptions, FetchPrune, Oid,
    PushOptions, RemoteCallbacks, Repository, Signature, Sort, Tree,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::backend::{
    Backend, BackendError, BackendFailure, BackendResult, PushOutcome, PushRequest, RemoteEntity,
    Retried,
};
use super::config::GitAuth;
use super::retry::{RetryPolicy, Sleeper, ThreadSleeper, classify, retry};
use crate::config::GitConfig;
use crate::core::{Entity, EntityKind};
use crate::error::{Result, RoadmapError};

pub const BACKEND_NAME: &str = "git";
/// Value of `created_by` in files this tool writes.
pub const CREATED_BY: &str = "roadmap";

const REMOTE_NAME: &str = "origin";
const DEFAULT_BRANCH: &str = "main";
const FETCH_REFSPEC: &str = "+refs/heads/*:refs/remotes/origin/*";
const FILE_MODE: i32 = 0o100_644;
const DIR_MODE: i32 = 0o040_000;

#[derive(Debug, Clone)]
enum ResolvedAuth {
    Default,
    Token {
        token: String,
        username: Option<String>,
    },
    SshKey {
        key_path: PathBuf,
        public_key: Option<PathBuf>,
        passphrase: Option<String>,
    },
}

/// Resolve configured credentials. `fallback_token` comes from the
/// credential provider and is used when no explicit method is set or the
/// configured variable is empty.
fn resolve_auth(auth: Option<&GitAuth>, fallback_token: Option<String>) -> Result<ResolvedAuth> {
    match auth {
        None => Ok(fallback_token.map_or(ResolvedAuth::Default, |token| ResolvedAuth::Token {
            token,
            username: None,
        })),
        Some(GitAuth::Token {
            token_env,
            username,
        }) => {
            let token = std::env::var(token_env)
                .ok()
                .filter(|t| !t.trim().is_empty())
                .or(fallback_token)
                .ok_or_else(|| RoadmapError::Auth(format!("missing token env var: {token_env}")))?;
            Ok(ResolvedAuth::Token {
                token,
                username: username.clone(),
            })
        }
        Some(GitAuth::SshKey {
            key_path,
            public_key,
            passphrase_env,
        }) => {
            let passphrase = match passphrase_env {
                Some(env) => Some(std::env::var(env).map_err(|_| {
                    RoadmapError::Auth(format!("missing passphrase env var: {env}"))
                })?),
                None => None,
            };
            Ok(ResolvedAuth::SshKey {
                key_path: key_path.clone(),
                public_key: public_key.clone(),
                passphrase,
            })
        }
    }
}

fn build_callbacks<'a>(auth: &ResolvedAuth) -> RemoteCallbacks<'a> {
    let auth = auth.clone();
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, allowed| match &auth {
        ResolvedAuth::Default => {
            if allowed.contains(CredentialType::SSH_KEY) {
                Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"))
            } else {
                Cred::default()
            }
        }
        ResolvedAuth::Token { token, username } => {
            let user = username
                .as_deref()
                .or(username_from_url)
                .unwrap_or("x-access-token");
            Cred::userpass_plaintext(user, token)
        }
        ResolvedAuth::SshKey {
            key_path,
            public_key,
            passphrase,
        } => Cred::ssh_key(
            username_from_url.unwrap_or("git"),
            public_key.as_deref(),
            key_path.as_path(),
            passphrase.as_deref(),
        ),
    });
    callbacks
}

/// Map libgit2 failures onto the backend error classes.
fn git_error(error: &git2::Error) -> BackendError {
    let message = error.message().to_string();
    match error.code() {
        ErrorCode::Auth => return BackendError::Unauthenticated(message),
        ErrorCode::NotFastForward | ErrorCode::User | ErrorCode::Locked | ErrorCode::Modified => {
            return BackendError::Transient(message);
        }
        _ => {}
    }
    let lower = message.to_ascii_lowercase();
    if lower.contains("rejected") || lower.contains("fast-forward") || lower.contains("fetch first") {
        return BackendError::Transient(message);
    }
    match error.class() {
        ErrorClass::Net | ErrorClass::Os | ErrorClass::Http | ErrorClass::Ssh | ErrorClass::Ssl => {
            BackendError::Transient(message)
        }
        _ => BackendError::Permanent(message),
    }
}

fn git(error: git2::Error) -> BackendError {
    git_error(&error)
}

pub struct GitBackend {
    url: String,
    branch: String,
    tracked_dir: Vec<String>,
    auth: ResolvedAuth,
    repo: Mutex<Repository>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl GitBackend {
    /// Open (or create) the cache repository under `data_dir`.
    pub fn new(config: &GitConfig, data_dir: &Path, token: Option<String>) -> Result<Self> {
        Self::with_retry(config, data_dir, token, RetryPolicy::default(), Arc::new(ThreadSleeper))
    }

    pub fn with_retry(
        config: &GitConfig,
        data_dir: &Path,
        token: Option<String>,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| RoadmapError::MissingConfig("git.url".to_string()))?;
        let auth = resolve_auth(config.auth.as_ref(), token)?;

        let cache_dir = data_dir.join("sync").join("remotes").join(BACKEND_NAME);
        std::fs::create_dir_all(&cache_dir)?;
        let repo = match Repository::open_bare(&cache_dir) {
            Ok(repo) => repo,
            Err(_) => Repository::init_bare(&cache_dir)?,
        };
        ensure_origin_url(&repo, &url)?;

        Ok(Self {
            url,
            branch: config.branch.clone().unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            tracked_dir: config
                .tracked_dir
                .split('/')
                .filter(|c| !c.is_empty() && *c != ".")
                .map(str::to_string)
                .collect(),
            auth,
            repo: Mutex::new(repo),
            policy,
            sleeper,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    fn call<T>(
        &self,
        op: impl Fn(&Repository) -> std::result::Result<T, BackendError>,
    ) -> BackendResult<T> {
        retry(&self.policy, &*self.sleeper, classify, |_| {
            let repo = self.repo.lock();
            op(&*repo)
        })
    }

    /// Fetch the branch and return the remote head, `None` for an empty remote.
    fn fetch(&self, repo: &Repository) -> std::result::Result<Option<Oid>, BackendError> {
        let mut remote = repo.find_remote(REMOTE_NAME).map_err(git)?;
        let mut options = FetchOptions::new();
        options.remote_callbacks(build_callbacks(&self.auth));
        options.prune(FetchPrune::On);
        remote
            .fetch(&[FETCH_REFSPEC], Some(&mut options), None)
            .map_err(git)?;

        match repo.find_reference(&self.tracking_ref()) {
            Ok(reference) => Ok(reference.target()),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(git(e)),
        }
    }

    fn tracking_ref(&self) -> String {
        format!("refs/remotes/{REMOTE_NAME}/{}", self.branch)
    }

    fn tracked_tree<'r>(
        &self,
        repo: &'r Repository,
        head: Option<Oid>,
    ) -> std::result::Result<Option<Tree<'r>>, BackendError> {
        let Some(head) = head else {
            return Ok(None);
        };
        let root = repo.find_commit(head).and_then(|c| c.tree()).map_err(git)?;
        subtree(repo, Some(root), &self.tracked_dir)
    }

    fn read_file(
        repo: &Repository,
        tree: &Tree<'_>,
        remote_id: &str,
    ) -> Option<std::result::Result<Entity, String>> {
        let entry = tree.get_path(Path::new(remote_id)).ok()?;
        let blob = match entry.to_object(repo).and_then(|o| o.peel_to_blob()) {
            Ok(blob) => blob,
            Err(e) => return Some(Err(e.message().to_string())),
        };
        let text = match std::str::from_utf8(blob.content()) {
            Ok(text) => text,
            Err(e) => return Some(Err(e.to_string())),
        };
        Some(Entity::from_document(text, remote_id).map_err(|e| e.to_string()))
    }

    fn read_entities(
        repo: &Repository,
        tree: &Tree<'_>,
        only: Option<&[String]>,
    ) -> Vec<RemoteEntity> {
        let mut out = Vec::new();
        for kind in EntityKind::ALL {
            let Ok(Some(dir)) = subtree(repo, Some(tree.clone()), &[kind.dir_name().to_string()])
            else {
                continue;
            };
            for entry in &dir {
                let Some(name) = entry.name().ok() else { continue };
                if !name.ends_with(".md") {
                    continue;
                }
                let remote_id = format!("{}/{name}", kind.dir_name());
                if only.is_some_and(|ids| !ids.contains(&remote_id)) {
                    continue;
                }
                match Self::read_file(repo, tree, &remote_id) {
                    Some(Ok(entity)) => out.push(to_remote(entity, remote_id)),
                    Some(Err(reason)) => {
                        warn!(remote_id = %remote_id, reason = %reason, "Skipping unreadable remote file");
                    }
                    None => {}
                }
            }
        }
        out
    }

    /// Most recent commit time per tracked file, newest commits first.
    fn file_times(
        &self,
        repo: &Repository,
        head: Oid,
    ) -> std::result::Result<HashMap<String, DateTime<Utc>>, git2::Error> {
        let prefix: PathBuf = self.tracked_dir.iter().collect();
        let mut walk = repo.revwalk()?;
        walk.push(head)?;
        walk.set_sorting(Sort::TIME)?;

        let mut times = HashMap::new();
        for oid in walk {
            let commit = repo.find_commit(oid?)?;
            let tree = commit.tree()?;
            let parent = if commit.parent_count() > 0 {
                Some(commit.parent(0)?.tree()?)
            } else {
                None
            };
            let Some(when) = Utc.timestamp_opt(commit.time().seconds(), 0).single() else {
                continue;
            };
            let diff = repo.diff_tree_to_tree(parent.as_ref(), Some(&tree), None)?;
            for delta in diff.deltas() {
                let Some(path) = delta.new_file().path() else { continue };
                if let Ok(relative) = path.strip_prefix(&prefix) {
                    let key = relative.to_string_lossy().replace('\\', "/");
                    times.entry(key).or_insert(when);
                }
            }
        }
        Ok(times)
    }

    /// Commit `files` (remote id, content) on top of `base` and push.
    fn publish(
        &self,
        repo: &Repository,
        base: Option<Oid>,
        files: &[(String, String)],
        message: &str,
    ) -> std::result::Result<Oid, BackendError> {
        let parent = base.map(|oid| repo.find_commit(oid)).transpose().map_err(git)?;
        let mut root = parent
            .as_ref()
            .map(Commit::tree)
            .transpose()
            .map_err(git)?
            .map(|t| t.id());

        for (remote_id, content) in files {
            let blob = repo.blob(content.as_bytes()).map_err(git)?;
            let mut path: Vec<String> = self.tracked_dir.clone();
            path.extend(remote_id.split('/').map(str::to_string));
            let current = root.map(|oid| repo.find_tree(oid)).transpose().map_err(git)?;
            root = Some(insert_blob(repo, current.as_ref(), &path, blob).map_err(git)?);
        }
        let Some(root) = root else {
            return Err(BackendError::Permanent("nothing to commit".to_string()));
        };
        let tree = repo.find_tree(root).map_err(git)?;

        let signature = repo
            .signature()
            .or_else(|_| Signature::now("roadmap", "roadmap@localhost"))
            .map_err(git)?;
        let parents: Vec<&Commit<'_>> = parent.iter().collect();
        let commit = repo
            .commit(None, &signature, &signature, message, &tree, &parents)
            .map_err(git)?;

        let local_ref = format!("refs/heads/{}", self.branch);
        repo.reference(&local_ref, commit, true, "roadmap sync")
            .map_err(git)?;
        self.push(repo, &local_ref)?;
        repo.reference(&self.tracking_ref(), commit, true, "roadmap push")
            .map_err(git)?;
        info!(commit = %commit, files = files.len(), "Pushed to git remote");
        Ok(commit)
    }

    fn push(&self, repo: &Repository, local_ref: &str) -> std::result::Result<(), BackendError> {
        let mut remote = repo.find_remote(REMOTE_NAME).map_err(git)?;
        let mut callbacks = build_callbacks(&self.auth);
        callbacks.push_update_reference(|refname, status| match status {
            Some(reason) => Err(git2::Error::from_str(&format!(
                "push of {refname} rejected: {reason}"
            ))),
            None => Ok(()),
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);
        let refspec = format!("{local_ref}:refs/heads/{}", self.branch);
        remote.push(&[refspec], Some(&mut options)).map_err(git)
    }

    /// One attempt at a batch: fetch, rewrite files on the fresh head, push.
    ///
    /// A request that cannot be written gets its own `Err` and is left out
    /// of the commit; only fetch and publish failures fail the whole batch.
    #[allow(clippy::type_complexity)]
    fn try_push_batch(
        &self,
        repo: &Repository,
        requests: &[PushRequest],
    ) -> std::result::Result<BTreeMap<String, std::result::Result<PushOutcome, BackendError>>, BackendError> {
        let head = self.fetch(repo)?;
        let tracked = self.tracked_tree(repo, head)?;

        let mut outcomes = BTreeMap::new();
        let mut files = Vec::new();
        let mut remotes = Vec::new();
        for request in requests {
            let entity = &request.entity;
            let remote_id = match request.existing_remote_id.as_deref() {
                Some(remote_id) => remote_id.to_string(),
                None => format!("{}/{}.md", entity.kind.dir_name(), entity.id),
            };
            if remote_id.split('/').any(|c| c == ".." || c.is_empty()) {
                warn!(id = %entity.id, remote_id, "Skipping push with invalid remote id");
                outcomes.insert(
                    entity.id.clone(),
                    Err(BackendError::Permanent(format!("invalid remote id {remote_id}"))),
                );
                continue;
            }
            let existing = tracked
                .as_ref()
                .and_then(|tree| Self::read_file(repo, tree, &remote_id));
            if existing.is_none() && request.existing_remote_id.is_some() {
                outcomes.insert(entity.id.clone(), Ok(PushOutcome::RemoteDeleted { remote_id }));
                continue;
            }

            // Keep unknown keys of the shared copy; replace the content.
            let created = existing.is_none();
            let mut shared = match existing {
                Some(Ok(mut remote)) => {
                    remote.apply_remote(entity.fields.clone(), entity.updated_at);
                    remote
                }
                _ => entity.clone(),
            };
            shared.id.clone_from(&entity.id);
            let rendered = shared
                .to_shared_document(CREATED_BY)
                .and_then(|text| Entity::from_document(&text, &remote_id).map(|w| (text, w)));
            let (text, written) = match rendered {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(id = %entity.id, remote_id, error = %e, "Skipping unwritable entity");
                    outcomes.insert(entity.id.clone(), Err(BackendError::Permanent(e.to_string())));
                    continue;
                }
            };
            remotes.push((entity.id.clone(), remote_id.clone(), created, written));
            files.push((remote_id, text));
        }

        if !files.is_empty() {
            let message = if files.len() == 1 {
                format!("roadmap: sync {}", files[0].0)
            } else {
                format!("roadmap: sync {} entities", files.len())
            };
            self.publish(repo, head, &files, &message)?;
        }
        for (id, remote_id, created, written) in remotes {
            outcomes.insert(
                id,
                Ok(PushOutcome::Pushed {
                    remote: to_remote(written, remote_id.clone()),
                    remote_id,
                    created,
                }),
            );
        }
        Ok(outcomes)
    }

    fn connect_heads(&self) -> std::result::Result<usize, git2::Error> {
        let repo = self.repo.lock();
        let mut remote = repo.find_remote(REMOTE_NAME)?;
        let connection =
            remote.connect_auth(Direction::Fetch, Some(build_callbacks(&self.auth)), None)?;
        let heads = connection.list()?.len();
        Ok(heads)
    }
}

impl Backend for GitBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn authenticate(&self) -> std::result::Result<(), BackendError> {
        let heads = self.connect_heads().map_err(git)?;
        debug!(url = %self.url, heads, "Authenticated against git remote");
        Ok(())
    }

    fn list_remote(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> std::result::Result<Vec<RemoteEntity>, BackendError> {
        let listed = self
            .call(|repo| {
                let head = self.fetch(repo)?;
                let Some(tree) = self.tracked_tree(repo, head)? else {
                    return Ok(Vec::new());
                };
                let mut entities = Self::read_entities(repo, &tree, None);
                if let (Some(since), Some(head)) = (since, head) {
                    let times = self.file_times(repo, head).map_err(git)?;
                    entities.retain(|e| {
                        times
                            .get(&e.remote_id)
                            .is_none_or(|t| t.timestamp() >= since.timestamp())
                    });
                }
                Ok(entities)
            })
            .map_err(|f| f.error)?;
        debug!(count = listed.value.len(), incremental = since.is_some(), "Listed git entities");
        Ok(listed.value)
    }

    fn push_one(&self, entity: &Entity, existing_remote_id: Option<&str>) -> BackendResult<PushOutcome> {
        let request = PushRequest {
            entity: entity.clone(),
            existing_remote_id: existing_remote_id.map(str::to_string),
        };
        self.push_batch(std::slice::from_ref(&request))
            .remove(&entity.id)
            .unwrap_or_else(|| {
                Err(BackendError::Permanent(format!("no result for {}", entity.id)).into())
            })
    }

    /// All writes of a batch go into a single commit. A rejected push
    /// (someone else pushed first) is retried on top of the new head.
    fn push_batch(&self, requests: &[PushRequest]) -> BTreeMap<String, BackendResult<PushOutcome>> {
        if requests.is_empty() {
            return BTreeMap::new();
        }
        match self.call(|repo| self.try_push_batch(repo, requests)) {
            Ok(Retried {
                value: mut outcomes,
                retries,
            }) => requests
                .iter()
                .map(|req| {
                    let id = req.entity.id.clone();
                    let result = outcomes.remove(&id).map_or_else(
                        || {
                            Err(BackendFailure {
                                error: BackendError::Permanent(format!("no result for {id}")),
                                retries,
                            })
                        },
                        |outcome| match outcome {
                            Ok(value) => Ok(Retried { value, retries }),
                            Err(error) => Err(BackendFailure { error, retries }),
                        },
                    );
                    (id, result)
                })
                .collect(),
            Err(failure) => requests
                .iter()
                .map(|req| (req.entity.id.clone(), Err(failure.clone())))
                .collect(),
        }
    }

    fn pull(&self, remote_ids: Option<&[String]>) -> std::result::Result<Vec<RemoteEntity>, BackendError> {
        let pulled = self
            .call(|repo| {
                let head = self.fetch(repo)?;
                Ok(self
                    .tracked_tree(repo, head)?
                    .map(|tree| Self::read_entities(repo, &tree, remote_ids))
                    .unwrap_or_default())
            })
            .map_err(|f| f.error)?;
        Ok(pulled.value)
    }

    fn check_connectivity(&self) -> std::result::Result<(), String> {
        match self.connect_heads() {
            Ok(_) => Ok(()),
            // Reached the remote; credentials are checked separately.
            Err(e) if e.code() == ErrorCode::Auth => Ok(()),
            Err(e) => Err(format!("cannot reach {}: {}", self.url, e.message())),
        }
    }

    fn close_remote(&self, remote_id: &str) -> BackendResult<()> {
        self.call(|repo| {
            let head = self.fetch(repo)?;
            let tracked = self.tracked_tree(repo, head)?;
            let mut entity = match tracked
                .as_ref()
                .and_then(|tree| Self::read_file(repo, tree, remote_id))
            {
                Some(Ok(entity)) => entity,
                Some(Err(reason)) => return Err(BackendError::Permanent(reason)),
                None => return Err(BackendError::NotFound(remote_id.to_string())),
            };
            if entity.fields.is_closed() {
                return Ok(());
            }
            entity.fields.status = "closed".to_string();
            entity.updated_at = Some(Utc::now());
            let text = entity
                .to_shared_document(CREATED_BY)
                .map_err(|e| BackendError::Permanent(e.to_string()))?;
            self.publish(
                repo,
                head,
                &[(remote_id.to_string(), text)],
                &format!("roadmap: close orphan {remote_id}"),
            )?;
            Ok(())
        })
    }

    fn prefers_batch(&self) -> bool {
        true
    }
}

fn to_remote(entity: Entity, remote_id: String) -> RemoteEntity {
    let created_by_tool = entity.created_by() == Some(CREATED_BY);
    RemoteEntity {
        remote_id,
        kind: entity.kind,
        local_id: Some(entity.id),
        created_by_tool,
        closed: entity.fields.is_closed(),
        updated_at: entity.updated_at,
        fields: entity.fields,
    }
}

fn ensure_origin_url(repo: &Repository, url: &str) -> Result<()> {
    match repo.find_remote(REMOTE_NAME) {
        Ok(remote) => {
            if remote.url().ok() != Some(url) {
                repo.remote_set_url(REMOTE_NAME, url)?;
            }
        }
        Err(_) => {
            repo.remote_with_fetch(REMOTE_NAME, url, FETCH_REFSPEC)?;
        }
    }
    Ok(())
}

/// Descend `path` from `tree`; `None` when any component is missing.
fn subtree<'r>(
    repo: &'r Repository,
    tree: Option<Tree<'r>>,
    path: &[String],
) -> std::result::Result<Option<Tree<'r>>, BackendError> {
    let mut current = tree;
    for component in path {
        let Some(tree) = current else {
            return Ok(None);
        };
        let Some(entry) = tree.get_name(component) else {
            return Ok(None);
        };
        current = match entry.to_object(repo).map_err(git)?.into_tree() {
            Ok(tree) => Some(tree),
            Err(_) => None,
        };
    }
    Ok(current)
}

/// Write a copy of `tree` with `blob` at `path`, creating directories.
fn insert_blob(
    repo: &Repository,
    tree: Option<&Tree<'_>>,
    path: &[String],
    blob: Oid,
) -> std::result::Result<Oid, git2::Error> {
    let Some((first, rest)) = path.split_first() else {
        return Err(git2::Error::from_str("empty path"));
    };
    let mut builder = repo.treebuilder(tree)?;
    if rest.is_empty() {
        builder.insert(first, blob, FILE_MODE)?;
    } else {
        let child = tree
            .and_then(|t| t.get_name(first))
            .and_then(|entry| entry.to_object(repo).ok())
            .and_then(|object| object.into_tree().ok());
        let child = insert_blob(repo, child.as_ref(), rest, blob)?;
        builder.insert(first, child, DIR_MODE)?;
    }
    builder.write()
}
