use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RoadmapError};
use crate::sync::config::{BackendKind, ConflictStrategy, GitAuth, RemoteDeletedPolicy};

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub git: GitConfig,
}

impl Config {
    /// Defaults, then the global and project files (or only `explicit_path`
    /// when given), then `ROADMAP_*` environment overrides.
    pub fn load(explicit_path: Option<&Path>, data_dir: &Path) -> Result<Self> {
        let global = dirs::config_dir().map(|dir| dir.join("roadmap").join(CONFIG_FILE));
        Self::load_layers(explicit_path, global.as_deref(), data_dir, |key| {
            std::env::var(key).ok()
        })
    }

    /// Same as [`Config::load`] with the global path and environment
    /// supplied by the caller.
    pub fn load_layers<F>(
        explicit_path: Option<&Path>,
        global_path: Option<&Path>,
        data_dir: &Path,
        env: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let explicit = explicit_path
            .map(PathBuf::from)
            .or_else(|| env("ROADMAP_CONFIG").map(PathBuf::from));

        if let Some(path) = explicit {
            let patch = Self::load_patch(&path)?.ok_or_else(|| {
                RoadmapError::Config(format!("config file {} not found", path.display()))
            })?;
            config.merge_patch(patch);
        } else {
            if let Some(global) = global_path {
                if let Some(patch) = Self::load_patch(global)? {
                    config.merge_patch(patch);
                }
            }
            if let Some(patch) = Self::load_patch(&data_dir.join(CONFIG_FILE))? {
                config.merge_patch(patch);
            }
        }

        config.apply_env_overrides(&env)?;
        config.validate()?;
        Ok(config)
    }

    fn load_patch(path: &Path) -> Result<Option<ConfigPatch>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|err| RoadmapError::Config(format!("read config {}: {err}", path.display())))?;
        let patch = toml::from_str(&raw)
            .map_err(|err| RoadmapError::Config(format!("parse config {}: {err}", path.display())))?;
        Ok(Some(patch))
    }

    fn merge_patch(&mut self, patch: ConfigPatch) {
        if let Some(patch) = patch.sync {
            self.sync.merge(patch);
        }
        if let Some(patch) = patch.github {
            self.github.merge(patch);
        }
        if let Some(patch) = patch.git {
            self.git.merge(patch);
        }
    }

    fn apply_env_overrides<F>(&mut self, env: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = env("ROADMAP_BACKEND") {
            self.sync.backend = BackendKind::parse(value.trim())?;
        }
        if let Some(value) = env("ROADMAP_CONFLICT_STRATEGY") {
            self.sync.conflict_strategy = ConflictStrategy::parse(value.trim())?;
        }
        if let Some(value) = env("ROADMAP_ORPHAN_CLOSURE") {
            self.sync.orphan_closure = parse_bool(&value);
        }
        if let Some(value) = env_number::<u32, _>(env, "ROADMAP_RATE_LIMIT_BUDGET")? {
            self.sync.rate_limit_budget = value;
        }
        if let Some(value) = env_number::<u32, _>(env, "ROADMAP_SYNC_INTERVAL_MINUTES")? {
            self.sync.sync_interval_minutes = value;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.github.workers == 0 {
            return Err(RoadmapError::Config("github.workers must be at least 1".into()));
        }
        if self.github.max_attempts == 0 {
            return Err(RoadmapError::Config(
                "github.max_attempts must be at least 1".into(),
            ));
        }
        if self.github.initial_backoff > self.github.max_backoff {
            return Err(RoadmapError::Config(
                "github.initial_backoff must not exceed github.max_backoff".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    #[serde(default)]
    pub orphan_closure: bool,
    #[serde(default)]
    pub sync_interval_minutes: u32,
    /// API calls kept in reserve before throttling until the reset time.
    #[serde(default)]
    pub rate_limit_budget: u32,
    #[serde(default)]
    pub on_remote_deleted: RemoteDeletedPolicy,
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub lock_timeout: Duration,
    #[serde(default = "default_backup_keep")]
    pub backup_keep: usize,
}

const fn default_lock_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_backup_keep() -> usize {
    3
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            conflict_strategy: ConflictStrategy::default(),
            orphan_closure: false,
            sync_interval_minutes: 0,
            rate_limit_budget: 0,
            on_remote_deleted: RemoteDeletedPolicy::default(),
            lock_timeout: default_lock_timeout(),
            backup_keep: default_backup_keep(),
        }
    }
}

impl SyncConfig {
    fn merge(&mut self, patch: SyncPatch) {
        if let Some(value) = patch.backend {
            self.backend = value;
        }
        if let Some(value) = patch.conflict_strategy {
            self.conflict_strategy = value;
        }
        if let Some(value) = patch.orphan_closure {
            self.orphan_closure = value;
        }
        if let Some(value) = patch.sync_interval_minutes {
            self.sync_interval_minutes = value;
        }
        if let Some(value) = patch.rate_limit_budget {
            self.rate_limit_budget = value;
        }
        if let Some(value) = patch.on_remote_deleted {
            self.on_remote_deleted = value;
        }
        if let Some(value) = patch.lock_timeout {
            self.lock_timeout = value;
        }
        if let Some(value) = patch.backup_keep {
            self.backup_keep = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
    #[serde(default = "default_project_label")]
    pub project_label: String,
    /// Local label -> GitHub label.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Local assignee -> GitHub login.
    #[serde(default)]
    pub assignees: BTreeMap<String, String>,
    /// Local milestone id -> GitHub milestone number.
    #[serde(default)]
    pub milestones: BTreeMap<String, u64>,
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

const fn default_workers() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

const fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_project_label() -> String {
    "roadmap:project".to_string()
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            owner: None,
            repo: None,
            api_url: default_api_url(),
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            project_label: default_project_label(),
            labels: BTreeMap::new(),
            assignees: BTreeMap::new(),
            milestones: BTreeMap::new(),
        }
    }
}

impl GitHubConfig {
    fn merge(&mut self, patch: GitHubPatch) {
        if let Some(value) = patch.owner {
            self.owner = Some(value);
        }
        if let Some(value) = patch.repo {
            self.repo = Some(value);
        }
        if let Some(value) = patch.api_url {
            self.api_url = value;
        }
        if let Some(value) = patch.workers {
            self.workers = value;
        }
        if let Some(value) = patch.max_attempts {
            self.max_attempts = value;
        }
        if let Some(value) = patch.initial_backoff {
            self.initial_backoff = value;
        }
        if let Some(value) = patch.max_backoff {
            self.max_backoff = value;
        }
        if let Some(value) = patch.project_label {
            self.project_label = value;
        }
        if let Some(values) = patch.labels {
            self.labels.extend(values);
        }
        if let Some(values) = patch.assignees {
            self.assignees.extend(values);
        }
        if let Some(values) = patch.milestones {
            self.milestones.extend(values);
        }
    }

    /// `(owner, repo)`, or `MissingConfig` naming the absent key.
    pub fn repository(&self) -> Result<(&str, &str)> {
        let owner = self
            .owner
            .as_deref()
            .ok_or_else(|| RoadmapError::MissingConfig("github.owner".into()))?;
        let repo = self
            .repo
            .as_deref()
            .ok_or_else(|| RoadmapError::MissingConfig("github.repo".into()))?;
        Ok((owner, repo))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    /// Directory inside the remote repository holding entity files.
    #[serde(default = "default_tracked_dir")]
    pub tracked_dir: String,
    #[serde(default)]
    pub auth: Option<GitAuth>,
}

fn default_tracked_dir() -> String {
    ".roadmap".to_string()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            url: None,
            branch: None,
            tracked_dir: default_tracked_dir(),
            auth: None,
        }
    }
}

impl GitConfig {
    fn merge(&mut self, patch: GitPatch) {
        if let Some(value) = patch.url {
            self.url = Some(value);
        }
        if let Some(value) = patch.branch {
            self.branch = Some(value);
        }
        if let Some(value) = patch.tracked_dir {
            self.tracked_dir = value;
        }
        if let Some(value) = patch.auth {
            self.auth = Some(value);
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigPatch {
    sync: Option<SyncPatch>,
    github: Option<GitHubPatch>,
    git: Option<GitPatch>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SyncPatch {
    backend: Option<BackendKind>,
    conflict_strategy: Option<ConflictStrategy>,
    orphan_closure: Option<bool>,
    sync_interval_minutes: Option<u32>,
    rate_limit_budget: Option<u32>,
    on_remote_deleted: Option<RemoteDeletedPolicy>,
    #[serde(default, with = "humantime_serde")]
    lock_timeout: Option<Duration>,
    backup_keep: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GitHubPatch {
    owner: Option<String>,
    repo: Option<String>,
    api_url: Option<String>,
    workers: Option<usize>,
    max_attempts: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    initial_backoff: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    max_backoff: Option<Duration>,
    project_label: Option<String>,
    labels: Option<BTreeMap<String, String>>,
    assignees: Option<BTreeMap<String, String>>,
    milestones: Option<BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GitPatch {
    url: Option<String>,
    branch: Option<String>,
    tracked_dir: Option<String>,
    auth: Option<GitAuth>,
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn env_number<T, F>(env: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match env(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| RoadmapError::Config(format!("invalid {key} value {value}: {err}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn load(
        explicit: Option<&Path>,
        global: Option<&Path>,
        data_dir: &Path,
        vars: &[(&str, &str)],
    ) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::load_layers(explicit, global, data_dir, |key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_files() {
        let temp = TempDir::new().unwrap();
        let config = load(None, None, temp.path(), &[]).unwrap();
        assert_eq!(config.sync.backend, BackendKind::GitHub);
        assert_eq!(config.sync.conflict_strategy, ConflictStrategy::LocalWins);
        assert!(!config.sync.orphan_closure);
        assert_eq!(config.sync.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.sync.backup_keep, 3);
        assert_eq!(config.github.workers, 4);
        assert_eq!(config.git.tracked_dir, ".roadmap");
    }

    #[test]
    fn project_file_overrides_global() {
        let temp = TempDir::new().unwrap();
        let global = temp.path().join("global.toml");
        std::fs::write(
            &global,
            "[sync]\nconflict_strategy = \"remote_wins\"\nrate_limit_budget = 50\n[github.labels]\nbug = \"type: bug\"\n",
        )
        .unwrap();
        std::fs::write(
            temp.path().join(CONFIG_FILE),
            "[sync]\nconflict_strategy = \"newer_wins\"\nlock_timeout = \"5s\"\n[github]\nowner = \"acme\"\nrepo = \"plan\"\n[github.labels]\nfeature = \"type: feature\"\n",
        )
        .unwrap();

        let config = load(None, Some(&global), temp.path(), &[]).unwrap();
        assert_eq!(config.sync.conflict_strategy, ConflictStrategy::NewerWins);
        assert_eq!(config.sync.rate_limit_budget, 50);
        assert_eq!(config.sync.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.github.repository().unwrap(), ("acme", "plan"));
        assert_eq!(config.github.labels.len(), 2);
    }

    #[test]
    fn explicit_path_replaces_file_layers() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(CONFIG_FILE), "[sync]\norphan_closure = true\n").unwrap();
        let explicit = temp.path().join("ci.toml");
        std::fs::write(&explicit, "[sync]\nbackend = \"git\"\n").unwrap();

        let config = load(Some(&explicit), None, temp.path(), &[]).unwrap();
        assert_eq!(config.sync.backend, BackendKind::Git);
        assert!(!config.sync.orphan_closure);
    }

    #[test]
    fn env_overrides_files() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(CONFIG_FILE), "[sync]\nbackend = \"git\"\n").unwrap();
        let config = load(
            None,
            None,
            temp.path(),
            &[
                ("ROADMAP_BACKEND", "github"),
                ("ROADMAP_ORPHAN_CLOSURE", "yes"),
                ("ROADMAP_RATE_LIMIT_BUDGET", "200"),
                ("ROADMAP_CONFLICT_STRATEGY", "remote_wins"),
            ],
        )
        .unwrap();
        assert_eq!(config.sync.backend, BackendKind::GitHub);
        assert!(config.sync.orphan_closure);
        assert_eq!(config.sync.rate_limit_budget, 200);
        assert_eq!(config.sync.conflict_strategy, ConflictStrategy::RemoteWins);
    }

    #[test]
    fn invalid_values_name_the_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(CONFIG_FILE),
            "[sync]\nconflict_strategy = \"merge\"\n",
        )
        .unwrap();
        let err = load(None, None, temp.path(), &[]).unwrap_err();
        assert!(matches!(err, RoadmapError::Config(_)));
        assert!(err.to_string().contains(CONFIG_FILE));
    }

    #[test]
    fn invalid_env_number_is_config_error() {
        let temp = TempDir::new().unwrap();
        let err = load(None, None, temp.path(), &[("ROADMAP_RATE_LIMIT_BUDGET", "lots")]).unwrap_err();
        assert!(err.to_string().contains("ROADMAP_RATE_LIMIT_BUDGET"));
    }

    #[test]
    fn zero_workers_rejected() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(CONFIG_FILE), "[github]\nworkers = 0\n").unwrap();
        assert!(load(None, None, temp.path(), &[]).is_err());
    }

    #[test]
    fn missing_repository_is_reported() {
        let config = Config::default();
        let err = config.github.repository().unwrap_err();
        assert!(matches!(err, RoadmapError::MissingConfig(ref key) if key == "github.owner"));
    }
}
