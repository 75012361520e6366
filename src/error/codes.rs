//! Stable error codes for `--json` output.
//!
//! The hundreds digit is the category: 1 entity, 2 index, 3 config,
//! 5 network, 6 storage, 7 git, 8 validation (85x lock), 9 internal.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // entity (1xx)
    /// E101: no entity file with that id
    EntityNotFound,
    /// E102: entity file exists but its front matter is invalid
    EntityInvalid,
    /// E103: entity file is corrupted and no backup could be recovered
    EntityCorrupted,

    // index (2xx)
    /// E201: index is stale or unreadable
    IndexStale,

    // config (3xx)
    /// E302: config file unreadable or a value out of range
    ConfigInvalid,
    /// E304: a value the chosen backend needs is unset
    ConfigMissingRequired,

    // network (5xx)
    /// E501: remote unreachable
    NetworkUnreachable,
    /// E503: credentials rejected
    NetworkAuthFailed,
    /// E504: remote request failed
    NetworkRequestFailed,

    // storage (6xx)
    /// E602: entity file write failed
    StorageWriteError,
    /// E604: SQLite index failure
    DatabaseError,
    /// E605: JSON or YAML (de)serialization failed
    SerializationError,
    /// E606: sync state could not be persisted
    SyncStateWriteError,

    // git (7xx)
    /// E704: libgit2 failure
    GitError,

    // validation (8xx)
    /// E801: input rejected
    ValidationFailed,
    /// E851: timed out waiting for the run lock
    LockTimeout,
    /// E852: could not acquire the run lock
    LockFailed,

    // internal (9xx)
    /// E903: run was cancelled
    Cancelled,
    /// E905: resource not found
    NotFound,
    /// E906: I/O failure
    IoError,
}

impl ErrorCode {
    #[must_use]
    pub const fn numeric(&self) -> u16 {
        match self {
            Self::EntityNotFound => 101,
            Self::EntityInvalid => 102,
            Self::EntityCorrupted => 103,

            Self::IndexStale => 201,

            Self::ConfigInvalid => 302,
            Self::ConfigMissingRequired => 304,

            Self::NetworkUnreachable => 501,
            Self::NetworkAuthFailed => 503,
            Self::NetworkRequestFailed => 504,

            Self::StorageWriteError => 602,
            Self::DatabaseError => 604,
            Self::SerializationError => 605,
            Self::SyncStateWriteError => 606,

            Self::GitError => 704,

            Self::ValidationFailed => 801,
            Self::LockTimeout => 851,
            Self::LockFailed => 852,

            Self::Cancelled => 903,
            Self::NotFound => 905,
            Self::IoError => 906,
        }
    }

    /// `E` plus the numeric code, e.g. `E101`.
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("E{}", self.numeric())
    }

    /// What the user can try next.
    #[must_use]
    pub const fn suggestion(&self) -> &'static str {
        match self {
            Self::EntityNotFound => "Run `roadmap status` to list known entities and their ids",
            Self::EntityInvalid => "Check the front matter between the `---` lines for YAML syntax errors",
            Self::EntityCorrupted => "Restore the file from `.roadmap/backups/` or from git history",
            Self::IndexStale => "Run `roadmap index rebuild` to regenerate the index from entity files",
            Self::ConfigInvalid => "Check TOML syntax and option values in .roadmap/config.toml",
            Self::ConfigMissingRequired => "Set the missing value in .roadmap/config.toml or via ROADMAP_* env vars",
            Self::NetworkUnreachable => "Check your network connection and that the remote is reachable",
            Self::NetworkAuthFailed => "Verify your token (GITHUB_TOKEN) or SSH key configuration",
            Self::NetworkRequestFailed => "The remote rejected the request. Re-run with -v for details",
            Self::StorageWriteError => "Check disk space and write permissions on the .roadmap directory",
            Self::DatabaseError => "Delete .roadmap/index.db; it is rebuilt automatically",
            Self::SerializationError => "A stored JSON or YAML document is malformed; inspect it or restore a backup",
            Self::SyncStateWriteError => "Sync state could not be saved. Fix the storage problem before syncing again",
            Self::GitError => "Check `git status` in the remote cache under .roadmap/sync/remotes/",
            Self::ValidationFailed => "Review the reported values and correct them",
            Self::LockTimeout => "Another roadmap process holds .roadmap/sync.lock; wait for it to finish",
            Self::LockFailed => "Failed to acquire the sync lock. Check permissions on .roadmap/sync.lock",
            Self::Cancelled => "The run was cancelled; remaining entities are retried on the next sync",
            Self::NotFound => "Check the id or path; `roadmap status` lists what is linked",
            Self::IoError => "Check that the project directory exists and is writable",
        }
    }

    /// Whether the user can typically fix this without a code change.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::SerializationError | Self::DatabaseError)
    }

    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self.numeric() {
            100..=199 => "entity",
            200..=299 => "index",
            300..=399 => "config",
            500..=599 => "network",
            600..=699 => "storage",
            700..=799 => "git",
            850..=899 => "lock",
            800..=849 => "validation",
            900..=999 => "internal",
            _ => "unknown",
        }
    }

    pub fn all() -> impl Iterator<Item = Self> {
        [
            Self::EntityNotFound,
            Self::EntityInvalid,
            Self::EntityCorrupted,
            Self::IndexStale,
            Self::ConfigInvalid,
            Self::ConfigMissingRequired,
            Self::NetworkUnreachable,
            Self::NetworkAuthFailed,
            Self::NetworkRequestFailed,
            Self::StorageWriteError,
            Self::DatabaseError,
            Self::SerializationError,
            Self::SyncStateWriteError,
            Self::GitError,
            Self::ValidationFailed,
            Self::LockTimeout,
            Self::LockFailed,
            Self::Cancelled,
            Self::NotFound,
            Self::IoError,
        ]
        .into_iter()
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code_string())
    }
}
