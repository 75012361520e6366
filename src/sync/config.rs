use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RoadmapError};

/// Which remote transport a run talks to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    #[serde(alias = "gh")]
    GitHub,
    #[serde(alias = "vanilla")]
    Git,
}

impl BackendKind {
    /// Name used as the key in `remote_ids` and in sync state paths.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::Git => "git",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "github" | "gh" => Ok(Self::GitHub),
            "git" | "vanilla" => Ok(Self::Git),
            _ => Err(RoadmapError::Config(format!(
                "unknown backend: {value} (use github|git)"
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolution policy for true conflicts. Chosen once per run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    LocalWins,
    RemoteWins,
    /// Compares last-modified timestamps. A push that bumps the remote's
    /// own timestamp can make a later read in the same run see the remote
    /// as newer; this race is known and left unresolved.
    NewerWins,
}

impl ConflictStrategy {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "local_wins" | "local-wins" | "local" => Ok(Self::LocalWins),
            "remote_wins" | "remote-wins" | "remote" => Ok(Self::RemoteWins),
            "newer_wins" | "newer-wins" | "newer" => Ok(Self::NewerWins),
            _ => Err(RoadmapError::Config(format!(
                "unknown conflict strategy: {value} (use local_wins|remote_wins|newer_wins)"
            ))),
        }
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::LocalWins => "local_wins",
            Self::RemoteWins => "remote_wins",
            Self::NewerWins => "newer_wins",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SyncDirection {
    PullOnly,
    PushOnly,
    #[default]
    Bidirectional,
}

impl SyncDirection {
    #[must_use]
    pub const fn allows_pull(self) -> bool {
        matches!(self, Self::PullOnly | Self::Bidirectional)
    }

    #[must_use]
    pub const fn allows_push(self) -> bool {
        matches!(self, Self::PushOnly | Self::Bidirectional)
    }
}

/// What to do when a linked remote entity turns out to be gone.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteDeletedPolicy {
    /// Report it and keep the link.
    #[default]
    Ignore,
    /// Push-create a fresh remote entity and relink.
    Recreate,
    /// Drop the sync record and the front-matter link.
    Unlink,
}

impl RemoteDeletedPolicy {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "ignore" => Ok(Self::Ignore),
            "recreate" => Ok(Self::Recreate),
            "unlink" => Ok(Self::Unlink),
            _ => Err(RoadmapError::Config(format!(
                "unknown on_remote_deleted policy: {value} (use ignore|recreate|unlink)"
            ))),
        }
    }
}

/// Credentials for the vanilla git transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum GitAuth {
    SshKey {
        key_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase_env: Option<String>,
    },
    Token {
        token_env: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
}
