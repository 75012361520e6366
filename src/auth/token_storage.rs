//! File-backed token storage.
//!
//! Tokens live in a JSON map (`backend name -> token`) at
//! `<config dir>/roadmap/credentials.json`. The file is only read here and
//! is expected to be 0600 on Unix; wider permissions are logged as insecure.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::CredentialProvider;
use crate::error::{Result, RoadmapError};

const CREDENTIALS_FILENAME: &str = "credentials.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    tokens: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the platform config directory.
    pub fn default_location() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| RoadmapError::Config("Could not find config directory".to_string()))?;
        Ok(Self::new(dir.join("roadmap").join(CREDENTIALS_FILENAME)))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<CredentialsFile>> {
        if !self.path.exists() {
            return Ok(None);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let mode = fs::metadata(&self.path)?.mode() & 0o777;
            if mode != 0o600 {
                warn!(
                    path = %self.path.display(),
                    mode = format!("{mode:o}"),
                    "Credentials file has insecure permissions"
                );
            }
        }

        let json = fs::read_to_string(&self.path)
            .map_err(|e| RoadmapError::Auth(format!("Failed to read credentials: {e}")))?;
        let file = serde_json::from_str(&json)
            .map_err(|e| RoadmapError::Auth(format!("Invalid credentials file: {e}")))?;
        Ok(Some(file))
    }
}

impl CredentialProvider for FileTokenStore {
    fn get_token(&self, backend: &str) -> Option<String> {
        match self.read() {
            Ok(file) => file.and_then(|f| f.tokens.get(backend).cloned()),
            Err(e) => {
                warn!(error = %e, "Credentials file unreadable");
                None
            }
        }
    }
}

/// Writers for tests; users manage the file themselves.
#[cfg(test)]
impl FileTokenStore {
    pub fn save(&self, backend: &str, token: &str) -> Result<()> {
        let mut file = self.read()?.unwrap_or_default();
        file.tokens.insert(backend.to_string(), token.to_string());
        self.write(&file)
    }

    /// Returns whether a token was stored for `backend`.
    pub fn clear(&self, backend: &str) -> Result<bool> {
        let Some(mut file) = self.read()? else {
            return Ok(false);
        };
        let removed = file.tokens.remove(backend).is_some();
        if removed {
            self.write(&file)?;
        }
        Ok(removed)
    }

    fn write(&self, file: &CredentialsFile) -> Result<()> {
        let json = serde_json::to_string_pretty(file)
            .map_err(|e| RoadmapError::Auth(format!("Failed to serialize credentials: {e}")))?;
        let root = self.path.parent().unwrap_or_else(|| Path::new("."));
        crate::storage::AtomicWriter::without_backups(root).write_atomic(&self.path, &json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
                .map_err(|e| RoadmapError::Auth(format!("Failed to set permissions: {e}")))?;
        }
        Ok(())
    }
}
