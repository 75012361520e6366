//! Atomic file writes with rotating backups.
//!
//! `write_atomic` writes to a temp file in the destination directory, fsyncs
//! it and renames it over the target, so readers see either the old or the
//! new content. Before replacing a file the previous version is copied into
//! the backup directory as `<relative path>.1`, shifting older copies up to
//! `keep`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{Result, RoadmapError};

/// Outcome of [`AtomicWriter::read_with_recovery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Intact(String),
    /// The file was unreadable or invalid; a backup passed validation.
    Recovered { content: String, backup: PathBuf },
    Unrecoverable { reason: String },
}

#[derive(Debug, Clone)]
pub struct AtomicWriter {
    root: PathBuf,
    backup_dir: PathBuf,
    keep: usize,
}

impl AtomicWriter {
    /// `root` is the directory whose relative layout is mirrored under
    /// `backup_dir`.
    pub fn new(root: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            root: root.into(),
            backup_dir: backup_dir.into(),
            keep,
        }
    }

    pub fn without_backups(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            backup_dir: root.clone(),
            root,
            keep: 0,
        }
    }

    #[must_use]
    pub const fn keep(&self) -> usize {
        self.keep
    }

    pub fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        let write_failed = |reason: String| RoadmapError::WriteFailed {
            path: path.display().to_string(),
            reason,
        };

        let parent = path
            .parent()
            .ok_or_else(|| write_failed("path has no parent directory".to_string()))?;
        fs::create_dir_all(parent).map_err(|e| write_failed(format!("create dir: {e}")))?;

        if self.keep > 0 && path.is_file() {
            if let Err(e) = self.rotate(path) {
                warn!(path = %path.display(), error = %e, "Backup rotation failed");
            }
        }

        let mut tmp =
            NamedTempFile::new_in(parent).map_err(|e| write_failed(format!("temp file: {e}")))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| write_failed(format!("write: {e}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| write_failed(format!("fsync: {e}")))?;
        tmp.persist(path)
            .map_err(|e| write_failed(format!("rename: {}", e.error)))?;

        debug!(path = %path.display(), bytes = content.len(), "Atomic write complete");
        Ok(())
    }

    /// Read `path`, falling back to the newest backup that `is_valid`
    /// accepts. A missing file is an `Io(NotFound)` error, not corruption.
    pub fn read_with_recovery<F>(&self, path: &Path, is_valid: F) -> Result<ReadOutcome>
    where
        F: Fn(&str) -> bool,
    {
        let reason = match fs::read_to_string(path) {
            Ok(content) if is_valid(&content) => return Ok(ReadOutcome::Intact(content)),
            Ok(_) => "content failed validation".to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(e.into()),
            Err(e) => format!("read failed: {e}"),
        };

        for backup in self.backups(path) {
            match fs::read_to_string(&backup) {
                Ok(content) if is_valid(&content) => {
                    warn!(
                        path = %path.display(),
                        backup = %backup.display(),
                        reason = %reason,
                        "Recovered content from backup"
                    );
                    return Ok(ReadOutcome::Recovered { content, backup });
                }
                _ => debug!(backup = %backup.display(), "Backup unusable"),
            }
        }

        Ok(ReadOutcome::Unrecoverable { reason })
    }

    /// Existing backups for `path`, newest first.
    #[must_use]
    pub fn backups(&self, path: &Path) -> Vec<PathBuf> {
        (1..=self.keep)
            .map(|n| self.backup_path(path, n))
            .filter(|p| p.is_file())
            .collect()
    }

    fn rotate(&self, path: &Path) -> std::io::Result<()> {
        let newest = self.backup_path(path, 1);
        if let Some(dir) = newest.parent() {
            fs::create_dir_all(dir)?;
        }
        let oldest = self.backup_path(path, self.keep);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.keep).rev() {
            let from = self.backup_path(path, n);
            if from.exists() {
                fs::rename(&from, self.backup_path(path, n + 1))?;
            }
        }
        fs::copy(path, &newest)?;
        Ok(())
    }

    fn backup_path(&self, path: &Path, n: usize) -> PathBuf {
        let relative = path
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.file_name().map(PathBuf::from).unwrap_or_default());
        let mut name = relative.into_os_string();
        name.push(format!(".{n}"));
        self.backup_dir.join(name)
    }
}
