//! File-backed entity store.
//!
//! One markdown file per entity under `.roadmap/<kind dir>/<id>.md`. The
//! store is the single owner of entity content; everything else (index,
//! sync state) is derived or keyed by entity id.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::backup::{AtomicWriter, ReadOutcome};
use crate::core::{Entity, EntityKind};
use crate::error::{Result, RoadmapError};

/// Name of the per-project data directory.
pub const DATA_DIR: &str = ".roadmap";

const GENERATION_FILE: &str = "store.generation";
const BACKUP_DIR: &str = "backups";
const ENTITY_EXT: &str = "md";

/// Restricts [`EntityStore::list`] and [`EntityStore::ids`].
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    /// Empty means every kind.
    pub kinds: Vec<EntityKind>,
    pub ids: Option<BTreeSet<String>>,
}

impl EntityFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn kind(kind: EntityKind) -> Self {
        Self {
            kinds: vec![kind],
            ids: None,
        }
    }

    fn kinds(&self) -> Vec<EntityKind> {
        if self.kinds.is_empty() {
            EntityKind::ALL.to_vec()
        } else {
            self.kinds.clone()
        }
    }

    fn admits(&self, id: &str) -> bool {
        self.ids.as_ref().is_none_or(|ids| ids.contains(id))
    }
}

pub struct EntityStore {
    data_dir: PathBuf,
    writer: AtomicWriter,
    generation: Mutex<()>,
}

impl EntityStore {
    /// Open the store for a project checkout, creating the kind directories.
    pub fn open(project_root: &Path, backup_keep: usize) -> Result<Self> {
        Self::at(project_root.join(DATA_DIR), backup_keep)
    }

    pub fn at(data_dir: impl Into<PathBuf>, backup_keep: usize) -> Result<Self> {
        let data_dir = data_dir.into();
        for kind in EntityKind::ALL {
            fs::create_dir_all(data_dir.join(kind.dir_name()))?;
        }
        let writer = AtomicWriter::new(&data_dir, data_dir.join(BACKUP_DIR), backup_keep);
        Ok(Self {
            data_dir,
            writer,
            generation: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path_for(&self, kind: EntityKind, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self
            .data_dir
            .join(kind.dir_name())
            .join(format!("{id}.{ENTITY_EXT}")))
    }

    /// Find the file for `id`, trying the kind implied by its prefix first.
    #[must_use]
    pub fn locate(&self, id: &str) -> Option<(EntityKind, PathBuf)> {
        let hinted = EntityKind::ALL
            .into_iter()
            .find(|k| id.starts_with(&format!("{}-", k.id_prefix())));
        hinted
            .into_iter()
            .chain(EntityKind::ALL.into_iter().filter(|k| Some(*k) != hinted))
            .find_map(|kind| {
                let path = self.path_for(kind, id).ok()?;
                path.is_file().then_some((kind, path))
            })
    }

    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.locate(id).is_some()
    }

    pub fn load(&self, id: &str) -> Result<Entity> {
        let (_, path) = self
            .locate(id)
            .ok_or_else(|| RoadmapError::EntityNotFound(id.to_string()))?;
        self.load_path(&path)
    }

    /// Parse an entity file, falling back to a backup when the file is
    /// corrupted. An unrecoverable file is `LocalCorruption`.
    pub fn load_path(&self, path: &Path) -> Result<Entity> {
        let origin = path.display().to_string();
        let outcome = self
            .writer
            .read_with_recovery(path, |text| Entity::from_document(text, &origin).is_ok())?;
        match outcome {
            ReadOutcome::Intact(text) => Entity::from_document(&text, &origin),
            ReadOutcome::Recovered { content, backup } => {
                warn!(
                    path = %origin,
                    backup = %backup.display(),
                    "Entity file was corrupted; using backup copy"
                );
                Entity::from_document(&content, &origin)
            }
            ReadOutcome::Unrecoverable { reason } => {
                Err(RoadmapError::LocalCorruption(format!("{origin}: {reason}")))
            }
        }
    }

    /// Entity ids matching `filter`, sorted within each kind.
    pub fn ids(&self, filter: &EntityFilter) -> Result<Vec<String>> {
        Ok(self
            .paths(filter)?
            .into_iter()
            .filter_map(|p| id_from_path(&p))
            .collect())
    }

    /// Lazily load entities matching `filter`. Each call re-scans the
    /// directories, so the sequence can be restarted by calling again.
    pub fn list(&self, filter: &EntityFilter) -> Result<EntityIter<'_>> {
        Ok(EntityIter {
            store: self,
            paths: self.paths(filter)?.into_iter(),
        })
    }

    /// Atomically write `entity`. A failure leaves the previous file intact
    /// and is not retried here.
    pub fn save(&self, entity: &Entity) -> Result<()> {
        let path = self.path_for(entity.kind, &entity.id)?;
        let text = entity.to_document()?;
        self.writer.write_atomic(&path, &text)?;
        self.bump_generation()?;
        debug!(entity_id = %entity.id, kind = %entity.kind, "Saved entity");
        Ok(())
    }

    #[must_use]
    pub fn fingerprint(&self, entity: &Entity) -> String {
        entity.fingerprint()
    }

    /// Monotonic counter bumped on every `save`.
    #[must_use]
    pub fn generation(&self) -> u64 {
        fs::read_to_string(self.data_dir.join(GENERATION_FILE))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Modification time and size of every entity file, keyed by path
    /// relative to the data directory. Catches edits made outside this
    /// crate, which do not bump the generation.
    pub fn file_stamps(&self) -> Result<Vec<(PathBuf, FileStamp)>> {
        let mut out = Vec::new();
        for path in self.paths(&EntityFilter::all())? {
            let meta = fs::metadata(&path)?;
            out.push((path, FileStamp::new(meta.modified()?, meta.len())));
        }
        Ok(out)
    }

    /// `path` relative to the data directory, as stored by the index.
    #[must_use]
    pub fn relative_key(&self, path: &Path) -> String {
        path.strip_prefix(&self.data_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    fn bump_generation(&self) -> Result<()> {
        let _guard = self.generation.lock();
        let next = self.generation() + 1;
        AtomicWriter::without_backups(&self.data_dir)
            .write_atomic(&self.data_dir.join(GENERATION_FILE), &next.to_string())
    }

    fn paths(&self, filter: &EntityFilter) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for kind in filter.kinds() {
            let dir = self.data_dir.join(kind.dir_name());
            if !dir.is_dir() {
                continue;
            }
            let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
                .filter_map(std::result::Result::ok)
                .map(|e| e.path())
                .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == ENTITY_EXT))
                .filter(|p| id_from_path(p).is_some_and(|id| filter.admits(&id)))
                .collect();
            paths.sort();
            out.extend(paths);
        }
        Ok(out)
    }
}

/// What the index remembers about an entity file to notice later edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub modified_ns: u128,
    pub size: u64,
}

impl FileStamp {
    #[must_use]
    pub fn new(modified: SystemTime, size: u64) -> Self {
        Self {
            modified_ns: modified
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_nanos()),
            size,
        }
    }
}

pub struct EntityIter<'a> {
    store: &'a EntityStore,
    paths: std::vec::IntoIter<PathBuf>,
}

impl Iterator for EntityIter<'_> {
    type Item = Result<Entity>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.paths.next()?;
        Some(self.store.load_path(&path))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.paths.size_hint()
    }
}

fn id_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    (!stem.starts_with('.')).then(|| stem.to_string())
}

fn validate_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(RoadmapError::ValidationFailed(format!(
            "invalid entity id {id:?}: use letters, digits, '-', '_' or '.'"
        )))
    }
}
