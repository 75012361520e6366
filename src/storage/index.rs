//! SQLite secondary index over the entity store.
//!
//! Purely a cache: it is rebuilt wholesale from the files and can be deleted
//! at any time. Staleness is detected from the store's generation counter and
//! a per-file (mtime, size) stamp taken just before each file was read, so
//! edits from other tools count even when they keep an old mtime.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::{debug, info, warn};

use super::store::{EntityStore, FileStamp};
use crate::core::{EntityKind, SyncStatus};
use crate::error::{Result, RoadmapError};

pub const INDEX_FILE: &str = "index.db";

const MIGRATIONS: [&str; 2] = [
    include_str!("../../migrations/001_entity_index.sql"),
    include_str!("../../migrations/002_file_stamps.sql"),
];

const META_GENERATION: &str = "store_generation";

/// Filter for [`EntityIndex::query`].
#[derive(Debug, Clone, Default)]
pub struct IndexQuery {
    /// Empty means every kind.
    pub kinds: Vec<EntityKind>,
    pub sync_status: Option<SyncStatus>,
    /// Only entities linked to this backend.
    pub linked_to: Option<String>,
    /// Only entities with no link to this backend.
    pub unlinked_from: Option<String>,
}

/// One row of [`EntityIndex::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedEntity {
    pub id: String,
    pub kind: EntityKind,
    pub fingerprint: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub remote_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub indexed: usize,
    pub skipped: usize,
}

pub struct EntityIndex {
    conn: Connection,
    path: PathBuf,
}

impl std::fmt::Debug for EntityIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityIndex")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl EntityIndex {
    /// Open (creating if needed) the index in `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(INDEX_FILE);
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        run_migrations(&conn)?;
        Ok(Self { conn, path })
    }

    /// Open only if the file already exists.
    pub fn open_existing(data_dir: &Path) -> Result<Option<Self>> {
        if data_dir.join(INDEX_FILE).is_file() {
            Self::open(data_dir).map(Some)
        } else {
            Ok(None)
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the index contents with a fresh scan of `store`. Files that
    /// fail to parse are skipped and logged.
    pub fn rebuild_from_store(&mut self, store: &EntityStore) -> Result<RebuildStats> {
        let generation = store.generation();
        let files = store.file_stamps()?;
        let mut stats = RebuildStats::default();

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM entity_remotes", [])?;
        tx.execute("DELETE FROM entities", [])?;
        tx.execute("DELETE FROM entity_files", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO entities (id, kind, title, status, sync_status, fingerprint, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            let mut insert_remote = tx.prepare(
                "INSERT INTO entity_remotes (entity_id, backend, remote_id) VALUES (?1, ?2, ?3)",
            )?;
            let mut insert_file = tx.prepare(
                "INSERT INTO entity_files (path, modified_ns, size) VALUES (?1, ?2, ?3)",
            )?;
            for (path, stamp) in &files {
                insert_file.execute(params![
                    store.relative_key(path),
                    stamp.modified_ns.to_string(),
                    i64::try_from(stamp.size).unwrap_or(i64::MAX),
                ])?;
                let entity = match store.load_path(path) {
                    Ok(entity) => entity,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable entity during index rebuild");
                        stats.skipped += 1;
                        continue;
                    }
                };
                insert.execute(params![
                    entity.id,
                    entity.kind.as_str(),
                    entity.fields.title,
                    entity.fields.status,
                    entity.sync.sync_status.to_string(),
                    entity.fingerprint(),
                    entity.updated_at.map(|at| at.to_rfc3339()).unwrap_or_default(),
                ])?;
                for (backend, remote_id) in &entity.sync.remote_ids {
                    insert_remote.execute(params![entity.id, backend, remote_id])?;
                }
                stats.indexed += 1;
            }
        }
        set_meta(&tx, META_GENERATION, &generation.to_string())?;
        tx.commit()?;

        info!(
            indexed = stats.indexed,
            skipped = stats.skipped,
            generation,
            "Rebuilt entity index"
        );
        Ok(stats)
    }

    /// True when the store changed after the last rebuild: a save through
    /// the store, or any file added, removed or touched from outside.
    pub fn is_stale(&self, store: &EntityStore) -> Result<bool> {
        let Some(generation) = self.meta(META_GENERATION)? else {
            return Ok(true);
        };
        if generation.parse::<u64>().ok() != Some(store.generation()) {
            debug!("Index generation mismatch");
            return Ok(true);
        }
        let recorded = self.file_stamps()?;
        let current: BTreeMap<String, FileStamp> = store
            .file_stamps()?
            .into_iter()
            .map(|(path, stamp)| (store.relative_key(&path), stamp))
            .collect();
        if recorded != current {
            debug!(recorded = recorded.len(), current = current.len(), "Entity files changed since index rebuild");
            return Ok(true);
        }
        Ok(false)
    }

    fn file_stamps(&self) -> Result<BTreeMap<String, FileStamp>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path, modified_ns, size FROM entity_files")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (path, modified_ns, size) = row?;
            out.insert(
                path,
                FileStamp {
                    // An unparsable stamp never matches a real file.
                    modified_ns: modified_ns.parse().unwrap_or(u128::MAX),
                    size: u64::try_from(size).unwrap_or(u64::MAX),
                },
            );
        }
        Ok(out)
    }

    pub fn query(&self, query: &IndexQuery) -> Result<Vec<String>> {
        Ok(self
            .snapshot(query, query.linked_to.as_deref())?
            .into_iter()
            .map(|row| row.id)
            .collect())
    }

    /// Rows matching `query`, with the remote id for `backend` when given.
    pub fn snapshot(&self, query: &IndexQuery, backend: Option<&str>) -> Result<Vec<IndexedEntity>> {
        let mut sql = String::from(
            "SELECT e.id, e.kind, e.fingerprint, e.updated_at, e.sync_status, r.remote_id
             FROM entities e
             LEFT JOIN entity_remotes r ON r.entity_id = e.id AND r.backend = ?1
             WHERE 1 = 1",
        );
        let mut args: Vec<String> = vec![backend.unwrap_or_default().to_string()];

        if !query.kinds.is_empty() {
            let marks: Vec<String> = query
                .kinds
                .iter()
                .map(|kind| {
                    args.push(kind.as_str().to_string());
                    format!("?{}", args.len())
                })
                .collect();
            sql.push_str(&format!(" AND e.kind IN ({})", marks.join(", ")));
        }
        if let Some(status) = query.sync_status {
            args.push(status.to_string());
            sql.push_str(&format!(" AND e.sync_status = ?{}", args.len()));
        }
        if let Some(linked) = &query.linked_to {
            args.push(linked.clone());
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM entity_remotes x WHERE x.entity_id = e.id AND x.backend = ?{})",
                args.len()
            ));
        }
        if let Some(unlinked) = &query.unlinked_from {
            args.push(unlinked.clone());
            sql.push_str(&format!(
                " AND NOT EXISTS (SELECT 1 FROM entity_remotes x WHERE x.entity_id = e.id AND x.backend = ?{})",
                args.len()
            ));
        }
        sql.push_str(" ORDER BY e.kind, e.id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, kind, fingerprint, updated_at, sync_status, remote_id) = row?;
            out.push(IndexedEntity {
                kind: EntityKind::parse(&kind)?,
                updated_at: parse_timestamp(&updated_at)?,
                sync_status: parse_sync_status(&sync_status),
                id,
                fingerprint,
                remote_id,
            });
        }
        Ok(out)
    }

    fn meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM index_meta WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO index_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn run_migrations(conn: &Connection) -> Result<u32> {
    let current: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let target = u32::try_from(idx + 1).unwrap_or(u32::MAX);
        if current >= target {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.pragma_update(None, "user_version", target)?;
    }
    Ok(u32::try_from(MIGRATIONS.len()).unwrap_or(u32::MAX))
}

/// Empty means the entity file carries no `updated_at`.
fn parse_timestamp(value: &str) -> Result<Option<DateTime<Utc>>> {
    if value.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|at| Some(at.with_timezone(&Utc)))
        .map_err(|e| RoadmapError::ValidationFailed(format!("index timestamp: {e}")))
}

fn parse_sync_status(value: &str) -> SyncStatus {
    match value {
        "synced" => SyncStatus::Synced,
        "conflict" => SyncStatus::Conflict,
        "error" => SyncStatus::Error,
        _ => SyncStatus::Pending,
    }
}
