use clap::Args;
use serde::Serialize;
use tracing::info;

use crate::app::AppContext;
use crate::cli::output::{HumanLayout, emit_human, emit_json};
use crate::core::SyncStatus;
use crate::error::{Result, RoadmapError};
use crate::storage::RunLock;
use crate::sync::{BackendKind, SyncStateTracker};

#[derive(Args, Debug)]
pub struct UnlinkArgs {
    /// Local entity id
    pub id: String,

    /// Backend to unlink from: github or git
    pub backend: String,
}

#[derive(Debug, Serialize)]
pub struct UnlinkResult {
    pub id: String,
    pub backend: String,
    /// Remote id the entity was linked to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub record_removed: bool,
}

/// Remove the sync record and the front-matter link. The next sync treats
/// the entity as never pushed.
pub fn unlink(ctx: &AppContext, id: &str, backend: BackendKind) -> Result<UnlinkResult> {
    let _lock = RunLock::acquire_timeout(ctx.store.data_dir(), ctx.config.sync.lock_timeout)?;
    let tracker = SyncStateTracker::new(ctx.store.data_dir());
    let record = tracker.get(id, backend.name())?;

    let mut entity = ctx.store.load(id)?;
    let link = entity.unlink_remote(backend.name());
    if record.is_none() && link.is_none() {
        return Err(RoadmapError::NotFound(format!("{id} is not linked to {backend}")));
    }
    let record_removed = tracker.unlink(id, backend.name())?;
    if matches!(entity.sync.sync_status, SyncStatus::Synced | SyncStatus::Conflict) {
        entity.sync.sync_status = SyncStatus::Pending;
    }
    ctx.store.save(&entity)?;

    let remote_id = record.map(|r| r.remote_id).or(link);
    info!(entity_id = %id, backend = %backend, remote_id = ?remote_id, "Unlinked entity");
    Ok(UnlinkResult {
        id: id.to_string(),
        backend: backend.name().to_string(),
        remote_id,
        record_removed,
    })
}

pub fn run(ctx: &AppContext, args: &UnlinkArgs) -> Result<i32> {
    let backend = BackendKind::parse(&args.backend)?;
    let result = unlink(ctx, &args.id, backend)?;
    if ctx.json {
        emit_json(&result)?;
    } else {
        let mut layout = HumanLayout::new();
        layout.title(&format!("Unlinked {} from {}", result.id, result.backend));
        if let Some(remote_id) = &result.remote_id {
            layout.kv("was linked to", remote_id);
        }
        emit_human(layout);
    }
    Ok(0)
}
