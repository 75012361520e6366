use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;

use crate::app::AppContext;
use crate::cli::output::{HumanLayout, emit_human, emit_json};
use crate::core::{EntityKind, SyncStatus};
use crate::error::Result;
use crate::storage::EntityFilter;
use crate::sync::{BackendKind, SyncStateTracker};

#[derive(Args, Debug, Default)]
pub struct StatusArgs {
    /// Backend whose links to show (default from config)
    #[arg(long, value_name = "BACKEND")]
    pub backend: Option<String>,

    /// Only entities that are not in sync
    #[arg(long)]
    pub pending: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusRow {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<EntityKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<SyncStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    pub conflict: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusRow {
    fn needs_attention(&self) -> bool {
        self.conflict || self.error.is_some() || self.sync_status != Some(SyncStatus::Synced)
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_listed_at: Option<DateTime<Utc>>,
    pub entities: Vec<StatusRow>,
}

pub fn collect(ctx: &AppContext, backend: &str) -> Result<StatusReport> {
    let tracker = SyncStateTracker::new(ctx.store.data_dir());
    let records = tracker.records(backend)?;
    let mut entities = Vec::new();
    for id in ctx.store.ids(&EntityFilter::all())? {
        let record = records.get(&id);
        let row = match ctx.store.load(&id) {
            Ok(entity) => StatusRow {
                kind: Some(entity.kind),
                title: Some(entity.fields.title.clone()),
                sync_status: Some(entity.sync.sync_status),
                remote_id: record
                    .map(|r| r.remote_id.clone())
                    .or_else(|| entity.remote_id(backend).map(str::to_string)),
                last_synced_at: record.and_then(|r| r.last_synced_at).or(entity.sync.last_synced_at),
                conflict: record.is_some_and(|r| r.conflict_marker),
                error: record.and_then(|r| r.last_error.clone()),
                id,
            },
            Err(e) => StatusRow {
                kind: None,
                title: None,
                sync_status: None,
                remote_id: record.map(|r| r.remote_id.clone()),
                last_synced_at: record.and_then(|r| r.last_synced_at),
                conflict: false,
                error: Some(format!("unreadable: {e}")),
                id,
            },
        };
        entities.push(row);
    }
    Ok(StatusReport {
        backend: backend.to_string(),
        last_listed_at: tracker.cursor(backend)?,
        entities,
    })
}

pub fn run(ctx: &AppContext, args: &StatusArgs) -> Result<i32> {
    let backend = match args.backend.as_deref() {
        Some(name) => BackendKind::parse(name)?,
        None => ctx.config.sync.backend,
    };
    let mut report = collect(ctx, backend.name())?;
    if args.pending {
        report.entities.retain(StatusRow::needs_attention);
    }

    if ctx.json {
        emit_json(&report)?;
        return Ok(0);
    }

    let mut layout = HumanLayout::new();
    layout.title(&format!("Sync status ({})", report.backend));
    let listed = report
        .last_listed_at
        .map_or_else(|| "never".to_string(), |at| at.to_rfc3339());
    layout.kv("last sync", &listed);
    layout.kv("entities", &report.entities.len().to_string());
    if !report.entities.is_empty() {
        layout.blank();
    }
    for row in &report.entities {
        let status = match (row.conflict, row.sync_status) {
            (true, _) | (_, Some(SyncStatus::Conflict)) => "conflict".red().to_string(),
            (_, Some(SyncStatus::Synced)) => "synced".green().to_string(),
            (_, Some(status)) => status.to_string().yellow().to_string(),
            (_, None) => "unreadable".red().to_string(),
        };
        let mut line = format!("{status} {}", row.id);
        if let Some(title) = &row.title {
            line.push_str(&format!(" {title}"));
        }
        if let Some(remote_id) = &row.remote_id {
            line.push_str(&format!(" [{remote_id}]").dimmed().to_string());
        }
        if let Some(error) = &row.error {
            line.push_str(&format!(": {error}"));
        }
        layout.bullet(&line);
    }
    emit_human(layout);
    Ok(0)
}
