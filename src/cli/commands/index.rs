//! roadmap index - rebuild or inspect the secondary index

use std::time::Instant;

use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Serialize;

use crate::app::AppContext;
use crate::cli::output::{HumanLayout, emit_human, emit_json};
use crate::error::Result;
use crate::storage::{EntityIndex, RunLock};

#[derive(Args, Debug)]
pub struct IndexArgs {
    #[command(subcommand)]
    pub command: IndexCommand,
}

#[derive(Subcommand, Debug)]
pub enum IndexCommand {
    /// Drop and rebuild the index from the entity files
    Rebuild,
    /// Report whether the index is behind the entity files
    Status,
}

#[derive(Debug, Serialize)]
struct RebuildSummary {
    indexed: usize,
    skipped: usize,
    elapsed_ms: u128,
}

#[derive(Debug, Serialize)]
struct IndexStatus {
    exists: bool,
    stale: bool,
}

pub fn run(ctx: &AppContext, args: &IndexArgs) -> Result<i32> {
    match args.command {
        IndexCommand::Rebuild => rebuild(ctx),
        IndexCommand::Status => status(ctx),
    }
}

fn rebuild(ctx: &AppContext) -> Result<i32> {
    let _lock = RunLock::acquire_timeout(ctx.store.data_dir(), ctx.config.sync.lock_timeout)?;
    let start = Instant::now();
    let mut index = EntityIndex::open(ctx.store.data_dir())?;
    let stats = index.rebuild_from_store(&ctx.store)?;
    let summary = RebuildSummary {
        indexed: stats.indexed,
        skipped: stats.skipped,
        elapsed_ms: start.elapsed().as_millis(),
    };

    if ctx.json {
        emit_json(&summary)?;
    } else {
        let mut layout = HumanLayout::new();
        layout.title("Index rebuilt");
        layout
            .kv("indexed", &summary.indexed.to_string())
            .kv("elapsed", &format!("{}ms", summary.elapsed_ms));
        if summary.skipped > 0 {
            layout.kv("skipped", &summary.skipped.to_string().yellow().to_string());
        }
        emit_human(layout);
    }
    Ok(0)
}

fn status(ctx: &AppContext) -> Result<i32> {
    let status = match EntityIndex::open_existing(ctx.store.data_dir())? {
        Some(index) => IndexStatus {
            exists: true,
            stale: index.is_stale(&ctx.store)?,
        },
        None => IndexStatus {
            exists: false,
            stale: true,
        },
    };
    if ctx.json {
        emit_json(&status)?;
    } else {
        let state = match (status.exists, status.stale) {
            (false, _) => "missing".yellow().to_string(),
            (true, true) => "stale".yellow().to_string(),
            (true, false) => "fresh".green().to_string(),
        };
        let mut layout = HumanLayout::new();
        layout.kv("index", &state);
        emit_human(layout);
    }
    Ok(0)
}
