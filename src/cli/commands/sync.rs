use std::time::Duration;

use clap::Args;
use tracing::warn;

use crate::app::AppContext;
use crate::auth::ChainedProvider;
use crate::cli::output::{emit_human, emit_json, render_report};
use crate::error::Result;
use crate::sync::{
    self, BackendKind, CancelToken, Connection, SyncDirection, SyncOptions, SyncOrchestrator,
};

#[derive(Args, Debug, Default)]
pub struct SyncArgs {
    /// Show what would happen without touching local files or the remote
    #[arg(long)]
    pub dry_run: bool,

    /// List every remote entity instead of changes since the last run
    #[arg(long)]
    pub full: bool,

    /// Only push local changes
    #[arg(long, conflicts_with = "pull_only")]
    pub push_only: bool,

    /// Only pull remote changes
    #[arg(long, conflicts_with = "push_only")]
    pub pull_only: bool,

    /// Backend to sync with: github or git (default from config)
    #[arg(long, value_name = "BACKEND")]
    pub backend: Option<String>,

    /// Stop starting new entities after this long (e.g. 90s, 5m)
    #[arg(long, value_parser = parse_duration, value_name = "DURATION")]
    pub timeout: Option<Duration>,
}

impl SyncArgs {
    const fn direction(&self) -> SyncDirection {
        if self.push_only {
            SyncDirection::PushOnly
        } else if self.pull_only {
            SyncDirection::PullOnly
        } else {
            SyncDirection::Bidirectional
        }
    }
}

fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

pub fn run(ctx: &AppContext, args: &SyncArgs) -> Result<i32> {
    let kind = match args.backend.as_deref() {
        Some(name) => BackendKind::parse(name)?,
        None => ctx.config.sync.backend,
    };
    let credentials = ChainedProvider::standard();

    let report = match sync::connect(kind, &ctx.config, ctx.store.data_dir(), &credentials)? {
        Connection::Disabled { backend, reason } => {
            warn!(backend = %backend, "Backend disabled: {reason}");
            sync::disabled_report(&backend, &reason, args.dry_run)
        }
        Connection::Ready(backend) => {
            let options = SyncOptions {
                dry_run: args.dry_run,
                full: args.full,
                direction: args.direction(),
                timeout: args.timeout,
            };
            let mut cancel = CancelToken::new();
            if let Some(timeout) = options.timeout {
                cancel = cancel.with_deadline(timeout);
            }
            SyncOrchestrator::new(&ctx.store, backend.as_ref(), &ctx.config.sync)
                .run(&options, &cancel)?
        }
    };

    if ctx.json {
        emit_json(&report)?;
    } else {
        emit_human(render_report(&report));
    }
    Ok(report.outcome().exit_code())
}
