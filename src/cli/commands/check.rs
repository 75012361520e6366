use clap::Args;
use colored::Colorize;
use serde::Serialize;

use crate::app::AppContext;
use crate::auth::ChainedProvider;
use crate::cli::output::{HumanLayout, emit_human, emit_json};
use crate::error::Result;
use crate::sync::{self, BackendKind, Connection};

#[derive(Args, Debug, Default)]
pub struct CheckArgs {
    /// Backend to check: github or git (default from config)
    #[arg(long, value_name = "BACKEND")]
    pub backend: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub backend: String,
    pub reachable: bool,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    const fn ok(&self) -> bool {
        self.reachable && self.authenticated
    }
}

pub fn check(ctx: &AppContext, kind: BackendKind) -> Result<CheckResult> {
    let credentials = ChainedProvider::standard();
    let backend = match sync::connect(kind, &ctx.config, ctx.store.data_dir(), &credentials)? {
        Connection::Ready(backend) => backend,
        Connection::Disabled { backend, reason } => {
            return Ok(CheckResult {
                backend,
                reachable: false,
                authenticated: false,
                error: Some(reason),
            });
        }
    };
    let name = backend.name().to_string();
    if let Err(reason) = backend.check_connectivity() {
        return Ok(CheckResult {
            backend: name,
            reachable: false,
            authenticated: false,
            error: Some(reason),
        });
    }
    Ok(match backend.authenticate() {
        Ok(()) => CheckResult {
            backend: name,
            reachable: true,
            authenticated: true,
            error: None,
        },
        Err(e) => CheckResult {
            backend: name,
            reachable: true,
            authenticated: false,
            error: Some(e.to_string()),
        },
    })
}

pub fn run(ctx: &AppContext, args: &CheckArgs) -> Result<i32> {
    let kind = match args.backend.as_deref() {
        Some(name) => BackendKind::parse(name)?,
        None => ctx.config.sync.backend,
    };
    let result = check(ctx, kind)?;
    if ctx.json {
        emit_json(&result)?;
    } else {
        let yes_no = |flag: bool| {
            if flag {
                "yes".green().to_string()
            } else {
                "no".red().to_string()
            }
        };
        let mut layout = HumanLayout::new();
        layout.title(&format!("Backend {}", result.backend));
        layout
            .kv("reachable", &yes_no(result.reachable))
            .kv("authenticated", &yes_no(result.authenticated));
        if let Some(error) = &result.error {
            layout.kv("error", error);
        }
        emit_human(layout);
    }
    Ok(if result.ok() { 0 } else { 2 })
}
