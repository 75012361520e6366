//! Command-line interface (clap derive).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod commands;
pub mod output;

/// Local-first issue, milestone and project tracker with GitHub and git sync
#[derive(Parser, Debug)]
#[command(name = "roadmap")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Machine-readable JSON on stdout (and JSON logs on stderr)
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress logging except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file path (replaces the global and project config files)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Project root (default: current directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Synchronize local entities with the configured backend
    Sync(commands::sync::SyncArgs),

    /// Show per-entity sync state
    Status(commands::status::StatusArgs),

    /// Forget the link between an entity and a backend
    Unlink(commands::unlink::UnlinkArgs),

    /// Manage the secondary index
    Index(commands::index::IndexArgs),

    /// Check that the backend is reachable and credentials work
    Check(commands::check::CheckArgs),
}
