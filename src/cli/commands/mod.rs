//! Subcommand implementations. Each returns the process exit code.

use crate::app::AppContext;
use crate::cli::Commands;
use crate::error::Result;

pub mod check;
pub mod index;
pub mod status;
pub mod sync;
pub mod unlink;

pub fn run(ctx: &AppContext, command: &Commands) -> Result<i32> {
    match command {
        Commands::Sync(args) => sync::run(ctx, args),
        Commands::Status(args) => status::run(ctx, args),
        Commands::Unlink(args) => unlink::run(ctx, args),
        Commands::Index(args) => index::run(ctx, args),
        Commands::Check(args) => check::run(ctx, args),
    }
}
