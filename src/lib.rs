//! Local-first issue, milestone and project tracking with sync to GitHub
//! or a plain git remote.

pub mod app;
pub mod auth;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod storage;
pub mod sync;

pub use error::{Result, RoadmapError};

/// Package version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
