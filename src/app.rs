//! Per-invocation context shared by CLI commands.

use std::path::PathBuf;

use tracing::debug;

use crate::cli::Cli;
use crate::config::Config;
use crate::error::Result;
use crate::storage::{DATA_DIR, EntityStore};

pub struct AppContext {
    /// Project checkout containing the data directory.
    pub root: PathBuf,
    pub config: Config,
    pub store: EntityStore,
    pub json: bool,
}

impl AppContext {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let root = match &cli.root {
            Some(root) => root.clone(),
            None => std::env::current_dir()?,
        };
        let data_dir = root.join(DATA_DIR);
        let config = Config::load(cli.config.as_deref(), &data_dir)?;
        let store = EntityStore::open(&root, config.sync.backup_keep)?;
        debug!(root = %root.display(), backend = %config.sync.backend, "Loaded context");
        Ok(Self {
            root,
            config,
            store,
            json: cli.json,
        })
    }
}
