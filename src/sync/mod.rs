//! Synchronization between the local entity store and a remote tracker.

pub mod backend;
pub mod config;
pub mod conflict;
pub mod github;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod state;
pub mod vanilla;

use std::path::Path;

pub use backend::{
    Backend, BackendError, BackendFailure, BackendResult, PushOutcome, PushRequest, RemoteEntity,
    Retried,
};
pub use config::{BackendKind, ConflictStrategy, GitAuth, RemoteDeletedPolicy, SyncDirection};
pub use conflict::{ChangeClass, ConflictResolver, Resolution, Timestamps, classify};
pub use github::GitHubBackend;
pub use orchestrator::{CancelToken, SyncOptions, SyncOrchestrator};
pub use report::{Action, EntityOutcome, EntityState, ErrorKind, RunOutcome, SyncReport};
pub use retry::{RetryPolicy, Sleeper, ThreadSleeper};
pub use state::{SyncRecord, SyncStateTracker};
pub use vanilla::GitBackend;

use crate::auth::CredentialProvider;
use crate::config::Config;
use crate::error::Result;

/// A backend ready for a run, or the reason it is disabled.
pub enum Connection {
    Ready(Box<dyn Backend>),
    Disabled { backend: String, reason: String },
}

/// Build the configured backend. A missing token disables GitHub rather
/// than failing; the Git backend falls back to its own auth settings.
pub fn connect(
    kind: BackendKind,
    config: &Config,
    data_dir: &Path,
    credentials: &dyn CredentialProvider,
) -> Result<Connection> {
    let token = credentials.get_token(kind.name());
    let backend: Box<dyn Backend> = match kind {
        BackendKind::GitHub => {
            let Some(token) = token else {
                return Ok(Connection::Disabled {
                    backend: kind.name().to_string(),
                    reason: format!(
                        "no token for {kind}; set {} or store one",
                        crate::auth::env_keys(kind.name()).join(" / ")
                    ),
                });
            };
            Box::new(GitHubBackend::new(
                &config.github,
                config.sync.rate_limit_budget,
                token,
            )?)
        }
        BackendKind::Git => Box::new(GitBackend::new(&config.git, data_dir, token)?),
    };
    Ok(Connection::Ready(backend))
}

/// Report for a run that never started because the backend is disabled.
#[must_use]
pub fn disabled_report(backend: &str, reason: &str, dry_run: bool) -> SyncReport {
    let mut report = SyncReport::new(backend, dry_run);
    report.abort_with(ErrorKind::AuthError, reason);
    report.finish();
    report
}
