//! Credential lookup for sync backends.
//!
//! The sync engine only ever asks "what is the current token for this
//! backend?". An absent token disables the backend for the run instead of
//! failing it.

pub mod token_storage;

use std::collections::BTreeMap;

pub use token_storage::FileTokenStore;

/// Read-only token source.
pub trait CredentialProvider: Send + Sync {
    fn get_token(&self, backend: &str) -> Option<String>;
}

/// Environment variables consulted per backend, in order.
#[must_use]
pub fn env_keys(backend: &str) -> Vec<String> {
    let mut keys = vec![format!(
        "ROADMAP_{}_TOKEN",
        backend.to_ascii_uppercase().replace('-', "_")
    )];
    if backend == "github" {
        keys.push("GITHUB_TOKEN".to_string());
        keys.push("GH_TOKEN".to_string());
    }
    keys
}

/// Tokens from `ROADMAP_<BACKEND>_TOKEN` (and `GITHUB_TOKEN`/`GH_TOKEN`
/// for GitHub).
pub struct EnvTokenProvider {
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl EnvTokenProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }
}

impl Default for EnvTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider for EnvTokenProvider {
    fn get_token(&self, backend: &str) -> Option<String> {
        env_keys(backend)
            .iter()
            .filter_map(|key| (self.lookup)(key))
            .map(|token| token.trim().to_string())
            .find(|token| !token.is_empty())
    }
}

/// Fixed tokens, mainly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens(pub BTreeMap<String, String>);

impl StaticTokens {
    pub fn single(backend: &str, token: &str) -> Self {
        Self(BTreeMap::from([(backend.to_string(), token.to_string())]))
    }
}

impl CredentialProvider for StaticTokens {
    fn get_token(&self, backend: &str) -> Option<String> {
        self.0.get(backend).cloned()
    }
}

/// First provider with a token wins. The stored-credentials provider goes
/// first so the environment only acts as a fallback.
pub struct ChainedProvider {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl ChainedProvider {
    #[must_use]
    pub fn new(providers: Vec<Box<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }

    /// Stored credentials, then environment variables.
    pub fn standard() -> Self {
        let mut providers: Vec<Box<dyn CredentialProvider>> = Vec::new();
        match FileTokenStore::default_location() {
            Ok(store) => providers.push(Box::new(store)),
            Err(e) => tracing::debug!(error = %e, "No credentials file location"),
        }
        providers.push(Box::new(EnvTokenProvider::new()));
        Self { providers }
    }
}

impl CredentialProvider for ChainedProvider {
    fn get_token(&self, backend: &str) -> Option<String> {
        self.providers.iter().find_map(|p| p.get_token(backend))
    }
}
