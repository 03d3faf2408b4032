use async_trait::async_trait;
use thiserror::Error;

/// The resolved owner of an API key. The hashing and storage model behind
/// keys is opaque here; the transport layer resolves the raw header and the
/// core only ever sees the principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub api_key_id: String,
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("api key lookup failed: {0}")]
    Lookup(String),
}

#[async_trait]
pub trait ApiKeyResolver: Send + Sync {
    /// `None` means the key is unknown or revoked.
    async fn resolve(&self, raw_key: &str) -> Result<Option<Principal>, AuthError>;
}
