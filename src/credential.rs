/*!
 * Credential provider abstraction
 */

use std::time::Instant;

use async_trait::async_trait;

use crate::error::Result;

/// A short-lived authentication token plus its expiry, as returned by the
/// IAM/credential provider ahead of each physical dial.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub expires_at: Instant,
}

/// Fetches a fresh credential for one physical dial. The reservoir never
/// caches credentials across dials — the refiller calls this once per
/// `openOne` attempt.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch_credential(&self) -> Result<Credential>;
}

/// A provider that always returns the same static token, useful for tests
/// and for deployments where the DSN already embeds long-lived credentials.
pub struct StaticCredentialProvider {
    token: String,
    ttl: std::time::Duration,
}

impl StaticCredentialProvider {
    pub fn new(token: impl Into<String>, ttl: std::time::Duration) -> Self {
        Self {
            token: token.into(),
            ttl,
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn fetch_credential(&self) -> Result<Credential> {
        Ok(Credential {
            token: self.token.clone(),
            expires_at: Instant::now() + self.ttl,
        })
    }
}
