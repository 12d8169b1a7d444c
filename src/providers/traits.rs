use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// A set of tokens returned from the identity provider after a refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    /// Some providers rotate the refresh token; absent means keep the old one.
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// The OAuth authorization server that issues and refreshes access tokens.
///
/// Error contract: a rejection of the grant itself (revoked or expired
/// refresh token) is `CredentialExpired` and must not be retried; transport
/// failures and 5xx are `ProviderUnavailable` and may be.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, IngestError>;
}
