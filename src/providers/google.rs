use async_trait::async_trait;
use serde::Deserialize;

use super::traits::{IdentityProvider, TokenSet};
use crate::error::IngestError;

const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Google OAuth 2.0 token endpoint client.
///
/// One delegated grant covers both reporting APIs; the dashboard owns the
/// consent flow, this service only ever exchanges refresh tokens.
pub struct GoogleIdentity {
    client_id: String,
    client_secret: String,
    http: reqwest::Client,
}

// Raw token response from Google's token endpoint
#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

impl GoogleIdentity {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id,
            client_secret,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IdentityProvider for GoogleIdentity {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, IngestError> {
        let resp = self
            .http
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("refresh_token", refresh_token),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| IngestError::ProviderUnavailable(format!("refresh request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(IngestError::ProviderUnavailable(format!(
                    "token endpoint HTTP {status}: {body}"
                )));
            }
            // 4xx from the token endpoint means the grant is dead
            // (invalid_grant on revocation or refresh-token expiry).
            return Err(IngestError::CredentialExpired(format!(
                "token endpoint HTTP {status}: {body}"
            )));
        }

        let token_resp: GoogleTokenResponse = resp.json().await.map_err(|e| {
            IngestError::ProviderUnavailable(format!("unreadable token response: {e}"))
        })?;

        Ok(TokenSet {
            access_token: token_resp.access_token,
            // Google does not always return a new refresh token on refresh
            refresh_token: token_resp.refresh_token,
            expires_in: token_resp.expires_in,
        })
    }
}
