//! Token lifecycle manager.
//!
//! Produces a currently-valid bearer token for an identity, refreshing
//! against the identity provider exactly once per need: concurrent callers
//! that observe the same stale token coalesce onto one in-flight refresh and
//! all receive its outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{error, info, warn};

use crate::crypto::CredentialVault;
use crate::error::IngestError;
use crate::providers::IdentityProvider;
use crate::store::{CredentialKey, CredentialRecord, CredentialStore};

/// Safety margin subtracted from the stored expiry so a token never runs out
/// mid-request.
const EXPIRY_SKEW_MS: i64 = 60_000;

/// Fallback lifetime when the provider omits `expires_in`.
const DEFAULT_TTL_SECS: u64 = 3600;

/// A decrypted, currently-valid access token handed to fetchers.
#[derive(Debug, Clone)]
pub struct Bearer {
    pub access_token: String,
    pub expires_at_ms: i64,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Bearer, IngestError>>>;

/// Owns per-identity token freshness decisions. The only component that
/// reads or writes credential records, and the only caller of the vault.
pub struct TokenBroker {
    store: Arc<dyn CredentialStore>,
    identity: Arc<dyn IdentityProvider>,
    vault: Arc<CredentialVault>,
    inflight: Arc<Mutex<HashMap<CredentialKey, RefreshFuture>>>,
}

/// Token material after the storage representation has been peeled off.
struct DecodedCredential {
    access_token: String,
    refresh_token: String,
    expires_at_ms: Option<i64>,
}

impl DecodedCredential {
    fn bearer(&self) -> Bearer {
        Bearer {
            access_token: self.access_token.clone(),
            expires_at_ms: self.expires_at_ms.unwrap_or_default(),
        }
    }
}

impl TokenBroker {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        identity: Arc<dyn IdentityProvider>,
        vault: Arc<CredentialVault>,
    ) -> Self {
        Self {
            store,
            identity,
            vault,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return a valid access token for the identity, refreshing if the stored
    /// one is within the skew of its expiry.
    pub async fn valid_token(&self, key: &CredentialKey) -> Result<Bearer, IngestError> {
        let record = self
            .store
            .load_credential(key)
            .await?
            .ok_or_else(|| IngestError::NoCredential(key.to_string()))?;

        let decoded = match decode(&self.vault, &record) {
            Ok(decoded) => decoded,
            Err(e) => {
                if matches!(e, IngestError::Integrity(_)) {
                    // Possible key rotation without re-encryption.
                    error!(identity = %key, "Credential envelope unreadable: {e}");
                }
                return Err(e);
            }
        };
        if is_fresh(&decoded) {
            return Ok(decoded.bearer());
        }

        self.join_refresh(key, false).await
    }

    /// Administrative refresh: skip the freshness check, still coalesced.
    pub async fn refresh_now(&self, key: &CredentialKey) -> Result<Bearer, IngestError> {
        self.join_refresh(key, true).await
    }

    /// Single-flight gate. The first caller to arrive for a key installs the
    /// refresh future; everyone (installer included) awaits the same shared
    /// future, so the provider sees exactly one call and every waiter gets
    /// the identical outcome.
    async fn join_refresh(&self, key: &CredentialKey, force: bool) -> Result<Bearer, IngestError> {
        let fut = {
            let mut inflight = lock_inflight(&self.inflight);
            if let Some(existing) = inflight.get(key) {
                existing.clone()
            } else {
                let fut = refresh_task(
                    self.store.clone(),
                    self.identity.clone(),
                    self.vault.clone(),
                    self.inflight.clone(),
                    key.clone(),
                    force,
                )
                .boxed()
                .shared();
                inflight.insert(key.clone(), fut.clone());
                fut
            }
        };

        fut.await
    }
}

fn lock_inflight(
    inflight: &Mutex<HashMap<CredentialKey, RefreshFuture>>,
) -> MutexGuard<'_, HashMap<CredentialKey, RefreshFuture>> {
    inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn refresh_task(
    store: Arc<dyn CredentialStore>,
    identity: Arc<dyn IdentityProvider>,
    vault: Arc<CredentialVault>,
    inflight: Arc<Mutex<HashMap<CredentialKey, RefreshFuture>>>,
    key: CredentialKey,
    force: bool,
) -> Result<Bearer, IngestError> {
    let outcome = perform_refresh(&*store, &*identity, &vault, &key, force).await;
    lock_inflight(&inflight).remove(&key);

    match &outcome {
        Ok(bearer) => {
            info!(identity = %key, expires_at_ms = bearer.expires_at_ms, "Refreshed access token")
        }
        Err(IngestError::Integrity(msg)) => {
            // Possible key rotation without re-encryption; needs an operator.
            error!(identity = %key, "Credential envelope unreadable: {msg}")
        }
        Err(e) => warn!(identity = %key, "Token refresh failed: {e}"),
    }

    outcome
}

async fn perform_refresh(
    store: &dyn CredentialStore,
    identity: &dyn IdentityProvider,
    vault: &CredentialVault,
    key: &CredentialKey,
    force: bool,
) -> Result<Bearer, IngestError> {
    // Re-read inside the gate: a flight that completed while we queued may
    // already have written a fresh token.
    let record = store
        .load_credential(key)
        .await?
        .ok_or_else(|| IngestError::NoCredential(key.to_string()))?;

    let decoded = decode(vault, &record)?;
    if !force && is_fresh(&decoded) {
        return Ok(decoded.bearer());
    }

    let tokens = identity.refresh(&decoded.refresh_token).await?;

    let expires_at_ms = Utc::now().timestamp_millis()
        + tokens.expires_in.unwrap_or(DEFAULT_TTL_SECS) as i64 * 1000;
    let refresh_token = tokens.refresh_token.unwrap_or(decoded.refresh_token);

    let sealed = CredentialRecord {
        access_token: vault.seal(&tokens.access_token)?,
        refresh_token: vault.seal(&refresh_token)?,
        expires_at: serde_json::json!(expires_at_ms),
        encrypted: Some(true),
    };
    store.store_credential(key, &sealed).await?;

    Ok(Bearer {
        access_token: tokens.access_token,
        expires_at_ms,
    })
}

fn decode(vault: &CredentialVault, record: &CredentialRecord) -> Result<DecodedCredential, IngestError> {
    let (access_token, refresh_token) = if record.is_encrypted() {
        (
            vault.open(&record.access_token)?,
            vault.open(&record.refresh_token)?,
        )
    } else {
        // Legacy plaintext row; fields used as-is, no forced migration.
        (record.access_token.clone(), record.refresh_token.clone())
    };

    Ok(DecodedCredential {
        access_token,
        refresh_token,
        expires_at_ms: record.expiry_ms(),
    })
}

fn is_fresh(decoded: &DecodedCredential) -> bool {
    match decoded.expires_at_ms {
        Some(expires_at_ms) => Utc::now().timestamp_millis() < expires_at_ms - EXPIRY_SKEW_MS,
        // No readable expiry: treat as stale and let a refresh normalize it.
        None => false,
    }
}
