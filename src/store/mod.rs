//! Store layer — record types, the seam traits consumed by the token broker
//! and the orchestrator, and the PostgreSQL implementation.

pub mod db;

pub use db::Store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::IngestError;
use crate::ingest::window::DateWindow;
use crate::sources::{ReportTable, SourceKind};

/// Identity a credential record is keyed by: one site owner, one provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    pub owner_id: String,
    pub provider: SourceKind,
}

impl std::fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.provider)
    }
}

/// A stored token pair, exactly as persisted.
///
/// `encrypted == Some(true)` means both token columns hold vault envelopes.
/// Anything else is a legacy plaintext row, still readable without migration.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Value,
    pub encrypted: Option<bool>,
}

impl CredentialRecord {
    pub fn is_encrypted(&self) -> bool {
        self.encrypted == Some(true)
    }

    /// Access-token expiry as epoch milliseconds, normalized from whichever
    /// shape the row carries.
    pub fn expiry_ms(&self) -> Option<i64> {
        expiry_ms(&self.expires_at)
    }
}

/// Normalize a stored expiry to epoch milliseconds.
///
/// Canonical form is a bare number of milliseconds; rows imported from the
/// old document store may instead carry `{"seconds": n}` or `{"_millis": n}`.
/// Every write emits the canonical form, so legacy shapes disappear on the
/// next refresh.
pub fn expiry_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::Object(map) => {
            if let Some(ms) = map.get("_millis").and_then(Value::as_i64) {
                Some(ms)
            } else {
                map.get("seconds")
                    .and_then(Value::as_i64)
                    .map(|s| s * 1000)
            }
        }
        _ => None,
    }
}

/// An onboarded site (tenant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: Uuid,
    pub owner_id: String,
    pub display_name: String,
    /// Analytics property reference, e.g. `"423918712"`.
    pub analytics_property: Option<String>,
    /// Search site URL, e.g. `"https://example.com/"`.
    pub search_site_url: Option<String>,
    pub setup_completed: bool,
}

impl Site {
    /// The reference string a fetcher needs for the given source, if wired.
    pub fn source_ref(&self, kind: SourceKind) -> Option<&str> {
        match kind {
            SourceKind::Analytics => self.analytics_property.as_deref(),
            SourceKind::Search => self.search_site_url.as_deref(),
        }
    }

    pub fn configured_sources(&self) -> Vec<SourceKind> {
        [SourceKind::Analytics, SourceKind::Search]
            .into_iter()
            .filter(|k| self.source_ref(*k).is_some())
            .collect()
    }

    pub fn is_eligible(&self) -> bool {
        self.setup_completed && !self.configured_sources().is_empty()
    }
}

/// Credential persistence surface used by the token broker. All writes for a
/// given key go through the broker's single-flight gate; the store itself
/// only promises per-row last-write-wins.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_credential(
        &self,
        key: &CredentialKey,
    ) -> Result<Option<CredentialRecord>, IngestError>;

    async fn store_credential(
        &self,
        key: &CredentialKey,
        record: &CredentialRecord,
    ) -> Result<(), IngestError>;
}

/// Site enumeration and lookup surface used by the orchestrator and the API.
#[async_trait]
pub trait SiteStore: Send + Sync {
    /// Sites eligible for ingestion: setup completed and at least one source.
    async fn eligible_sites(&self) -> Result<Vec<Site>, IngestError>;

    async fn site(&self, id: Uuid) -> Result<Option<Site>, IngestError>;

    async fn upsert_site(&self, site: &Site) -> Result<(), IngestError>;

    async fn sites_for_owner(&self, owner_id: &str) -> Result<Vec<Site>, IngestError>;
}

/// Downstream persistence for fetched reports. Keyed upserts make re-runs of
/// the same window overwrite rather than duplicate.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn store_snapshot(
        &self,
        site_id: Uuid,
        source: SourceKind,
        window: &DateWindow,
        table: &ReportTable,
    ) -> Result<(), IngestError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expiry_ms_canonical_number() {
        assert_eq!(expiry_ms(&json!(1_754_000_000_123_i64)), Some(1_754_000_000_123));
    }

    #[test]
    fn test_expiry_ms_legacy_shapes_agree() {
        let canonical = expiry_ms(&json!(1_754_000_000_000_i64));
        assert_eq!(expiry_ms(&json!({"seconds": 1_754_000_000_i64})), canonical);
        assert_eq!(expiry_ms(&json!({"_millis": 1_754_000_000_000_i64})), canonical);
    }

    #[test]
    fn test_expiry_ms_unreadable_shapes() {
        assert_eq!(expiry_ms(&json!(null)), None);
        assert_eq!(expiry_ms(&json!("2026-08-06")), None);
        assert_eq!(expiry_ms(&json!({"minutes": 5})), None);
    }

    #[test]
    fn test_legacy_record_is_not_encrypted() {
        let record = CredentialRecord {
            access_token: "plain-access".into(),
            refresh_token: "plain-refresh".into(),
            expires_at: json!({"seconds": 1_754_000_000_i64}),
            encrypted: None,
        };
        assert!(!record.is_encrypted());

        let explicit_false = CredentialRecord {
            encrypted: Some(false),
            ..record.clone()
        };
        assert!(!explicit_false.is_encrypted());
    }

    #[test]
    fn test_configured_sources() {
        let mut site = Site {
            id: Uuid::new_v4(),
            owner_id: "user-1".into(),
            display_name: "Example".into(),
            analytics_property: Some("423918712".into()),
            search_site_url: None,
            setup_completed: true,
        };
        assert_eq!(site.configured_sources(), vec![SourceKind::Analytics]);
        assert!(site.is_eligible());

        site.analytics_property = None;
        assert!(!site.is_eligible());

        site.search_site_url = Some("https://example.com/".into());
        site.setup_completed = false;
        assert!(!site.is_eligible());
    }
}
