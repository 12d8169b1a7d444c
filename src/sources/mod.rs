//! Source fetchers — narrow adapters over the two external reporting APIs.
//!
//! A fetcher turns (source reference, bearer token, date window) into a
//! normalized [`ReportTable`]. Fetchers never retry and never touch stored
//! credentials; retry policy lives in the orchestrator, tokens come from the
//! broker.

mod analytics;
mod search;

pub use analytics::AnalyticsFetcher;
pub use search::SearchFetcher;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::ingest::window::DateWindow;

/// The two reporting sources a site can be wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Analytics,
    Search,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Analytics => "analytics",
            SourceKind::Search => "search",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analytics" => Ok(SourceKind::Analytics),
            "search" => Ok(SourceKind::Search),
            other => Err(IngestError::BadRequest(format!("unknown source: {other}"))),
        }
    }
}

/// One row of a normalized report: dimension values and numeric metric
/// values as ordered lists, aligned with the table's header lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRow {
    pub dimensions: Vec<String>,
    pub metrics: Vec<f64>,
}

/// Source-agnostic report shape handed to the snapshot sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportTable {
    pub dimension_headers: Vec<String>,
    pub metric_headers: Vec<String>,
    pub rows: Vec<ReportRow>,
}

impl ReportTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Fetch failure, split so the orchestrator can decide whether to retry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Network trouble or a 408/429/5xx from the source; worth retrying.
    #[error("transient source error: {0}")]
    Transient(String),

    /// The request itself is bad (invalid property/site reference, revoked
    /// API access, malformed response body); retrying cannot help.
    #[error("source rejected request: {0}")]
    Permanent(String),
}

impl From<FetchError> for IngestError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Transient(msg) => IngestError::ProviderUnavailable(msg),
            FetchError::Permanent(msg) => IngestError::SourceRejected(msg),
        }
    }
}

/// Classify a non-2xx reporting-API response.
pub(crate) fn classify_response(status: reqwest::StatusCode, body: &str) -> FetchError {
    let msg = format!("HTTP {status}: {body}");
    if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
        FetchError::Transient(msg)
    } else {
        FetchError::Permanent(msg)
    }
}

/// A stateless caller of one external reporting API.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Run one report request for the given source reference (analytics
    /// property or search site URL) and normalize the response.
    async fn fetch(
        &self,
        source_ref: &str,
        bearer: &str,
        window: &DateWindow,
    ) -> Result<ReportTable, FetchError>;
}
