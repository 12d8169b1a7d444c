use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{classify_response, FetchError, ReportRow, ReportTable, SourceFetcher, SourceKind};
use crate::ingest::window::DateWindow;

const SEARCH_API: &str = "https://searchconsole.googleapis.com/webmasters/v3";

/// Search-performance fetcher (`searchAnalytics/query` endpoint).
pub struct SearchFetcher {
    http: reqwest::Client,
}

const DIMENSIONS: [&str; 2] = ["date", "query"];
const METRIC_HEADERS: [&str; 4] = ["clicks", "impressions", "ctr", "position"];
const ROW_LIMIT: u32 = 1000;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchQueryRequest {
    start_date: String,
    end_date: String,
    dimensions: Vec<String>,
    row_limit: u32,
}

#[derive(Debug, Deserialize)]
struct SearchQueryResponse {
    #[serde(default)]
    rows: Vec<RawSearchRow>,
}

#[derive(Debug, Deserialize)]
struct RawSearchRow {
    keys: Vec<String>,
    clicks: f64,
    impressions: f64,
    ctr: f64,
    position: f64,
}

impl SearchFetcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for SearchFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceFetcher for SearchFetcher {
    fn kind(&self) -> SourceKind {
        SourceKind::Search
    }

    async fn fetch(
        &self,
        site_url: &str,
        bearer: &str,
        window: &DateWindow,
    ) -> Result<ReportTable, FetchError> {
        let request = SearchQueryRequest {
            start_date: window.start.to_string(),
            end_date: window.end.to_string(),
            dimensions: DIMENSIONS.iter().map(|d| d.to_string()).collect(),
            row_limit: ROW_LIMIT,
        };

        let resp = self
            .http
            .post(format!(
                "{SEARCH_API}/sites/{}/searchAnalytics/query",
                urlencoding(site_url)
            ))
            .bearer_auth(bearer)
            .json(&request)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("search request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_response(status, &body));
        }

        let report: SearchQueryResponse = resp
            .json()
            .await
            .map_err(|e| FetchError::Permanent(format!("search response shape: {e}")))?;

        Ok(normalize_report(report))
    }
}

fn normalize_report(report: SearchQueryResponse) -> ReportTable {
    let rows = report
        .rows
        .into_iter()
        .map(|raw| ReportRow {
            dimensions: raw.keys,
            metrics: vec![raw.clicks, raw.impressions, raw.ctr, raw.position],
        })
        .collect();

    ReportTable {
        dimension_headers: DIMENSIONS.iter().map(|d| d.to_string()).collect(),
        metric_headers: METRIC_HEADERS.iter().map(|m| m.to_string()).collect(),
        rows,
    }
}

/// Percent-encoding for the site URL path segment.
fn urlencoding(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
