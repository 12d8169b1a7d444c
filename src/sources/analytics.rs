use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{classify_response, FetchError, ReportRow, ReportTable, SourceFetcher, SourceKind};
use crate::ingest::window::DateWindow;

const ANALYTICS_API: &str = "https://analyticsdata.googleapis.com/v1beta";

/// Traffic-analytics fetcher (`runReport` endpoint).
///
/// Requests a fixed channel/engagement report per site; which dimensions and
/// metrics end up on which dashboard chart is the dashboard's business.
pub struct AnalyticsFetcher {
    http: reqwest::Client,
}

const DIMENSIONS: [&str; 2] = ["date", "sessionDefaultChannelGroup"];
const METRICS: [&str; 3] = ["sessions", "activeUsers", "screenPageViews"];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunReportRequest {
    date_ranges: Vec<ApiDateRange>,
    dimensions: Vec<ApiName>,
    metrics: Vec<ApiName>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiDateRange {
    start_date: String,
    end_date: String,
}

#[derive(Debug, Serialize)]
struct ApiName {
    name: String,
}

// Raw response from the analytics data API. Required fields are enforced
// here so a shape drift fails fast instead of propagating nulls downstream.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunReportResponse {
    dimension_headers: Vec<ApiHeader>,
    metric_headers: Vec<ApiHeader>,
    #[serde(default)]
    rows: Vec<RawRow>,
}

#[derive(Debug, Deserialize)]
struct ApiHeader {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRow {
    dimension_values: Vec<ApiValue>,
    metric_values: Vec<ApiValue>,
}

#[derive(Debug, Deserialize)]
struct ApiValue {
    value: String,
}

impl AnalyticsFetcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for AnalyticsFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceFetcher for AnalyticsFetcher {
    fn kind(&self) -> SourceKind {
        SourceKind::Analytics
    }

    async fn fetch(
        &self,
        property: &str,
        bearer: &str,
        window: &DateWindow,
    ) -> Result<ReportTable, FetchError> {
        let request = RunReportRequest {
            date_ranges: vec![ApiDateRange {
                start_date: window.start.to_string(),
                end_date: window.end.to_string(),
            }],
            dimensions: DIMENSIONS.iter().map(|d| ApiName { name: d.to_string() }).collect(),
            metrics: METRICS.iter().map(|m| ApiName { name: m.to_string() }).collect(),
        };

        let resp = self
            .http
            .post(format!("{ANALYTICS_API}/properties/{property}:runReport"))
            .bearer_auth(bearer)
            .json(&request)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("analytics request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_response(status, &body));
        }

        let report: RunReportResponse = resp
            .json()
            .await
            .map_err(|e| FetchError::Permanent(format!("analytics response shape: {e}")))?;

        normalize_report(report)
    }
}

/// Flatten the API response into the position-aligned table shape.
fn normalize_report(report: RunReportResponse) -> Result<ReportTable, FetchError> {
    let mut rows = Vec::with_capacity(report.rows.len());
    for raw in report.rows {
        let metrics = raw
            .metric_values
            .iter()
            .map(|v| {
                v.value
                    .parse::<f64>()
                    .map_err(|_| FetchError::Permanent(format!("non-numeric metric: {}", v.value)))
            })
            .collect::<Result<Vec<f64>, FetchError>>()?;

        rows.push(ReportRow {
            dimensions: raw.dimension_values.into_iter().map(|v| v.value).collect(),
            metrics,
        });
    }

    Ok(ReportTable {
        dimension_headers: report.dimension_headers.into_iter().map(|h| h.name).collect(),
        metric_headers: report.metric_headers.into_iter().map(|h| h.name).collect(),
        rows,
    })
}
