//! Onboarding backfill — best-effort historical ingestion for a new site.
//!
//! Fired once per created site, off the acknowledgment path. A backfill that
//! fails leaves the site fully usable; it only costs history.

use chrono::Utc;
use tracing::info;

use super::orchestrator::Orchestrator;
use super::window::backfill_windows;
use super::{IngestTask, RunSummary};
use crate::store::Site;

/// Ingest the past `months` whole months for every configured source of the
/// site: one task per (month window, source), same isolation as the sweep.
pub async fn run_backfill(orchestrator: &Orchestrator, site: &Site, months: u32) -> RunSummary {
    let started_at = Utc::now();
    let windows = backfill_windows(started_at.date_naive(), months);

    let tasks: Vec<IngestTask> = windows
        .iter()
        .flat_map(|window| {
            site.configured_sources()
                .into_iter()
                .map(|source| IngestTask {
                    site: site.clone(),
                    source,
                    window: *window,
                })
        })
        .collect();

    info!(site = %site.id, months, tasks = tasks.len(), "Starting backfill");

    let summary = orchestrator
        .execute(tasks, orchestrator.settings().sweep_deadline, started_at)
        .await;

    info!(
        site = %site.id,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "Backfill finished"
    );
    summary
}
