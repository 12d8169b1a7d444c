//! Ingestion — the scheduled multi-tenant sweep, the manual single-site run,
//! and the onboarding backfill, all sharing one bounded-concurrency task
//! executor with per-task failure isolation.

pub mod backfill;
pub mod orchestrator;
pub mod schedule;
pub mod window;

pub use backfill::run_backfill;
pub use orchestrator::{IngestSettings, Orchestrator};
pub use schedule::sweep_daemon;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::sources::SourceKind;
use crate::store::Site;
use self::window::DateWindow;

/// Ephemeral unit of work: one site, one source, one window.
#[derive(Debug, Clone)]
pub struct IngestTask {
    pub site: Site,
    pub source: SourceKind,
    pub window: DateWindow,
}

/// What happened to one task. Tasks never escape as errors; they resolve to
/// this value at the task boundary.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub site_id: Uuid,
    pub source: SourceKind,
    pub window: DateWindow,
    pub result: Result<usize, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub site_id: Uuid,
    pub source: SourceKind,
    pub reason: String,
}

/// Aggregate of one run (scheduled sweep or backfill). Logged, not persisted.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub total_tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<TaskFailure>,
}

impl RunSummary {
    pub fn from_outcomes(started_at: DateTime<Utc>, outcomes: Vec<TaskOutcome>) -> Self {
        let total_tasks = outcomes.len();
        let failures: Vec<TaskFailure> = outcomes
            .iter()
            .filter_map(|o| {
                o.result.as_ref().err().map(|reason| TaskFailure {
                    site_id: o.site_id,
                    source: o.source,
                    reason: reason.clone(),
                })
            })
            .collect();

        RunSummary {
            started_at,
            total_tasks,
            succeeded: total_tasks - failures.len(),
            failed: failures.len(),
            failures,
        }
    }
}

/// Per-source result of a manual run.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SourceOutcome {
    Ok(SourceReport),
    Err { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub window: DateWindow,
    pub row_count: usize,
}

/// Result of a manual single-site run; `None` means the source is not wired.
#[derive(Debug, Serialize)]
pub struct ManualOutcome {
    pub analytics: Option<SourceOutcome>,
    pub search: Option<SourceOutcome>,
}

impl ManualOutcome {
    pub fn all_ok(&self) -> bool {
        [&self.analytics, &self.search]
            .into_iter()
            .filter_map(|o| o.as_ref())
            .all(|o| matches!(o, SourceOutcome::Ok(_)))
    }
}
