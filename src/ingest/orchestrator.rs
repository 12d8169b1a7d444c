//! Bounded-concurrency sweep over all eligible sites.
//!
//! The orchestrator is the only component allowed to catch-and-continue:
//! every error a task produces is converted into a failure entry at the task
//! boundary and can never cancel sibling tasks or the run.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use super::window::{sweep_window, DateWindow};
use super::{IngestTask, ManualOutcome, RunSummary, SourceOutcome, SourceReport, TaskOutcome};
use crate::config::Config;
use crate::error::IngestError;
use crate::sources::{SourceFetcher, SourceKind};
use crate::store::{CredentialKey, ReportSink, Site, SiteStore};
use crate::token::TokenBroker;

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub concurrency: usize,
    pub task_retry_limit: u32,
    pub retry_backoff: Duration,
    pub sweep_deadline: Duration,
    pub manual_deadline: Duration,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.sweep_concurrency,
            task_retry_limit: config.task_retry_limit,
            retry_backoff: Duration::from_millis(500),
            sweep_deadline: Duration::from_secs(config.sweep_deadline_secs),
            manual_deadline: Duration::from_secs(config.manual_deadline_secs),
        }
    }
}

pub struct Orchestrator {
    sites: Arc<dyn SiteStore>,
    broker: Arc<TokenBroker>,
    analytics: Arc<dyn SourceFetcher>,
    search: Arc<dyn SourceFetcher>,
    sink: Arc<dyn ReportSink>,
    settings: IngestSettings,
}

impl Orchestrator {
    pub fn new(
        sites: Arc<dyn SiteStore>,
        broker: Arc<TokenBroker>,
        analytics: Arc<dyn SourceFetcher>,
        search: Arc<dyn SourceFetcher>,
        sink: Arc<dyn ReportSink>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            sites,
            broker,
            analytics,
            search,
            sink,
            settings,
        }
    }

    pub(crate) fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    fn fetcher_for(&self, kind: SourceKind) -> &Arc<dyn SourceFetcher> {
        match kind {
            SourceKind::Analytics => &self.analytics,
            SourceKind::Search => &self.search,
        }
    }

    /// One full scheduled pass over all eligible sites.
    pub async fn run_scheduled_sweep(&self) -> Result<RunSummary, IngestError> {
        let started_at = Utc::now();
        let sites = self.sites.eligible_sites().await?;
        let window = sweep_window(started_at.date_naive());

        let tasks: Vec<IngestTask> = sites
            .iter()
            .flat_map(|site| {
                site.configured_sources()
                    .into_iter()
                    .map(|source| IngestTask {
                        site: site.clone(),
                        source,
                        window,
                    })
            })
            .collect();

        info!(
            sites = sites.len(),
            tasks = tasks.len(),
            window = %window,
            "Starting scheduled sweep"
        );

        let summary = self
            .execute(tasks, self.settings.sweep_deadline, started_at)
            .await;

        info!(
            total = summary.total_tasks,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Scheduled sweep finished"
        );
        Ok(summary)
    }

    /// Manual single-site run: both sources concurrently, one result or error
    /// per source, neither aborting the other.
    pub async fn run_manual(&self, site_id: Uuid) -> Result<ManualOutcome, IngestError> {
        let site = self
            .sites
            .site(site_id)
            .await?
            .ok_or_else(|| IngestError::NotFound("site".into()))?;

        let window = sweep_window(Utc::now().date_naive());
        let (analytics, search) = tokio::join!(
            self.manual_source(&site, SourceKind::Analytics, window),
            self.manual_source(&site, SourceKind::Search, window),
        );

        Ok(ManualOutcome { analytics, search })
    }

    async fn manual_source(
        &self,
        site: &Site,
        source: SourceKind,
        window: DateWindow,
    ) -> Option<SourceOutcome> {
        site.source_ref(source)?;

        let task = IngestTask {
            site: site.clone(),
            source,
            window,
        };

        let outcome = match tokio::time::timeout(
            self.settings.manual_deadline,
            self.run_task(task),
        )
        .await
        {
            Ok(outcome) => outcome.result,
            Err(_) => Err("deadline exceeded".to_string()),
        };

        Some(match outcome {
            Ok(row_count) => SourceOutcome::Ok(SourceReport { window, row_count }),
            Err(error) => SourceOutcome::Err { error },
        })
    }

    /// Drive a batch of tasks with bounded parallelism and an overall
    /// deadline. Tasks still outstanding at the deadline are cancelled and
    /// reported as timeout failures; completed results are kept.
    pub(crate) async fn execute(
        &self,
        tasks: Vec<IngestTask>,
        deadline: Duration,
        started_at: DateTime<Utc>,
    ) -> RunSummary {
        let total = tasks.len();
        let mut outcomes: Vec<TaskOutcome> = Vec::with_capacity(total);
        let mut done = vec![false; total];

        {
            let mut running = stream::iter(tasks.iter().cloned().enumerate())
                .map(|(idx, task)| async move { (idx, self.run_task(task).await) })
                .buffer_unordered(self.settings.concurrency.max(1));

            let expired = tokio::time::sleep(deadline);
            tokio::pin!(expired);

            loop {
                tokio::select! {
                    _ = &mut expired => {
                        warn!("Run deadline exceeded, cancelling outstanding tasks");
                        break;
                    }
                    next = running.next() => match next {
                        Some((idx, outcome)) => {
                            done[idx] = true;
                            outcomes.push(outcome);
                        }
                        None => break,
                    }
                }
            }
        }

        for (idx, task) in tasks.iter().enumerate() {
            if !done[idx] {
                outcomes.push(TaskOutcome {
                    site_id: task.site.id,
                    source: task.source,
                    window: task.window,
                    result: Err("run deadline exceeded".into()),
                });
            }
        }

        RunSummary::from_outcomes(started_at, outcomes)
    }

    /// Run one task to a value. Transient failures are retried with doubling
    /// backoff; whatever error remains is captured, never rethrown.
    async fn run_task(&self, task: IngestTask) -> TaskOutcome {
        let mut attempt = 0u32;
        let result = loop {
            match self.attempt(&task).await {
                Ok(rows) => break Ok(rows),
                Err(e) if e.is_transient() && attempt < self.settings.task_retry_limit => {
                    attempt += 1;
                    warn!(
                        site = %task.site.id,
                        source = %task.source,
                        attempt,
                        "Transient failure, retrying: {e}"
                    );
                    tokio::time::sleep(self.settings.retry_backoff * 2u32.pow(attempt - 1)).await;
                }
                Err(e) => {
                    warn!(site = %task.site.id, source = %task.source, "Ingestion task failed: {e}");
                    break Err(e.to_string());
                }
            }
        };

        if let Ok(rows) = &result {
            info!(site = %task.site.id, source = %task.source, rows, "Ingestion task done");
        }

        TaskOutcome {
            site_id: task.site.id,
            source: task.source,
            window: task.window,
            result,
        }
    }

    async fn attempt(&self, task: &IngestTask) -> Result<usize, IngestError> {
        let source_ref = task
            .site
            .source_ref(task.source)
            .ok_or_else(|| IngestError::BadRequest("source not configured".into()))?;

        let key = CredentialKey {
            owner_id: task.site.owner_id.clone(),
            provider: task.source,
        };
        let bearer = self.broker.valid_token(&key).await?;

        let table = self
            .fetcher_for(task.source)
            .fetch(source_ref, &bearer.access_token, &task.window)
            .await?;

        self.sink
            .store_snapshot(task.site.id, task.source, &task.window, &table)
            .await?;

        Ok(table.row_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CredentialVault;
    use crate::providers::{IdentityProvider, TokenSet};
    use crate::sources::{FetchError, ReportRow, ReportTable};
    use crate::store::{CredentialRecord, CredentialStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StaticSites(Vec<Site>);

    #[async_trait]
    impl SiteStore for StaticSites {
        async fn eligible_sites(&self) -> Result<Vec<Site>, IngestError> {
            Ok(self.0.iter().filter(|s| s.is_eligible()).cloned().collect())
        }

        async fn site(&self, id: Uuid) -> Result<Option<Site>, IngestError> {
            Ok(self.0.iter().find(|s| s.id == id).cloned())
        }

        async fn upsert_site(&self, _site: &Site) -> Result<(), IngestError> {
            Ok(())
        }

        async fn sites_for_owner(&self, owner_id: &str) -> Result<Vec<Site>, IngestError> {
            Ok(self
                .0
                .iter()
                .filter(|s| s.owner_id == owner_id)
                .cloned()
                .collect())
        }
    }

    struct MemoryCredentials {
        records: Mutex<HashMap<CredentialKey, CredentialRecord>>,
        writes: AtomicUsize,
    }

    impl MemoryCredentials {
        fn new() -> Self {
            Self {
                records: Mutex::new(HashMap::new()),
                writes: AtomicUsize::new(0),
            }
        }

        fn put_plain(&self, owner: &str, provider: SourceKind, refresh: &str, expires_ms: i64) {
            self.records.lock().unwrap().insert(
                CredentialKey {
                    owner_id: owner.into(),
                    provider,
                },
                CredentialRecord {
                    access_token: format!("access-{owner}"),
                    refresh_token: refresh.into(),
                    expires_at: json!(expires_ms),
                    encrypted: None,
                },
            );
        }
    }

    #[async_trait]
    impl CredentialStore for MemoryCredentials {
        async fn load_credential(
            &self,
            key: &CredentialKey,
        ) -> Result<Option<CredentialRecord>, IngestError> {
            Ok(self.records.lock().unwrap().get(key).cloned())
        }

        async fn store_credential(
            &self,
            key: &CredentialKey,
            record: &CredentialRecord,
        ) -> Result<(), IngestError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.records
                .lock()
                .unwrap()
                .insert(key.clone(), record.clone());
            Ok(())
        }
    }

    /// Refresh outcome depends on the refresh token handed in, so one mock
    /// provider can serve sites with healthy and revoked grants at once.
    struct PerTokenIdentity {
        calls: AtomicUsize,
        revoked: Vec<String>,
    }

    #[async_trait]
    impl IdentityProvider for PerTokenIdentity {
        async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.revoked.iter().any(|r| r == refresh_token) {
                return Err(IngestError::CredentialExpired("invalid_grant".into()));
            }
            Ok(TokenSet {
                access_token: "refreshed-access".into(),
                refresh_token: None,
                expires_in: Some(3600),
            })
        }
    }

    enum FetchScript {
        Ok,
        Permanent,
        TransientThenOk(AtomicUsize),
        Hang,
    }

    struct ScriptedFetcher {
        kind: SourceKind,
        script: FetchScript,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn ok(kind: SourceKind) -> Self {
            Self {
                kind,
                script: FetchScript::Ok,
                calls: AtomicUsize::new(0),
            }
        }

        fn scripted(kind: SourceKind, script: FetchScript) -> Self {
            Self {
                kind,
                script,
                calls: AtomicUsize::new(0),
            }
        }
    }

    fn one_row_table() -> ReportTable {
        ReportTable {
            dimension_headers: vec!["date".into()],
            metric_headers: vec!["sessions".into()],
            rows: vec![ReportRow {
                dimensions: vec!["2026-08-01".into()],
                metrics: vec![42.0],
            }],
        }
    }

    #[async_trait]
    impl SourceFetcher for ScriptedFetcher {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        async fn fetch(
            &self,
            _source_ref: &str,
            _bearer: &str,
            _window: &DateWindow,
        ) -> Result<ReportTable, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                FetchScript::Ok => Ok(one_row_table()),
                FetchScript::Permanent => {
                    Err(FetchError::Permanent("HTTP 400: bad property".into()))
                }
                FetchScript::TransientThenOk(failures_left) => {
                    if failures_left
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        Err(FetchError::Transient("HTTP 503".into()))
                    } else {
                        Ok(one_row_table())
                    }
                }
                FetchScript::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(one_row_table())
                }
            }
        }
    }

    #[derive(Default)]
    struct MemorySink {
        snapshots: Mutex<Vec<(Uuid, SourceKind, DateWindow)>>,
    }

    #[async_trait]
    impl ReportSink for MemorySink {
        async fn store_snapshot(
            &self,
            site_id: Uuid,
            source: SourceKind,
            window: &DateWindow,
            _table: &ReportTable,
        ) -> Result<(), IngestError> {
            self.snapshots.lock().unwrap().push((site_id, source, *window));
            Ok(())
        }
    }

    fn site(owner: &str, analytics: bool, search: bool) -> Site {
        Site {
            id: Uuid::new_v4(),
            owner_id: owner.into(),
            display_name: format!("{owner}'s site"),
            analytics_property: analytics.then(|| "423918712".into()),
            search_site_url: search.then(|| "https://example.com/".into()),
            setup_completed: true,
        }
    }

    fn settings() -> IngestSettings {
        IngestSettings {
            concurrency: 4,
            task_retry_limit: 2,
            retry_backoff: Duration::from_millis(10),
            sweep_deadline: Duration::from_secs(60),
            manual_deadline: Duration::from_secs(10),
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        credentials: Arc<MemoryCredentials>,
        identity: Arc<PerTokenIdentity>,
        analytics: Arc<ScriptedFetcher>,
        sink: Arc<MemorySink>,
    }

    fn fixture(
        sites: Vec<Site>,
        revoked: Vec<String>,
        analytics: ScriptedFetcher,
        search: ScriptedFetcher,
    ) -> Fixture {
        let credentials = Arc::new(MemoryCredentials::new());
        let identity = Arc::new(PerTokenIdentity {
            calls: AtomicUsize::new(0),
            revoked,
        });
        let analytics = Arc::new(analytics);
        let sink = Arc::new(MemorySink::default());
        let broker = Arc::new(TokenBroker::new(
            credentials.clone(),
            identity.clone(),
            Arc::new(CredentialVault::new("orchestrator-test-secret")),
        ));
        let orchestrator = Orchestrator::new(
            Arc::new(StaticSites(sites)),
            broker,
            analytics.clone(),
            Arc::new(search),
            sink.clone(),
            settings(),
        );
        Fixture {
            orchestrator,
            credentials,
            identity,
            analytics,
            sink,
        }
    }

    fn fresh_ms() -> i64 {
        Utc::now().timestamp_millis() + 3_600_000
    }

    fn expired_ms() -> i64 {
        Utc::now().timestamp_millis() - 1000
    }

    #[tokio::test]
    async fn test_sweep_isolates_failing_tenant() {
        let t1 = site("u1", true, false);
        let t2 = site("u2", true, false);
        let t3 = site("u3", false, true);
        let t2_id = t2.id;

        let fx = fixture(
            vec![t1, t2, t3],
            vec!["revoked-rt".into()],
            ScriptedFetcher::ok(SourceKind::Analytics),
            ScriptedFetcher::ok(SourceKind::Search),
        );
        fx.credentials
            .put_plain("u1", SourceKind::Analytics, "rt-1", fresh_ms());
        fx.credentials
            .put_plain("u2", SourceKind::Analytics, "revoked-rt", expired_ms());
        fx.credentials
            .put_plain("u3", SourceKind::Search, "rt-3", fresh_ms());

        let summary = fx.orchestrator.run_scheduled_sweep().await.unwrap();

        assert_eq!(summary.total_tasks, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].site_id, t2_id);
        assert!(summary.failures[0].reason.contains("re-authorization"));
        assert_eq!(fx.sink.snapshots.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_skips_ineligible_sites() {
        let mut unfinished = site("u1", true, true);
        unfinished.setup_completed = false;
        let unwired = site("u2", false, false);

        let fx = fixture(
            vec![unfinished, unwired],
            vec![],
            ScriptedFetcher::ok(SourceKind::Analytics),
            ScriptedFetcher::ok(SourceKind::Search),
        );

        let summary = fx.orchestrator.run_scheduled_sweep().await.unwrap();
        assert_eq!(summary.total_tasks, 0);
    }

    #[tokio::test]
    async fn test_missing_credential_is_a_task_failure_not_a_crash() {
        let t1 = site("u1", true, true);
        let fx = fixture(
            vec![t1],
            vec![],
            ScriptedFetcher::ok(SourceKind::Analytics),
            ScriptedFetcher::ok(SourceKind::Search),
        );
        // No credentials stored at all.

        let summary = fx.orchestrator.run_scheduled_sweep().await.unwrap();
        assert_eq!(summary.total_tasks, 2);
        assert_eq!(summary.failed, 2);
        assert!(summary.failures.iter().all(|f| f.reason.contains("No stored credential")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried_within_the_run() {
        let t1 = site("u1", true, false);
        let fx = fixture(
            vec![t1],
            vec![],
            ScriptedFetcher::scripted(
                SourceKind::Analytics,
                FetchScript::TransientThenOk(AtomicUsize::new(1)),
            ),
            ScriptedFetcher::ok(SourceKind::Search),
        );
        fx.credentials
            .put_plain("u1", SourceKind::Analytics, "rt-1", fresh_ms());

        let summary = fx.orchestrator.run_scheduled_sweep().await.unwrap();
        assert_eq!(summary.succeeded, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let t1 = site("u1", true, false);
        let fx = fixture(
            vec![t1],
            vec![],
            ScriptedFetcher::scripted(SourceKind::Analytics, FetchScript::Permanent),
            ScriptedFetcher::ok(SourceKind::Search),
        );
        fx.credentials
            .put_plain("u1", SourceKind::Analytics, "rt-1", fresh_ms());

        let summary = fx.orchestrator.run_scheduled_sweep().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(fx.analytics.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reports_unfinished_tasks_as_timeouts() {
        let t1 = site("u1", true, false);
        let t2 = site("u2", false, true);

        let mut fx_settings = settings();
        fx_settings.sweep_deadline = Duration::from_millis(200);

        let credentials = Arc::new(MemoryCredentials::new());
        credentials.put_plain("u1", SourceKind::Analytics, "rt-1", fresh_ms());
        credentials.put_plain("u2", SourceKind::Search, "rt-2", fresh_ms());
        let identity = Arc::new(PerTokenIdentity {
            calls: AtomicUsize::new(0),
            revoked: vec![],
        });
        let sink = Arc::new(MemorySink::default());
        let broker = Arc::new(TokenBroker::new(
            credentials,
            identity,
            Arc::new(CredentialVault::new("orchestrator-test-secret")),
        ));
        let orchestrator = Orchestrator::new(
            Arc::new(StaticSites(vec![t1, t2.clone()])),
            broker,
            Arc::new(ScriptedFetcher::ok(SourceKind::Analytics)),
            Arc::new(ScriptedFetcher::scripted(SourceKind::Search, FetchScript::Hang)),
            sink,
            fx_settings,
        );

        let summary = orchestrator.run_scheduled_sweep().await.unwrap();
        assert_eq!(summary.total_tasks, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].site_id, t2.id);
        assert!(summary.failures[0].reason.contains("deadline"));
    }

    #[tokio::test]
    async fn test_manual_run_isolates_sources_and_reads_idempotently() {
        let t1 = site("u1", true, true);
        let site_id = t1.id;
        let fx = fixture(
            vec![t1],
            vec![],
            ScriptedFetcher::scripted(SourceKind::Analytics, FetchScript::Permanent),
            ScriptedFetcher::ok(SourceKind::Search),
        );
        fx.credentials
            .put_plain("u1", SourceKind::Analytics, "rt-a", fresh_ms());
        fx.credentials
            .put_plain("u1", SourceKind::Search, "rt-s", fresh_ms());

        let first = fx.orchestrator.run_manual(site_id).await.unwrap();
        assert!(matches!(first.analytics, Some(SourceOutcome::Err { .. })));
        assert!(matches!(first.search, Some(SourceOutcome::Ok(_))));
        assert!(!first.all_ok());

        let second = fx.orchestrator.run_manual(site_id).await.unwrap();
        assert!(matches!(second.search, Some(SourceOutcome::Ok(_))));

        // Valid tokens short-circuit: no provider calls, no credential writes.
        assert_eq!(fx.identity.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.credentials.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_manual_run_skips_unwired_source() {
        let t1 = site("u1", true, false);
        let site_id = t1.id;
        let fx = fixture(
            vec![t1],
            vec![],
            ScriptedFetcher::ok(SourceKind::Analytics),
            ScriptedFetcher::ok(SourceKind::Search),
        );
        fx.credentials
            .put_plain("u1", SourceKind::Analytics, "rt-a", fresh_ms());

        let outcome = fx.orchestrator.run_manual(site_id).await.unwrap();
        assert!(matches!(outcome.analytics, Some(SourceOutcome::Ok(_))));
        assert!(outcome.search.is_none());
        assert!(outcome.all_ok());
    }

    #[tokio::test]
    async fn test_manual_run_unknown_site_is_not_found() {
        let fx = fixture(
            vec![],
            vec![],
            ScriptedFetcher::ok(SourceKind::Analytics),
            ScriptedFetcher::ok(SourceKind::Search),
        );
        let err = fx.orchestrator.run_manual(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }
}
