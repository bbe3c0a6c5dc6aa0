//! Reconciliation cycle and scheduler for the designated materials registry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use emreg_adapters::{RemoteFetch, RemoteSnapshotFetcher, RemoteSource, SourceConfig, SourceError};
use emreg_core::{LocalSnapshot, MaterialId, NewMaterial, ReconcilePlan, RemoteSnapshot};
use emreg_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, MaterialStore, PgMaterialStore, StoreConfig,
    StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "emreg-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store: StoreConfig,
    pub source: SourceConfig,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub sync_interval: Duration,
    pub retry: BackoffPolicy,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            store: StoreConfig {
                host: env_or("EMREG_DB_HOST", "localhost"),
                port: env_parse("EMREG_DB_PORT", 5432),
                user: env_or("EMREG_DB_USER", "emreg"),
                password: env_or("EMREG_DB_PASSWORD", ""),
                database: env_or("EMREG_DB_NAME", "emreg"),
            },
            source: SourceConfig {
                base_url: env_or("EMREG_SOURCE_BASE_URL", "https://minjust.gov.ru"),
                listing_path: env_or("EMREG_SOURCE_LISTING_PATH", "/extremist-materials/"),
                skip_header: std::env::var("EMREG_CSV_SKIP_HEADER")
                    .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                    .unwrap_or(false),
            },
            user_agent: env_or("EMREG_USER_AGENT", "emreg-bot/0.1"),
            http_timeout_secs: env_parse("EMREG_HTTP_TIMEOUT_SECS", 120),
            sync_interval: Duration::from_secs(env_parse("EMREG_SYNC_INTERVAL_SECS", 6 * 60 * 60)),
            retry: BackoffPolicy {
                base_delay: Duration::from_secs(env_parse("EMREG_RETRY_BASE_SECS", 300)),
                max_delay: Duration::from_secs(env_parse("EMREG_RETRY_MAX_SECS", 3600)),
            },
        }
    }
}

/// Set difference of the two snapshots keyed by material name.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffEngine;

impl DiffEngine {
    pub fn new() -> Self {
        Self
    }

    /// Remote names missing locally become inserts; local names missing remotely become deletes.
    /// Names on both sides are left alone even if the dates disagree.
    pub fn diff(&self, local: &LocalSnapshot, remote: &RemoteSnapshot) -> ReconcilePlan {
        let to_create = remote
            .iter()
            .filter(|(name, _)| !local.contains_key(name.as_str()))
            .map(|(name, date_text)| NewMaterial::from_remote(name.clone(), date_text))
            .collect();

        let to_delete = local
            .iter()
            .filter(|(name, _)| !remote.contains_key(name.as_str()))
            .map(|(_, id)| *id)
            .collect();

        ReconcilePlan {
            to_create,
            to_delete,
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("remote snapshot failed: {0}")]
    Source(#[from] SourceError),
    #[error("local snapshot failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub csv_url: String,
    pub csv_sha256: String,
    pub skipped_rows: usize,
    pub remote_entries: usize,
    pub local_records: usize,
    pub to_create: usize,
    pub to_delete: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WriteReport {
    pub inserted: Option<u64>,
    pub deleted: Option<u64>,
}

/// Insert and delete tasks dispatched by a cycle. Dropping this detaches them.
#[derive(Debug, Default)]
pub struct PendingWrites {
    insert: Option<JoinHandle<Result<u64, StoreError>>>,
    delete: Option<JoinHandle<Result<u64, StoreError>>>,
}

impl PendingWrites {
    pub fn is_empty(&self) -> bool {
        self.insert.is_none() && self.delete.is_none()
    }

    /// Waits for both writes; the first failure is returned after both have settled.
    pub async fn wait(self) -> Result<WriteReport> {
        let inserted = match self.insert {
            Some(handle) => Some(handle.await),
            None => None,
        };
        let deleted = match self.delete {
            Some(handle) => Some(handle.await),
            None => None,
        };

        let inserted = inserted.transpose().context("insert task panicked")?;
        let deleted = deleted.transpose().context("delete task panicked")?;
        Ok(WriteReport {
            inserted: inserted.transpose().context("inserting new materials")?,
            deleted: deleted.transpose().context("deleting stale materials")?,
        })
    }
}

#[derive(Debug)]
pub struct CycleOutcome {
    pub summary: CycleSummary,
    pub plan: ReconcilePlan,
    pub writes: PendingWrites,
}

pub struct ReconcilePipeline {
    source: Arc<dyn RemoteSource>,
    store: Arc<dyn MaterialStore>,
    diff: DiffEngine,
    dry_run: bool,
}

impl ReconcilePipeline {
    pub fn new(source: Arc<dyn RemoteSource>, store: Arc<dyn MaterialStore>) -> Self {
        Self {
            source,
            store,
            diff: DiffEngine::new(),
            dry_run: false,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let source = RemoteSnapshotFetcher::new(http, config.source.clone());
        let store = PgMaterialStore::new(&config.store);
        Ok(Self::new(Arc::new(source), Arc::new(store)))
    }

    /// Computes and logs the plan without touching the store.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// One fetch -> read -> diff -> write pass. Writes are dispatched but not awaited.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, CycleError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("reconcile_cycle", %run_id);

        async {
            info!(phase = "connect", "acquiring remote and local snapshots");
            let (remote, local) = tokio::try_join!(
                async {
                    self.source
                        .fetch_snapshot(run_id)
                        .await
                        .map_err(CycleError::from)
                },
                async {
                    let local = self.store.load_snapshot().await?;
                    info!(phase = "connect", records = local.len(), "loaded local snapshot");
                    Ok::<_, CycleError>(local)
                },
            )?;
            let RemoteFetch {
                csv_url,
                csv_sha256,
                skipped_rows,
                snapshot,
            } = remote;

            info!(
                phase = "compare",
                remote = snapshot.len(),
                local = local.len(),
                "comparing snapshots"
            );
            let plan = self.diff.diff(&local, &snapshot);
            info!(
                phase = "compare",
                to_create = plan.to_create.len(),
                to_delete = plan.to_delete.len(),
                "comparison complete"
            );

            let writes = if self.dry_run {
                if !plan.is_empty() {
                    info!(phase = "write", "dry run; skipping store writes");
                }
                PendingWrites::default()
            } else {
                self.dispatch_writes(run_id, &plan)
            };

            let summary = CycleSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                csv_url,
                csv_sha256,
                skipped_rows,
                remote_entries: snapshot.len(),
                local_records: local.len(),
                to_create: plan.to_create.len(),
                to_delete: plan.to_delete.len(),
                dry_run: self.dry_run,
            };

            Ok::<_, CycleError>(CycleOutcome {
                summary,
                plan,
                writes,
            })
        }
        .instrument(span)
        .await
    }

    /// Spawns insert and delete side by side; they touch disjoint rows.
    fn dispatch_writes(&self, run_id: Uuid, plan: &ReconcilePlan) -> PendingWrites {
        let mut writes = PendingWrites::default();

        if !plan.to_create.is_empty() {
            let store = Arc::clone(&self.store);
            let records = plan.to_create.clone();
            writes.insert = Some(tokio::spawn(
                async move {
                    info!(phase = "write", count = records.len(), "inserting new materials");
                    let result = store.insert_batch(&records).await;
                    match &result {
                        Ok(rows) => info!(phase = "write", rows, "insert complete"),
                        Err(err) => error!(phase = "write", error = %err, "insert failed"),
                    }
                    result
                }
                .instrument(info_span!("insert_batch", %run_id)),
            ));
        }

        if !plan.to_delete.is_empty() {
            let store = Arc::clone(&self.store);
            let ids: Vec<MaterialId> = plan.to_delete.clone();
            writes.delete = Some(tokio::spawn(
                async move {
                    info!(phase = "write", count = ids.len(), "deleting stale materials");
                    let result = store.delete_batch(&ids).await;
                    match &result {
                        Ok(rows) => info!(phase = "write", rows, "delete complete"),
                        Err(err) => error!(phase = "write", error = %err, "delete failed"),
                    }
                    result
                }
                .instrument(info_span!("delete_batch", %run_id)),
            ));
        }

        writes
    }
}

/// Runs a cycle, sleeps a fixed interval, repeats. Failed cycles are retried after a backoff.
pub struct Scheduler {
    pipeline: ReconcilePipeline,
    interval: Duration,
    retry: BackoffPolicy,
}

impl Scheduler {
    pub fn new(pipeline: ReconcilePipeline, interval: Duration, retry: BackoffPolicy) -> Self {
        Self {
            pipeline,
            interval,
            retry,
        }
    }

    /// Loops until `shutdown` resolves. Shutdown is only observed between cycles.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut consecutive_failures = 0usize;

        loop {
            let delay = match self.pipeline.run_cycle().await {
                Ok(outcome) => {
                    consecutive_failures = 0;
                    info!(
                        run_id = %outcome.summary.run_id,
                        to_create = outcome.summary.to_create,
                        to_delete = outcome.summary.to_delete,
                        next_in_secs = self.interval.as_secs(),
                        "cycle finished"
                    );
                    // Writes keep running in the background while we sleep.
                    drop(outcome.writes);
                    self.interval
                }
                Err(err) => {
                    let delay = self
                        .retry
                        .delay_for_attempt(consecutive_failures)
                        .min(self.interval);
                    consecutive_failures += 1;
                    error!(
                        error = %err,
                        consecutive_failures,
                        retry_in_secs = delay.as_secs(),
                        "cycle failed"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => {
                    warn!("shutdown requested; scheduler stopping");
                    return;
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OnceReport {
    pub summary: CycleSummary,
    pub writes: WriteReport,
}

/// Runs a single cycle from environment configuration and waits for its writes.
pub async fn run_once_from_env(dry_run: bool) -> Result<OnceReport> {
    let config = SyncConfig::from_env();
    let pipeline = ReconcilePipeline::from_config(&config)?.with_dry_run(dry_run);
    let outcome = pipeline.run_cycle().await.context("running reconciliation cycle")?;
    let writes = outcome.writes.wait().await?;
    Ok(OnceReport {
        summary: outcome.summary,
        writes,
    })
}

/// Runs the scheduler from environment configuration until Ctrl-C.
pub async fn run_scheduler_from_env(interval_override: Option<Duration>) -> Result<()> {
    let config = SyncConfig::from_env();
    let interval = interval_override.unwrap_or(config.sync_interval);
    info!(
        store = ?config.store,
        source = %config.source.listing_url(),
        interval_secs = interval.as_secs(),
        "starting scheduler"
    );
    let pipeline = ReconcilePipeline::from_config(&config)?;
    Scheduler::new(pipeline, interval, config.retry)
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use emreg_core::MaterialRecord;
    use emreg_storage::InMemoryMaterialStore;

    fn local(pairs: &[(&str, MaterialId)]) -> LocalSnapshot {
        pairs.iter().map(|(n, id)| (n.to_string(), *id)).collect()
    }

    fn remote(pairs: &[(&str, &str)]) -> RemoteSnapshot {
        pairs
            .iter()
            .map(|(n, d)| (n.to_string(), d.to_string()))
            .collect()
    }

    fn names(plan: &ReconcilePlan) -> HashSet<String> {
        plan.to_create.iter().map(|r| r.name.clone()).collect()
    }

    /// Remote source returning scripted results and recording call times.
    struct ScriptedSource {
        responses: Mutex<Vec<Result<RemoteSnapshot, ()>>>,
        calls: Mutex<Vec<tokio::time::Instant>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<RemoteSnapshot, ()>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<tokio::time::Instant> {
            self.calls.lock().expect("calls").clone()
        }
    }

    #[async_trait]
    impl RemoteSource for ScriptedSource {
        async fn fetch_snapshot(&self, _run_id: Uuid) -> Result<RemoteFetch, SourceError> {
            self.calls
                .lock()
                .expect("calls")
                .push(tokio::time::Instant::now());
            let next = {
                let mut responses = self.responses.lock().expect("responses");
                if responses.len() > 1 {
                    responses.remove(0)
                } else {
                    responses[0].clone()
                }
            };
            match next {
                Ok(snapshot) => Ok(RemoteFetch {
                    csv_url: "http://registry.test/list.csv".into(),
                    csv_sha256: String::new(),
                    skipped_rows: 0,
                    snapshot,
                }),
                Err(()) => Err(SourceError::LinkNotFound {
                    page_url: "http://registry.test/".into(),
                }),
            }
        }
    }

    fn record(id: MaterialId, name: &str) -> MaterialRecord {
        MaterialRecord {
            id,
            name: name.into(),
            inclusion_date: None,
        }
    }

    #[test]
    fn diff_matches_end_to_end_scenario() {
        let plan = DiffEngine::new().diff(
            &local(&[("A", 1), ("B", 2)]),
            &remote(&[("A", ""), ("C", "01.01.2021")]),
        );
        assert_eq!(
            plan.to_create,
            vec![NewMaterial {
                name: "C".into(),
                inclusion_date: NaiveDate::from_ymd_opt(2021, 1, 1),
            }]
        );
        assert_eq!(plan.to_delete, vec![2]);
    }

    #[test]
    fn diff_is_exact_set_difference() {
        let l = local(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);
        let r = remote(&[("c", ""), ("d", ""), ("e", ""), ("f", "bad")]);
        let plan = DiffEngine::new().diff(&l, &r);

        let expected_create: HashSet<String> = ["e", "f"].iter().map(|s| s.to_string()).collect();
        assert_eq!(names(&plan), expected_create);

        let deleted: HashSet<MaterialId> = plan.to_delete.iter().copied().collect();
        assert_eq!(deleted, HashSet::from([1, 2]));

        // Nothing scheduled for deletion shares a name with anything being created.
        let ids_by_name: HashMap<MaterialId, &String> = l.iter().map(|(n, id)| (*id, n)).collect();
        for id in &plan.to_delete {
            assert!(!names(&plan).contains(ids_by_name[id]));
        }
    }

    #[test]
    fn identical_key_sets_produce_empty_plan() {
        let plan = DiffEngine::new().diff(
            &local(&[("A", 1), ("B", 2)]),
            &remote(&[("A", "01.01.2020"), ("B", "")]),
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn shared_name_with_different_date_is_untouched() {
        let plan = DiffEngine::new().diff(&local(&[("A", 1)]), &remote(&[("A", "31.12.1999")]));
        assert!(plan.is_empty());
    }

    #[test]
    fn empty_and_bad_dates_create_undated_records() {
        let plan = DiffEngine::new().diff(
            &LocalSnapshot::new(),
            &remote(&[("empty", ""), ("bad", "not-a-date"), ("good", "25.06.2020")]),
        );
        let by_name: HashMap<_, _> = plan
            .to_create
            .iter()
            .map(|r| (r.name.as_str(), r.inclusion_date))
            .collect();
        assert_eq!(by_name["empty"], None);
        assert_eq!(by_name["bad"], None);
        assert_eq!(by_name["good"], NaiveDate::from_ymd_opt(2020, 6, 25));
    }

    #[tokio::test]
    async fn cycle_applies_inserts_and_deletes() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(remote(&[
            ("A", ""),
            ("C", "01.01.2021"),
        ]))]));
        let store = Arc::new(InMemoryMaterialStore::with_records([
            record(1, "A"),
            record(2, "B"),
        ]));
        let pipeline = ReconcilePipeline::new(source, store.clone());

        let outcome = pipeline.run_cycle().await.expect("cycle");
        assert_eq!(outcome.summary.to_create, 1);
        assert_eq!(outcome.summary.to_delete, 1);
        let report = outcome.writes.wait().await.expect("writes");
        assert_eq!(report.inserted, Some(1));
        assert_eq!(report.deleted, Some(1));

        let names: HashSet<String> = store.records().await.into_iter().map(|r| r.name).collect();
        assert_eq!(names, HashSet::from(["A".to_string(), "C".to_string()]));
    }

    #[tokio::test]
    async fn unchanged_registry_issues_no_writes() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(remote(&[("A", "")]))]));
        let store = Arc::new(InMemoryMaterialStore::with_records([record(1, "A")]));
        let pipeline = ReconcilePipeline::new(source, store.clone());

        let outcome = pipeline.run_cycle().await.expect("cycle");
        assert!(outcome.writes.is_empty());
        outcome.writes.wait().await.expect("writes");
        assert!(store.insert_calls().await.is_empty());
        assert!(store.delete_calls().await.is_empty());
    }

    #[tokio::test]
    async fn dry_run_leaves_store_untouched() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(remote(&[("New", "")]))]));
        let store = Arc::new(InMemoryMaterialStore::with_records([record(1, "Old")]));
        let pipeline = ReconcilePipeline::new(source, store.clone()).with_dry_run(true);

        let outcome = pipeline.run_cycle().await.expect("cycle");
        assert!(outcome.summary.dry_run);
        assert_eq!(outcome.plan.to_delete, vec![1]);
        assert!(outcome.writes.is_empty());
        assert!(store.insert_calls().await.is_empty());
    }

    #[tokio::test]
    async fn store_outage_fails_the_cycle() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(remote(&[("A", "")]))]));
        let store = Arc::new(InMemoryMaterialStore::new());
        store.set_unavailable(true).await;
        let pipeline = ReconcilePipeline::new(source, store);

        let err = pipeline.run_cycle().await.expect_err("outage");
        assert!(matches!(err, CycleError::Store(StoreError::Unavailable(_))));
    }

    async fn exploding_insert() -> Result<u64, StoreError> {
        panic!("insert task blew up")
    }

    #[tokio::test]
    async fn failed_insert_task_still_waits_for_delete() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let deleted = Arc::new(AtomicBool::new(false));
        let flag = deleted.clone();
        let writes = PendingWrites {
            insert: Some(tokio::spawn(exploding_insert())),
            delete: Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<u64, StoreError>(1)
            })),
        };

        let err = writes.wait().await.expect_err("insert panicked");
        assert!(err.to_string().contains("insert task panicked"));
        assert!(deleted.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_retries_failed_cycle_before_regular_interval() {
        let interval = Duration::from_secs(6 * 60 * 60);
        let retry = BackoffPolicy {
            base_delay: Duration::from_secs(300),
            max_delay: Duration::from_secs(3600),
        };
        let source = Arc::new(ScriptedSource::new(vec![
            Err(()),
            Ok(remote(&[("A", "")])),
        ]));
        let store = Arc::new(InMemoryMaterialStore::new());
        let pipeline = ReconcilePipeline::new(source.clone(), store.clone());

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let scheduler = tokio::spawn(Scheduler::new(pipeline, interval, retry).run_until(async move {
            let _ = stop_rx.await;
        }));

        while source.calls().len() < 3 {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        let _ = stop_tx.send(());
        scheduler.await.expect("scheduler");

        let calls = source.calls();
        assert_eq!(calls[1] - calls[0], Duration::from_secs(300));
        assert_eq!(calls[2] - calls[1], interval);
        assert_eq!(store.insert_calls().await.len(), 1);
    }
}
