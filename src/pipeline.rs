use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::db::{SqliteStore, Store, UpsertBatch};
use crate::error::{PipelineError, StoreError};
use crate::fetcher::{fetch_all, Fetcher, HttpFetcher};
use crate::model::{new_run_id, RunRecord, RunReport, RunStatus, UpsertSummary};
use crate::normalizer::{normalize_all, JsonNormalizer, Normalizer};
use crate::settings::{RunOptions, Settings, SourceConfig};

/// Where a run currently is. `Committed` and `Aborted` are final for the run;
/// a retry is a fresh run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Fetching,
    Normalizing,
    Upserting,
    Committed,
    Aborted,
}

/// Fetcher → Normalizer → Store, each stage injected.
pub struct Pipeline {
    fetcher: Arc<dyn Fetcher>,
    normalizer: Arc<dyn Normalizer>,
    store: Box<dyn Store>,
    options: RunOptions,
    show_progress: bool,
    state: RunState,
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        normalizer: Arc<dyn Normalizer>,
        store: Box<dyn Store>,
        options: RunOptions,
    ) -> Self {
        Pipeline {
            fetcher,
            normalizer,
            store,
            options,
            show_progress: false,
            state: RunState::Idle,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        info!("Run state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Execute one run against `source`. Nothing is written unless the run
    /// reaches `Committed`.
    pub async fn run(&mut self, source: &SourceConfig) -> Result<RunReport, PipelineError> {
        let started_at = Utc::now();
        let run_id = new_run_id(started_at);
        self.state = RunState::Idle;
        info!(run_id = %run_id, source = %source.base_url, "starting run");

        let mut partial = Partial::default();
        match self.execute(source, started_at, &run_id, &mut partial).await {
            Ok(report) => {
                self.transition(RunState::Committed);
                let record = RunRecord {
                    run_id: report.run_id.clone(),
                    started_at: report.started_at,
                    finished_at: report.finished_at,
                    status: RunStatus::Committed,
                    documents: report.documents,
                    summary: report.summary,
                    fetch_errors: report.fetch_failures.len(),
                    error: None,
                };
                if let Err(e) = self.store.record_run(&record) {
                    warn!(error = %e, "failed to record committed run");
                }
                Ok(report)
            }
            Err(e) => {
                self.transition(RunState::Aborted);
                error!(run_id = %run_id, kind = e.kind(), error = %e, "run aborted");
                let record = RunRecord {
                    run_id,
                    started_at,
                    finished_at: Utc::now(),
                    status: RunStatus::Aborted,
                    documents: partial.documents,
                    summary: UpsertSummary {
                        rejected: partial.rejected,
                        ..Default::default()
                    },
                    fetch_errors: partial.fetch_errors,
                    error: Some(e.to_string()),
                };
                if let Err(log_err) = self.store.record_run(&record) {
                    warn!(error = %log_err, "failed to record aborted run");
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &mut self,
        source: &SourceConfig,
        started_at: chrono::DateTime<Utc>,
        run_id: &str,
        partial: &mut Partial,
    ) -> Result<RunReport, PipelineError> {
        let deadline = self.options.run_timeout.map(|t| Instant::now() + t);

        self.transition(RunState::Fetching);
        let fetch = fetch_all(
            Arc::clone(&self.fetcher),
            source,
            self.options.fail_fast,
            self.show_progress,
        );
        let fetched = match self.options.run_timeout {
            Some(limit) => tokio::time::timeout(limit, fetch)
                .await
                .map_err(|_| PipelineError::TimedOut(limit))??,
            None => fetch.await?,
        };
        partial.documents = fetched.documents.len();
        partial.fetch_errors = fetched.failures.len();
        if fetched.documents.is_empty() {
            if self.options.refuse_empty_source {
                return Err(PipelineError::EmptySource);
            }
            warn!("Source returned no documents; every active location will be deactivated");
        }

        self.transition(RunState::Normalizing);
        let normalized = normalize_all(self.normalizer.as_ref(), &fetched.documents);
        let total = fetched.documents.len();
        let rejected = normalized.rejections.len();
        partial.rejected = rejected;
        if rejected > 0 {
            warn!("Rejected {} of {} documents", rejected, total);
        }
        if total > 0 && rejected as f64 / total as f64 > self.options.max_rejection_rate {
            return Err(PipelineError::RejectionThreshold {
                rejected,
                total,
                max_rate: self.options.max_rejection_rate,
            });
        }

        let deactivate_missing =
            fetched.failures.is_empty() || self.options.deactivate_on_partial_fetch;
        if !deactivate_missing {
            warn!(
                "{} pages failed; leaving unseen locations active",
                fetched.failures.len()
            );
        }

        self.transition(RunState::Upserting);
        let run_at = Utc::now();
        let run_timeout = self.options.run_timeout;
        let mut summary = self
            .store
            .upsert(UpsertBatch {
                records: &normalized.records,
                run_at,
                deactivate_missing,
                deadline,
            })
            .map_err(|e| match (e, run_timeout) {
                (StoreError::DeadlineExceeded, Some(limit)) => {
                    PipelineError::TimedOut(limit)
                }
                (e, _) => PipelineError::Store(e),
            })?;
        summary.rejected = rejected;

        info!(
            "Committed: {} inserted, {} updated, {} deactivated, {} rejected",
            summary.inserted, summary.updated, summary.deactivated, summary.rejected
        );

        Ok(RunReport {
            run_id: run_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            documents: total,
            summary,
            fetch_failures: fetched.failures,
            rejections: normalized.rejections,
            deactivation_skipped: !deactivate_missing,
        })
    }
}

/// Counters kept for the run log when a run aborts part-way.
#[derive(Default)]
struct Partial {
    documents: usize,
    rejected: usize,
    fetch_errors: usize,
}

/// Production entrypoint: HTTP fetcher, JSON normalizer, SQLite store.
pub async fn run_pipeline(settings: &Settings, show_progress: bool) -> Result<RunReport, PipelineError> {
    let fetcher = HttpFetcher::new()?;
    run_with_fetcher(settings, Arc::new(fetcher), show_progress).await
}

/// Validate configuration, then open the store, then run. Configuration
/// errors surface before the fetcher or database are touched.
pub async fn run_from_vars<I>(vars: I, fetcher: Arc<dyn Fetcher>) -> Result<RunReport, PipelineError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let settings = Settings::from_vars(vars)?;
    run_with_fetcher(&settings, fetcher, false).await
}

async fn run_with_fetcher(
    settings: &Settings,
    fetcher: Arc<dyn Fetcher>,
    show_progress: bool,
) -> Result<RunReport, PipelineError> {
    let source = settings.source()?;
    let store = SqliteStore::open(&settings.db_url)?;
    let mut pipeline = Pipeline::new(
        fetcher,
        Arc::new(JsonNormalizer),
        Box::new(store),
        settings.run.clone(),
    )
    .with_progress(show_progress);
    pipeline.run(source).await
}
