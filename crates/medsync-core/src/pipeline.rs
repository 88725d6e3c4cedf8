//! Import pipeline: one fetch-normalize-commit-advance cycle per run.
//!
//! # Run lifecycle
//!
//! `Idle → FetchingPage → Normalizing → Committing → AdvancingCursor → Done`
//!
//! - A fetch that exhausts its retries (or fails terminally) aborts the run
//!   before anything is written; the cursor stays where it was, so the next
//!   run retries the same window.
//! - Records of a page are processed sequentially inside one transaction.
//!   Each record runs in its own savepoint: a malformed record is counted
//!   and skipped, and a record the store rejects is rolled back to its
//!   savepoint and counted as errored. Only a failed page commit (or a
//!   failing savepoint command) rolls the whole page back and fails the run.
//! - The cursor is written only after the page commit. Re-running a page
//!   after a crash is harmless because every write is a natural-key upsert.
//! - Run statistics are written last and best-effort.
//!
//! # Manual windows
//!
//! [`ImportParams::skip`] pins the window explicitly. Such a run neither
//! reads nor advances the stored cursor.

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{JobConfig, JobKind};
use crate::error::{AppError, UpstreamError};
use crate::normalize::{self, Normalized};
use crate::sync::{next_cursor, parse_cursor, RecordOutcome, RunPhase, RunStats};
use crate::traits::{EntityStore, EntityTx, Fetched, StateStore, UpstreamFetcher};
use crate::upsert;

/// Extra fields requested from the ClinicalTables conditions API.
const CONDITIONS_EXTRA_FIELDS: &str = "consumer_name,icd10cm_codes,term_icd9_code,synonyms";

/// Per-invocation overrides of a job's configured query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportParams {
    pub search: Option<String>,
    pub terms: Option<String>,
    pub limit: Option<u32>,
    /// Explicit window start. Bypasses the stored cursor.
    pub skip: Option<u64>,
}

/// Tracks the current phase so failures can report where they happened.
struct RunContext {
    phase: RunPhase,
    job: String,
}

impl RunContext {
    fn new(job: &str) -> Self {
        Self {
            phase: RunPhase::Idle,
            job: job.to_string(),
        }
    }

    fn enter(&mut self, phase: RunPhase) {
        debug!(job = %self.job, from = %self.phase, to = %phase, "Run phase transition");
        self.phase = phase;
    }
}

/// Orchestrates import runs for a fixed set of configured jobs.
///
/// # Type Parameters
///
/// * `F` - upstream fetcher (e.g. `medsync_client::RetryingFetcher`)
/// * `S` - entity store (e.g. `medsync_db::PgEntityStore`)
/// * `K` - cursor/statistics store (e.g. `medsync_db::PgStateStore`)
pub struct ImportPipeline<F, S, K>
where
    F: UpstreamFetcher,
    S: EntityStore,
    K: StateStore,
{
    fetcher: F,
    store: S,
    state: K,
    jobs: Vec<JobConfig>,
}

impl<F, S, K> ImportPipeline<F, S, K>
where
    F: UpstreamFetcher,
    S: EntityStore,
    K: StateStore,
{
    pub fn new(fetcher: F, store: S, state: K, jobs: Vec<JobConfig>) -> Self {
        Self {
            fetcher,
            store,
            state,
            jobs,
        }
    }

    #[cfg(test)]
    pub(crate) fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn jobs(&self) -> &[JobConfig] {
        &self.jobs
    }

    pub fn job(&self, name: &str) -> Result<&JobConfig, AppError> {
        self.jobs
            .iter()
            .find(|job| job.name == name)
            .ok_or_else(|| AppError::UnknownJob(name.to_string()))
    }

    /// Runs one import cycle for `job_name` and returns its statistics.
    ///
    /// Callable from a request handler (the statistics are returned) and
    /// from a timer (they are also persisted under `stats:<job>`).
    pub async fn run_import(
        &self,
        job_name: &str,
        params: &ImportParams,
    ) -> Result<RunStats, AppError> {
        let job = self.job(job_name)?;
        let mut stats = RunStats::new(&job.name);
        let mut ctx = RunContext::new(&job.name);

        info!(job = %job.name, kind = job.kind.as_str(), "Starting import run");

        let label_candidates = job.kind == JobKind::OpenfdaLabel
            && params.search.is_none()
            && job.search.is_none();

        let result = if label_candidates {
            self.run_label_candidates(job, &mut stats, &mut ctx).await
        } else {
            self.run_page(job, params, &mut stats, &mut ctx).await
        };

        if let Err(e) = result {
            let failed_in = ctx.phase;
            ctx.enter(RunPhase::Failed);
            let attempts = match &e {
                AppError::Upstream(upstream) => upstream.attempts(),
                _ => 0,
            };
            error!(
                job = %job.name,
                phase = %failed_in,
                attempts,
                retryable = e.is_retryable(),
                error = %e,
                "Import run failed"
            );
            return Err(e);
        }

        stats.finish();
        match self.persist_stats(job, &stats).await {
            Ok(()) => {}
            Err(e) => warn!(job = %job.name, error = %e, "Could not persist run statistics"),
        }

        ctx.enter(RunPhase::Done);
        info!(
            job = %job.name,
            received = stats.received,
            processed = stats.total(),
            imported = stats.imported,
            updated = stats.updated,
            skipped = stats.skipped,
            errors = stats.error_count,
            next_cursor = ?stats.next_cursor,
            "Import run complete"
        );
        Ok(stats)
    }

    async fn run_page(
        &self,
        job: &JobConfig,
        params: &ImportParams,
        stats: &mut RunStats,
        ctx: &mut RunContext,
    ) -> Result<(), AppError> {
        ctx.enter(RunPhase::FetchingPage);
        let requested = job.effective_page_size(params.limit);
        let (start, tracks_cursor) = match params.skip {
            Some(skip) => (skip, false),
            None => {
                let stored = self.state.get(&job.cursor_key()).await?;
                (parse_cursor(stored.as_deref()), true)
            }
        };

        let (endpoint, query) = page_request(job, params, requested, start)?;
        debug!(job = %job.name, endpoint = %endpoint, start, requested, "Fetching page");

        let records = match self.fetcher.fetch(&endpoint, &query).await {
            Ok(fetched) => {
                if fetched.retries() > 0 {
                    info!(job = %job.name, retries = fetched.retries(), "Page fetched after retries");
                }
                extract_records(job, &fetched)?
            }
            Err(e) if is_openfda_no_match(job.kind, &e) => {
                debug!(job = %job.name, start, "No upstream matches at this offset");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        stats.received = records.len();

        ctx.enter(RunPhase::Normalizing);
        let mut tx = self.store.begin().await?;
        for record in &records {
            let step = match tx.savepoint().await {
                Ok(()) => {
                    let applied = apply_record(&mut tx, job.kind, record).await;
                    settle_record(&mut tx, &job.name, applied).await
                }
                Err(e) => Err(e),
            };
            match step {
                Ok(outcome) => stats.record(outcome),
                Err(e) => {
                    rollback_quietly(tx, &job.name).await;
                    return Err(e);
                }
            }
        }

        ctx.enter(RunPhase::Committing);
        tx.commit().await?;

        if tracks_cursor {
            ctx.enter(RunPhase::AdvancingCursor);
            let next = next_cursor(start, requested, stats.received);
            self.state.set(&job.cursor_key(), &next.to_string()).await?;
            stats.next_cursor = Some(next);
        }

        Ok(())
    }

    /// Label enrichment for drugs still missing label sections, one lookup
    /// per drug. Lookups happen before the transaction opens.
    async fn run_label_candidates(
        &self,
        job: &JobConfig,
        stats: &mut RunStats,
        ctx: &mut RunContext,
    ) -> Result<(), AppError> {
        ctx.enter(RunPhase::FetchingPage);
        let candidates = self.store.label_candidates(job.batch_size).await?;
        stats.received = candidates.len();

        let endpoint = format!("{}/drug/label.json", job.base_url());
        let mut lookups = Vec::with_capacity(candidates.len());
        for ndc in candidates {
            let mut query = vec![
                (
                    "search".to_string(),
                    format!("openfda.product_ndc:\"{}\"", ndc),
                ),
                ("limit".to_string(), "1".to_string()),
            ];
            push_api_key(&mut query, job);
            let result = self.fetcher.fetch(&endpoint, &query).await;
            lookups.push((ndc, result));
        }

        ctx.enter(RunPhase::Normalizing);
        let mut tx = self.store.begin().await?;
        for (ndc, lookup) in &lookups {
            let step = match tx.savepoint().await {
                Ok(()) => {
                    let applied = label_lookup_outcome(&mut tx, job, ndc, lookup).await;
                    settle_record(&mut tx, &job.name, applied).await
                }
                Err(e) => Err(e),
            };
            match step {
                Ok(outcome) => stats.record(outcome),
                Err(e) => {
                    rollback_quietly(tx, &job.name).await;
                    return Err(e);
                }
            }
        }

        ctx.enter(RunPhase::Committing);
        tx.commit().await?;
        Ok(())
    }

    async fn persist_stats(&self, job: &JobConfig, stats: &RunStats) -> Result<(), AppError> {
        let json = serde_json::to_string(stats)?;
        self.state.set(&job.stats_key(), &json).await
    }
}

/// Builds the endpoint and query for one page of a paged job.
fn page_request(
    job: &JobConfig,
    params: &ImportParams,
    requested: u32,
    start: u64,
) -> Result<(String, Vec<(String, String)>), AppError> {
    let base = job.base_url();
    let search = params.search.as_ref().or(job.search.as_ref());

    match job.kind {
        JobKind::OpenfdaNdc | JobKind::OpenfdaLabel => {
            let path = if job.kind == JobKind::OpenfdaNdc {
                "drug/ndc.json"
            } else {
                "drug/label.json"
            };
            let mut query = Vec::new();
            if let Some(search) = search {
                query.push(("search".to_string(), search.clone()));
            }
            query.push(("limit".to_string(), requested.to_string()));
            query.push(("skip".to_string(), start.to_string()));
            push_api_key(&mut query, job);
            Ok((format!("{}/{}", base, path), query))
        }
        JobKind::ClinicaltablesConditions => {
            let terms = params
                .terms
                .as_ref()
                .or(job.terms.as_ref())
                .filter(|terms| !terms.trim().is_empty())
                .ok_or_else(|| {
                    AppError::Config(format!("job {} requires search terms", job.name))
                })?;
            let query = vec![
                ("terms".to_string(), terms.clone()),
                ("count".to_string(), requested.to_string()),
                ("offset".to_string(), start.to_string()),
                ("df".to_string(), "primary_name".to_string()),
                ("ef".to_string(), CONDITIONS_EXTRA_FIELDS.to_string()),
            ];
            Ok((format!("{}/api/conditions/v3/search", base), query))
        }
    }
}

fn push_api_key(query: &mut Vec<(String, String)>, job: &JobConfig) {
    if let Some(api_key) = job.api_key.as_ref().filter(|key| !key.is_empty()) {
        query.push(("api_key".to_string(), api_key.clone()));
    }
}

fn extract_records(job: &JobConfig, fetched: &Fetched) -> Result<Vec<Value>, AppError> {
    match job.kind {
        JobKind::OpenfdaNdc | JobKind::OpenfdaLabel => {
            normalize::openfda_results(&job.name, &fetched.payload)
        }
        JobKind::ClinicaltablesConditions => {
            normalize::clinicaltables_rows(&job.name, &fetched.payload)
        }
    }
}

/// openFDA answers 404 when a query has no results at the requested offset.
fn is_openfda_no_match(kind: JobKind, error: &UpstreamError) -> bool {
    matches!(kind, JobKind::OpenfdaNdc | JobKind::OpenfdaLabel)
        && matches!(error, UpstreamError::Status { status: 404, .. })
}

async fn apply_record<T: EntityTx>(
    tx: &mut T,
    kind: JobKind,
    record: &Value,
) -> Result<RecordOutcome, AppError> {
    match kind {
        JobKind::OpenfdaNdc => match normalize::ndc_record(record) {
            Normalized::Ready(drug) => upsert::upsert_drug(tx, &drug).await,
            Normalized::Skip(reason) => Ok(RecordOutcome::Skipped(reason)),
            Normalized::Malformed(message) => Ok(RecordOutcome::Errored(message)),
        },
        JobKind::OpenfdaLabel => match normalize::label_record(record, None) {
            Normalized::Ready(label) => upsert::enrich_label(tx, &label).await,
            Normalized::Skip(reason) => Ok(RecordOutcome::Skipped(reason)),
            Normalized::Malformed(message) => Ok(RecordOutcome::Errored(message)),
        },
        JobKind::ClinicaltablesConditions => match normalize::condition_record(record) {
            Normalized::Ready(condition) => upsert::upsert_condition(tx, &condition).await,
            Normalized::Skip(reason) => Ok(RecordOutcome::Skipped(reason)),
            Normalized::Malformed(message) => Ok(RecordOutcome::Errored(message)),
        },
    }
}

async fn label_lookup_outcome<T: EntityTx>(
    tx: &mut T,
    job: &JobConfig,
    ndc: &str,
    lookup: &Result<Fetched, UpstreamError>,
) -> Result<RecordOutcome, AppError> {
    tx.mark_label_checked(ndc).await?;

    let fetched = match lookup {
        Ok(fetched) => fetched,
        Err(e) if is_openfda_no_match(job.kind, e) => {
            return Ok(RecordOutcome::Skipped("no label published"))
        }
        Err(e) => return Ok(RecordOutcome::Errored(format!("{}: {}", ndc, e))),
    };

    let results = match normalize::openfda_results(&job.name, &fetched.payload) {
        Ok(results) => results,
        Err(e) => return Ok(RecordOutcome::Errored(format!("{}: {}", ndc, e))),
    };
    let Some(document) = results.first() else {
        return Ok(RecordOutcome::Skipped("no label published"));
    };

    match normalize::label_record(document, Some(ndc)) {
        Normalized::Ready(label) => upsert::enrich_label(tx, &label).await,
        Normalized::Skip(reason) => Ok(RecordOutcome::Skipped(reason)),
        Normalized::Malformed(message) => Ok(RecordOutcome::Errored(message)),
    }
}

/// Closes the record's savepoint. A store error raised while applying the
/// record discards only that record's writes and counts it as errored; the
/// page keeps going. Errors from the savepoint commands themselves are fatal.
async fn settle_record<T: EntityTx>(
    tx: &mut T,
    job: &str,
    applied: Result<RecordOutcome, AppError>,
) -> Result<RecordOutcome, AppError> {
    match applied {
        Ok(outcome) => {
            tx.release_savepoint().await?;
            Ok(outcome)
        }
        Err(e) => {
            tx.rollback_to_savepoint().await?;
            warn!(job, error = %e, "Record rejected by the store");
            Ok(RecordOutcome::Errored(e.to_string()))
        }
    }
}

async fn rollback_quietly<T: EntityTx>(tx: T, job: &str) {
    if let Err(e) = tx.rollback().await {
        warn!(job, error = %e, "Rollback failed; the transaction is discarded on drop");
    }
}
