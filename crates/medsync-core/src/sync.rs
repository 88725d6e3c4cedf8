//! Run bookkeeping for import jobs: per-record outcomes, run statistics and
//! the cursor advancement rule.
//!
//! Everything here is pure; the pipeline owns the I/O.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error messages retained per run. The full count is kept separately.
pub const MAX_ERROR_SAMPLES: usize = 5;

/// Outcome of processing a single upstream record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// New canonical entity inserted.
    Imported,
    /// Existing entity matched by natural key.
    Updated,
    /// Record lacked a usable natural key or matched nothing to enrich.
    Skipped(&'static str),
    /// Record could not be interpreted at all.
    Errored(String),
}

/// Where a run is in its lifecycle. Used for logging and failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    FetchingPage,
    Normalizing,
    Committing,
    AdvancingCursor,
    Done,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::FetchingPage => "fetching_page",
            RunPhase::Normalizing => "normalizing",
            RunPhase::Committing => "committing",
            RunPhase::AdvancingCursor => "advancing_cursor",
            RunPhase::Done => "done",
            RunPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Statistics for one import run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub job: String,
    pub received: usize,
    pub imported: usize,
    pub updated: usize,
    pub skipped: usize,
    pub error_count: usize,
    /// At most [`MAX_ERROR_SAMPLES`] messages.
    pub errors: Vec<String>,
    /// Cursor persisted at the end of the run, if the run used one.
    pub next_cursor: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStats {
    /// Creates an empty tracker for `job`.
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            received: 0,
            imported: 0,
            updated: 0,
            skipped: 0,
            error_count: 0,
            errors: Vec::new(),
            next_cursor: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Records an outcome, incrementing the appropriate counter.
    pub fn record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Imported => self.imported += 1,
            RecordOutcome::Updated => self.updated += 1,
            RecordOutcome::Skipped(_) => self.skipped += 1,
            RecordOutcome::Errored(message) => self.record_error(message),
        }
    }

    /// Counts an error, keeping its message only while the sample has room.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        if self.errors.len() < MAX_ERROR_SAMPLES {
            self.errors.push(message.into());
        }
    }

    /// Returns the number of records that reached a final outcome.
    pub fn total(&self) -> usize {
        self.imported + self.updated + self.skipped + self.error_count
    }

    /// Returns the number of records written.
    pub fn written(&self) -> usize {
        self.imported + self.updated
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

/// Computes the cursor for the next run.
///
/// A page shorter than requested is taken as the end of the listing and
/// wraps the cursor to 0; otherwise the cursor advances by what was
/// received. Upstream listings grow over time, so wrapping makes the next
/// pass pick up new records.
///
/// # Examples
///
/// ```
/// use medsync_core::sync::next_cursor;
///
/// assert_eq!(next_cursor(200, 100, 100), 300);
/// assert_eq!(next_cursor(200, 100, 3), 0);
/// ```
pub fn next_cursor(current: u64, requested: u32, received: usize) -> u64 {
    if received < requested as usize {
        0
    } else {
        current.saturating_add(received as u64)
    }
}

/// Parses a stored cursor value. Unreadable values restart from 0.
pub fn parse_cursor(value: Option<&str>) -> u64 {
    value
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(0)
}

// =============================================================================
// Batch Run Types
// =============================================================================

/// Result of running a single job in batch mode.
#[derive(Debug, Clone)]
pub struct JobRunResult {
    pub job: String,
    pub stats: Option<RunStats>,
    /// Error message if the run failed, None if successful.
    pub error: Option<String>,
}

impl JobRunResult {
    pub fn success(job: String, stats: RunStats) -> Self {
        Self {
            job,
            stats: Some(stats),
            error: None,
        }
    }

    pub fn failure(job: String, error: String) -> Self {
        Self {
            job,
            stats: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregated results from running several jobs.
#[derive(Debug, Clone, Default)]
pub struct BatchRunSummary {
    pub results: Vec<JobRunResult>,
}

impl BatchRunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, result: JobRunResult) {
        self.results.push(result);
    }

    pub fn successful_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.is_success()).count()
    }

    /// Records received across all successful runs.
    pub fn total_received(&self) -> usize {
        self.results
            .iter()
            .filter_map(|r| r.stats.as_ref())
            .map(|s| s.received)
            .sum()
    }

    /// Records imported or updated across all successful runs.
    pub fn total_written(&self) -> usize {
        self.results
            .iter()
            .filter_map(|r| r.stats.as_ref())
            .map(RunStats::written)
            .sum()
    }
}
