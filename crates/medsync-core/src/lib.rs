//! Medsync Core - domain types, normalization, the import pipeline and its
//! scheduler.
//!
//! I/O lives behind the traits in [`traits`]; `medsync-client` supplies the
//! HTTP fetcher and `medsync-db` the PostgreSQL stores.

pub mod config;
pub mod error;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod scheduler;
pub mod sync;
pub mod traits;
pub mod upsert;

#[cfg(test)]
mod testing;

pub use config::{
    default_config_path, HttpConfig, JobConfig, JobKind, RateLimit, RateLimitConfig,
    SchedulerConfig, Settings,
};
pub use error::{AppError, UpstreamError};
pub use models::{
    Diagnosis, DiagnosisPatch, Drug, DrugPatch, EntityCounts, Ingredient, LabelPatch, Synonym,
};
pub use pipeline::{ImportParams, ImportPipeline};
pub use scheduler::Scheduler;
pub use sync::{
    next_cursor, parse_cursor, BatchRunSummary, JobRunResult, RecordOutcome, RunPhase, RunStats,
};
pub use traits::{EntityStore, EntityTx, Fetched, StateStore, UpstreamFetcher};
