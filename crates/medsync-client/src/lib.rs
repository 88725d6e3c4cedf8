//! Medsync Client - outbound HTTP for the public registries.
//!
//! - [`rate_limit`] - per-host token buckets
//! - [`fetcher`] - [`RetryingFetcher`], the production
//!   [`UpstreamFetcher`](medsync_core::traits::UpstreamFetcher)

pub mod fetcher;
pub mod rate_limit;

pub use fetcher::{parse_retry_after, Backoff, RetryingFetcher};
pub use rate_limit::{RateLimiter, RateLimiters};
