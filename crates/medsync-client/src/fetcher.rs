use std::time::Duration;

use medsync_core::config::{HttpConfig, RateLimitConfig};
use medsync_core::error::{AppError, UpstreamError};
use medsync_core::traits::{Fetched, UpstreamFetcher};
use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::rate_limit::RateLimiters;

/// Query parameters never echoed into logs or error messages.
const SECRET_PARAMS: &[&str] = &["api_key"];

/// Exponential backoff: each computed delay doubles the previous one, up to
/// `cap`. A server hint replaces the computed delay and is not capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            next: base.min(cap),
            cap,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self, hint: Option<Duration>) -> Duration {
        let computed = self.next;
        self.next = self.next.saturating_mul(2).min(self.cap);
        hint.unwrap_or(computed)
    }
}

/// Parses a `Retry-After` header given in whole seconds.
///
/// HTTP-date values are ignored; the caller falls back to its own backoff.
pub fn parse_retry_after(value: Option<&HeaderValue>) -> Option<Duration> {
    let raw = value?.to_str().ok()?.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<u64>().ok().map(Duration::from_secs)
}

/// HTTP fetcher for openFDA and ClinicalTables.
///
/// Every attempt first takes a permit from the host's rate limiter. 429 and
/// 5xx responses, timeouts and transport errors are retried with
/// exponential backoff (honouring `Retry-After`) until `max_attempts` is
/// spent. Any other non-2xx status fails immediately.
///
/// # Examples
///
/// ```no_run
/// use medsync_client::RetryingFetcher;
/// use medsync_core::config::{HttpConfig, RateLimitConfig};
/// use medsync_core::traits::UpstreamFetcher;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = RetryingFetcher::new(&HttpConfig::default(), RateLimitConfig::default())?;
/// let query = vec![("limit".to_string(), "1".to_string())];
/// let page = fetcher.fetch("https://api.fda.gov/drug/ndc.json", &query).await?;
/// println!("{}", page.payload);
/// # Ok(())
/// # }
/// ```
pub struct RetryingFetcher {
    client: Client,
    limiters: RateLimiters,
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    timeout_secs: u64,
}

impl RetryingFetcher {
    /// Builds the HTTP client and the per-host limiter registry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(http: &HttpConfig, rate_limits: RateLimitConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(http.user_agent.as_str())
            .timeout(http.timeout())
            .build()
            .map_err(|e| AppError::Config(format!("Cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            limiters: RateLimiters::new(rate_limits),
            max_attempts: http.max_attempts.max(1),
            base_backoff: http.base_backoff(),
            max_backoff: http.max_backoff(),
            timeout_secs: http.timeout_secs,
        })
    }

    fn transport_error(&self, e: &reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            UpstreamError::Timeout(self.timeout_secs)
        } else {
            UpstreamError::Network(e.to_string())
        }
    }
}

impl UpstreamFetcher for RetryingFetcher {
    async fn fetch(
        &self,
        endpoint: &str,
        query: &[(String, String)],
    ) -> Result<Fetched, UpstreamError> {
        let url = build_url(endpoint, query)?;
        let shown = redacted(&url);
        let host = url
            .host_str()
            .ok_or_else(|| UpstreamError::InvalidUrl(format!("{}: no host", shown)))?
            .to_string();
        let limiter = self.limiters.for_host(&host).await;
        let mut backoff = Backoff::new(self.base_backoff, self.max_backoff);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if !limiter.try_acquire() {
                debug!(url = %shown, attempt, "Waiting for a rate limit permit");
                limiter.acquire().await;
            }
            debug!(url = %shown, attempt, "GET");

            let (error, hint) = match self.client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => {
                                return serde_json::from_slice(&body)
                                    .map(|payload| Fetched {
                                        payload,
                                        attempts: attempt,
                                    })
                                    .map_err(|e| UpstreamError::Decode {
                                        url: shown.clone(),
                                        message: e.to_string(),
                                    });
                            }
                            Err(e) => (self.transport_error(&e), None),
                        }
                    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        let hint = parse_retry_after(resp.headers().get(RETRY_AFTER));
                        (
                            UpstreamError::Throttled {
                                status: status.as_u16(),
                                url: shown.clone(),
                            },
                            hint,
                        )
                    } else {
                        return Err(UpstreamError::Status {
                            status: status.as_u16(),
                            url: shown,
                        });
                    }
                }
                Err(e) => (self.transport_error(&e), None),
            };

            if attempt >= self.max_attempts {
                warn!(url = %shown, attempts = attempt, error = %error, "Giving up on upstream request");
                return Err(UpstreamError::Exhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = backoff.next_delay(hint);
            warn!(
                url = %shown,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Upstream request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn build_url(endpoint: &str, query: &[(String, String)]) -> Result<Url, UpstreamError> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| UpstreamError::InvalidUrl(format!("{}: {}", endpoint, e)))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

/// The URL with secret query values masked.
fn redacted(url: &Url) -> String {
    if !url
        .query_pairs()
        .any(|(key, _)| SECRET_PARAMS.contains(&key.as_ref()))
    {
        return url.to_string();
    }
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            let value = if SECRET_PARAMS.contains(&key.as_ref()) {
                "***".to_string()
            } else {
                value.into_owned()
            };
            (key.into_owned(), value)
        })
        .collect();
    let mut shown = url.clone();
    shown.query_pairs_mut().clear().extend_pairs(pairs);
    shown.to_string()
}
