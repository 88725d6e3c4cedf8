use thiserror::Error;

/// Failures of the outbound fetch layer.
///
/// `Status` is terminal (4xx other than 429). `Throttled`, `Network` and
/// `Timeout` are transient and retried by the fetcher until its attempt
/// budget runs out, at which point the last transient failure is wrapped in
/// `Exhausted`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Non-retryable HTTP status.
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    /// 429 or 5xx. Retryable.
    #[error("Upstream throttled or failed: HTTP {status} from {url}")]
    Throttled { status: u16, url: String },

    /// Connection refused, reset, DNS failure and similar transport errors.
    #[error("Network error: {0}")]
    Network(String),

    /// The per-call timeout elapsed.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// A 2xx response whose body was not valid JSON.
    #[error("Invalid JSON payload from {url}: {message}")]
    Decode { url: String, message: String },

    /// The endpoint or query could not be turned into a URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Every attempt failed with a transient error.
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<UpstreamError>,
    },
}

impl UpstreamError {
    /// Returns true if another attempt may succeed.
    ///
    /// # Examples
    ///
    /// ```
    /// use medsync_core::error::UpstreamError;
    ///
    /// let err = UpstreamError::Throttled { status: 429, url: "https://api.fda.gov".into() };
    /// assert!(err.is_retryable());
    ///
    /// let err = UpstreamError::Status { status: 404, url: "https://api.fda.gov".into() };
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::Throttled { .. } | UpstreamError::Network(_) | UpstreamError::Timeout(_)
        )
    }

    /// The HTTP status behind this error, looking through `Exhausted`.
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Status { status, .. } | UpstreamError::Throttled { status, .. } => {
                Some(*status)
            }
            UpstreamError::Exhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Number of attempts made before this error surfaced.
    pub fn attempts(&self) -> u32 {
        match self {
            UpstreamError::Exhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }
}

/// Application-wide error types.
///
/// Conversions from the underlying library errors are derived with `#[from]`:
/// - `sqlx::Error` → `AppError::DatabaseError`
/// - `UpstreamError` → `AppError::Upstream`
/// - `serde_json::Error` → `AppError::SerializationError`
///
/// # Examples
///
/// ```no_run
/// use medsync_core::error::AppError;
///
/// fn example() -> Result<(), AppError> {
///     Err(AppError::UnknownJob("nightly".to_string()))
/// }
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// Database operation failed.
    ///
    /// Raised while applying one record, only that record is rolled back.
    /// Raised by a page commit, the run fails.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Upstream registry request failed after the fetcher's retry policy.
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The upstream answered 2xx but the top-level shape is unusable
    /// (e.g. no `results` list).
    #[error("Malformed response from {source_name}: {reason}")]
    MalformedResponse { source_name: String, reason: String },

    /// Configuration file or values are invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A cron expression could not be parsed.
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    /// No job with this name is configured.
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    /// A run of this job is already in progress in this process.
    #[error("Job {0} is already running")]
    JobBusy(String),

    /// Generic application error for cases not covered by specific variants.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DatabaseError(e) => {
                if e.to_string().contains("connection") {
                    "Cannot connect to database. Is PostgreSQL running?\n   Check DATABASE_URL."
                        .to_string()
                } else {
                    format!("Database error: {}", e)
                }
            }
            AppError::Upstream(e) => match e.status() {
                Some(429) => format!(
                    "Upstream rate limit persisted after {} attempts.\n   Lower the request rate or try again later.",
                    e.attempts()
                ),
                Some(403) | Some(401) => {
                    "Upstream rejected the credentials.\n   Check OPENFDA_API_KEY.".to_string()
                }
                _ => format!("Upstream error: {}", e),
            },
            AppError::JobBusy(job) => {
                format!("Job {} is already running in this process.\n   Wait for it to finish.", job)
            }
            AppError::UnknownJob(job) => {
                format!("Unknown job: {}\n   Run `medsync jobs` to list configured jobs.", job)
            }
            _ => self.to_string(),
        }
    }

    /// Returns true if this error is retryable.
    ///
    /// # Examples
    ///
    /// ```
    /// use medsync_core::error::{AppError, UpstreamError};
    ///
    /// let err = AppError::Upstream(UpstreamError::Timeout(30));
    /// assert!(err.is_retryable());
    ///
    /// let err = AppError::UnknownJob("nope".to_string());
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Upstream(e) => e.is_retryable(),
            AppError::JobBusy(_) => true,
            _ => false,
        }
    }
}
