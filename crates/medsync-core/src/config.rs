//! Configuration types for medsync components.
//!
//! Settings are static: they are read once at startup from a TOML file
//! (default `<config_dir>/medsync/medsync.toml`) and then overridden by CLI
//! flags or environment variables in the binary. A missing file means
//! built-in defaults.
//!
//! ```toml
//! [http]
//! timeout_secs = 30
//! max_attempts = 5
//! base_backoff_ms = 1000
//!
//! [rate_limit]
//! rate = 4.0
//! burst = 4
//!
//! [rate_limit.hosts."clinicaltables.nlm.nih.gov"]
//! rate = 2.0
//! burst = 2
//!
//! [scheduler]
//! enabled = true
//!
//! [[jobs]]
//! name = "openfda_ndc"
//! kind = "openfda_ndc"
//! cron = "0 2 * * *"
//! page_size = 100
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Default openFDA API root.
pub const OPENFDA_BASE_URL: &str = "https://api.fda.gov";

/// Default NLM ClinicalTables API root.
pub const CLINICALTABLES_BASE_URL: &str = "https://clinicaltables.nlm.nih.gov";

/// Returns the default configuration file path.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("medsync").join("medsync.toml"))
}

/// HTTP client and retry configuration for upstream calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    /// Upper bound on the exponential backoff. Server-supplied
    /// `Retry-After` hints are not capped.
    pub max_backoff_secs: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_attempts: 5,
            base_backoff_ms: 1000,
            max_backoff_secs: 300,
            user_agent: "medsync/0.1 (registry-importer)".to_string(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

/// Token bucket parameters for one upstream host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Sustained requests per second.
    pub rate: f64,
    /// Bucket capacity.
    pub burst: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            rate: 4.0,
            burst: 4,
        }
    }
}

/// Default limit plus per-host overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub rate: f64,
    pub burst: u32,
    pub hosts: HashMap<String, RateLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let default = RateLimit::default();
        Self {
            rate: default.rate,
            burst: default.burst,
            hosts: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Limit that applies to `host`.
    pub fn for_host(&self, host: &str) -> RateLimit {
        self.hosts.get(host).copied().unwrap_or(RateLimit {
            rate: self.rate,
            burst: self.burst,
        })
    }
}

/// Background scheduling configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Master switch for timer-driven runs. Manual runs ignore it.
    pub enabled: bool,
}

/// Upstream registry a job pulls from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    OpenfdaNdc,
    OpenfdaLabel,
    ClinicaltablesConditions,
}

impl JobKind {
    /// Largest page the upstream accepts.
    pub fn max_page_size(&self) -> u32 {
        match self {
            JobKind::OpenfdaNdc | JobKind::OpenfdaLabel => 100,
            JobKind::ClinicaltablesConditions => 500,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            JobKind::OpenfdaNdc | JobKind::OpenfdaLabel => OPENFDA_BASE_URL,
            JobKind::ClinicaltablesConditions => CLINICALTABLES_BASE_URL,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::OpenfdaNdc => "openfda_ndc",
            JobKind::OpenfdaLabel => "openfda_label",
            JobKind::ClinicaltablesConditions => "clinicaltables_conditions",
        }
    }
}

/// One configured import job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub kind: JobKind,
    /// Crontab expression (5 or 6 fields). Jobs without one are manual-only.
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// openFDA `search` expression.
    #[serde(default)]
    pub search: Option<String>,
    /// ClinicalTables `terms`.
    #[serde(default)]
    pub terms: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Drugs examined per candidate-mode label enrichment run.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_page_size() -> u32 {
    100
}

fn default_batch_size() -> u32 {
    50
}

impl JobConfig {
    pub fn new(name: impl Into<String>, kind: JobKind) -> Self {
        Self {
            name: name.into(),
            kind,
            cron: None,
            page_size: default_page_size(),
            search: None,
            terms: None,
            base_url: None,
            api_key: None,
            batch_size: default_batch_size(),
        }
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.kind.default_base_url())
            .trim_end_matches('/')
    }

    /// Page size actually sent upstream.
    pub fn effective_page_size(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.page_size)
            .clamp(1, self.kind.max_page_size())
    }

    /// Durable key for this job's progress cursor.
    pub fn cursor_key(&self) -> String {
        format!("{}_skip", self.name)
    }

    /// Durable key for this job's last-run statistics.
    pub fn stats_key(&self) -> String {
        format!("stats:{}", self.name)
    }
}

/// Top-level settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub http: HttpConfig,
    pub rate_limit: RateLimitConfig,
    pub scheduler: SchedulerConfig,
    pub jobs: Vec<JobConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut ndc = JobConfig::new("openfda_ndc", JobKind::OpenfdaNdc);
        ndc.cron = Some("0 2 * * *".to_string());
        ndc.search = Some("finished:true".to_string());

        let mut label = JobConfig::new("openfda_label", JobKind::OpenfdaLabel);
        label.cron = Some("30 2 * * *".to_string());

        let conditions = JobConfig::new("clinicaltables_conditions", JobKind::ClinicaltablesConditions);

        Self {
            http: HttpConfig::default(),
            rate_limit: RateLimitConfig::default(),
            scheduler: SchedulerConfig::default(),
            jobs: vec![ndc, label, conditions],
        }
    }
}

impl Settings {
    /// Parses settings from TOML text and validates them.
    pub fn from_toml(text: &str) -> Result<Self, AppError> {
        let settings: Settings =
            toml::from_str(text).map_err(|e| AppError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from `path`, or the default path when `None`.
    ///
    /// A missing file yields [`Settings::default`]; an unreadable or invalid
    /// one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let path = match path.map(Path::to_path_buf).or_else(default_config_path) {
            Some(path) => path,
            None => return Ok(Settings::default()),
        };

        if !path.exists() {
            tracing::debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Settings::default());
        }

        let text = std::fs::read_to_string(&path).map_err(|e| {
            AppError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|job| job.name == name)
    }

    /// Applies an API key to every openFDA job that has none.
    pub fn apply_openfda_api_key(&mut self, api_key: &str) {
        for job in &mut self.jobs {
            if matches!(job.kind, JobKind::OpenfdaNdc | JobKind::OpenfdaLabel)
                && job.api_key.is_none()
            {
                job.api_key = Some(api_key.to_string());
            }
        }
    }

    fn validate(&self) -> Result<(), AppError> {
        let mut seen = std::collections::HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                return Err(AppError::Config("job name must not be empty".to_string()));
            }
            if !seen.insert(job.name.as_str()) {
                return Err(AppError::Config(format!("duplicate job name: {}", job.name)));
            }
            if job.page_size == 0 {
                return Err(AppError::Config(format!(
                    "job {}: page_size must be positive",
                    job.name
                )));
            }
        }
        if self.http.max_attempts == 0 {
            return Err(AppError::Config(
                "http.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.http.timeout_secs == 0 {
            return Err(AppError::Config(
                "http.timeout_secs must be positive".to_string(),
            ));
        }
        if self.http.base_backoff_ms == 0 || self.http.max_backoff_secs == 0 {
            return Err(AppError::Config(
                "http.base_backoff_ms and http.max_backoff_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_http_config_defaults() {
        let config = HttpConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_backoff(), Duration::from_millis(1000));
        assert_eq!(config.max_backoff(), Duration::from_secs(300));
    }

    #[test]
    fn test_default_jobs() {
        let settings = Settings::default();
        assert!(!settings.scheduler.enabled);
        assert_eq!(settings.jobs.len(), 3);

        let ndc = settings.job("openfda_ndc").unwrap();
        assert_eq!(ndc.cron.as_deref(), Some("0 2 * * *"));
        assert_eq!(ndc.cursor_key(), "openfda_ndc_skip");
        assert_eq!(ndc.stats_key(), "stats:openfda_ndc");
        assert_eq!(ndc.base_url(), OPENFDA_BASE_URL);

        let conditions = settings.job("clinicaltables_conditions").unwrap();
        assert!(conditions.cron.is_none());
    }

    #[test]
    fn test_effective_page_size_is_clamped() {
        let job = JobConfig::new("ndc", JobKind::OpenfdaNdc);
        assert_eq!(job.effective_page_size(None), 100);
        assert_eq!(job.effective_page_size(Some(500)), 100);
        assert_eq!(job.effective_page_size(Some(0)), 1);

        let conditions = JobConfig::new("c", JobKind::ClinicaltablesConditions);
        assert_eq!(conditions.effective_page_size(Some(500)), 500);
    }

    #[test]
    fn test_rate_limit_host_override() {
        let settings = Settings::from_toml(
            r#"
            [rate_limit]
            rate = 1.0
            burst = 2

            [rate_limit.hosts."api.fda.gov"]
            rate = 4.0
            burst = 8
            "#,
        )
        .unwrap();

        let fda = settings.rate_limit.for_host("api.fda.gov");
        assert_eq!(fda.rate, 4.0);
        assert_eq!(fda.burst, 8);

        let other = settings.rate_limit.for_host("example.org");
        assert_eq!(other.rate, 1.0);
        assert_eq!(other.burst, 2);
    }

    #[test]
    fn test_parse_jobs_section() {
        let settings = Settings::from_toml(
            r#"
            [scheduler]
            enabled = true

            [[jobs]]
            name = "conditions_diabetes"
            kind = "clinicaltables_conditions"
            cron = "15 3 * * *"
            terms = "diabetes"
            page_size = 250
            "#,
        )
        .unwrap();

        assert!(settings.scheduler.enabled);
        assert_eq!(settings.jobs.len(), 1);
        let job = &settings.jobs[0];
        assert_eq!(job.kind, JobKind::ClinicaltablesConditions);
        assert_eq!(job.terms.as_deref(), Some("diabetes"));
        assert_eq!(job.page_size, 250);
        assert_eq!(job.batch_size, 50);
    }

    #[test]
    fn test_duplicate_job_names_rejected() {
        let result = Settings::from_toml(
            r#"
            [[jobs]]
            name = "a"
            kind = "openfda_ndc"

            [[jobs]]
            name = "a"
            kind = "openfda_label"
            "#,
        );
        assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn test_zero_timeout_and_backoff_rejected() {
        for http in [
            "timeout_secs = 0",
            "max_backoff_secs = 0",
            "base_backoff_ms = 0",
        ] {
            let result = Settings::from_toml(&format!("[http]\n{}\n", http));
            assert!(
                matches!(result, Err(AppError::Config(ref msg)) if msg.starts_with("http.")),
                "{} should be rejected",
                http
            );
        }
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[http]\nmax_attempts = 2\n").unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.http.max_attempts, 2);
        assert_eq!(settings.http.timeout_secs, 30);
        assert_eq!(settings.jobs.len(), 3);
    }

    #[test]
    fn test_apply_openfda_api_key() {
        let mut settings = Settings::default();
        settings.apply_openfda_api_key("secret");
        assert_eq!(
            settings.job("openfda_ndc").unwrap().api_key.as_deref(),
            Some("secret")
        );
        assert!(settings
            .job("clinicaltables_conditions")
            .unwrap()
            .api_key
            .is_none());
    }
}
