//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::SchemaLayout;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Storage and staging locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Shared politeness and resilience policy
    #[serde(default)]
    pub governor: GovernorConfig,

    /// Historical batch download settings
    #[serde(default)]
    pub fetcher: FetcherConfig,

    /// CSV layout table and record validation bounds
    #[serde(default)]
    pub normalizer: NormalizerConfig,

    /// Station status feed polling
    #[serde(default)]
    pub poller: PollerConfig,

    /// Supporting content crawl
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Historical manifest discovery
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        let governor = &self.governor;
        if governor.user_agent.trim().is_empty() {
            return Err(AppError::validation("governor.user_agent is empty"));
        }
        if governor.max_concurrent == 0 {
            return Err(AppError::validation("governor.max_concurrent must be > 0"));
        }
        if governor.request_timeout_secs == 0 {
            return Err(AppError::validation(
                "governor.request_timeout_secs must be > 0",
            ));
        }
        governor.default_rate.validate("governor.default_rate")?;
        for host in &governor.hosts {
            host.limit.validate(&format!("governor.hosts[{}]", host.host))?;
        }
        if governor.retry.max_attempts == 0 {
            return Err(AppError::validation(
                "governor.retry.max_attempts must be > 0",
            ));
        }
        if governor.retry.multiplier < 1.0 {
            return Err(AppError::validation(
                "governor.retry.multiplier must be >= 1.0",
            ));
        }
        if self.fetcher.max_concurrent_batches == 0 {
            return Err(AppError::validation(
                "fetcher.max_concurrent_batches must be > 0",
            ));
        }
        if self.fetcher.merge_chunk_size == 0 {
            return Err(AppError::validation("fetcher.merge_chunk_size must be > 0"));
        }
        if self.normalizer.layouts.is_empty() {
            return Err(AppError::validation("No schema layouts defined"));
        }
        if self.normalizer.max_trip_duration_secs <= 0 {
            return Err(AppError::validation(
                "normalizer.max_trip_duration_secs must be > 0",
            ));
        }
        for layout in &self.normalizer.layouts {
            layout.validate()?;
        }
        if self.poller.interval_secs == 0 {
            return Err(AppError::validation("poller.interval_secs must be > 0"));
        }
        if self.poller.failure_threshold == 0 {
            return Err(AppError::validation("poller.failure_threshold must be > 0"));
        }
        if self.poller.degraded_multiplier < 1.0 {
            return Err(AppError::validation(
                "poller.degraded_multiplier must be >= 1.0",
            ));
        }
        if self.poller.attempts_per_poll == 0 {
            return Err(AppError::validation("poller.attempts_per_poll must be > 0"));
        }
        if self.crawler.max_pages == 0 {
            return Err(AppError::validation("crawler.max_pages must be > 0"));
        }
        self.crawler.disallow_patterns()?;
        Ok(())
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

/// Storage and staging locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the trip log, watermark, snapshot and page stores
    #[serde(default = "defaults::storage_dir")]
    pub storage_dir: PathBuf,

    /// Raw batch staging area (replayable downloads)
    #[serde(default = "defaults::staging_dir")]
    pub staging_dir: PathBuf,

    /// Historical manifest file
    #[serde(default = "defaults::manifest_file")]
    pub manifest_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            storage_dir: defaults::storage_dir(),
            staging_dir: defaults::staging_dir(),
            manifest_file: defaults::manifest_file(),
        }
    }
}

/// Shared rate, concurrency and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Global cap on in-flight network calls
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Timeout applied to each network call
    #[serde(default = "defaults::request_timeout")]
    pub request_timeout_secs: u64,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Rate applied to hosts without an override
    #[serde(default)]
    pub default_rate: RateLimitConfig,

    /// Per-host rate overrides
    #[serde(default)]
    pub hosts: Vec<HostRateLimit>,

    /// Retry schedule for transient failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl GovernorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Rate limit for a host, falling back to the default rate.
    pub fn rate_for(&self, host: &str) -> &RateLimitConfig {
        self.hosts
            .iter()
            .find(|h| h.host.eq_ignore_ascii_case(host))
            .map(|h| &h.limit)
            .unwrap_or(&self.default_rate)
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::max_concurrent(),
            request_timeout_secs: defaults::request_timeout(),
            user_agent: defaults::user_agent(),
            default_rate: RateLimitConfig::default(),
            hosts: Vec::new(),
            retry: RetryConfig::default(),
        }
    }
}

/// `requests` per `window_ms`, admitting at most `burst` back to back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    #[serde(default = "defaults::rate_requests")]
    pub requests: u32,
    #[serde(default = "defaults::rate_window_ms")]
    pub window_ms: u64,
    #[serde(default = "defaults::rate_burst")]
    pub burst: u32,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self, context: &str) -> Result<()> {
        if self.requests == 0 || self.window_ms == 0 || self.burst == 0 {
            return Err(AppError::validation(format!(
                "{context}: requests, window_ms and burst must be > 0"
            )));
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: defaults::rate_requests(),
            window_ms: defaults::rate_window_ms(),
            burst: defaults::rate_burst(),
        }
    }
}

/// Rate override for a single host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRateLimit {
    pub host: String,
    #[serde(flatten)]
    pub limit: RateLimitConfig,
}

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "defaults::base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "defaults::multiplier")]
    pub multiplier: f64,
    #[serde(default = "defaults::max_delay")]
    pub max_delay_ms: u64,
    /// Apply +/- 50% random jitter to each delay
    #[serde(default = "defaults::jitter")]
    pub jitter: bool,
}

impl RetryConfig {
    /// Same schedule with a different attempt budget.
    pub fn with_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_delay_ms: defaults::base_delay(),
            multiplier: defaults::multiplier(),
            max_delay_ms: defaults::max_delay(),
            jitter: defaults::jitter(),
        }
    }
}

/// Historical batch download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Batches downloaded and merged concurrently
    #[serde(default = "defaults::max_concurrent_batches")]
    pub max_concurrent_batches: usize,

    /// Re-fetch and re-merge batches already marked ingested
    #[serde(default)]
    pub refresh: bool,

    /// Candidates handed to the trip log per append
    #[serde(default = "defaults::merge_chunk_size")]
    pub merge_chunk_size: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_batches: defaults::max_concurrent_batches(),
            refresh: false,
            merge_chunk_size: defaults::merge_chunk_size(),
        }
    }
}

/// Layout table and validation bounds for trip records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Longest plausible trip
    #[serde(default = "defaults::max_trip_duration")]
    pub max_trip_duration_secs: i64,

    /// Allowed gap between reported and timestamp-derived duration
    #[serde(default = "defaults::duration_tolerance")]
    pub duration_tolerance_secs: i64,

    /// Known per-vintage column layouts
    #[serde(default = "SchemaLayout::builtin")]
    pub layouts: Vec<SchemaLayout>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_trip_duration_secs: defaults::max_trip_duration(),
            duration_tolerance_secs: defaults::duration_tolerance(),
            layouts: SchemaLayout::builtin(),
        }
    }
}

/// Station status feed polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// GBFS-style station_status endpoint
    #[serde(default = "defaults::feed_url")]
    pub feed_url: String,

    /// Base cadence
    #[serde(default = "defaults::poll_interval")]
    pub interval_secs: u64,

    /// Consecutive failures before entering the degraded state
    #[serde(default = "defaults::failure_threshold")]
    pub failure_threshold: u32,

    /// Interval growth factor while degraded
    #[serde(default = "defaults::degraded_multiplier")]
    pub degraded_multiplier: f64,

    /// Upper bound on the degraded interval
    #[serde(default = "defaults::max_poll_interval")]
    pub max_interval_secs: u64,

    /// Governor attempts spent inside a single poll
    #[serde(default = "defaults::attempts_per_poll")]
    pub attempts_per_poll: u32,
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// First interval used once the poller turns degraded.
    pub fn degraded_interval(&self) -> Duration {
        let secs = (self.interval_secs as f64 * self.degraded_multiplier)
            .min(self.max_interval_secs.max(self.interval_secs) as f64);
        Duration::from_secs_f64(secs)
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            feed_url: defaults::feed_url(),
            interval_secs: defaults::poll_interval(),
            failure_threshold: defaults::failure_threshold(),
            degraded_multiplier: defaults::degraded_multiplier(),
            max_interval_secs: defaults::max_poll_interval(),
            attempts_per_poll: defaults::attempts_per_poll(),
        }
    }
}

/// Supporting content crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Default seeds when none are passed explicitly
    #[serde(default = "defaults::crawl_seeds")]
    pub seeds: Vec<String>,

    /// Link hops followed from a seed
    #[serde(default = "defaults::max_depth")]
    pub max_depth: usize,

    /// Fetch budget for one run
    #[serde(default = "defaults::max_pages")]
    pub max_pages: usize,

    /// Regex patterns matched against the URL path; matches are never fetched
    #[serde(default = "defaults::disallow")]
    pub disallow: Vec<String>,

    /// Link targets ignored during discovery (not HTML)
    #[serde(default = "defaults::skip_extensions")]
    pub skip_extensions: Vec<String>,

    /// Follow links to other origins
    #[serde(default)]
    pub follow_cross_origin: bool,

    /// Consult each origin's robots.txt before fetching
    #[serde(default = "defaults::respect_robots_txt")]
    pub respect_robots_txt: bool,
}

impl CrawlerConfig {
    /// Compile the disallow list.
    pub fn disallow_patterns(&self) -> Result<Vec<Regex>> {
        self.disallow
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    AppError::validation(format!("Invalid crawler.disallow pattern '{p}': {e}"))
                })
            })
            .collect()
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            seeds: defaults::crawl_seeds(),
            max_depth: defaults::max_depth(),
            max_pages: defaults::max_pages(),
            disallow: defaults::disallow(),
            skip_extensions: defaults::skip_extensions(),
            follow_cross_origin: false,
            respect_robots_txt: defaults::respect_robots_txt(),
        }
    }
}

/// Historical manifest discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Publisher page listing the monthly trip exports
    #[serde(default = "defaults::discovery_page")]
    pub page_url: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            page_url: defaults::discovery_page(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn log_level() -> String {
        "info".into()
    }

    // Paths
    pub fn storage_dir() -> PathBuf {
        PathBuf::from("storage")
    }
    pub fn staging_dir() -> PathBuf {
        PathBuf::from("storage/raw")
    }
    pub fn manifest_file() -> PathBuf {
        PathBuf::from("data/manifest.toml")
    }

    // Governor
    pub fn max_concurrent() -> usize {
        4
    }
    pub fn request_timeout() -> u64 {
        30
    }
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; bikeshare-ingest/0.1)".into()
    }
    pub fn rate_requests() -> u32 {
        2
    }
    pub fn rate_window_ms() -> u64 {
        1_000
    }
    pub fn rate_burst() -> u32 {
        1
    }
    pub fn max_attempts() -> u32 {
        4
    }
    pub fn base_delay() -> u64 {
        500
    }
    pub fn multiplier() -> f64 {
        2.0
    }
    pub fn max_delay() -> u64 {
        30_000
    }
    pub fn jitter() -> bool {
        true
    }

    // Fetcher
    pub fn max_concurrent_batches() -> usize {
        2
    }
    pub fn merge_chunk_size() -> usize {
        5_000
    }

    // Normalizer
    pub fn max_trip_duration() -> i64 {
        7 * 24 * 60 * 60
    }
    pub fn duration_tolerance() -> i64 {
        300
    }

    // Poller
    pub fn feed_url() -> String {
        "https://vancouver-gbfs.smoove.pro/gbfs/2/en/station_status.json".into()
    }
    pub fn poll_interval() -> u64 {
        30
    }
    pub fn failure_threshold() -> u32 {
        3
    }
    pub fn degraded_multiplier() -> f64 {
        4.0
    }
    pub fn max_poll_interval() -> u64 {
        900
    }
    pub fn attempts_per_poll() -> u32 {
        1
    }

    // Crawler
    pub fn crawl_seeds() -> Vec<String> {
        vec!["https://www.mobibikes.ca/en".into()]
    }
    pub fn max_depth() -> usize {
        3
    }
    pub fn max_pages() -> usize {
        200
    }
    pub fn disallow() -> Vec<String> {
        vec![
            "^/api/".into(),
            "^/admin/".into(),
            "^/login".into(),
            "^/logout".into(),
            "^/register".into(),
        ]
    }
    pub fn skip_extensions() -> Vec<String> {
        [".pdf", ".jpg", ".jpeg", ".png", ".gif", ".css", ".js", ".xml"]
            .into_iter()
            .map(String::from)
            .collect()
    }
    pub fn respect_robots_txt() -> bool {
        true
    }

    // Discovery
    pub fn discovery_page() -> String {
        "https://www.mobibikes.ca/en/system-data".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_default_config_ok() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_user_agent() {
        let mut config = Config::default();
        config.governor.user_agent = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.governor.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_disallow_regex() {
        let mut config = Config::default();
        config.crawler.disallow.push("([".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_layout_table() {
        let mut config = Config::default();
        config.normalizer.layouts.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            [poller]
            interval_secs = 60

            [[governor.hosts]]
            host = "gbfs.example.test"
            requests = 1
            window_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.poller.interval_secs, 60);
        assert_eq!(config.poller.failure_threshold, 3);
        assert_eq!(config.governor.rate_for("GBFS.example.test").requests, 1);
        assert_eq!(config.governor.rate_for("GBFS.example.test").burst, 1);
        assert_eq!(config.governor.rate_for("other.test").requests, 2);
        assert!(!config.normalizer.layouts.is_empty());
    }

    #[test]
    fn degraded_interval_is_capped() {
        let poller = PollerConfig {
            interval_secs: 300,
            degraded_multiplier: 10.0,
            max_interval_secs: 900,
            ..PollerConfig::default()
        };
        assert_eq!(poller.degraded_interval(), Duration::from_secs(900));
    }
}
