//! Configuration file parser for `jobfeed.toml`.
//!
//! The config file is optional: a missing or empty file yields
//! `Config::default()`. Unknown keys are ignored by serde but logged as a
//! warning, since they are usually typos. A handful of environment variables
//! override the file for container deployments.
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::events::EventBroadcaster;
use crate::feed::FetchLimits;
use crate::import::ImportSettings;
use crate::maintenance::SweepSettings;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// A value parsed but is out of range or malformed
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Feeds imported when the config lists none.
pub const DEFAULT_FEEDS: &[&str] = &[
    "https://jobicy.com/?feed=job_feed",
    "https://jobicy.com/?feed=job_feed&job_categories=smm&job_types=full-time",
    "https://jobicy.com/?feed=job_feed&job_categories=seller&job_types=full-time&search_region=france",
    "https://jobicy.com/?feed=job_feed&job_categories=design-multimedia",
    "https://jobicy.com/?feed=job_feed&job_categories=data-science",
    "https://jobicy.com/?feed=job_feed&job_categories=copywriting",
    "https://jobicy.com/?feed=job_feed&job_categories=business",
    "https://jobicy.com/?feed=job_feed&job_categories=management",
    "https://www.higheredjobs.com/rss/articleFeed.cfm",
];

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file, or `:memory:`.
    pub database_path: String,
    /// Feed URLs imported by every run.
    pub feeds: Vec<String>,
    pub queue: QueueConfig,
    pub fetch: FetchConfig,
    pub schedule: ScheduleConfig,
    pub ledger: LedgerConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Worker pool size.
    pub concurrency: usize,
    /// Postings per enqueue batch.
    pub batch_size: usize,
    /// Idle worker poll period.
    pub poll_interval_ms: u64,
    /// How long a completed queue key keeps deduplicating.
    pub retention_minutes: u64,
    /// How long a claimed item may stay active before another pool or the
    /// sweep returns it to pending.
    pub claim_timeout_minutes: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_feed_bytes: usize,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Minutes between scheduled imports. 0 = on demand only.
    pub import_interval_minutes: u64,
    pub sweep_interval_minutes: u64,
    /// Open runs older than this are closed by the sweep.
    pub stale_run_minutes: u64,
    pub run_on_startup: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Failures kept per run; oldest are evicted first.
    pub max_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub enabled: bool,
    /// Frames buffered per subscriber before it is disconnected.
    pub buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "jobfeed.db".to_string(),
            feeds: DEFAULT_FEEDS.iter().map(|s| s.to_string()).collect(),
            queue: QueueConfig::default(),
            fetch: FetchConfig::default(),
            schedule: ScheduleConfig::default(),
            ledger: LedgerConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            batch_size: 50,
            poll_interval_ms: 1000,
            retention_minutes: 30,
            claim_timeout_minutes: 10,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_feed_bytes: 10 * 1024 * 1024,
            user_agent: concat!("jobfeed/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            import_interval_minutes: 60,
            sweep_interval_minutes: 30,
            stale_run_minutes: 120,
            run_on_startup: false,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { max_failures: 100 }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer: 64,
        }
    }
}

const KNOWN_SECTIONS: &[(&str, &[&str])] = &[
    (
        "queue",
        &[
            "concurrency",
            "batch_size",
            "poll_interval_ms",
            "retention_minutes",
            "claim_timeout_minutes",
        ],
    ),
    ("fetch", &["timeout_secs", "max_feed_bytes", "user_agent"]),
    (
        "schedule",
        &[
            "import_interval_minutes",
            "sweep_interval_minutes",
            "stale_run_minutes",
            "run_on_startup",
        ],
    ),
    ("ledger", &["max_failures"]),
    ("events", &["enabled", "buffer"]),
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    ///
    /// The result is not yet validated; see [`Config::validate`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to bound memory use
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            feeds = config.feeds.len(),
            database = %config.database_path,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Apply `JOBFEED_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source. Unset variables are skipped.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("JOBFEED_DATABASE") {
            self.database_path = path;
        }
        if let Some(value) = lookup("JOBFEED_QUEUE_CONCURRENCY") {
            self.queue.concurrency = parse_env("JOBFEED_QUEUE_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("JOBFEED_IMPORT_BATCH_SIZE") {
            self.queue.batch_size = parse_env("JOBFEED_IMPORT_BATCH_SIZE", &value)?;
        }
        if let Some(value) = lookup("JOBFEED_ENABLE_EVENTS") {
            self.events.enabled = parse_env("JOBFEED_ENABLE_EVENTS", &value)?;
        }
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("queue.concurrency", self.queue.concurrency as u64),
            ("queue.batch_size", self.queue.batch_size as u64),
            ("queue.poll_interval_ms", self.queue.poll_interval_ms),
            ("queue.claim_timeout_minutes", self.queue.claim_timeout_minutes),
            ("fetch.timeout_secs", self.fetch.timeout_secs),
            ("fetch.max_feed_bytes", self.fetch.max_feed_bytes as u64),
            ("schedule.sweep_interval_minutes", self.schedule.sweep_interval_minutes),
            ("schedule.stale_run_minutes", self.schedule.stale_run_minutes),
            ("ledger.max_failures", self.ledger.max_failures as u64),
            ("events.buffer", self.events.buffer as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be at least 1")));
            }
        }

        if self.database_path.trim().is_empty() {
            return Err(ConfigError::Invalid("database_path is empty".to_string()));
        }

        for feed in &self.feeds {
            validate_feed_url(feed)?;
        }
        Ok(())
    }

    // ========================================================================
    // Derived Settings
    // ========================================================================

    pub fn import_settings(&self) -> ImportSettings {
        ImportSettings {
            batch_size: self.queue.batch_size,
            fetch: FetchLimits {
                timeout: Duration::from_secs(self.fetch.timeout_secs),
                max_bytes: self.fetch.max_feed_bytes,
            },
            queue_retention: self.queue_retention(),
        }
    }

    pub fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            interval: minutes(self.schedule.sweep_interval_minutes),
            stale_after: minutes(self.schedule.stale_run_minutes),
            queue_retention: self.queue_retention(),
        }
    }

    pub fn claim_timeout(&self) -> Duration {
        minutes(self.queue.claim_timeout_minutes)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue.poll_interval_ms)
    }

    /// `None` when scheduled imports are disabled.
    pub fn import_interval(&self) -> Option<Duration> {
        match self.schedule.import_interval_minutes {
            0 => None,
            n => Some(minutes(n)),
        }
    }

    pub fn event_broadcaster(&self) -> EventBroadcaster {
        if self.events.enabled {
            EventBroadcaster::new(self.events.buffer)
        } else {
            EventBroadcaster::disabled()
        }
    }

    fn queue_retention(&self) -> Duration {
        minutes(self.queue.retention_minutes)
    }
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(60))
}

fn warn_unknown_keys(raw: &toml::Table) {
    for (key, value) in raw {
        if key == "database_path" || key == "feeds" {
            continue;
        }
        let Some((_, fields)) = KNOWN_SECTIONS.iter().find(|(name, _)| *name == key.as_str()) else {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            continue;
        };
        if let Some(table) = value.as_table() {
            for field in table.keys() {
                if !fields.contains(&field.as_str()) {
                    tracing::warn!(key = %format!("{key}.{field}"), "Unknown key in config file, ignoring");
                }
            }
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{name}={value:?} is not a valid value")))
}

fn validate_feed_url(feed: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(feed)
        .map_err(|e| ConfigError::Invalid(format!("feed URL {feed:?}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ConfigError::Invalid(format!(
            "feed URL {feed:?}: unsupported scheme {scheme:?}"
        ))),
    }
}

// ============================================================================
// Tests
// ============================================================================
