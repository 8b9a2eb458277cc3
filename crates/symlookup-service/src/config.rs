use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use symlookup_sources::SourceConfig;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "symlookup".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Expiry and coordination settings of the shared symbol cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a "not found" result is kept before the sources are asked again.
    #[serde(with = "humantime_serde")]
    pub retry_misses_after: Duration,
    /// How long a transient download failure is kept before the sources are asked again.
    #[serde(with = "humantime_serde")]
    pub retry_failed_after: Duration,
    /// How long a symbol file that failed to convert is kept before it is downloaded again.
    #[serde(with = "humantime_serde")]
    pub retry_malformed_after: Duration,
    /// Maximum age of a pending entry.
    ///
    /// After this, the worker that created it is considered dead and another worker may take
    /// over the computation.
    #[serde(with = "humantime_serde")]
    pub max_pending_age: Duration,
    /// How often a worker checks on an entry that another process is computing.
    #[serde(with = "humantime_serde")]
    pub pending_poll_interval: Duration,
    /// Number of lookup tables kept loaded in memory per worker.
    pub in_memory_capacity: u64,
    /// How long a loaded lookup table is kept in memory per worker.
    #[serde(with = "humantime_serde")]
    pub in_memory_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retry_misses_after: Duration::from_secs(3600),
            retry_failed_after: Duration::from_secs(5 * 60),
            retry_malformed_after: Duration::from_secs(3600 * 24),
            max_pending_age: Duration::from_secs(10 * 60),
            pending_poll_interval: Duration::from_millis(250),
            in_memory_capacity: 1000,
            in_memory_ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Settings of the eviction process.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct EvictionConfig {
    /// Upper bound for the total size of all converted symbol files, in bytes.
    pub max_cache_size: u64,
    /// Time between two eviction cycles.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Minimum age of temporary and unreferenced files before they are swept.
    #[serde(with = "humantime_serde")]
    pub orphan_grace_period: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 40 * 1024 * 1024 * 1024,
            interval: Duration::from_secs(60),
            orphan_grace_period: Duration::from_secs(3600),
        }
    }
}

/// See the README for more information on config values.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use for the shared symbol cache.
    pub cache_dir: Option<PathBuf>,
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,
    /// Configuration for internal logging.
    pub logging: Logging,
    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,
    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
    /// Fine-tune cache expiry.
    pub caches: CacheConfig,
    /// Configuration of the eviction process.
    pub eviction: EvictionConfig,
    /// Ordered list of symbol sources.
    pub sources: Arc<[SourceConfig]>,
    /// The maximum timeout for a single download attempt.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,
    /// The timeout for establishing a connection in a download.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// The timeout until the response headers of a download have been received.
    #[serde(with = "humantime_serde")]
    pub head_timeout: Duration,
    /// Number of attempts per candidate file before moving to the next source.
    pub fetch_retries: u32,
    /// Base delay between two attempts. It doubles with every retry.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// The maximum number of requests that are processed concurrently.
    ///
    /// A value of `None` indicates no limit.
    pub max_concurrent_requests: Option<usize>,
}

/// Checks if we are running in docker.
fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup")
        .map(|s| s.contains("/docker"))
        .unwrap_or(false)
}

/// Default value for the "bind" configuration.
fn default_bind() -> String {
    if is_docker() {
        // Docker images rely on this service being exposed
        "0.0.0.0:3021".to_owned()
    } else {
        "127.0.0.1:3021".to_owned()
    }
}

/// Default value for the "cache_dir" configuration.
fn default_cache_dir() -> Option<PathBuf> {
    if is_docker() {
        Some(PathBuf::from("/data"))
    } else {
        None
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: default_cache_dir(),
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfig::default(),
            eviction: EvictionConfig::default(),
            sources: Arc::from(vec![]),
            max_download_timeout: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(1),
            head_timeout: Duration::from_secs(5),
            fetch_retries: 3,
            retry_backoff: Duration::from_millis(100),
            max_concurrent_requests: Some(200),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            )?,
            None => Config::default(),
        };
        config.apply_overrides(|name| env::var(name).ok())?;
        Ok(config)
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;

        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }

        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// Applies `SYMLOOKUP_*` overrides on top of the file configuration.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("SYMLOOKUP_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(size) = lookup("SYMLOOKUP_MAX_CACHE_SIZE") {
            self.eviction.max_cache_size = size
                .trim()
                .parse()
                .context("invalid SYMLOOKUP_MAX_CACHE_SIZE")?;
        }
        Ok(())
    }

    /// Returns the configured cache directory, or an error if there is none.
    pub fn require_cache_dir(&self) -> Result<&Path> {
        self.cache_dir
            .as_deref()
            .context("`cache_dir` needs to be configured")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
