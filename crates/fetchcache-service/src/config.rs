use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

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
    /// The log level for fetchcache.
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
            prefix: "fetchcache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Bounds of the in-memory cache tier.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct InMemoryCacheConfig {
    /// Maximum number of entries kept in memory.
    ///
    /// Defaults to `100`.
    pub count_limit: u64,

    /// Maximum summed payload size (in bytes) kept in memory.
    ///
    /// Defaults to `50 MiB (= 52_428_800)`.
    pub cost_limit: u64,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            count_limit: 100,
            cost_limit: 50 * 1024 * 1024,
        }
    }
}

/// Bounds and expiry of the file-system cache tier.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Maximum total size (in bytes) of all cache files.
    ///
    /// A maintenance pass that finds the cache above this limit evicts the oldest files until
    /// the cache is at 80% of the limit.
    ///
    /// Defaults to `500 MiB (= 524_288_000)`.
    pub size_limit: u64,

    /// Time after which a stored entry is considered expired, in both cache tiers.
    ///
    /// Defaults to `7d`.
    #[serde(with = "humantime_serde")]
    pub entry_lifetime: Duration,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            size_limit: 500 * 1024 * 1024,
            entry_lifetime: Duration::from_secs(3600 * 24 * 7),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configure the in-memory cache tier.
    pub in_memory: InMemoryCacheConfig,
    /// Configure the file-system cache tier.
    pub disk: DiskCacheConfig,
}

/// Timeouts, retries and concurrency of transport fetches.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    /// The timeout of a single transport attempt.
    ///
    /// An attempt running into this timeout counts as a transient failure and is retried.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// The timeout for establishing a connection, used by the HTTP transport.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The maximum number of attempts of one logical fetch, including the first one.
    pub max_retry_attempts: u32,

    /// The delay before the first retry, doubled for every further retry.
    #[serde(with = "humantime_serde")]
    pub base_retry_delay: Duration,

    /// Adds up to 25% random jitter to retry delays.
    pub retry_jitter: bool,

    /// The maximum number of transport attempts running at the same time.
    pub max_concurrent_fetches: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_retry_attempts: 3,
            base_retry_delay: Duration::from_secs(1),
            retry_jitter: false,
            max_concurrent_fetches: 6,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use when caching. Default is not to cache on disk.
    pub cache_dir: Option<PathBuf>,

    /// Logging configuration.
    pub logging: Logging,

    /// Metrics configuration.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<String>,

    /// Fine-tune cache bounds and expiry.
    pub caches: CacheConfigs,

    /// Fine-tune transport fetches.
    pub fetch: FetchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            fetch: FetchConfig::default(),
        }
    }
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    ///
    /// If there is no base cache directory configured this means no caching should happen
    /// and this returns None.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }

    /// Loads the configuration from the given YAML file, or returns the defaults.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
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
