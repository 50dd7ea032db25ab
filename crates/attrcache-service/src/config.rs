use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{de, Deserialize, Deserializer};
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
    /// The log level for attrcache.
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
            prefix: "attrcache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning of the source tier.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SourceCacheConfig {
    /// Sliding expiration of fetched source documents.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Option<Duration>,

    /// Maximum number of source documents kept in memory.
    pub capacity: u64,

    /// Maximum number of sources whose invalidation handles are remembered.
    ///
    /// A source that is forgotten can no longer be purged, but entries derived from it still
    /// expire when unused. This should not be smaller than the capacity of the derived tier.
    pub tracked_handles: u64,
}

impl Default for SourceCacheConfig {
    fn default() -> Self {
        Self {
            max_unused_for: Some(Duration::from_secs(60)),
            capacity: 1_000,
            tracked_handles: 100_000,
        }
    }
}

/// Fine-tuning of the derived tier.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DerivedCacheConfig {
    /// Sliding expiration of successfully computed attributes.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Option<Duration>,

    /// Sliding expiration of empty results caused by a failed fetch.
    #[serde(with = "humantime_serde")]
    pub retry_misses_after: Option<Duration>,

    /// Sliding expiration of empty results caused by a failed computation.
    #[serde(with = "humantime_serde")]
    pub retry_malformed_after: Option<Duration>,

    /// Maximum number of computed attribute sets kept in memory.
    pub capacity: u64,
}

impl Default for DerivedCacheConfig {
    fn default() -> Self {
        Self {
            max_unused_for: Some(Duration::from_secs(3600 * 24)),
            retry_misses_after: Some(Duration::from_secs(60 * 10)),
            retry_malformed_after: Some(Duration::from_secs(3600 * 24)),
            capacity: 100_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configure how long fetched sources are cached for.
    pub sources: SourceCacheConfig,
    /// Configure how long attributes derived from sources are cached for.
    pub derived: DerivedCacheConfig,
}

/// Where source documents are fetched from.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FetcherConfig {
    /// Fetches over HTTP. Every occurrence of `{id}` in `url` is replaced by the source id.
    Http { url: String },
    /// Reads `<path>/<id>` from the local file system.
    Filesystem { path: PathBuf },
}

impl Default for FetcherConfig {
    fn default() -> Self {
        FetcherConfig::Http {
            url: "http://127.0.0.1:8080/sources/{id}".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune cache expiry
    pub caches: CacheConfigs,

    /// The remote resource source documents are fetched from.
    pub source: FetcherConfig,

    /// The timeout for establishing a connection when fetching a source.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The maximum time a single source fetch may take.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,
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
        "0.0.0.0:3025".to_owned()
    } else {
        "127.0.0.1:3025".to_owned()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            source: FetcherConfig::default(),
            connect_timeout: Duration::from_secs(1),
            max_download_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
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

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config() {
        // It should be possible to set individual caches in reasonable units without
        // affecting other caches' default values.
        let yaml = r#"
            caches:
              derived:
                retry_misses_after: 1m
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(
            cfg.caches.derived.retry_misses_after,
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            cfg.caches.derived.max_unused_for,
            Some(Duration::from_secs(3600 * 24))
        );
        assert_eq!(cfg.caches.sources, SourceCacheConfig::default());
    }

    #[test]
    fn test_disabled_expiration() {
        let yaml = r#"
            caches:
              sources:
                max_unused_for: null
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.caches.sources.max_unused_for, None);
        assert_eq!(cfg.caches.sources.capacity, 1_000);
    }

    #[test]
    fn test_fetcher_config() {
        let yaml = r#"
            source:
              type: filesystem
              path: /srv/sources
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(
            cfg.source,
            FetcherConfig::Filesystem {
                path: PathBuf::from("/srv/sources")
            }
        );

        let yaml = r#"
            source:
              type: http
              url: "https://example.com/sources/{id}"
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(
            cfg.source,
            FetcherConfig::Http {
                url: "https://example.com/sources/{id}".into()
            }
        );
    }

    #[test]
    fn test_logging_and_timeouts() {
        let yaml = r#"
            logging:
              level: debug
              format: json
            connect_timeout: 500ms
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.connect_timeout, Duration::from_millis(500));
        assert_eq!(cfg.max_download_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_unknown_level() {
        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_empty_file() {
        // Empty files are not accepted, an absent file means defaults.
        assert!(Config::from_reader("\n  \n".as_bytes()).is_err());
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.metrics.prefix, "attrcache");
    }
}
