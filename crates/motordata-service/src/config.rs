use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer};
use tracing::level_filters::LevelFilter;
use url::Url;

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
    /// The log level for the service.
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
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: std::env::var("STATSD_SERVER").ok(),
            prefix: "motordata".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Retry behavior for upstream lookups.
///
/// Only transient failures (connection problems and server errors) are
/// retried; see [`fetch::retry`](crate::fetch::retry).
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: usize,
    /// Delay before the first retry; doubles on each subsequent retry.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Timeouts for upstream requests.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct FetchTimeouts {
    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
    /// The overall timeout for a single request, including the body.
    #[serde(with = "humantime_serde")]
    pub request: Duration,
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        FetchTimeouts {
            connect: Duration::from_secs(15),
            request: Duration::from_secs(30),
        }
    }
}

/// Where and how to reach the upstream vehicle-data APIs.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Base URL of the vehicle-data API (tech specs, repair times, analysis).
    pub base_url: Url,
    /// Base URL of the MOT defect manual API.
    pub manual_base_url: Url,
    /// Request timeouts.
    pub timeouts: FetchTimeouts,
    /// Retry behavior.
    pub retry: RetryConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            base_url: "http://localhost:8005/api/v1/"
                .parse()
                .expect("static url must parse"),
            manual_base_url: "http://localhost:8002/api/v1/"
                .parse()
                .expect("static url must parse"),
            timeouts: FetchTimeouts::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Expiry and versioning settings for one lookup domain's cache.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DomainCacheConfig {
    /// Time-to-live of entries in the in-memory tier.
    #[serde(with = "humantime_serde")]
    pub memory_ttl: Duration,
    /// Time-to-live of entries in the on-disk tier.
    #[serde(with = "humantime_serde")]
    pub persistent_ttl: Duration,
    /// Schema version tag written into every envelope.
    ///
    /// Bump this to invalidate all previously persisted entries after a
    /// payload format change.
    pub version: String,
    /// Maximum number of entries held in the in-memory tier.
    pub capacity: u64,
}

impl Default for DomainCacheConfig {
    fn default() -> Self {
        DomainCacheConfig {
            memory_ttl: Duration::from_secs(15 * 60),
            persistent_ttl: Duration::from_secs(24 * 3600),
            version: "v1".into(),
            capacity: 1024,
        }
    }
}

/// Cache configuration for all lookup domains.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfigs {
    pub tech_specs: DomainCacheConfig,
    pub repair_times: DomainCacheConfig,
    pub defect_manual: DomainCacheConfig,
    pub analysis: DomainCacheConfig,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        CacheConfigs {
            tech_specs: DomainCacheConfig::default(),
            repair_times: DomainCacheConfig::default(),
            defect_manual: DomainCacheConfig {
                memory_ttl: Duration::from_secs(3600),
                ..Default::default()
            },
            analysis: DomainCacheConfig {
                memory_ttl: Duration::from_secs(24 * 3600),
                ..Default::default()
            },
        }
    }
}

/// The service configuration, loadable from a YAML file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory to persist cached lookups in. If not set, only the
    /// in-memory tier is used.
    pub cache_dir: Option<PathBuf>,

    /// Maximum serialized size of a single persisted entry, in bytes.
    ///
    /// Larger entries are kept in memory only.
    pub max_entry_size: u64,

    /// Byte budget for each domain's on-disk cache directory.
    ///
    /// Writes that would exceed it trigger eviction of the oldest entries.
    pub max_cache_size: u64,

    /// Per-domain cache expiry and versioning.
    pub caches: CacheConfigs,

    /// Upstream API endpoints, timeouts and retries.
    pub fetch: FetchConfig,

    /// Logging configuration.
    pub logging: Logging,

    /// Metrics configuration.
    pub metrics: Metrics,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            max_entry_size: 512 * 1024,
            max_cache_size: 5 * 1024 * 1024,
            caches: CacheConfigs::default(),
            fetch: FetchConfig::default(),
            logging: Logging::default(),
            metrics: Metrics::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let file = fs::File::open(path)
                    .context(format!("failed to open file {}", path.display()))?;
                serde_yaml::from_reader(file)
                    .context(format!("failed to parse YAML from {}", path.display()))?
            }
            None => Config::default(),
        };
        Ok(config)
    }

    /// Returns the subdirectory inside the cache directory for the given path.
    pub fn cache_dir<P: AsRef<Path>>(&self, path: P) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join(path))
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct V;

    impl de::Visitor<'_> for V {
        type Value = LevelFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a log level")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            v.parse().map_err(de::Error::custom)
        }
    }

    deserializer.deserialize_str(V)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.cache_dir.is_none());
        assert_eq!(config.fetch.retry.max_attempts, 3);
        assert_eq!(config.caches.tech_specs.memory_ttl, Duration::from_secs(900));
        assert_eq!(
            config.caches.defect_manual.memory_ttl,
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
            cache_dir: /tmp/motordata
            max_cache_size: 1048576
            caches:
              tech_specs:
                memory_ttl: 5m
                version: v2
            fetch:
              retry:
                max_attempts: 1
                base_delay: 20ms
            logging:
              level: debug
        "#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/motordata")));
        assert_eq!(config.max_cache_size, 1024 * 1024);
        assert_eq!(config.caches.tech_specs.memory_ttl, Duration::from_secs(300));
        assert_eq!(config.caches.tech_specs.version, "v2");
        // unspecified domains keep their defaults
        assert_eq!(config.caches.repair_times.version, "v1");
        assert_eq!(config.fetch.retry.max_attempts, 1);
        assert_eq!(config.fetch.retry.base_delay, Duration::from_millis(20));
        assert_eq!(config.logging.level, LevelFilter::DEBUG);
    }
}
