use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
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
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "smartcache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Refresh and eviction timing of a single cache instance.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct InstanceConfig {
    /// Age after which a loaded value is refreshed in the background.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Additional age past `refresh_interval` after which an unused key is evicted.
    #[serde(with = "humantime_serde")]
    pub clear_interval: Duration,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5 * 60),
            clear_interval: Duration::from_secs(3600),
        }
    }
}

/// Configuration of a [`CacheRegistry`](crate::caching::CacheRegistry).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of concurrently running background refreshes, across all instances.
    ///
    /// Unset by default, which means every stale lookup starts a refresh for its key. When the
    /// limit is reached, stale values are served without a refresh. Values below `1` are
    /// treated as `1`.
    pub max_lazy_refreshes: Option<isize>,

    /// Intervals of instances that are not listed in `instances`.
    pub defaults: InstanceConfig,

    /// Intervals of individual instances, by name.
    pub instances: BTreeMap<String, InstanceConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_lazy_refreshes: None,
            defaults: InstanceConfig::default(),
            instances: BTreeMap::new(),
        }
    }
}

impl CacheConfig {
    /// The intervals configured for the instance called `name`.
    pub fn intervals_for(&self, name: &str) -> InstanceConfig {
        self.instances.get(name).copied().unwrap_or(self.defaults)
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// Fine-tune cache refreshes and expiry
    pub caches: CacheConfig,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.caches, CacheConfig::default());
        assert_eq!(cfg.caches.max_lazy_refreshes, None);
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
        assert_eq!(cfg.metrics.prefix, "smartcache");
    }

    #[test]
    fn test_cache_config() {
        // It should be possible to set individual instances in reasonable units without
        // affecting the defaults of others.
        let yaml = r#"
            caches:
              max_lazy_refreshes: 5
              instances:
                users:
                  refresh_interval: 30s
                  clear_interval: 10m
                sessions:
                  refresh_interval: 100ms
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        let caches = &cfg.caches;
        assert_eq!(caches.max_lazy_refreshes, Some(5));
        assert_eq!(caches.defaults, InstanceConfig::default());

        assert_eq!(
            caches.intervals_for("users"),
            InstanceConfig {
                refresh_interval: Duration::from_secs(30),
                clear_interval: Duration::from_secs(600),
            }
        );
        assert_eq!(
            caches.intervals_for("sessions"),
            InstanceConfig {
                refresh_interval: Duration::from_millis(100),
                clear_interval: Duration::from_secs(3600),
            }
        );
        assert_eq!(caches.intervals_for("unknown"), InstanceConfig::default());
    }

    #[test]
    fn test_defaults_section() {
        let yaml = r#"
            caches:
              defaults:
                refresh_interval: 1m
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(
            cfg.caches.intervals_for("anything").refresh_interval,
            Duration::from_secs(60)
        );
        assert_eq!(
            cfg.caches.intervals_for("anything").clear_interval,
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_logging_config() {
        let yaml = r#"
            logging:
              level: trace
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::TRACE);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.logging.enable_backtraces);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_empty_config() {
        assert!(Config::from_reader("   \n".as_bytes()).is_err());
    }

    #[test]
    fn test_config_from_file() {
        let dir = smartcache_test::tempdir();
        let path = dir.path().join("config.yml");
        fs::write(&path, "metrics:\n  prefix: myapp\n").unwrap();

        let cfg = Config::get(Some(&path)).unwrap();
        assert_eq!(cfg.metrics.prefix, "myapp");

        assert!(Config::get(Some(Path::new("/does/not/exist.yml"))).is_err());
    }
}
