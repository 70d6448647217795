use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tributary_log::LogConfig;
use tributary_metrics::HistogramAggregate;

use crate::{ListenAddr, NameMatcher, TagMatcher};

/// The default flush interval.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// The default worker pool size.
pub const DEFAULT_NUM_WORKERS: usize = 96;

/// The default bound of a worker's inbound channel.
pub const DEFAULT_WORKER_QUEUE_SIZE: usize = 32_768;

/// Indicates config related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("could not read config file")]
    Io(#[from] std::io::Error),

    /// The config is not valid YAML or has mistyped values.
    #[error("could not parse YAML config")]
    Yaml(#[from] serde_yaml::Error),

    /// The config contains unknown keys.
    ///
    /// This error is recoverable: it carries the parsed configuration, so
    /// callers can warn and continue unless strict validation is requested.
    #[error("unknown config keys: {}", keys.join(", "))]
    UnknownKeys {
        /// The configuration parsed from the known keys.
        config: Box<Config>,
        /// The offending key paths.
        keys: Vec<String>,
    },

    /// A config value is out of range.
    #[error("invalid value for `{field}`: {message}")]
    InvalidValue {
        /// The offending field.
        field: &'static str,
        /// Why the value is invalid.
        message: String,
    },
}

/// Feature toggles.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Features {
    /// Enables rule-based sink routing. When disabled, every sink receives
    /// every metric.
    pub enable_metric_sink_routing: bool,
}

/// Configuration of one metric or span sink.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// The sink implementation to instantiate.
    pub kind: String,
    /// The sink's name for routing and telemetry. Defaults to the kind.
    pub name: String,
    /// Drop metrics whose name exceeds this length. Zero disables the check.
    pub max_name_length: usize,
    /// Drop metrics with more than this many tags after stripping. Zero
    /// disables the check.
    pub max_tags: usize,
    /// Drop metrics with any tag longer than this. Zero disables the check.
    pub max_tag_length: usize,
    /// Tags matching any of these matchers are removed before the length and
    /// count checks.
    pub strip_tags: Vec<TagMatcher>,
    /// Kind-specific settings, passed to the sink factory.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl SinkConfig {
    /// The sink's display name: the configured name, or the kind.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.kind
        } else {
            &self.name
        }
    }
}

/// Configuration of one source.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// The source implementation to instantiate.
    pub kind: String,
    /// The source's name for telemetry. Defaults to the kind.
    pub name: String,
    /// Kind-specific settings, passed to the source factory.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// One name-and-tags condition of a routing rule.
#[derive(Clone, Debug, Deserialize)]
pub struct RoutingMatcher {
    /// Matches the metric name.
    pub name: NameMatcher,
    /// Every tag matcher must match some tag on the metric.
    #[serde(default)]
    pub tags: Vec<TagMatcher>,
}

/// The sinks a routing rule contributes.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SinkRoutingSinks {
    /// Sinks receiving metrics the rule matches.
    pub matched: Vec<String>,
    /// Sinks receiving metrics the rule does not match.
    pub not_matched: Vec<String>,
}

/// One sink routing rule.
///
/// A rule matches a metric iff any of its matchers does; a matcher requires
/// its name matcher and all of its tag matchers to match. Sinks contributed
/// by all rules are unioned.
#[derive(Clone, Debug, Deserialize)]
pub struct SinkRoutingConfig {
    /// The rule's name, for diagnostics.
    pub name: String,
    /// The rule's conditions.
    #[serde(rename = "match")]
    pub matchers: Vec<RoutingMatcher>,
    /// The contributed sinks.
    pub sinks: SinkRoutingSinks,
}

/// The top-level YAML configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This instance's hostname. When empty, the OS hostname is used unless
    /// [`omit_empty_hostname`](Self::omit_empty_hostname) is set.
    pub hostname: String,

    /// Keeps an empty hostname empty instead of defaulting to the OS
    /// hostname.
    pub omit_empty_hostname: bool,

    /// The flush interval, e.g. `10s`.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// The number of aggregation workers. Must be at least 1.
    pub num_workers: usize,

    /// The bound of each worker's inbound channel. When a worker's channel
    /// is full, ingest observes backpressure and drops.
    pub worker_queue_size: usize,

    /// Percentiles emitted for histograms and timers, in `[0, 1]`.
    pub percentiles: Vec<f64>,

    /// Aggregates emitted for histograms and timers.
    pub aggregates: Vec<HistogramAggregate>,

    /// Flush counters as per-second rates instead of raw sums.
    pub flush_counters_as_rate: bool,

    /// Address of the global instance partial aggregates are forwarded to.
    /// Empty disables forwarding.
    pub forward_address: String,

    /// Address this instance listens on for forwarded partials, making it a
    /// global instance. Empty disables the listener.
    pub forward_listen_address: String,

    /// Track an estimate of unique timeseries per worker per interval.
    pub count_unique_timeseries: bool,

    /// Abort the process after this many consecutive intervals without a
    /// completed flush. Zero disables the watchdog.
    pub flush_watchdog_missed_flushes: usize,

    /// Ingest listener addresses for the statsd source.
    pub statsd_listen_addresses: Vec<ListenAddr>,

    /// Statsd address for the service's own telemetry.
    pub stats_address: String,

    /// The metric sinks to instantiate.
    pub metric_sinks: Vec<SinkConfig>,

    /// The span sinks to instantiate.
    pub span_sinks: Vec<SinkConfig>,

    /// The sources to instantiate.
    pub sources: Vec<SourceConfig>,

    /// Sink routing rules, evaluated when
    /// [`Features::enable_metric_sink_routing`] is set.
    pub metric_sink_routing: Vec<SinkRoutingConfig>,

    /// Feature toggles.
    pub features: Features,

    /// Logging configuration.
    pub logging: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            omit_empty_hostname: false,
            interval: DEFAULT_FLUSH_INTERVAL,
            num_workers: DEFAULT_NUM_WORKERS,
            worker_queue_size: DEFAULT_WORKER_QUEUE_SIZE,
            percentiles: vec![0.5, 0.9, 0.99],
            aggregates: vec![
                HistogramAggregate::Min,
                HistogramAggregate::Max,
                HistogramAggregate::Count,
            ],
            flush_counters_as_rate: false,
            forward_address: String::new(),
            forward_listen_address: String::new(),
            count_unique_timeseries: false,
            flush_watchdog_missed_flushes: 0,
            statsd_listen_addresses: Vec::new(),
            stats_address: "localhost:8125".to_owned(),
            metric_sinks: Vec::new(),
            span_sinks: Vec::new(),
            sources: Vec::new(),
            metric_sink_routing: Vec::new(),
            features: Features::default(),
            logging: LogConfig::default(),
        }
    }
}

impl Config {
    /// Parses a YAML document.
    ///
    /// Unknown keys yield [`ConfigError::UnknownKeys`] carrying the parsed
    /// configuration; all other errors are fatal.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "---" {
            let mut config = Self::default();
            config.apply_defaults()?;
            return Ok(config);
        }

        let mut unknown = Vec::new();
        let deserializer = serde_yaml::Deserializer::from_str(raw);
        let mut config: Config = serde_ignored::deserialize(deserializer, |path| {
            unknown.push(path.to_string());
        })?;

        config.apply_defaults()?;

        if !unknown.is_empty() {
            return Err(ConfigError::UnknownKeys {
                config: Box::new(config),
                keys: unknown,
            });
        }

        Ok(config)
    }

    /// Reads and parses a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    fn apply_defaults(&mut self) -> Result<(), ConfigError> {
        if self.num_workers < 1 {
            return Err(ConfigError::InvalidValue {
                field: "num_workers",
                message: "must be at least 1".to_owned(),
            });
        }

        if self.worker_queue_size < 1 {
            return Err(ConfigError::InvalidValue {
                field: "worker_queue_size",
                message: "must be at least 1".to_owned(),
            });
        }

        if self.interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "interval",
                message: "must be positive".to_owned(),
            });
        }

        for &percentile in &self.percentiles {
            if !(0.0..=1.0).contains(&percentile) {
                return Err(ConfigError::InvalidValue {
                    field: "percentiles",
                    message: format!("{percentile} is outside [0, 1]"),
                });
            }
        }

        if self.hostname.is_empty() && !self.omit_empty_hostname {
            self.hostname = hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_applies_defaults() {
        for raw in ["", "---"] {
            let config = Config::parse(raw).unwrap();
            assert_eq!(config.num_workers, 96);
            assert_eq!(config.interval, Duration::from_secs(10));
            assert_eq!(config.worker_queue_size, DEFAULT_WORKER_QUEUE_SIZE);
            assert_eq!(config.percentiles, vec![0.5, 0.9, 0.99]);
            assert!(!config.hostname.is_empty());
        }
    }

    #[test]
    fn parses_interval_and_workers() {
        let config = Config::parse("interval: 30s\nnum_workers: 4").unwrap();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.num_workers, 4);
    }

    #[test]
    fn unknown_keys_still_yield_config() {
        let error = Config::parse("no_such_key: 1\nhostname: foobar").unwrap_err();
        match error {
            ConfigError::UnknownKeys { config, keys } => {
                assert_eq!(config.hostname, "foobar");
                assert_eq!(keys, vec!["no_such_key".to_owned()]);
            }
            other => panic!("expected UnknownKeys, got {other:?}"),
        }
    }

    #[test]
    fn bad_yaml_is_fatal() {
        assert!(matches!(
            Config::parse("hostname: [oops"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn hostname_defaults() {
        let config = Config::parse("hostname: foo").unwrap();
        assert_eq!(config.hostname, "foo");

        let config = Config::parse("hostname: ''").unwrap();
        let current = hostname::get().unwrap().to_string_lossy().into_owned();
        assert_eq!(config.hostname, current);

        let config = Config::parse("omit_empty_hostname: true").unwrap();
        assert_eq!(config.hostname, "");
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            Config::parse("num_workers: 0"),
            Err(ConfigError::InvalidValue {
                field: "num_workers",
                ..
            })
        ));
        assert!(matches!(
            Config::parse("percentiles: [1.5]"),
            Err(ConfigError::InvalidValue {
                field: "percentiles",
                ..
            })
        ));
        assert!(matches!(
            Config::parse("interval: 0s"),
            Err(ConfigError::InvalidValue { field: "interval", .. })
        ));
    }

    #[test]
    fn parses_listen_addresses() {
        let config = Config::parse(
            "statsd_listen_addresses:\n  - udp://127.0.0.1:8126\n  - tcp://127.0.0.1:8127",
        )
        .unwrap();

        assert_eq!(
            config.statsd_listen_addresses,
            vec![
                ListenAddr::Udp("127.0.0.1:8126".to_owned()),
                ListenAddr::Tcp("127.0.0.1:8127".to_owned()),
            ]
        );
    }

    #[test]
    fn parses_sinks_and_routing() {
        let raw = r#"
features:
  enable_metric_sink_routing: true
metric_sinks:
  - kind: channel
    name: channel
    max_name_length: 11
    max_tag_length: 11
    max_tags: 2
    strip_tags:
      - kind: prefix
        value: foo
metric_sink_routing:
  - name: default
    match:
      - name:
          kind: any
    sinks:
      matched: [channel]
"#;

        let config = Config::parse(raw).unwrap();
        assert!(config.features.enable_metric_sink_routing);

        let sink = &config.metric_sinks[0];
        assert_eq!(sink.display_name(), "channel");
        assert_eq!(sink.max_name_length, 11);
        assert_eq!(sink.max_tags, 2);
        assert_eq!(sink.max_tag_length, 11);
        assert!(sink.strip_tags[0].matches("foo:value1"));

        let rule = &config.metric_sink_routing[0];
        assert_eq!(rule.name, "default");
        assert!(rule.matchers[0].name.matches("anything"));
        assert_eq!(rule.sinks.matched, vec!["channel".to_owned()]);
        assert!(rule.sinks.not_matched.is_empty());
    }

    #[test]
    fn sink_extra_keys_are_kept_for_factories() {
        let config = Config::parse(
            "metric_sinks:\n  - kind: debug\n    flush_to: stderr",
        )
        .unwrap();
        let sink = &config.metric_sinks[0];
        assert_eq!(sink.display_name(), "debug");
        assert!(sink.extra.contains_key("flush_to"));
    }

    #[test]
    fn example_config_parses() {
        let raw = std::fs::read_to_string(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../example.yaml"
        ))
        .unwrap();

        let config = Config::parse(&raw).unwrap();
        assert_eq!(config.num_workers, 96);
        assert_eq!(config.sources[0].kind, "statsd");
    }

    #[test]
    fn aggregates_parse_from_names() {
        let config = Config::parse("aggregates: [min, median]").unwrap();
        assert_eq!(
            config.aggregates,
            vec![HistogramAggregate::Min, HistogramAggregate::Median]
        );
    }
}
