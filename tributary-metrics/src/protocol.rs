use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hasher;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

/// Tag marking a sample for aggregation at the global tier only.
pub const GLOBAL_ONLY_TAG: &str = "tributaryglobalonly";

/// Tag marking a sample for aggregation on this instance only.
pub const LOCAL_ONLY_TAG: &str = "tributarylocalonly";

/// Tag prefix restricting a finalized metric to a named sink.
pub const SINK_ONLY_TAG_PREFIX: &str = "sinkonly:";

/// The kind of an ingested metric sample.
///
/// The kind is part of a timeseries' identity: reusing a metric name with a
/// different kind produces a distinct timeseries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// A monotonic count of events, summed within the flush interval.
    Counter,
    /// A point-in-time value, last write wins.
    Gauge,
    /// A distribution of values aggregated into a rank sketch.
    Histogram,
    /// A [`Histogram`](Self::Histogram) with seconds semantics.
    Timer,
    /// A count of unique string members, aggregated into a cardinality sketch.
    Set,
    /// A service health report, aggregated like a gauge.
    StatusCheck,
    /// A discrete occurrence. Events are not aggregatable.
    Event,
}

impl MetricKind {
    /// Returns the canonical name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Timer => "timer",
            Self::Set => "set",
            Self::StatusCheck => "status_check",
            Self::Event => "event",
        }
    }

    /// Returns `true` for kinds aggregated into a mergeable rank sketch.
    ///
    /// These are the kinds for which a mixed-scope sample is both finalized
    /// locally and forwarded to the global tier.
    pub fn is_rank_sketch(&self) -> bool {
        matches!(self, Self::Histogram | Self::Timer)
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tier of a local/global topology finalizes a sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MetricScope {
    /// Aggregated to completion by this instance, never forwarded.
    Local,
    /// Finalized locally; rank-sketch kinds additionally forward partial
    /// state for a cluster-wide view.
    #[default]
    Mixed,
    /// Partial state is forwarded to the global tier; nothing is finalized
    /// on this instance when forwarding is configured.
    Global,
}

/// The observed value of a [`Sample`].
#[derive(Clone, Debug, PartialEq)]
pub enum MetricValue {
    /// Numeric observation for counters, gauges, histograms and timers.
    Double(f64),
    /// Arbitrary set member for set metrics.
    Text(String),
}

/// Aggregates that can be computed from a histogram sketch at flush time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistogramAggregate {
    /// The smallest observed value.
    Min,
    /// The largest observed value.
    Max,
    /// The sum of all observed values.
    Sum,
    /// The arithmetic mean of all observed values.
    Avg,
    /// The number of observed values.
    Count,
    /// The 50th percentile.
    Median,
}

impl HistogramAggregate {
    /// Returns the suffix appended to the metric name for this aggregate.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Count => "count",
            Self::Median => "median",
        }
    }
}

/// Computes the stable identity digest of a timeseries.
///
/// The digest depends on exactly the metric name, kind and canonical
/// (sorted, comma-joined) tags. It uses FNV-1a without per-process seeding,
/// so the same timeseries shards to the same worker index across restarts
/// and across processes.
pub fn compute_digest(name: &str, kind: MetricKind, joined_tags: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(name.as_bytes());
    hasher.write(kind.as_str().as_bytes());
    hasher.write(joined_tags.as_bytes());
    hasher.finish()
}

/// One ingested observation.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// The metric name. Must be non-empty.
    pub name: String,
    /// The metric kind.
    pub kind: MetricKind,
    /// Tags in `k:v` form, sorted and deduplicated.
    pub tags: Vec<String>,
    /// Canonical comma-joined form of [`tags`](Self::tags), used for digesting.
    pub joined_tags: String,
    /// The observed value.
    pub value: MetricValue,
    /// The client-side sample rate in `(0, 1]`. Counters and histograms
    /// scale by its reciprocal.
    pub sample_rate: f32,
    /// Stable identity of `(name, kind, tags)`.
    pub digest: u64,
    /// Which tier finalizes this sample.
    pub scope: MetricScope,
}

impl Sample {
    /// Creates a sample with canonicalized tags and a computed digest.
    pub fn new(
        name: impl Into<String>,
        kind: MetricKind,
        mut tags: Vec<String>,
        value: MetricValue,
    ) -> Self {
        let name = name.into();
        tags.sort_unstable();
        tags.dedup();
        let joined_tags = tags.join(",");
        let digest = compute_digest(&name, kind, &joined_tags);

        Self {
            name,
            kind,
            tags,
            joined_tags,
            value,
            sample_rate: 1.0,
            digest,
            scope: MetricScope::default(),
        }
    }

    /// Creates a counter sample.
    pub fn counter(name: impl Into<String>, tags: Vec<String>, value: f64) -> Self {
        Self::new(name, MetricKind::Counter, tags, MetricValue::Double(value))
    }

    /// Creates a gauge sample.
    pub fn gauge(name: impl Into<String>, tags: Vec<String>, value: f64) -> Self {
        Self::new(name, MetricKind::Gauge, tags, MetricValue::Double(value))
    }

    /// Creates a histogram sample.
    pub fn histogram(name: impl Into<String>, tags: Vec<String>, value: f64) -> Self {
        Self::new(name, MetricKind::Histogram, tags, MetricValue::Double(value))
    }

    /// Creates a timer sample.
    pub fn timer(name: impl Into<String>, tags: Vec<String>, value: f64) -> Self {
        Self::new(name, MetricKind::Timer, tags, MetricValue::Double(value))
    }

    /// Creates a set sample with a string member.
    pub fn set(name: impl Into<String>, tags: Vec<String>, member: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Set, tags, MetricValue::Text(member.into()))
    }

    /// Sets the scope, returning the modified sample.
    pub fn with_scope(mut self, scope: MetricScope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the sample rate, returning the modified sample.
    pub fn with_sample_rate(mut self, sample_rate: f32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Parses a single dogstatsd-flavored line into a sample.
    ///
    /// The format is `name:value|type` followed by optional `|@rate` and
    /// `|#tag1:v1,tag2` sections in any order. A `tributaryglobalonly` or
    /// `tributarylocalonly` tag selects the scope and is consumed.
    pub fn parse_statsd(line: &str) -> Result<Self, ParseMetricError> {
        let mut sections = line.trim_end().split('|');

        let name_value = sections.next().unwrap_or_default();
        let (name, raw_value) = name_value
            .split_once(':')
            .ok_or(ParseMetricError::MissingValue)?;
        if name.is_empty() {
            return Err(ParseMetricError::EmptyName);
        }

        let kind = match sections.next() {
            Some("c") => MetricKind::Counter,
            Some("g") => MetricKind::Gauge,
            Some("h") | Some("d") => MetricKind::Histogram,
            Some("ms") => MetricKind::Timer,
            Some("s") => MetricKind::Set,
            Some(_) => return Err(ParseMetricError::UnknownType),
            None => return Err(ParseMetricError::MissingType),
        };

        let mut sample_rate = 1.0f32;
        let mut tags = Vec::new();
        let mut scope = MetricScope::default();

        for section in sections {
            if let Some(rate) = section.strip_prefix('@') {
                sample_rate = rate
                    .parse()
                    .map_err(|_| ParseMetricError::InvalidSampleRate)?;
            } else if let Some(raw_tags) = section.strip_prefix('#') {
                for tag in raw_tags.split(',').filter(|tag| !tag.is_empty()) {
                    let (key, _) = tag.split_once(':').unwrap_or((tag, ""));
                    match key {
                        GLOBAL_ONLY_TAG => scope = MetricScope::Global,
                        LOCAL_ONLY_TAG => scope = MetricScope::Local,
                        _ => tags.push(tag.to_owned()),
                    }
                }
            }
        }

        let value = match kind {
            MetricKind::Set => MetricValue::Text(raw_value.to_owned()),
            _ => MetricValue::Double(
                raw_value
                    .parse()
                    .map_err(|_| ParseMetricError::InvalidValue)?,
            ),
        };

        Ok(Self::new(name, kind, tags, value)
            .with_sample_rate(sample_rate)
            .with_scope(scope))
    }
}

/// An error returned when parsing a statsd line fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseMetricError {
    /// The line has no `name:value` section.
    #[error("missing metric value")]
    MissingValue,
    /// The metric name is empty.
    #[error("empty metric name")]
    EmptyName,
    /// The line has no type section.
    #[error("missing metric type")]
    MissingType,
    /// The type section is not one of `c`, `g`, `h`, `d`, `ms`, `s`.
    #[error("unknown metric type")]
    UnknownType,
    /// The value does not parse for the given type.
    #[error("invalid metric value")]
    InvalidValue,
    /// The `@rate` section does not parse.
    #[error("invalid sample rate")]
    InvalidSampleRate,
}

/// The identity of an aggregated timeseries, retained for flushing.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricKey {
    /// The metric name.
    pub name: String,
    /// The metric kind.
    pub kind: MetricKind,
    /// Sorted tags in `k:v` form.
    pub tags: Vec<String>,
    /// Canonical comma-joined tags.
    pub joined_tags: String,
    /// The identity digest.
    pub digest: u64,
}

impl From<&Sample> for MetricKey {
    fn from(sample: &Sample) -> Self {
        Self {
            name: sample.name.clone(),
            kind: sample.kind,
            tags: sample.tags.clone(),
            joined_tags: sample.joined_tags.clone(),
            digest: sample.digest,
        }
    }
}

/// The shape of a finalized [`InterMetric`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InterMetricKind {
    /// A summed count.
    Counter,
    /// A point-in-time value.
    Gauge,
}

/// A finalized, flat metric emitted to sinks.
///
/// Higher-order shapes are expanded before emission: histograms produce one
/// `InterMetric` per configured aggregate and percentile, and sets produce a
/// gauge carrying the cardinality estimate.
#[derive(Clone, Debug, PartialEq)]
pub struct InterMetric {
    /// Unix timestamp in seconds at which the metric was finalized.
    pub timestamp: i64,
    /// The metric name, including any aggregate or percentile suffix.
    pub name: String,
    /// Tags in `k:v` form.
    pub tags: Vec<String>,
    /// The finalized value.
    pub value: f64,
    /// The shape of the metric.
    pub kind: InterMetricKind,
    /// When set, restricts delivery to the named sinks.
    pub sinks: Option<BTreeSet<String>>,
}

impl InterMetric {
    /// Creates a finalized metric, splitting `sinkonly:` tags into the sink
    /// filter.
    pub fn new(
        timestamp: i64,
        name: String,
        tags: &[String],
        value: f64,
        kind: InterMetricKind,
    ) -> Self {
        let mut sinks = None;
        let mut kept = Vec::with_capacity(tags.len());

        for tag in tags {
            match tag.strip_prefix(SINK_ONLY_TAG_PREFIX) {
                Some(sink) => {
                    sinks
                        .get_or_insert_with(BTreeSet::new)
                        .insert(sink.to_owned());
                }
                None => kept.push(tag.clone()),
            }
        }

        Self {
            timestamp,
            name,
            tags: kept,
            value,
            kind,
            sinks,
        }
    }

    /// Returns `true` if this metric may be delivered to the named sink.
    pub fn allows_sink(&self, sink: &str) -> bool {
        match &self.sinks {
            Some(sinks) => sinks.contains(sink),
            None => true,
        }
    }
}
