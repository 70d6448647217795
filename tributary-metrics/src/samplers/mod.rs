//! Per-kind accumulators with bounded memory.
//!
//! Each sampler ingests observations for one timeseries within a flush
//! interval, merges forwarded partial state from other instances, and
//! produces either finalized [`InterMetric`]s or a wire partial. All
//! aggregations except the gauge's last-write are commutative, so flushes do
//! not depend on arrival order.

use std::collections::HashMap;

use crate::sketch::{HyperLogLog, SketchError, TDigest, DEFAULT_COMPRESSION};
use crate::{
    wire, HistogramAggregate, InterMetric, InterMetricKind, MetricKey, MetricKind, MetricScope,
    MetricValue, Sample,
};

/// Why a sample was rejected instead of aggregated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The metric name is empty.
    EmptyName,
    /// The sample rate is outside `(0, 1]`.
    InvalidSampleRate,
    /// The value does not fit the metric kind.
    InvalidValue,
    /// The kind cannot be aggregated.
    Unsupported,
    /// Aggregation panicked; the aggregator was dropped.
    Panic,
}

impl RejectReason {
    /// Returns the telemetry tag value for this reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyName => "empty_name",
            Self::InvalidSampleRate => "invalid_sample_rate",
            Self::InvalidValue => "invalid_value",
            Self::Unsupported => "unsupported",
            Self::Panic => "panic",
        }
    }
}

/// An error merging a forwarded partial into local aggregators.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// The wire kind is unknown or not mergeable.
    #[error("partial has an unsupported kind")]
    UnsupportedKind,
    /// The partial state does not match the declared kind.
    #[error("partial state does not match its kind")]
    KindMismatch,
    /// The embedded sketch state is invalid.
    #[error("invalid sketch state: {0}")]
    Sketch(#[from] SketchError),
}

/// Sums counter increments, scaled by the reciprocal sample rate.
#[derive(Clone, Debug, Default)]
pub struct Counter {
    value: i64,
}

impl Counter {
    /// Creates an empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an observation.
    pub fn sample(&mut self, value: f64, sample_rate: f32) {
        let scaled = value * f64::from(sample_rate).recip();
        self.value = self.value.saturating_add(scaled as i64);
    }

    /// Adds a forwarded partial sum.
    pub fn merge(&mut self, sum: i64) {
        self.value = self.value.saturating_add(sum);
    }

    /// The accumulated sum.
    pub fn value(&self) -> i64 {
        self.value
    }

    /// Finalizes the counter into one metric.
    ///
    /// Emits the raw sum, or a per-second rate when `interval_secs` is set.
    pub fn flush(
        &self,
        key: &MetricKey,
        timestamp: i64,
        interval_secs: Option<f64>,
    ) -> Vec<InterMetric> {
        let value = match interval_secs {
            Some(secs) if secs > 0.0 => self.value as f64 / secs,
            _ => self.value as f64,
        };

        vec![InterMetric::new(
            timestamp,
            key.name.clone(),
            &key.tags,
            value,
            InterMetricKind::Counter,
        )]
    }

    /// The wire representation of this counter.
    pub fn partial(&self) -> wire::Value {
        wire::Value::Counter(self.value)
    }
}

/// Keeps the last reported value.
#[derive(Clone, Debug, Default)]
pub struct Gauge {
    value: f64,
}

impl Gauge {
    /// Creates a gauge at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an observation. Last write wins.
    pub fn sample(&mut self, value: f64) {
        self.value = value;
    }

    /// Merges a forwarded value. Last write wins.
    pub fn merge(&mut self, value: f64) {
        self.value = value;
    }

    /// The last reported value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Finalizes the gauge into one metric.
    pub fn flush(&self, key: &MetricKey, timestamp: i64) -> Vec<InterMetric> {
        vec![InterMetric::new(
            timestamp,
            key.name.clone(),
            &key.tags,
            self.value,
            InterMetricKind::Gauge,
        )]
    }

    /// The wire representation of this gauge.
    pub fn partial(&self) -> wire::Value {
        wire::Value::Gauge(self.value)
    }
}

/// Estimates the number of unique string members.
#[derive(Clone, Debug, Default)]
pub struct Set {
    sketch: HyperLogLog,
}

impl Set {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a member.
    pub fn sample(&mut self, member: &str) {
        self.sketch.insert(member.as_bytes());
    }

    /// Merges a forwarded sketch.
    pub fn merge(&mut self, state: &wire::SetState) -> Result<(), SketchError> {
        let precision = u8::try_from(state.precision).map_err(|_| SketchError::InvalidState)?;
        let other = HyperLogLog::from_registers(precision, &state.registers)?;
        self.sketch.merge(&other)
    }

    /// The estimated cardinality.
    pub fn estimate(&self) -> u64 {
        self.sketch.estimate()
    }

    /// Finalizes the set into one gauge carrying the cardinality estimate.
    ///
    /// An empty member stream emits nothing.
    pub fn flush(&self, key: &MetricKey, timestamp: i64) -> Vec<InterMetric> {
        if self.sketch.is_empty() {
            return Vec::new();
        }

        vec![InterMetric::new(
            timestamp,
            key.name.clone(),
            &key.tags,
            self.sketch.estimate() as f64,
            InterMetricKind::Gauge,
        )]
    }

    /// The wire representation of this set.
    pub fn partial(&self) -> wire::Value {
        wire::Value::Set(wire::SetState {
            precision: u32::from(self.sketch.precision()),
            registers: self.sketch.registers().to_vec(),
        })
    }
}

/// Aggregates a distribution of values into a rank sketch.
///
/// Backs both histograms and timers.
#[derive(Clone, Debug)]
pub struct Histo {
    digest: TDigest,
}

impl Histo {
    /// Creates an empty histogram.
    pub fn new() -> Self {
        Self {
            digest: TDigest::new(DEFAULT_COMPRESSION),
        }
    }

    /// Records an observation, weighted by the reciprocal sample rate.
    pub fn sample(&mut self, value: f64, sample_rate: f32) {
        self.digest.add(value, f64::from(sample_rate).recip());
    }

    /// Merges a forwarded rank sketch.
    pub fn merge(&mut self, state: &wire::HistogramState) -> Result<(), SketchError> {
        let other = TDigest::from_parts(
            state.compression,
            &state.means,
            &state.weights,
            state.min,
            state.max,
            state.sum,
        )?;
        self.digest.merge(&other);
        Ok(())
    }

    /// The number of observed values, including sample-rate weights.
    pub fn count(&self) -> f64 {
        self.digest.count()
    }

    /// Finalizes the histogram into one metric per configured aggregate and
    /// percentile.
    ///
    /// A histogram that saw no values emits nothing. The count aggregate is
    /// emitted as a counter; everything else is a gauge.
    pub fn flush(
        &mut self,
        key: &MetricKey,
        timestamp: i64,
        aggregates: &[HistogramAggregate],
        percentiles: &[f64],
    ) -> Vec<InterMetric> {
        if self.digest.count() == 0.0 {
            return Vec::new();
        }

        let mut metrics = Vec::with_capacity(aggregates.len() + percentiles.len());

        for aggregate in aggregates {
            let (value, kind) = match aggregate {
                HistogramAggregate::Min => (self.digest.min(), InterMetricKind::Gauge),
                HistogramAggregate::Max => (self.digest.max(), InterMetricKind::Gauge),
                HistogramAggregate::Sum => (self.digest.sum(), InterMetricKind::Gauge),
                HistogramAggregate::Avg => (self.digest.avg(), InterMetricKind::Gauge),
                HistogramAggregate::Count => (self.digest.count(), InterMetricKind::Counter),
                HistogramAggregate::Median => (self.digest.quantile(0.5), InterMetricKind::Gauge),
            };

            metrics.push(InterMetric::new(
                timestamp,
                format!("{}.{}", key.name, aggregate.as_str()),
                &key.tags,
                value,
                kind,
            ));
        }

        for &percentile in percentiles {
            metrics.push(InterMetric::new(
                timestamp,
                format!("{}.{}", key.name, percentile_suffix(percentile)),
                &key.tags,
                self.digest.quantile(percentile),
                InterMetricKind::Gauge,
            ));
        }

        metrics
    }

    /// The wire representation of this histogram.
    pub fn partial(&mut self) -> wire::Value {
        let min = self.digest.min();
        let max = self.digest.max();
        let sum = self.digest.sum();
        let compression = self.digest.compression();
        let (means, weights) = self
            .digest
            .centroids()
            .iter()
            .map(|c| (c.mean, c.weight))
            .unzip();

        wire::Value::Histogram(wire::HistogramState {
            compression,
            means,
            weights,
            min,
            max,
            sum,
        })
    }
}

impl Default for Histo {
    fn default() -> Self {
        Self::new()
    }
}

/// Formats the name suffix of a percentile metric, e.g. `50percentile`.
fn percentile_suffix(percentile: f64) -> String {
    let pct = (percentile * 10_000.0).round() / 100.0;
    format!("{pct}percentile")
}

/// One aggregated timeseries held by a worker.
#[derive(Clone, Debug)]
pub struct SamplerEntry<T> {
    /// The timeseries identity.
    pub key: MetricKey,
    /// The scope observed on the most recent sample.
    pub scope: MetricScope,
    /// The accumulator.
    pub sampler: T,
}

/// A worker's aggregator maps, keyed by identity digest.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    /// Counter timeseries.
    pub counters: HashMap<u64, SamplerEntry<Counter>>,
    /// Gauge and status-check timeseries.
    pub gauges: HashMap<u64, SamplerEntry<Gauge>>,
    /// Set timeseries.
    pub sets: HashMap<u64, SamplerEntry<Set>>,
    /// Histogram timeseries.
    pub histograms: HashMap<u64, SamplerEntry<Histo>>,
    /// Timer timeseries.
    pub timers: HashMap<u64, SamplerEntry<Histo>>,
}

fn entry<'a, T: Default>(
    map: &'a mut HashMap<u64, SamplerEntry<T>>,
    key: MetricKey,
    scope: MetricScope,
) -> &'a mut T {
    let entry = map.entry(key.digest).or_insert_with(|| SamplerEntry {
        key,
        scope,
        sampler: T::default(),
    });
    entry.scope = scope;
    &mut entry.sampler
}

impl WorkerMetrics {
    /// Aggregates one sample, creating the timeseries lazily.
    pub fn ingest(&mut self, sample: &Sample) -> Result<(), RejectReason> {
        if sample.name.is_empty() {
            return Err(RejectReason::EmptyName);
        }
        if !(sample.sample_rate > 0.0 && sample.sample_rate <= 1.0) {
            return Err(RejectReason::InvalidSampleRate);
        }

        let key = MetricKey::from(sample);

        match (sample.kind, &sample.value) {
            (MetricKind::Counter, MetricValue::Double(value)) => {
                entry(&mut self.counters, key, sample.scope).sample(*value, sample.sample_rate);
            }
            (MetricKind::Gauge | MetricKind::StatusCheck, MetricValue::Double(value)) => {
                entry(&mut self.gauges, key, sample.scope).sample(*value);
            }
            (MetricKind::Set, MetricValue::Text(member)) => {
                entry(&mut self.sets, key, sample.scope).sample(member);
            }
            (MetricKind::Histogram, MetricValue::Double(value)) => {
                entry(&mut self.histograms, key, sample.scope).sample(*value, sample.sample_rate);
            }
            (MetricKind::Timer, MetricValue::Double(value)) => {
                entry(&mut self.timers, key, sample.scope).sample(*value, sample.sample_rate);
            }
            (MetricKind::Event, _) => return Err(RejectReason::Unsupported),
            _ => return Err(RejectReason::InvalidValue),
        }

        Ok(())
    }

    /// Merges one forwarded partial, creating the timeseries lazily.
    ///
    /// Merged timeseries aggregate with mixed scope: a terminal global
    /// instance finalizes them at its next flush.
    pub fn merge_partial(&mut self, metric: &wire::Metric) -> Result<(), MergeError> {
        let kind = metric
            .kind()
            .to_metric_kind()
            .ok_or(MergeError::UnsupportedKind)?;

        let mut tags = metric.tags.clone();
        tags.sort_unstable();
        let joined_tags = tags.join(",");
        let key = MetricKey {
            name: metric.name.clone(),
            kind,
            tags,
            joined_tags,
            digest: metric.digest,
        };
        let scope = MetricScope::Mixed;

        match (kind, &metric.value) {
            (MetricKind::Counter, Some(wire::Value::Counter(sum))) => {
                entry(&mut self.counters, key, scope).merge(*sum);
            }
            (MetricKind::Gauge, Some(wire::Value::Gauge(value))) => {
                entry(&mut self.gauges, key, scope).merge(*value);
            }
            (MetricKind::Set, Some(wire::Value::Set(state))) => {
                entry(&mut self.sets, key, scope).merge(state)?;
            }
            (MetricKind::Histogram, Some(wire::Value::Histogram(state))) => {
                entry(&mut self.histograms, key, scope).merge(state)?;
            }
            (MetricKind::Timer, Some(wire::Value::Histogram(state))) => {
                entry(&mut self.timers, key, scope).merge(state)?;
            }
            _ => return Err(MergeError::KindMismatch),
        }

        Ok(())
    }

    /// Drops the aggregator a sample belongs to, if it exists.
    pub fn remove(&mut self, kind: MetricKind, digest: u64) {
        match kind {
            MetricKind::Counter => {
                self.counters.remove(&digest);
            }
            MetricKind::Gauge | MetricKind::StatusCheck => {
                self.gauges.remove(&digest);
            }
            MetricKind::Set => {
                self.sets.remove(&digest);
            }
            MetricKind::Histogram => {
                self.histograms.remove(&digest);
            }
            MetricKind::Timer => {
                self.timers.remove(&digest);
            }
            MetricKind::Event => {}
        }
    }

    /// The number of aggregated timeseries.
    pub fn len(&self) -> usize {
        self.counters.len()
            + self.gauges.len()
            + self.sets.len()
            + self.histograms.len()
            + self.timers.len()
    }

    /// Returns `true` if no timeseries are aggregated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, kind: MetricKind) -> MetricKey {
        MetricKey::from(&Sample::new(
            name,
            kind,
            vec!["env:prod".to_owned()],
            MetricValue::Double(0.0),
        ))
    }

    #[test]
    fn counter_scales_by_sample_rate() {
        let mut counter = Counter::new();
        counter.sample(2.0, 0.5);
        counter.sample(1.0, 1.0);
        assert_eq!(counter.value(), 5);
    }

    #[test]
    fn counter_flush_raw_and_rate() {
        let mut counter = Counter::new();
        counter.sample(10.0, 1.0);
        let key = key("api.hits", MetricKind::Counter);

        let raw = counter.flush(&key, 100, None);
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].name, "api.hits");
        assert_eq!(raw[0].value, 10.0);
        assert_eq!(raw[0].kind, InterMetricKind::Counter);
        assert_eq!(raw[0].timestamp, 100);

        let rate = counter.flush(&key, 100, Some(10.0));
        assert_eq!(rate[0].value, 1.0);
    }

    #[test]
    fn counter_merge_is_commutative() {
        let mut a = Counter::new();
        a.sample(3.0, 1.0);
        a.merge(4);

        let mut b = Counter::new();
        b.merge(4);
        b.sample(3.0, 1.0);

        assert_eq!(a.value(), b.value());
    }

    #[test]
    fn gauge_last_write_wins() {
        let mut gauge = Gauge::new();
        gauge.sample(1.0);
        gauge.sample(7.5);
        assert_eq!(gauge.value(), 7.5);

        let flushed = gauge.flush(&key("load", MetricKind::Gauge), 0);
        assert_eq!(flushed[0].value, 7.5);
        assert_eq!(flushed[0].kind, InterMetricKind::Gauge);
    }

    #[test]
    fn set_counts_unique_members() {
        let mut set = Set::new();
        set.sample("alice");
        set.sample("bob");
        set.sample("alice");
        assert_eq!(set.estimate(), 2);

        let flushed = set.flush(&key("users", MetricKind::Set), 0);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].name, "users");
        assert_eq!(flushed[0].value, 2.0);
        assert_eq!(flushed[0].kind, InterMetricKind::Gauge);
    }

    #[test]
    fn empty_set_emits_nothing() {
        let set = Set::new();
        assert!(set.flush(&key("users", MetricKind::Set), 0).is_empty());
    }

    #[test]
    fn set_partial_roundtrip() {
        let mut local = Set::new();
        local.sample("alice");
        local.sample("bob");

        let mut global = Set::new();
        global.sample("carol");
        match local.partial() {
            wire::Value::Set(state) => global.merge(&state).unwrap(),
            _ => unreachable!(),
        }

        assert_eq!(global.estimate(), 3);
    }

    #[test]
    fn histo_expands_aggregates_and_percentiles() {
        let mut histo = Histo::new();
        for value in [1.0, 2.0, 3.0, 4.0] {
            histo.sample(value, 1.0);
        }

        let key = key("api.latency", MetricKind::Histogram);
        let aggregates = [
            HistogramAggregate::Min,
            HistogramAggregate::Max,
            HistogramAggregate::Sum,
            HistogramAggregate::Avg,
            HistogramAggregate::Count,
            HistogramAggregate::Median,
        ];
        let metrics = histo.flush(&key, 0, &aggregates, &[0.5, 0.999]);

        let by_name: std::collections::HashMap<_, _> = metrics
            .iter()
            .map(|m| (m.name.as_str(), (m.value, m.kind)))
            .collect();

        assert_eq!(by_name["api.latency.min"], (1.0, InterMetricKind::Gauge));
        assert_eq!(by_name["api.latency.max"], (4.0, InterMetricKind::Gauge));
        assert_eq!(by_name["api.latency.sum"], (10.0, InterMetricKind::Gauge));
        assert_eq!(by_name["api.latency.avg"], (2.5, InterMetricKind::Gauge));
        assert_eq!(
            by_name["api.latency.count"],
            (4.0, InterMetricKind::Counter)
        );
        assert_eq!(by_name["api.latency.median"], (2.5, InterMetricKind::Gauge));
        assert!(by_name.contains_key("api.latency.50percentile"));
        assert!(by_name.contains_key("api.latency.99.9percentile"));
    }

    #[test]
    fn empty_histo_emits_nothing() {
        let mut histo = Histo::new();
        let metrics = histo.flush(
            &key("api.latency", MetricKind::Histogram),
            0,
            &[HistogramAggregate::Min],
            &[0.5],
        );
        assert!(metrics.is_empty());
    }

    #[test]
    fn histo_partial_roundtrip() {
        let mut local = Histo::new();
        local.sample(20.0, 1.0);

        let mut global = Histo::new();
        match local.partial() {
            wire::Value::Histogram(state) => global.merge(&state).unwrap(),
            _ => unreachable!(),
        }

        let metrics = global.flush(
            &key("histo", MetricKind::Histogram),
            0,
            &[HistogramAggregate::Min],
            &[],
        );
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name, "histo.min");
        assert_eq!(metrics[0].value, 20.0);
    }

    #[test]
    fn ingest_rejects_bad_samples() {
        let mut metrics = WorkerMetrics::default();

        let mut empty_name = Sample::counter("x", vec![], 1.0);
        empty_name.name.clear();
        assert_eq!(metrics.ingest(&empty_name), Err(RejectReason::EmptyName));

        let bad_rate = Sample::counter("api.hits", vec![], 1.0).with_sample_rate(0.0);
        assert_eq!(
            metrics.ingest(&bad_rate),
            Err(RejectReason::InvalidSampleRate)
        );

        let event = Sample::new(
            "deploy",
            MetricKind::Event,
            vec![],
            MetricValue::Text("v2".to_owned()),
        );
        assert_eq!(metrics.ingest(&event), Err(RejectReason::Unsupported));

        let bad_value = Sample::new(
            "api.hits",
            MetricKind::Counter,
            vec![],
            MetricValue::Text("nope".to_owned()),
        );
        assert_eq!(metrics.ingest(&bad_value), Err(RejectReason::InvalidValue));

        assert!(metrics.is_empty());
    }

    #[test]
    fn ingest_aggregates_same_digest() {
        let mut metrics = WorkerMetrics::default();
        metrics
            .ingest(&Sample::counter("api.hits", vec![], 2.0))
            .unwrap();
        metrics
            .ingest(&Sample::counter("api.hits", vec![], 3.0))
            .unwrap();

        assert_eq!(metrics.counters.len(), 1);
        let entry = metrics.counters.values().next().unwrap();
        assert_eq!(entry.sampler.value(), 5);
    }

    #[test]
    fn status_checks_aggregate_as_gauges() {
        let mut metrics = WorkerMetrics::default();
        let sample = Sample::new(
            "db.ok",
            MetricKind::StatusCheck,
            vec![],
            MetricValue::Double(1.0),
        );
        metrics.ingest(&sample).unwrap();
        assert_eq!(metrics.gauges.len(), 1);
    }

    #[test]
    fn merge_partial_creates_timeseries() {
        let mut metrics = WorkerMetrics::default();
        let partial = wire::Metric {
            name: "api.hits".to_owned(),
            tags: vec![],
            kind: wire::Kind::Counter as i32,
            digest: 99,
            value: Some(wire::Value::Counter(7)),
        };

        metrics.merge_partial(&partial).unwrap();
        metrics.merge_partial(&partial).unwrap();

        let entry = &metrics.counters[&99];
        assert_eq!(entry.sampler.value(), 14);
        assert_eq!(entry.scope, MetricScope::Mixed);
    }

    #[test]
    fn merge_partial_rejects_mismatch() {
        let mut metrics = WorkerMetrics::default();
        let partial = wire::Metric {
            name: "api.hits".to_owned(),
            tags: vec![],
            kind: wire::Kind::Counter as i32,
            digest: 99,
            value: Some(wire::Value::Gauge(1.0)),
        };

        assert!(matches!(
            metrics.merge_partial(&partial),
            Err(MergeError::KindMismatch)
        ));
    }

    #[test]
    fn percentile_suffixes() {
        assert_eq!(percentile_suffix(0.5), "50percentile");
        assert_eq!(percentile_suffix(0.99), "99percentile");
        assert_eq!(percentile_suffix(0.999), "99.9percentile");
        assert_eq!(percentile_suffix(0.0), "0percentile");
        assert_eq!(percentile_suffix(1.0), "100percentile");
    }
}
