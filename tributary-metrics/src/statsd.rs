use tributary_statsd::{CounterMetric, GaugeMetric};

/// Counter metrics emitted by the aggregation path.
pub enum MetricCounters {
    /// A sample was dropped before aggregation, tagged with `reason`.
    SamplesRejected,
}

impl CounterMetric for MetricCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::SamplesRejected => "samples_rejected",
        }
    }
}

/// Gauge metrics emitted by the aggregation path.
pub enum MetricGauges {
    /// Estimated unique timeseries seen by one worker this interval.
    UniqueTimeseries,
}

impl GaugeMetric for MetricGauges {
    fn name(&self) -> &'static str {
        match self {
            Self::UniqueTimeseries => "unique_timeseries",
        }
    }
}
