/// A metric for capturing timings.
///
/// Timings are a positive number of milliseconds between a start and end
/// time, recorded from a [`std::time::Duration`].
///
/// ## Example
///
/// ```
/// use tributary_statsd::{metric, TimerMetric};
///
/// enum MyTimer {
///     ProcessA,
/// }
///
/// impl TimerMetric for MyTimer {
///     fn name(&self) -> &'static str {
///         match self {
///             Self::ProcessA => "process_a",
///         }
///     }
/// }
///
/// # fn process_a() {}
/// let start_time = std::time::Instant::now();
/// process_a();
/// metric!(timer(MyTimer::ProcessA) = start_time.elapsed());
/// ```
pub trait TimerMetric {
    /// Returns the timer metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing counters.
///
/// Counters are simple values incremented or decremented by a client.
///
/// ## Example
///
/// ```
/// use tributary_statsd::{metric, CounterMetric};
///
/// enum MyCounter {
///     TotalRequests,
/// }
///
/// impl CounterMetric for MyCounter {
///     fn name(&self) -> &'static str {
///         match self {
///             Self::TotalRequests => "total_requests",
///         }
///     }
/// }
///
/// metric!(counter(MyCounter::TotalRequests) += 1);
/// metric!(counter(MyCounter::TotalRequests) += 1, server = "s1");
/// ```
pub trait CounterMetric {
    /// Returns the counter metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing gauges.
///
/// Gauge values are an instantaneous measurement of a value determined by the
/// client, which do not change unless changed by the client.
///
/// ## Example
///
/// ```
/// use tributary_statsd::{metric, GaugeMetric};
///
/// enum MyGauge {
///     QueueDepth,
/// }
///
/// impl GaugeMetric for MyGauge {
///     fn name(&self) -> &'static str {
///         match self {
///             Self::QueueDepth => "queue_depth",
///         }
///     }
/// }
///
/// metric!(gauge(MyGauge::QueueDepth) = 42.0);
/// ```
pub trait GaugeMetric {
    /// Returns the gauge metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing histograms.
///
/// Histograms are values whose distribution is calculated by the receiver.
/// The distribution calculated for histograms is often similar to that of
/// timers.
///
/// ## Example
///
/// ```
/// use tributary_statsd::{metric, HistogramMetric};
///
/// enum MyHistogram {
///     BatchSize,
/// }
///
/// impl HistogramMetric for MyHistogram {
///     fn name(&self) -> &'static str {
///         match self {
///             Self::BatchSize => "batch_size",
///         }
///     }
/// }
///
/// metric!(histogram(MyHistogram::BatchSize) = 128.0);
/// ```
pub trait HistogramMetric {
    /// Returns the histogram metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing sets.
///
/// Sets count the number of unique elements in a group.
///
/// ## Example
///
/// ```
/// use tributary_statsd::{metric, SetMetric};
///
/// enum MySet {
///     UniqueUsers,
/// }
///
/// impl SetMetric for MySet {
///     fn name(&self) -> &'static str {
///         match self {
///             Self::UniqueUsers => "unique_users",
///         }
///     }
/// }
///
/// metric!(set(MySet::UniqueUsers) = 91827);
/// ```
pub trait SetMetric {
    /// Returns the set metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}
