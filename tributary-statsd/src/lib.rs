//! A high-level StatsD metric client built on cadence.
//!
//! The service reports its own operational metrics (dropped samples, flush
//! health, per-sink delivery counters) through this crate.
//!
//! ## Defining Metrics
//!
//! In order to use metrics, one needs to first define one of the metric
//! traits on a custom enum: [`CounterMetric`], [`GaugeMetric`],
//! [`TimerMetric`], [`HistogramMetric`] or [`SetMetric`]. The traits serve
//! only to provide a type safe metric name; a counter metric cannot be used
//! where a timer is expected.
//!
//! ## Initializing the Client
//!
//! Metrics can be used without initializing a statsd client. In that case,
//! invoking `with_client` or the [`metric!`] macro will become a noop.
//!
//! ```no_run
//! # use std::collections::BTreeMap;
//! tributary_statsd::init("tributary", "localhost:8125", BTreeMap::new()).unwrap();
//! ```
//!
//! ## Macro Usage
//!
//! The recommended way to record metrics is by using the [`metric!`] macro:
//!
//! ```
//! use tributary_statsd::{metric, CounterMetric};
//!
//! struct MyCounter;
//!
//! impl CounterMetric for MyCounter {
//!     fn name(&self) -> &'static str {
//!         "counter"
//!     }
//! }
//!
//! metric!(counter(MyCounter) += 1);
//! ```
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::net::UdpSocket;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use cadence::{
    BufferedUdpMetricSink, Metric, MetricBuilder, MetricError, QueuingMetricSink, SpyMetricSink,
    StatsdClient,
};

mod types;
pub use types::*;

/// The cadence traits needed to record metrics on the raw client.
pub mod prelude {
    pub use cadence::prelude::*;
}

static METRICS_CLIENT: RwLock<Option<Arc<MetricsClient>>> = RwLock::new(None);

/// Serializes capturing test clients, which swap the process-global client.
static TEST_LOCK: Mutex<()> = Mutex::new(());

/// The globally configured metrics client.
///
/// Wraps a raw cadence [`StatsdClient`] and applies the configured default
/// tags to every metric before it is sent.
pub struct MetricsClient {
    /// The raw statsd client.
    pub statsd_client: StatsdClient,
    /// Tags added to every emitted metric.
    pub default_tags: BTreeMap<String, String>,
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &Self::Target {
        &self.statsd_client
    }
}

impl MetricsClient {
    /// Sends a metric, attaching the client's default tags.
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (key, value) in &self.default_tags {
            metric = metric.with_tag(key, value);
        }

        metric.send();
    }
}

/// Initializes the global statsd client reporting to `host` over UDP.
pub fn init(
    prefix: &str,
    host: &str,
    default_tags: BTreeMap<String, String>,
) -> Result<(), MetricError> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;

    let sink = QueuingMetricSink::from(BufferedUdpMetricSink::from(host, socket)?);
    let statsd_client = StatsdClient::builder(prefix, sink)
        .with_error_handler(|error| {
            tributary_log::debug!("failed to send statsd metric: {error}");
        })
        .build();

    set_client(MetricsClient {
        statsd_client,
        default_tags,
    });

    tributary_log::info!("reporting internal metrics to statsd at {host}");
    Ok(())
}

/// Replaces the global metrics client.
pub fn set_client(client: MetricsClient) {
    *METRICS_CLIENT
        .write()
        .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(client));
}

/// Removes the global metrics client, turning metrics into noops.
pub fn clear_client() {
    *METRICS_CLIENT
        .write()
        .unwrap_or_else(PoisonError::into_inner) = None;
}

/// Invokes `f` with the current metrics client, if one is configured.
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    let guard = METRICS_CLIENT
        .read()
        .unwrap_or_else(PoisonError::into_inner);

    match guard.as_ref() {
        Some(client) => f(client),
        None => R::default(),
    }
}

/// Runs `f` with a capturing client and returns the captured metric lines.
///
/// Swaps the global client for the duration of the call; concurrent captures
/// are serialized.
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    let _guard = TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    let (rx, sink) = SpyMetricSink::new();
    let previous = METRICS_CLIENT
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(Arc::new(MetricsClient {
            statsd_client: StatsdClient::from_sink("", sink),
            default_tags: BTreeMap::new(),
        }));

    f();

    *METRICS_CLIENT
        .write()
        .unwrap_or_else(PoisonError::into_inner) = previous;

    rx.try_iter()
        .map(|bytes| String::from_utf8(bytes).expect("statsd metrics are valid utf-8"))
        .collect()
}

/// Emits a metric to the configured statsd client.
///
/// See the crate level documentation and the metric traits for examples.
#[macro_export]
macro_rules! metric {
    // counter with increment
    (counter($id:expr) += $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::prelude::*;
            client.send_metric(
                client.count_with_tags($crate::CounterMetric::name(&$id), $value)
                    $(.with_tag(stringify!($k), $v))*
            )
        })
    };

    // counter with decrement
    (counter($id:expr) -= $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::prelude::*;
            client.send_metric(
                client.count_with_tags($crate::CounterMetric::name(&$id), -$value)
                    $(.with_tag(stringify!($k), $v))*
            )
        })
    };

    // gauge set
    (gauge($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::prelude::*;
            client.send_metric(
                client.gauge_with_tags($crate::GaugeMetric::name(&$id), $value)
                    $(.with_tag(stringify!($k), $v))*
            )
        })
    };

    // timer value (duration)
    (timer($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::prelude::*;
            client.send_metric(
                client.time_with_tags($crate::TimerMetric::name(&$id), $value)
                    $(.with_tag(stringify!($k), $v))*
            )
        })
    };

    // timed block
    (timer($id:expr), $($k:ident = $v:expr,)* $block:block) => {{
        let now = std::time::Instant::now();
        let rv = $block;
        $crate::metric!(timer($id) = now.elapsed() $(, $k = $v)*);
        rv
    }};

    // histogram value
    (histogram($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::prelude::*;
            client.send_metric(
                client.histogram_with_tags($crate::HistogramMetric::name(&$id), $value)
                    $(.with_tag(stringify!($k), $v))*
            )
        })
    };

    // set value
    (set($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::prelude::*;
            client.send_metric(
                client.set_with_tags($crate::SetMetric::name(&$id), $value)
                    $(.with_tag(stringify!($k), $v))*
            )
        })
    };
}
