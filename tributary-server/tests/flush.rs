//! End-to-end flush, forward and shaping behavior.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message as _;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tributary_config::Config;
use tributary_metrics::{
    wire, HistogramAggregate, InterMetric, InterMetricKind, MetricScope, Sample,
    SampleTimeseries, TallyTimeseries,
};
use tributary_server::sinks::{ChannelSink, MetricSink, MetricSinkTypes};
use tributary_server::sources::SourceTypes;
use tributary_server::spans::SpanSinkTypes;
use tributary_server::{Server, ServerConfig};

/// Serializes tests that swap the process-global telemetry client.
static TELEMETRY: Mutex<()> = Mutex::new(());

fn test_config() -> Config {
    let mut config = Config::parse("omit_empty_hostname: true").unwrap();
    config.num_workers = 4;
    config.interval = Duration::from_millis(50);
    config
}

fn build_server(config: Config, metric_sink_types: MetricSinkTypes) -> Server {
    Server::new(ServerConfig {
        config,
        source_types: SourceTypes::with_builtins(),
        metric_sink_types,
        span_sink_types: SpanSinkTypes::with_builtins(),
    })
    .unwrap()
}

/// Registers a `channel` sink kind delivering into `tx`.
fn channel_sink_types(tx: mpsc::Sender<Vec<InterMetric>>) -> MetricSinkTypes {
    let mut types = MetricSinkTypes::with_builtins();
    types.register("channel", move |sink_config, _config| {
        Ok(Box::new(ChannelSink::named(sink_config.display_name(), tx.clone()))
            as Box<dyn MetricSink>)
    });
    types
}

fn channel_sink_yaml(extra: &str) -> Config {
    let raw = format!(
        r#"
omit_empty_hostname: true
metric_sinks:
  - kind: channel
    name: channel
{extra}"#
    );
    Config::parse(&raw).unwrap()
}

/// A forward receiver in the style of the real global listener.
///
/// Collects the names of every streamed partial, sleeps for `delay`, then
/// replies with the accepted count. Each completed stream's names are
/// delivered on the returned channel.
async fn forward_test_server(delay: Duration) -> (String, mpsc::Receiver<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        loop {
            let Ok((socket, _peer)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();

            tokio::spawn(async move {
                let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
                let mut names = Vec::new();
                let mut accepted = 0u64;

                while let Some(Ok(frame)) = framed.next().await {
                    if let Ok(metric) = wire::Metric::decode(frame.freeze()) {
                        names.push(metric.name);
                        accepted += 1;
                    }
                }

                tokio::time::sleep(delay).await;

                if !names.is_empty() {
                    tx.send(names).await.ok();
                }

                let response = wire::ForwardResponse { accepted };
                framed
                    .send(Bytes::from(response.encode_to_vec()))
                    .await
                    .ok();
            });
        }
    });

    (address, rx)
}

/// The canonical mixed-scope ingest set exercised by the forward tests.
fn forward_test_samples() -> Vec<Sample> {
    vec![
        Sample::histogram("test.grpc.histogram", vec![], 20.0).with_scope(MetricScope::Mixed),
        Sample::histogram("test.grpc.histogram_global", vec![], 20.0)
            .with_scope(MetricScope::Global),
        Sample::gauge("test.grpc.gauge", vec![], 1.0).with_scope(MetricScope::Global),
        Sample::counter("test.grpc.counter", vec![], 2.0).with_scope(MetricScope::Global),
        Sample::timer("test.grpc.timer_mixed", vec![], 100.0).with_scope(MetricScope::Mixed),
        Sample::timer("test.grpc.timer", vec![], 100.0).with_scope(MetricScope::Global),
        Sample::set("test.grpc.set", vec![], "test").with_scope(MetricScope::Global),
        Sample::counter("test.grpc.counter.local", vec![], 100.0).with_scope(MetricScope::Mixed),
    ]
}

#[tokio::test(flavor = "multi_thread")]
async fn forwards_global_and_mixed_sketches() {
    let (address, mut received) = forward_test_server(Duration::ZERO).await;

    let mut config = test_config();
    config.forward_address = address;

    let mut server = build_server(config, MetricSinkTypes::with_builtins());
    server.start().await.unwrap();

    for sample in forward_test_samples() {
        server.ingest(sample);
    }

    let mut names = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("timed out waiting for the forwarded partials")
        .unwrap();
    names.sort();

    // Global samples of every kind forward; mixed histograms and timers
    // forward too. The mixed counter stays local.
    let mut expected = vec![
        "test.grpc.counter",
        "test.grpc.gauge",
        "test.grpc.histogram",
        "test.grpc.histogram_global",
        "test.grpc.set",
        "test.grpc.timer",
        "test.grpc.timer_mixed",
    ];
    expected.sort_unstable();
    assert_eq!(names, expected);

    server.shutdown();
}

#[test]
fn forward_timeout_is_counted() {
    let _guard = TELEMETRY.lock().unwrap_or_else(|e| e.into_inner());

    let (capture_rx, spy) = cadence::SpyMetricSink::new();
    tributary_statsd::set_client(tributary_statsd::MetricsClient {
        statsd_client: cadence::StatsdClient::from_sink("", spy),
        default_tags: BTreeMap::new(),
    });

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let found = rt.block_on(async {
        let (address, _received) = forward_test_server(Duration::from_millis(500)).await;

        let mut config = test_config();
        config.interval = Duration::from_micros(20);
        config.forward_address = address;

        let mut server = build_server(config, MetricSinkTypes::with_builtins());
        server.start().await.unwrap();

        for sample in forward_test_samples() {
            server.ingest(sample);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut found = false;
        while tokio::time::Instant::now() < deadline && !found {
            while let Ok(bytes) = capture_rx.try_recv() {
                let line = String::from_utf8(bytes).unwrap();
                if line.starts_with("forward.error_total:1|c")
                    && line.contains("cause:deadline_exceeded")
                {
                    found = true;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        server.shutdown();
        found
    });

    tributary_statsd::clear_client();
    assert!(found, "no deadline_exceeded forward error was counted");
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_forward_address_does_not_stall_sinks() {
    let (tx, mut rx) = mpsc::channel(64);

    let mut config = channel_sink_yaml("");
    config.num_workers = 4;
    config.interval = Duration::from_millis(50);
    config.forward_address = "bad-address:123".to_owned();

    let mut server = build_server(config, channel_sink_types(tx));
    server.start().await.unwrap();

    server.ingest(
        Sample::histogram("test.grpc.histogram", vec![], 20.0).with_scope(MetricScope::Mixed),
    );
    server.ingest(Sample::counter("counter", vec![], 20.0).with_scope(MetricScope::Mixed));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for local metrics despite bad forward address");

        let batch = tokio::time::timeout(remaining, rx.recv())
            .await
            .expect("timed out waiting for a sink flush")
            .unwrap();
        if !batch.is_empty() {
            assert!(batch.iter().any(|metric| metric.name == "counter"));
            break;
        }
    }

    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn global_instance_finalizes_histograms() {
    let (tx, mut rx) = mpsc::channel(64);

    let mut config = channel_sink_yaml("");
    config.num_workers = 4;
    config.interval = Duration::from_secs(10);
    config.percentiles = vec![];
    config.aggregates = vec![HistogramAggregate::Min];

    let mut server = build_server(config, channel_sink_types(tx));
    server.start().await.unwrap();

    server.ingest(Sample::histogram("histo", vec![], 20.0).with_scope(MetricScope::Mixed));
    server.flush().await;

    let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for the global flush")
        .unwrap();

    assert_eq!(batch.len(), 1, "too many metrics for the global histo flush");
    assert_eq!(batch[0].name, "histo.min");
    assert_eq!(batch[0].value, 20.0);
    assert_eq!(batch[0].kind, InterMetricKind::Gauge);

    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn flush_resets_worker_unique_timeseries() {
    let mut config = test_config();
    config.count_unique_timeseries = true;
    config.num_workers = 2;
    config.interval = Duration::from_secs(60);

    let mut server = build_server(config, MetricSinkTypes::with_builtins());
    server.start().await.unwrap();

    let sample = Sample::histogram("a.b.c", vec![], 1.0).with_scope(MetricScope::Local);
    for worker in server.workers() {
        worker
            .send(SampleTimeseries(sample.clone()))
            .await
            .unwrap();
    }

    for worker in server.workers() {
        let estimate = worker.send(TallyTimeseries).await.unwrap().await.unwrap();
        assert_eq!(estimate, 1);
    }
    assert_eq!(server.tally_timeseries().await, 2);

    server.flush().await;

    for worker in server.workers() {
        let estimate = worker.send(TallyTimeseries).await.unwrap().await.unwrap();
        assert_eq!(estimate, 0);
    }
    assert_eq!(server.tally_timeseries().await, 0);

    server.shutdown();
}

#[test]
fn shaping_matrix_with_status_counters() {
    let _guard = TELEMETRY.lock().unwrap_or_else(|e| e.into_inner());

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let captures = tributary_statsd::with_capturing_test_client(|| {
        rt.block_on(async {
            let (tx, mut rx) = mpsc::channel(64);

            // A uniquely-named sink, so concurrently running tests cannot
            // contribute `flushed_metrics` lines for it.
            let mut config = Config::parse(
                r#"
omit_empty_hostname: true
metric_sinks:
  - kind: channel
    name: shaped
    max_name_length: 11
    max_tag_length: 11
    max_tags: 2
    strip_tags:
      - kind: prefix
        value: foo
features:
  enable_metric_sink_routing: true
metric_sink_routing:
  - name: default
    match:
      - name:
          kind: any
    sinks:
      matched: [shaped]
"#,
            )
            .unwrap();
            config.num_workers = 4;
            config.interval = Duration::from_secs(10);

            let mut server = build_server(config, channel_sink_types(tx));
            server.start().await.unwrap();

            let cases: &[(&str, &[&str], Option<&[&str]>)] = &[
                // Stripping removes the foo tag and the metric passes.
                ("test.metric", &["foo:value1", "bar:value2"], Some(&["bar:value2"])),
                // Name over the limit.
                ("test.longmetric", &["key1:value1", "key2:value2"], None),
                // Too many tags.
                (
                    "test.metric",
                    &["key1:value1", "key2:value2", "key3:value3"],
                    None,
                ),
                // Stripping brings the tag count back under the limit.
                (
                    "test.metric",
                    &["foo:value1", "key2:value2", "key3:value3"],
                    Some(&["key2:value2", "key3:value3"]),
                ),
                // A tag over the length limit.
                (
                    "test.metric",
                    &["key1:long1", "key2:longvalue2", "key3:value3"],
                    None,
                ),
                // Stripping removes the over-length tag.
                (
                    "test.metric",
                    &["foo:longvalue1", "key2:value2", "key3:value3"],
                    Some(&["key2:value2", "key3:value3"]),
                ),
            ];

            for (name, tags, expected) in cases {
                let tags: Vec<String> = tags.iter().map(|tag| (*tag).to_owned()).collect();
                server.ingest(
                    Sample::counter(*name, tags, 1.0).with_scope(MetricScope::Local),
                );
                server.flush().await;

                let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                    .await
                    .expect("timed out waiting for the sink flush")
                    .unwrap();

                match expected {
                    Some(expected_tags) => {
                        assert_eq!(batch.len(), 1, "case {name} {expected_tags:?}");
                        assert_eq!(batch[0].name, *name);
                        let expected_tags: Vec<String> =
                            expected_tags.iter().map(|tag| (*tag).to_owned()).collect();
                        assert_eq!(batch[0].tags, expected_tags);
                    }
                    None => assert!(batch.is_empty(), "case {name} should have been dropped"),
                }
            }

            server.shutdown();
        });
    });

    let status_lines = |value: i64, status: &str| -> usize {
        captures
            .iter()
            .filter(|line| {
                **line
                    == format!(
                        "flushed_metrics:{value}|c|#sink_name:shaped,sink_kind:channel,\
                         status:{status},veneurglobalonly:true"
                    )
            })
            .count()
    };

    // Six flushes, each reporting all five statuses for the sink.
    let total: usize = captures
        .iter()
        .filter(|line| {
            line.starts_with("flushed_metrics:") && line.contains("sink_name:shaped")
        })
        .count();
    assert_eq!(total, 30);

    assert_eq!(status_lines(1, "flushed"), 3);
    assert_eq!(status_lines(1, "max_name_length"), 1);
    assert_eq!(status_lines(1, "max_tags"), 1);
    assert_eq!(status_lines(1, "max_tag_length"), 1);
    assert_eq!(status_lines(1, "skipped"), 0);
    assert_eq!(status_lines(0, "skipped"), 6);
}
