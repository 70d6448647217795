//! The tiered local/global topology, end to end.

use std::time::Duration;

use tokio::sync::mpsc;
use tributary_config::Config;
use tributary_metrics::{HistogramAggregate, InterMetric, MetricScope, Sample};
use tributary_server::sinks::{ChannelSink, MetricSink, MetricSinkTypes};
use tributary_server::sources::SourceTypes;
use tributary_server::spans::SpanSinkTypes;
use tributary_server::{Server, ServerConfig};

fn build_server(config: Config, metric_sink_types: MetricSinkTypes) -> Server {
    Server::new(ServerConfig {
        config,
        source_types: SourceTypes::with_builtins(),
        metric_sink_types,
        span_sink_types: SpanSinkTypes::with_builtins(),
    })
    .unwrap()
}

fn channel_sink_types(tx: mpsc::Sender<Vec<InterMetric>>) -> MetricSinkTypes {
    let mut types = MetricSinkTypes::with_builtins();
    types.register("channel", move |sink_config, _config| {
        Ok(Box::new(ChannelSink::named(sink_config.display_name(), tx.clone()))
            as Box<dyn MetricSink>)
    });
    types
}

#[tokio::test(flavor = "multi_thread")]
async fn local_partials_finalize_at_the_global_tier() {
    let (tx, mut rx) = mpsc::channel(64);

    // The global instance: listens for partials, finalizes on flush.
    let mut global_config = Config::parse(
        "omit_empty_hostname: true\nmetric_sinks:\n  - kind: channel\n    name: channel",
    )
    .unwrap();
    global_config.num_workers = 4;
    global_config.interval = Duration::from_secs(10);
    global_config.forward_listen_address = "127.0.0.1:0".to_owned();
    global_config.percentiles = vec![0.5];
    global_config.aggregates = vec![HistogramAggregate::Max, HistogramAggregate::Count];

    let mut global = build_server(global_config, channel_sink_types(tx));
    global.start().await.unwrap();
    let listen_addr = global.forward_listen_addr().unwrap();

    // The local instance: forwards its global-scope aggregates.
    let mut local_config = Config::parse("omit_empty_hostname: true").unwrap();
    local_config.num_workers = 2;
    local_config.interval = Duration::from_secs(10);
    local_config.forward_address = listen_addr.to_string();

    let mut local = build_server(local_config, MetricSinkTypes::with_builtins());
    local.start().await.unwrap();

    // Two local views of the same timeseries, as two hosts would produce.
    local.ingest(Sample::histogram("api.latency", vec![], 10.0).with_scope(MetricScope::Global));
    local.ingest(Sample::histogram("api.latency", vec![], 30.0).with_scope(MetricScope::Global));
    local.ingest(Sample::counter("api.hits", vec![], 5.0).with_scope(MetricScope::Global));
    local.flush().await;

    // Forwarding completes asynchronously; poll the global flush until the
    // merged aggregates appear.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let batch = loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for the global tier to finalize the partials"
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        global.flush().await;

        let batch = rx.recv().await.unwrap();
        if !batch.is_empty() {
            break batch;
        }
    };

    let find = |name: &str| {
        batch
            .iter()
            .find(|metric| metric.name == name)
            .unwrap_or_else(|| panic!("missing {name} in {batch:?}"))
    };

    assert_eq!(find("api.latency.max").value, 30.0);
    assert_eq!(find("api.latency.count").value, 2.0);
    assert_eq!(find("api.latency.50percentile").value, 20.0);
    assert_eq!(find("api.hits").value, 5.0);

    // Nothing was finalized on the local instance, and the global tier has
    // consumed its state: the next flush is empty again.
    global.flush().await;
    assert!(rx.recv().await.unwrap().is_empty());

    local.shutdown();
    global.shutdown();
}
