use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::net::TcpListener;
use tributary_config::Config;
use tributary_metrics::{
    worker_index, ProcessSample, Sample, SampleTimeseries, TallyTimeseries, Worker, WorkerService,
};
use tributary_statsd::metric;
use tributary_system::{Addr, Service, ShutdownController};

use crate::flusher::{spawn_flush_loop, spawn_watchdog, Flusher, SinkEntry};
use crate::forward;
use crate::sinks::{MetricSinkTypes, SinkRouter, SinkShaper};
use crate::sources::{Source, SourceError, SourceTypes};
use crate::spans::{SpanSink, SpanSinkTypes, TraceSpan};
use crate::statsd::ServerCounters;
use crate::BoxError;

/// Everything needed to build a [`Server`].
///
/// The registries map configured `kind`s to implementations; the binary
/// registers the built-ins and embedders add their own.
pub struct ServerConfig {
    /// The parsed YAML configuration.
    pub config: Config,
    /// Source implementations by kind.
    pub source_types: SourceTypes,
    /// Metric sink implementations by kind.
    pub metric_sink_types: MetricSinkTypes,
    /// Span sink implementations by kind.
    pub span_sink_types: SpanSinkTypes,
}

/// An error building or starting a [`Server`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// A configured sink kind has no registered implementation.
    #[error("unknown sink kind `{kind}`")]
    UnknownSinkKind {
        /// The unknown kind.
        kind: String,
    },

    /// A sink factory failed.
    #[error("could not build sink `{name}`")]
    SinkBuild {
        /// The sink's name.
        name: String,
        /// The factory error.
        #[source]
        source: BoxError,
    },

    /// A configured source kind has no registered implementation.
    #[error("unknown source kind `{kind}`")]
    UnknownSourceKind {
        /// The unknown kind.
        kind: String,
    },

    /// A source factory failed.
    #[error("could not build source `{name}`")]
    SourceBuild {
        /// The source's name.
        name: String,
        /// The factory error.
        #[source]
        source: BoxError,
    },

    /// A source failed to start.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The forward listener could not be bound.
    #[error("could not bind forward listener `{address}`")]
    Bind {
        /// The address that failed to bind.
        address: String,
        /// The underlying socket error.
        #[source]
        source: std::io::Error,
    },
}

impl ServerError {
    /// Returns `true` for listener bind failures, which map to their own
    /// exit code.
    pub fn is_bind_failure(&self) -> bool {
        matches!(
            self,
            Self::Bind { .. } | Self::Source(SourceError::Bind { .. })
        )
    }
}

/// The handle sources publish samples through.
///
/// Routes each sample to the worker owning its digest. Publishing never
/// blocks: when the worker's inbound channel is full the sample is dropped
/// and counted on `samples_dropped`.
#[derive(Clone)]
pub struct Ingest {
    workers: Arc<Vec<Addr<Worker>>>,
    count_unique_timeseries: bool,
}

impl Ingest {
    /// Publishes one sample towards its owning worker.
    pub fn ingest(&self, sample: Sample) {
        let index = worker_index(sample.digest, self.workers.len());
        let worker = &self.workers[index];

        if self.count_unique_timeseries {
            // Cardinality accounting is best-effort and must never add
            // backpressure of its own.
            worker.try_send(SampleTimeseries(sample.clone())).ok();
        }

        if worker.try_send(ProcessSample(sample)).is_err() {
            metric!(counter(ServerCounters::SamplesDropped) += 1);
        }
    }
}

/// The assembled metrics pipeline.
pub struct Server {
    config: Config,
    workers: Arc<Vec<Addr<Worker>>>,
    ingest: Ingest,
    flusher: Arc<Flusher>,
    shutdown: ShutdownController,
    sources: Vec<Box<dyn Source>>,
    span_sinks: Vec<Arc<dyn SpanSink>>,
    forward_listen_addr: Option<std::net::SocketAddr>,
}

impl Server {
    /// Builds the pipeline: workers, sinks, sources and the flush plan.
    ///
    /// Nothing is bound or spawned beyond the worker tasks until
    /// [`start`](Self::start).
    pub fn new(server_config: ServerConfig) -> Result<Self, ServerError> {
        let ServerConfig {
            config,
            source_types,
            metric_sink_types,
            span_sink_types,
        } = server_config;

        let workers: Vec<Addr<Worker>> = (0..config.num_workers)
            .map(|index| {
                WorkerService::new(index, config.count_unique_timeseries)
                    .start_with_capacity(config.worker_queue_size)
            })
            .collect();

        let mut sinks = Vec::with_capacity(config.metric_sinks.len());
        for sink_config in &config.metric_sinks {
            let sink = metric_sink_types
                .create(sink_config, &config)
                .ok_or_else(|| ServerError::UnknownSinkKind {
                    kind: sink_config.kind.clone(),
                })?
                .map_err(|source| ServerError::SinkBuild {
                    name: sink_config.display_name().to_owned(),
                    source,
                })?;

            sinks.push(SinkEntry {
                name: sink_config.display_name().to_owned(),
                kind: sink_config.kind.clone(),
                sink: Arc::from(sink),
                shaper: SinkShaper::new(sink_config),
            });
        }

        let mut span_sinks: Vec<Arc<dyn SpanSink>> = Vec::with_capacity(config.span_sinks.len());
        for sink_config in &config.span_sinks {
            let sink = span_sink_types
                .create(sink_config, &config)
                .ok_or_else(|| ServerError::UnknownSinkKind {
                    kind: sink_config.kind.clone(),
                })?
                .map_err(|source| ServerError::SinkBuild {
                    name: sink_config.display_name().to_owned(),
                    source,
                })?;
            span_sinks.push(Arc::from(sink));
        }

        let mut sources = Vec::with_capacity(config.sources.len());
        for source_config in &config.sources {
            let source = source_types
                .create(source_config, &config)
                .ok_or_else(|| ServerError::UnknownSourceKind {
                    kind: source_config.kind.clone(),
                })?
                .map_err(|source| ServerError::SourceBuild {
                    name: source_config.name.clone(),
                    source,
                })?;
            sources.push(source);
        }

        let router = SinkRouter::new(
            config.features.enable_metric_sink_routing,
            config.metric_sink_routing.clone(),
            sinks.iter().map(|entry| entry.name.clone()),
        );

        let flusher = Arc::new(Flusher {
            workers: workers.clone(),
            interval: config.interval,
            aggregates: config.aggregates.clone(),
            percentiles: config.percentiles.clone(),
            counter_rate_secs: config
                .flush_counters_as_rate
                .then(|| config.interval.as_secs_f64()),
            forward_address: (!config.forward_address.is_empty())
                .then(|| config.forward_address.clone()),
            sinks,
            span_sinks: span_sinks.clone(),
            router,
            completed_flushes: AtomicU64::new(0),
        });

        let workers = Arc::new(workers);
        let ingest = Ingest {
            workers: Arc::clone(&workers),
            count_unique_timeseries: config.count_unique_timeseries,
        };

        Ok(Self {
            config,
            workers,
            ingest,
            flusher,
            shutdown: ShutdownController::new(),
            sources,
            span_sinks,
            forward_listen_addr: None,
        })
    }

    /// Binds listeners and spawns the long-lived tasks.
    ///
    /// Bind failures are fatal; the caller maps them to the bind exit code.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if !self.config.forward_listen_address.is_empty() {
            let address = self.config.forward_listen_address.clone();
            let listener =
                TcpListener::bind(&address)
                    .await
                    .map_err(|source| ServerError::Bind {
                        address: address.clone(),
                        source,
                    })?;
            self.forward_listen_addr = listener.local_addr().ok();
            tributary_log::info!(
                address = address.as_str(),
                "listening for forwarded partials"
            );
            forward::spawn_forward_listener(
                listener,
                (*self.workers).clone(),
                self.shutdown.handle(),
            );
        }

        for source in self.sources.drain(..) {
            let name = source.name().to_owned();
            source
                .start(self.ingest.clone(), self.shutdown.handle())
                .await?;
            tributary_log::info!(source = name.as_str(), "started source");
        }

        spawn_flush_loop(Arc::clone(&self.flusher), self.shutdown.handle());
        spawn_watchdog(
            Arc::clone(&self.flusher),
            self.config.flush_watchdog_missed_flushes,
            self.shutdown.handle(),
        );

        tributary_log::info!(
            workers = self.config.num_workers,
            interval = format!("{:?}", self.config.interval).as_str(),
            "server started"
        );

        Ok(())
    }

    /// Publishes one sample into the pipeline.
    pub fn ingest(&self, sample: Sample) {
        self.ingest.ingest(sample);
    }

    /// Returns a cloneable ingest handle for sources and embedders.
    pub fn ingest_handle(&self) -> Ingest {
        self.ingest.clone()
    }

    /// Hands one span to every configured span sink.
    pub fn ingest_span(&self, span: TraceSpan) {
        for sink in &self.span_sinks {
            sink.ingest(span.clone());
        }
    }

    /// Runs one flush cycle immediately, outside the timer.
    pub async fn flush(&self) {
        self.flusher.flush().await;
    }

    /// Sums the unique-timeseries estimates across all workers.
    ///
    /// Sharding keys timeseries by digest, so per-worker estimates are over
    /// disjoint sets and their sum estimates the instance total.
    pub async fn tally_timeseries(&self) -> u64 {
        let mut total = 0;
        for worker in self.workers.iter() {
            if let Ok(response) = worker.send(TallyTimeseries).await {
                if let Ok(estimate) = response.await {
                    total += estimate;
                }
            }
        }
        total
    }

    /// The worker pool, indexed by shard.
    pub fn workers(&self) -> &[Addr<Worker>] {
        &self.workers
    }

    /// The bound forward listener address, once [`start`](Self::start) has
    /// run on a global instance.
    pub fn forward_listen_addr(&self) -> Option<std::net::SocketAddr> {
        self.forward_listen_addr
    }

    /// The server's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Signals every task to stop. In-flight flushes complete; no final
    /// flush is forced.
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }
}
