use std::panic::{catch_unwind, AssertUnwindSafe};

use tributary_statsd::metric;
use tributary_system::{
    AsyncResponse, FromMessage, Interface, NoResponse, Receiver, Sender, Service,
};

use crate::samplers::{RejectReason, WorkerMetrics};
use crate::sketch::HyperLogLog;
use crate::statsd::{MetricCounters, MetricGauges};
use crate::{wire, Sample};

/// Aggregates one sample into the worker's shard.
#[derive(Debug)]
pub struct ProcessSample(pub Sample);

/// Tallies a sample's digest into the unique-timeseries estimator without
/// aggregating it. Used by ingest to track cardinality pressure.
#[derive(Debug)]
pub struct SampleTimeseries(pub Sample);

/// Merges a forwarded partial into the worker's shard.
#[derive(Debug)]
pub struct MergePartial(pub wire::Metric);

/// Snapshots and resets the worker's state.
///
/// Issued only by the flush controller. Because the flush request travels on
/// the same channel as samples, the snapshot is serialized with ingest
/// without locks.
#[derive(Debug)]
pub struct FlushWorker;

/// Reads the unique-timeseries estimate without resetting it.
#[derive(Debug)]
pub struct TallyTimeseries;

/// The state captured from one worker at flush.
#[derive(Debug)]
pub struct WorkerSnapshot {
    /// The worker's aggregator maps, frozen at the flush boundary.
    pub metrics: WorkerMetrics,
    /// The unique-timeseries estimate for the closed interval.
    pub unique_timeseries: u64,
}

/// Worker service interface.
#[derive(Debug)]
pub enum Worker {
    /// See [`ProcessSample`].
    Process(ProcessSample),
    /// See [`SampleTimeseries`].
    SampleTimeseries(SampleTimeseries),
    /// See [`MergePartial`].
    MergePartial(MergePartial),
    /// See [`FlushWorker`].
    Flush(FlushWorker, Sender<WorkerSnapshot>),
    /// See [`TallyTimeseries`].
    Tally(TallyTimeseries, Sender<u64>),
}

impl Interface for Worker {}

impl FromMessage<ProcessSample> for Worker {
    type Response = NoResponse;

    fn from_message(message: ProcessSample, _: ()) -> Self {
        Self::Process(message)
    }
}

impl FromMessage<SampleTimeseries> for Worker {
    type Response = NoResponse;

    fn from_message(message: SampleTimeseries, _: ()) -> Self {
        Self::SampleTimeseries(message)
    }
}

impl FromMessage<MergePartial> for Worker {
    type Response = NoResponse;

    fn from_message(message: MergePartial, _: ()) -> Self {
        Self::MergePartial(message)
    }
}

impl FromMessage<FlushWorker> for Worker {
    type Response = AsyncResponse<WorkerSnapshot>;

    fn from_message(message: FlushWorker, sender: Sender<WorkerSnapshot>) -> Self {
        Self::Flush(message, sender)
    }
}

impl FromMessage<TallyTimeseries> for Worker {
    type Response = AsyncResponse<u64>;

    fn from_message(message: TallyTimeseries, sender: Sender<u64>) -> Self {
        Self::Tally(message, sender)
    }
}

/// A worker owning one shard of the timeseries space.
///
/// The worker's aggregator state is touched only by the worker's own task:
/// ingest, partial merges and flush requests all arrive as messages on one
/// bounded channel and are applied in channel order.
#[derive(Debug)]
pub struct WorkerService {
    index: usize,
    metrics: WorkerMetrics,
    unique_mts: HyperLogLog,
    count_unique_timeseries: bool,
}

impl WorkerService {
    /// Creates the worker for the given pool index.
    pub fn new(index: usize, count_unique_timeseries: bool) -> Self {
        Self {
            index,
            metrics: WorkerMetrics::default(),
            unique_mts: HyperLogLog::new(),
            count_unique_timeseries,
        }
    }

    fn handle_process(&mut self, sample: Sample) {
        // A panic inside a sampler must not take the worker down. The
        // offending aggregator is dropped and the worker continues.
        let outcome = catch_unwind(AssertUnwindSafe(|| self.metrics.ingest(&sample)));

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                tributary_log::error!(
                    metric = sample.name.as_str(),
                    worker = self.index,
                    "aggregation panicked, dropping aggregator"
                );
                self.metrics.remove(sample.kind, sample.digest);
                Err(RejectReason::Panic)
            }
        };

        if let Err(reason) = result {
            metric!(
                counter(MetricCounters::SamplesRejected) += 1,
                reason = reason.as_str()
            );
        }
    }

    fn handle_sample_timeseries(&mut self, sample: &Sample) {
        if self.count_unique_timeseries {
            self.unique_mts.insert_hash(sample.digest);
        }
    }

    fn handle_merge_partial(&mut self, partial: wire::Metric) {
        if let Err(error) = self.metrics.merge_partial(&partial) {
            tributary_log::warn!(
                metric = partial.name.as_str(),
                worker = self.index,
                "dropping unmergeable partial: {error}"
            );
            metric!(
                counter(MetricCounters::SamplesRejected) += 1,
                reason = "invalid_partial"
            );
        }
    }

    fn handle_flush(&mut self) -> WorkerSnapshot {
        let metrics = std::mem::take(&mut self.metrics);
        let unique_timeseries = self.unique_mts.estimate();
        self.unique_mts.clear();

        if self.count_unique_timeseries {
            let worker = self.index.to_string();
            metric!(
                gauge(MetricGauges::UniqueTimeseries) = unique_timeseries as f64,
                worker = worker.as_str()
            );
        }

        WorkerSnapshot {
            metrics,
            unique_timeseries,
        }
    }

    fn handle_message(&mut self, message: Worker) {
        match message {
            Worker::Process(ProcessSample(sample)) => self.handle_process(sample),
            Worker::SampleTimeseries(SampleTimeseries(sample)) => {
                self.handle_sample_timeseries(&sample)
            }
            Worker::MergePartial(MergePartial(partial)) => self.handle_merge_partial(partial),
            Worker::Flush(FlushWorker, sender) => sender.send(self.handle_flush()),
            Worker::Tally(TallyTimeseries, sender) => sender.send(self.unique_mts.estimate()),
        }
    }
}

impl Service for WorkerService {
    type Interface = Worker;

    fn spawn_handler(mut self, mut rx: Receiver<Self::Interface>) {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                self.handle_message(message);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MetricScope, MetricValue, MetricKind};

    #[tokio::test]
    async fn flush_swaps_state() {
        let addr = WorkerService::new(0, false).start();

        addr.send(ProcessSample(Sample::counter("api.hits", vec![], 2.0)))
            .await
            .unwrap();
        addr.send(ProcessSample(Sample::counter("api.hits", vec![], 3.0)))
            .await
            .unwrap();

        let snapshot = addr.send(FlushWorker).await.unwrap().await.unwrap();
        assert_eq!(snapshot.metrics.counters.len(), 1);
        let entry = snapshot.metrics.counters.values().next().unwrap();
        assert_eq!(entry.sampler.value(), 5);

        // The worker starts the next interval empty.
        let snapshot = addr.send(FlushWorker).await.unwrap().await.unwrap();
        assert!(snapshot.metrics.is_empty());
    }

    #[tokio::test]
    async fn flush_resets_unique_timeseries() {
        let addr = WorkerService::new(0, true).start();

        let sample = Sample::histogram("a.b.c", vec![], 1.0).with_scope(MetricScope::Local);
        addr.send(SampleTimeseries(sample)).await.unwrap();

        let estimate = addr.send(TallyTimeseries).await.unwrap().await.unwrap();
        assert_eq!(estimate, 1);

        let snapshot = addr.send(FlushWorker).await.unwrap().await.unwrap();
        assert_eq!(snapshot.unique_timeseries, 1);
        // SampleTimeseries does not aggregate.
        assert!(snapshot.metrics.is_empty());

        let estimate = addr.send(TallyTimeseries).await.unwrap().await.unwrap();
        assert_eq!(estimate, 0);
    }

    #[test]
    fn rejected_samples_are_counted() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let captures = tributary_statsd::with_capturing_test_client(|| {
            rt.block_on(async {
                let addr = WorkerService::new(0, false).start();
                let event = Sample::new(
                    "deploy",
                    MetricKind::Event,
                    vec![],
                    MetricValue::Text("v2".to_owned()),
                );
                addr.send(ProcessSample(event)).await.unwrap();
                // The flush response serializes behind the rejected sample.
                addr.send(FlushWorker).await.unwrap().await.unwrap();
            });
        });

        assert!(captures.iter().any(|line| {
            line.starts_with("samples_rejected:1|c") && line.contains("reason:unsupported")
        }));
    }

    #[tokio::test]
    async fn merge_partial_participates_in_flush() {
        let addr = WorkerService::new(0, false).start();

        addr.send(MergePartial(wire::Metric {
            name: "api.hits".to_owned(),
            tags: vec![],
            kind: wire::Kind::Counter as i32,
            digest: 7,
            value: Some(wire::Value::Counter(4)),
        }))
        .await
        .unwrap();

        let snapshot = addr.send(FlushWorker).await.unwrap().await.unwrap();
        assert_eq!(snapshot.metrics.counters[&7].sampler.value(), 4);
    }
}
