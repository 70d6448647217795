use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use tokio::time::{timeout, MissedTickBehavior};
use tributary_metrics::samplers::SamplerEntry;
use tributary_metrics::{
    wire, FlushWorker, HistogramAggregate, InterMetric, MetricKey, MetricScope, Worker,
    WorkerSnapshot,
};
use tributary_statsd::metric;
use tributary_system::{Addr, ShutdownHandle};

use crate::forward;
use crate::sinks::{MetricSink, ShapeCounts, ShapeStatus, SinkRouter, SinkShaper, SHAPE_STATUSES};
use crate::spans::SpanSink;
use crate::statsd::{ServerCounters, ServerTimers};

/// Fraction of the interval granted to the snapshot phase.
const SNAPSHOT_DEADLINE_FRACTION: f64 = 0.9;

/// Lower bound on the snapshot deadline. Deadlines below scheduler latency
/// would cause every snapshot response to be dropped.
const SNAPSHOT_DEADLINE_FLOOR: Duration = Duration::from_millis(5);

/// One configured metric sink with its shaping rules.
pub(crate) struct SinkEntry {
    pub name: String,
    pub kind: String,
    pub sink: Arc<dyn MetricSink>,
    pub shaper: SinkShaper,
}

/// Drives the flush cycle: snapshot, partition, forward, finalize, dispatch.
pub(crate) struct Flusher {
    pub workers: Vec<Addr<Worker>>,
    pub interval: Duration,
    pub aggregates: Vec<HistogramAggregate>,
    pub percentiles: Vec<f64>,
    /// `Some(interval seconds)` when counters flush as per-second rates.
    pub counter_rate_secs: Option<f64>,
    /// The global instance partials are forwarded to, when configured.
    pub forward_address: Option<String>,
    pub sinks: Vec<SinkEntry>,
    pub span_sinks: Vec<Arc<dyn SpanSink>>,
    pub router: SinkRouter,
    /// Completed cycles, observed by the watchdog.
    pub completed_flushes: AtomicU64,
}

impl Flusher {
    /// Runs one complete flush cycle.
    pub async fn flush(&self) {
        let start = Instant::now();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or_default();

        // Snapshot all workers concurrently. A worker that misses the
        // deadline contributes nothing this interval.
        let deadline = self
            .interval
            .mul_f64(SNAPSHOT_DEADLINE_FRACTION)
            .max(SNAPSHOT_DEADLINE_FLOOR);
        let results = join_all(self.workers.iter().map(|worker| {
            timeout(deadline, async move {
                worker.send(FlushWorker).await.ok()?.await.ok()
            })
        }))
        .await;

        let mut snapshots = Vec::with_capacity(results.len());
        let mut missed = 0i64;
        for result in results {
            match result {
                Ok(Some(snapshot)) => snapshots.push(snapshot),
                _ => missed += 1,
            }
        }

        if missed > 0 {
            tributary_log::warn!(missed, "workers missed the flush deadline");
            metric!(counter(ServerCounters::WorkerFlushMissed) += missed);
        }

        // Assemble: split every aggregated timeseries between the forwarded
        // partials and the locally finalized metrics.
        let forwarding = self.forward_address.is_some();
        let mut local = Vec::new();
        let mut partials = Vec::new();
        for snapshot in snapshots {
            self.partition(snapshot, forwarding, timestamp, &mut local, &mut partials);
        }

        // Forward concurrently with local dispatch. The remaining interval
        // budget is the deadline; dropped batches are not retried.
        if let Some(address) = &self.forward_address {
            if !partials.is_empty() {
                let remaining = self.interval.saturating_sub(start.elapsed());
                tokio::spawn(forward::forward_partials(
                    address.clone(),
                    partials,
                    remaining,
                ));
            }
        }

        self.dispatch(local).await;

        self.completed_flushes.fetch_add(1, Ordering::Relaxed);
        metric!(timer(ServerTimers::FlushDuration) = start.elapsed());
    }

    /// Partitions one worker snapshot by scope.
    ///
    /// Forwarding applies to global-scope timeseries of every kind, and to
    /// mixed-scope rank sketches, which are additionally finalized locally.
    /// With forwarding disabled, everything is finalized locally.
    fn partition(
        &self,
        snapshot: WorkerSnapshot,
        forwarding: bool,
        timestamp: i64,
        local: &mut Vec<InterMetric>,
        partials: &mut Vec<wire::Metric>,
    ) {
        let metrics = snapshot.metrics;

        for entry in metrics.counters.into_values() {
            let SamplerEntry { key, scope, sampler } = entry;
            if forwarding && scope == MetricScope::Global {
                partials.push(make_partial(&key, wire::Kind::Counter, sampler.partial()));
            } else {
                local.extend(sampler.flush(&key, timestamp, self.counter_rate_secs));
            }
        }

        for entry in metrics.gauges.into_values() {
            let SamplerEntry { key, scope, sampler } = entry;
            if forwarding && scope == MetricScope::Global {
                partials.push(make_partial(&key, wire::Kind::Gauge, sampler.partial()));
            } else {
                local.extend(sampler.flush(&key, timestamp));
            }
        }

        for entry in metrics.sets.into_values() {
            let SamplerEntry { key, scope, sampler } = entry;
            if forwarding && scope == MetricScope::Global {
                partials.push(make_partial(&key, wire::Kind::Set, sampler.partial()));
            } else {
                local.extend(sampler.flush(&key, timestamp));
            }
        }

        for entry in metrics.histograms.into_values() {
            self.partition_rank_sketch(entry, wire::Kind::Histogram, forwarding, timestamp, local, partials);
        }

        for entry in metrics.timers.into_values() {
            self.partition_rank_sketch(entry, wire::Kind::Timer, forwarding, timestamp, local, partials);
        }
    }

    fn partition_rank_sketch(
        &self,
        mut entry: SamplerEntry<tributary_metrics::samplers::Histo>,
        kind: wire::Kind,
        forwarding: bool,
        timestamp: i64,
        local: &mut Vec<InterMetric>,
        partials: &mut Vec<wire::Metric>,
    ) {
        let forward_partial = forwarding
            && matches!(entry.scope, MetricScope::Global | MetricScope::Mixed);
        let finalize = !(forwarding && entry.scope == MetricScope::Global);

        if forward_partial {
            partials.push(make_partial(&entry.key, kind, entry.sampler.partial()));
        }

        if finalize {
            local.extend(entry.sampler.flush(
                &entry.key,
                timestamp,
                &self.aggregates,
                &self.percentiles,
            ));
        }
    }

    /// Routes, shapes and delivers the finalized batch to every sink.
    async fn dispatch(&self, local: Vec<InterMetric>) {
        let routes: Vec<BTreeSet<String>> =
            local.iter().map(|metric| self.router.route(metric)).collect();

        let mut deliveries = Vec::with_capacity(self.sinks.len());
        for entry in &self.sinks {
            let mut counts = ShapeCounts::default();
            let mut batch = Vec::new();

            for (metric_, routed) in local.iter().zip(&routes) {
                if !routed.contains(&entry.name) {
                    continue;
                }

                match entry.shaper.shape(metric_) {
                    Ok(shaped) => {
                        counts.record(ShapeStatus::Flushed);
                        batch.push(shaped);
                    }
                    Err(status) => counts.record(status),
                }
            }

            // All five status counters are reported every flush, zeroes
            // included, so dashboards can tell "no drops" from "no data".
            for status in SHAPE_STATUSES {
                metric!(
                    counter(ServerCounters::FlushedMetrics) += counts.get(status),
                    sink_name = entry.name.as_str(),
                    sink_kind = entry.kind.as_str(),
                    status = status.as_str(),
                    veneurglobalonly = "true"
                );
            }

            let sink = Arc::clone(&entry.sink);
            let sink_deadline = self.interval;
            deliveries.push(async move {
                match timeout(sink_deadline, sink.flush(batch)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        tributary_log::warn!(sink = sink.name(), "sink flush failed: {error}");
                    }
                    Err(_elapsed) => {
                        tributary_log::warn!(sink = sink.name(), "sink flush timed out");
                    }
                }
            });
        }

        let span_deliveries = self.span_sinks.iter().map(|sink| {
            let sink = Arc::clone(sink);
            let sink_deadline = self.interval;
            async move {
                match timeout(sink_deadline, sink.flush()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        tributary_log::warn!(sink = sink.name(), "span sink flush failed: {error}");
                    }
                    Err(_elapsed) => {
                        tributary_log::warn!(sink = sink.name(), "span sink flush timed out");
                    }
                }
            }
        });

        futures::future::join(join_all(deliveries), join_all(span_deliveries)).await;
    }
}

fn make_partial(key: &MetricKey, kind: wire::Kind, value: wire::Value) -> wire::Metric {
    wire::Metric {
        name: key.name.clone(),
        tags: key.tags.clone(),
        kind: kind as i32,
        digest: key.digest,
        value: Some(value),
    }
}

/// Spawns the interval timer driving [`Flusher::flush`].
pub(crate) fn spawn_flush_loop(flusher: Arc<Flusher>, mut shutdown: ShutdownHandle) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(flusher.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the first flush should come
        // one full interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,
                _ = ticker.tick() => flusher.flush().await,
            }
        }
    });
}

/// Spawns the flush watchdog, which aborts a wedged process.
pub(crate) fn spawn_watchdog(
    flusher: Arc<Flusher>,
    missed_flushes: usize,
    mut shutdown: ShutdownHandle,
) {
    if missed_flushes == 0 {
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(flusher.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut last = flusher.completed_flushes.load(Ordering::Relaxed);
        let mut stalled = 0usize;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,

                _ = ticker.tick() => {
                    let completed = flusher.completed_flushes.load(Ordering::Relaxed);
                    if completed == last {
                        stalled += 1;
                    } else {
                        stalled = 0;
                        last = completed;
                    }

                    if stalled >= missed_flushes {
                        tributary_log::error!(
                            stalled,
                            "no flush completed, aborting so a supervisor can restart us"
                        );
                        panic!("flush pipeline stalled for {stalled} intervals");
                    }
                }
            }
        }
    });
}
