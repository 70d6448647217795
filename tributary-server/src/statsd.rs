use tributary_statsd::{CounterMetric, TimerMetric};

/// Counter metrics emitted by the server.
pub enum ServerCounters {
    /// Per-sink, per-status delivery counters, emitted once per flush for
    /// every status.
    FlushedMetrics,
    /// Workers that missed the snapshot deadline this interval.
    WorkerFlushMissed,
    /// Samples dropped at ingest because a worker's queue was full.
    SamplesDropped,
    /// Samples dropped before aggregation, tagged with `reason`.
    SamplesRejected,
    /// Forward attempts that failed, tagged with `cause`.
    ForwardErrorTotal,
}

impl CounterMetric for ServerCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::FlushedMetrics => "flushed_metrics",
            Self::WorkerFlushMissed => "worker_flush_missed",
            Self::SamplesDropped => "samples_dropped",
            Self::SamplesRejected => "samples_rejected",
            Self::ForwardErrorTotal => "forward.error_total",
        }
    }
}

/// Timer metrics emitted by the server.
pub enum ServerTimers {
    /// Wall time of one complete flush cycle.
    FlushDuration,
}

impl TimerMetric for ServerTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::FlushDuration => "flush.total_duration",
        }
    }
}
