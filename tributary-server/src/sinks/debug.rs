use async_trait::async_trait;
use tributary_metrics::InterMetric;

use super::{MetricSink, SinkError};

/// Logs every finalized batch instead of delivering it anywhere.
pub struct DebugSink {
    name: String,
}

impl DebugSink {
    /// Creates a debug sink.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl MetricSink for DebugSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "debug"
    }

    async fn flush(&self, metrics: Vec<InterMetric>) -> Result<(), SinkError> {
        tributary_log::info!(
            sink = self.name.as_str(),
            count = metrics.len(),
            "flushing metrics"
        );

        for metric in &metrics {
            tributary_log::debug!(
                name = metric.name.as_str(),
                value = metric.value,
                tags = metric.tags.join(",").as_str(),
                "flushed metric"
            );
        }

        Ok(())
    }
}
