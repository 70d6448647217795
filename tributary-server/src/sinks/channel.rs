use async_trait::async_trait;
use tokio::sync::mpsc;
use tributary_metrics::InterMetric;

use super::{MetricSink, SinkError};

/// Delivers finalized batches into an in-process channel.
///
/// Used by the test suite and by embedders that consume metrics directly.
pub struct ChannelSink {
    name: String,
    tx: mpsc::Sender<Vec<InterMetric>>,
}

impl ChannelSink {
    /// Creates a channel sink named `channel`.
    pub fn new(tx: mpsc::Sender<Vec<InterMetric>>) -> Self {
        Self::named("channel", tx)
    }

    /// Creates a channel sink with an explicit name.
    pub fn named(name: impl Into<String>, tx: mpsc::Sender<Vec<InterMetric>>) -> Self {
        Self {
            name: name.into(),
            tx,
        }
    }
}

#[async_trait]
impl MetricSink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "channel"
    }

    async fn flush(&self, metrics: Vec<InterMetric>) -> Result<(), SinkError> {
        self.tx.send(metrics).await.map_err(|_| SinkError::Closed)
    }
}
