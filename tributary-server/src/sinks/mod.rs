//! Metric sinks and per-sink routing and shaping.
//!
//! A sink receives a batch of finalized metrics once per flush. Sinks are
//! flushed in parallel under a per-sink deadline; one sink's failure never
//! affects another. Concrete sinks register through [`MetricSinkTypes`], the
//! way the binary wires built-ins and embedders add their own.

use std::collections::HashMap;

use async_trait::async_trait;
use tributary_config::{Config, SinkConfig};
use tributary_metrics::InterMetric;

use crate::BoxError;

mod channel;
mod debug;
mod routing;

pub use channel::*;
pub use debug::*;
pub use routing::*;

/// An error delivering a batch to one sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The delivery did not complete within the flush deadline.
    #[error("sink flush timed out")]
    Timeout,
    /// The sink's transport failed.
    #[error("sink transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// The sink's receiver is gone.
    #[error("sink receiver closed")]
    Closed,
}

/// A downstream destination for finalized metrics.
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// The sink's configured name, used in routing and telemetry.
    fn name(&self) -> &str;

    /// The sink implementation kind, used in telemetry.
    fn kind(&self) -> &str;

    /// Delivers one flush interval's batch.
    ///
    /// Batches may be empty; sinks should deliver them anyway so downstream
    /// consumers observe the flush cadence. Batches of overlapping intervals
    /// may be in flight concurrently.
    async fn flush(&self, metrics: Vec<InterMetric>) -> Result<(), SinkError>;
}

/// Factory building one metric sink from its configuration.
pub type MetricSinkFactory =
    Box<dyn Fn(&SinkConfig, &Config) -> Result<Box<dyn MetricSink>, BoxError> + Send + Sync>;

/// Registry of metric sink implementations by kind.
#[derive(Default)]
pub struct MetricSinkTypes {
    factories: HashMap<String, MetricSinkFactory>,
}

impl MetricSinkTypes {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for the given sink kind.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn(&SinkConfig, &Config) -> Result<Box<dyn MetricSink>, BoxError>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        self.factories.insert(kind.into(), Box::new(factory));
        self
    }

    /// Builds a sink from its configuration.
    pub fn create(
        &self,
        sink_config: &SinkConfig,
        config: &Config,
    ) -> Option<Result<Box<dyn MetricSink>, BoxError>> {
        let factory = self.factories.get(&sink_config.kind)?;
        Some(factory(sink_config, config))
    }

    /// Returns the registry with the built-in sinks registered.
    pub fn with_builtins() -> Self {
        let mut types = Self::new();
        types.register("debug", |sink_config, _config| {
            Ok(Box::new(DebugSink::new(sink_config.display_name())) as Box<dyn MetricSink>)
        });
        types
    }
}
