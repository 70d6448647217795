//! The span sink seam.
//!
//! Trace spans bypass aggregation entirely: the server hands each ingested
//! span to every configured span sink, which buffers it until the next
//! flush tick drains the buffer alongside the metric sinks.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tributary_config::{Config, SinkConfig};

use crate::sinks::SinkError;
use crate::BoxError;

/// One ingested trace span.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceSpan {
    /// The trace this span belongs to.
    pub trace_id: u64,
    /// This span's id.
    pub span_id: u64,
    /// The parent span's id, zero for a root span.
    pub parent_id: u64,
    /// The service that produced the span.
    pub service: String,
    /// The operation name.
    pub name: String,
    /// Start time, nanoseconds since the epoch.
    pub start_timestamp: i64,
    /// End time, nanoseconds since the epoch.
    pub end_timestamp: i64,
    /// Whether the operation errored.
    pub error: bool,
    /// Tags in `k:v` form.
    pub tags: Vec<String>,
}

/// A downstream destination for trace spans.
#[async_trait]
pub trait SpanSink: Send + Sync {
    /// The sink's configured name.
    fn name(&self) -> &str;

    /// The sink implementation kind.
    fn kind(&self) -> &str;

    /// Accepts one span into the sink's buffer.
    fn ingest(&self, span: TraceSpan);

    /// Drains the buffer at the flush tick.
    async fn flush(&self) -> Result<(), SinkError>;
}

/// Factory building one span sink from its configuration.
pub type SpanSinkFactory =
    Box<dyn Fn(&SinkConfig, &Config) -> Result<Box<dyn SpanSink>, BoxError> + Send + Sync>;

/// Registry of span sink implementations by kind.
#[derive(Default)]
pub struct SpanSinkTypes {
    factories: HashMap<String, SpanSinkFactory>,
}

impl SpanSinkTypes {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for the given span sink kind.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn(&SinkConfig, &Config) -> Result<Box<dyn SpanSink>, BoxError>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        self.factories.insert(kind.into(), Box::new(factory));
        self
    }

    /// Builds a span sink from its configuration.
    pub fn create(
        &self,
        sink_config: &SinkConfig,
        config: &Config,
    ) -> Option<Result<Box<dyn SpanSink>, BoxError>> {
        let factory = self.factories.get(&sink_config.kind)?;
        Some(factory(sink_config, config))
    }

    /// Returns the registry with the built-in span sinks registered.
    pub fn with_builtins() -> Self {
        let mut types = Self::new();
        types.register("debug", |sink_config, _config| {
            Ok(Box::new(DebugSpanSink::new(sink_config.display_name())) as Box<dyn SpanSink>)
        });
        types
    }
}

/// Logs the spans of every flush instead of delivering them anywhere.
pub struct DebugSpanSink {
    name: String,
    buffer: Mutex<Vec<TraceSpan>>,
}

impl DebugSpanSink {
    /// Creates a debug span sink.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffer: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SpanSink for DebugSpanSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "debug"
    }

    fn ingest(&self, span: TraceSpan) {
        self.buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(span);
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let spans = std::mem::take(
            &mut *self
                .buffer
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );

        tributary_log::info!(
            sink = self.name.as_str(),
            count = spans.len(),
            "flushing spans"
        );

        for span in &spans {
            tributary_log::debug!(
                service = span.service.as_str(),
                name = span.name.as_str(),
                trace_id = span.trace_id,
                "flushed span"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(name: &str) -> TraceSpan {
        TraceSpan {
            trace_id: 1,
            span_id: 2,
            parent_id: 0,
            service: "api".to_owned(),
            name: name.to_owned(),
            start_timestamp: 0,
            end_timestamp: 1,
            error: false,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn debug_sink_drains_on_flush() {
        let sink = DebugSpanSink::new("debug");
        sink.ingest(span("a"));
        sink.ingest(span("b"));

        sink.flush().await.unwrap();
        assert!(sink.buffer.lock().unwrap().is_empty());
    }
}
