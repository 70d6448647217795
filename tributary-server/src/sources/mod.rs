//! Sources producing samples into the ingest path.
//!
//! Sources are external collaborators: the server owns the [`Ingest`]
//! facade they publish into and the registry they are built from, but the
//! protocol listeners themselves are pluggable. The built-in `statsd`
//! source listens on the configured UDP and TCP addresses.

use std::collections::HashMap;

use async_trait::async_trait;
use tributary_config::{Config, SourceConfig};
use tributary_system::ShutdownHandle;

use crate::{BoxError, Ingest};

mod statsd;

pub use statsd::*;

/// An error starting a source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// A listener socket could not be bound.
    #[error("could not bind `{address}`: {source}")]
    Bind {
        /// The address that failed to bind.
        address: String,
        /// The underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// The source failed for another reason.
    #[error("source failed: {0}")]
    Other(#[from] BoxError),
}

/// A producer of samples.
#[async_trait]
pub trait Source: Send {
    /// The source's configured name.
    fn name(&self) -> &str;

    /// Binds the source's listeners and spawns its ingest tasks.
    ///
    /// Bind failures surface here so startup can fail hard; everything after
    /// a successful bind runs on background tasks until shutdown.
    async fn start(
        self: Box<Self>,
        ingest: Ingest,
        shutdown: ShutdownHandle,
    ) -> Result<(), SourceError>;
}

/// Factory building one source from its configuration.
pub type SourceFactory =
    Box<dyn Fn(&SourceConfig, &Config) -> Result<Box<dyn Source>, BoxError> + Send + Sync>;

/// Registry of source implementations by kind.
#[derive(Default)]
pub struct SourceTypes {
    factories: HashMap<String, SourceFactory>,
}

impl SourceTypes {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for the given source kind.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn(&SourceConfig, &Config) -> Result<Box<dyn Source>, BoxError>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        self.factories.insert(kind.into(), Box::new(factory));
        self
    }

    /// Builds a source from its configuration.
    pub fn create(
        &self,
        source_config: &SourceConfig,
        config: &Config,
    ) -> Option<Result<Box<dyn Source>, BoxError>> {
        let factory = self.factories.get(&source_config.kind)?;
        Some(factory(source_config, config))
    }

    /// Returns the registry with the built-in sources registered.
    pub fn with_builtins() -> Self {
        let mut types = Self::new();
        types.register("statsd", |source_config, config| {
            Ok(Box::new(StatsdSource::from_config(source_config, config)) as Box<dyn Source>)
        });
        types
    }
}
