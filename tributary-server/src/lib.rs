//! The Tributary server: ingest, aggregation, flushing and delivery.
//!
//! A [`Server`] owns a fixed pool of aggregation workers, the flush
//! controller driving the interval cycle, the forward topology connecting
//! local instances to a global one, and the configured sinks and sources.
//!
//! Data flows `source → ingest → worker`, and on every flush tick
//! `worker snapshots → {forwarded partials | finalized metrics} → sinks`.
#![warn(missing_docs)]

mod flusher;
mod server;
mod statsd;

pub mod forward;
pub mod sinks;
pub mod sources;
pub mod spans;

pub use server::*;

/// A type-erased error produced by sink and source factories.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
