//! Metric protocol and aggregation for Tributary.
//!
//! Samples are submitted in a text-based protocol based on StatsD:
//!
//! ```text
//! endpoint.response_time:57|ms|#route:user_index
//! endpoint.hits:1|c|@0.5|#route:user_index
//! ```
//!
//! Every sample carries a stable 64-bit [digest](Sample::digest) derived from
//! its name, kind and canonical tags. The digest shards samples across a
//! fixed pool of [workers](WorkerService), so each unique timeseries is owned
//! by exactly one worker and aggregation needs no locks.
//!
//! Within a flush interval, a worker accumulates samples into per-kind
//! [samplers](crate::samplers) with bounded memory: counters fold into a
//! single sum, gauges keep the last value, sets count cardinality in a
//! HyperLogLog sketch, and histograms maintain a t-digest rank sketch. On
//! flush, the worker's state is swapped out atomically and either finalized
//! into flat [`InterMetric`]s or serialized into mergeable
//! [wire partials](crate::wire) for the global tier.
#![warn(missing_docs)]

mod protocol;
mod routing;
mod statsd;
mod worker;

pub mod samplers;
pub mod sketch;
pub mod wire;

pub use protocol::*;
pub use routing::*;
pub use worker::*;
