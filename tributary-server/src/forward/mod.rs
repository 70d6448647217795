//! The forward topology connecting local instances to a global one.
//!
//! A local instance streams the mergeable partial state of its aggregators
//! to the configured global instance once per flush, as length-delimited
//! protobuf frames over TCP. The global side merges each partial into its
//! own workers and replies with the number of accepted partials.
//!
//! Forwarding is at-most-once: a partial batch that misses its deadline or
//! fails in transit is dropped, counted, and never retried.

mod client;
mod server;

pub use client::*;
pub use server::*;
