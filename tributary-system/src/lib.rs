//! Foundational framework for the services that make up Tributary.
//!
//! Services are spawned tasks that communicate exclusively through message
//! channels. Each service declares an [`Interface`] enumerating the messages
//! it handles; an [`Addr`] is the cloneable handle used to send them. All
//! channels are bounded, so producers either wait for capacity
//! ([`Addr::send`]) or observe backpressure immediately ([`Addr::try_send`]).
#![warn(missing_docs)]

mod service;
mod shutdown;

pub use service::*;
pub use shutdown::*;
