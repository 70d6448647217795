//! Logging for the Tributary services.
//!
//! Every crate in the workspace logs through the macros re-exported here, so
//! that the subscriber can be swapped without touching call sites. The
//! subscriber itself is configured once at startup via [`init`].
#![warn(missing_docs)]

mod setup;

pub use setup::*;
#[doc(hidden)]
pub use test::*;

// Expose the tracing macros under this crate's namespace.
pub use tracing::{debug, error, info, trace, warn};
