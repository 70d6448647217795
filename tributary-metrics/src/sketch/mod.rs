//! Bounded-memory sketches backing the set and histogram samplers.

mod hll;
mod tdigest;

pub use hll::*;
pub use tdigest::*;

/// An error when combining or decoding sketches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SketchError {
    /// Two sketches with different parameters cannot be merged.
    #[error("sketch parameters do not match")]
    ParameterMismatch,
    /// The encoded sketch state is malformed.
    #[error("invalid encoded sketch state")]
    InvalidState,
}
