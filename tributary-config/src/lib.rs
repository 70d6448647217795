//! Configuration for the Tributary server.
//!
//! Configuration is a single YAML document with strict keys: unknown keys
//! produce a recoverable [`ConfigError::UnknownKeys`] that still carries the
//! parsed configuration, so operators can choose between warning and failing
//! hard (`--validate-config-strict`).
#![warn(missing_docs)]

mod config;
mod listen;
mod matcher;

pub use config::*;
pub use listen::*;
pub use matcher::*;
