//! steer-core — shared types and configuration for Steer.
//!
//! Steer routes live video sessions across a pool of CDN backends. This
//! crate holds the vocabulary every other crate speaks: backend classes,
//! ranking criteria, identifiers, and the `steer.toml` configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::SteerConfig;
pub use error::ConfigError;
pub use types::*;
