//! Core types, configuration, and tracing setup for Stowage.
//!
//! This crate provides the building blocks shared by the access layer and the
//! object browser: endpoint configuration, project identifiers, secret
//! newtypes that never print their contents, and a single tracing initializer.

mod config;
mod error;
mod telemetry;
mod types;

pub use config::{DEFAULT_KEY_NAME, StowageConfig, parse_bool};
pub use error::{CoreError, CoreResult};
pub use telemetry::init_tracing;
pub use types::{Passphrase, ProjectId, Salt};
