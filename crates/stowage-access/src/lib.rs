//! Scoped access derivation for the Stowage object browser.
//!
//! This crate turns a long-lived project API key into short-lived,
//! permission-scoped S3 gateway credentials.
//!
//! # Overview
//!
//! ```text
//! ProjectApi (console)  --create key-->  ApiKey
//!        |
//!        v
//! CapabilityWorker (own thread)
//!   SetPermission   -> restricted ApiKey (caveat chained)
//!   GenerateAccess  -> access string (key + derived encryption key)
//!        |
//!        v
//! CredentialExchange (gateway auth service) -> GatewayCredential
//! ```
//!
//! # Modules
//!
//! - [`api_key`] - HMAC-chained API keys
//! - [`caveat`] - Permission and time-window restrictions
//! - [`error`] - Access error types
//! - [`exchange`] - Gateway credential exchange
//! - [`grant`] - Access strings and encryption key derivation
//! - [`project`] - Console project API
//! - [`worker`] - The isolated capability worker

pub mod api_key;
pub mod caveat;
pub mod error;
pub mod exchange;
pub mod grant;
pub mod project;
pub mod worker;

pub use api_key::ApiKey;
pub use caveat::{Action, Caveat};
pub use error::{AccessError, AccessResult};
pub use exchange::{AuthServiceClient, CredentialExchange, GatewayCredential};
pub use grant::{AccessGrant, EncryptionKey};
pub use project::{ConsoleClient, MemoryProjectApi, ProjectApi};
pub use worker::{CapabilityWorker, WorkerReply, WorkerRequest};
