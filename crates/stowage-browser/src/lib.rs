//! Object browser core for Stowage.
//!
//! This crate opens credentialed sessions against an S3-compatible gateway
//! and drives the browser engines on top of them.
//!
//! # Architecture
//!
//! ```text
//! SessionManager ──open──> Session (credential + ClientSlot)
//!                               |
//!          ┌────────────────────┼────────────────────┐
//!          v                    v                    v
//!   ListingEngine         UploadPipeline       DeletionEngine
//!   (tokens, sort,        (multipart, FIFO     (batched, recursive,
//!    versions)             refresh queue)       partial accounting)
//!          \                    |                    /
//!           `──────────> ObjectStore <─────────────'
//!                        (S3Store | MemoryGateway)
//! ```
//!
//! # Modules
//!
//! - [`client`] - Client factory seam and the rotating client slot
//! - [`config`] - Engine tunables
//! - [`deletion`] - Single, bulk and recursive deletion
//! - [`error`] - Browser error types
//! - [`listing`] - Paginated listing engine
//! - [`objects`] - Per-object operations (restore, lock, folders, download)
//! - [`session`] - Session state machine
//! - [`store`] - Object store trait, S3 backend and in-memory gateway
//! - [`upload`] - Upload pipeline

pub mod client;
pub mod config;
pub mod deletion;
pub mod error;
pub mod listing;
pub mod objects;
pub mod session;
pub mod store;
pub mod upload;

pub use client::{ClientFactory, ClientSlot};
pub use config::BrowserConfig;
pub use deletion::{DeletionAccounting, DeletionEngine};
pub use error::{BrowserError, BrowserResult};
pub use listing::{
    ContinuationToken, ContinuationTokenMap, Cursor, EntryKind, ListingEngine, ListingStrategy,
    ObjectEntry, SortDirection, SortKey,
};
pub use objects::ObjectOperations;
pub use session::{Session, SessionManager, SessionState};
pub use store::memory::MemoryGateway;
pub use store::s3::{S3ClientFactory, S3Store};
pub use store::{ObjectStore, StoreError};
pub use upload::{
    BytesSource, FailureKind, FileSource, UploadEvent, UploadFailure, UploadPipeline,
    UploadSource, UploadStatus, UploadTask,
};
