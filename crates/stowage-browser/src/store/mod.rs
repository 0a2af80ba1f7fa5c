//! Object store seam.
//!
//! [`ObjectStore`] is the subset of the S3 API the browser uses. Two
//! implementations exist: [`s3::S3Store`] talks to a real gateway through
//! `aws-sdk-s3`, and [`memory::MemoryGateway`] keeps everything in process.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

pub mod memory;
pub mod s3;

/// Zero-byte object that marks an otherwise empty folder. Never shown.
pub const FOLDER_PLACEHOLDER: &str = ".file_placeholder";

/// Maximum number of keys per `DeleteObjects` call.
pub const MAX_DELETE_BATCH: usize = 1000;

/// Path delimiter.
pub const DELIMITER: &str = "/";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A failed object store call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed: {message}")]
pub struct StoreError {
    /// Operation name (e.g. `"PutObject"`).
    pub operation: &'static str,
    /// S3 error code, when the backend returned one.
    pub code: Option<String>,
    /// Error message.
    pub message: String,
}

impl StoreError {
    /// Build an error for `operation`.
    #[must_use]
    pub fn new(operation: &'static str, code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            operation,
            code: code.map(ToOwned::to_owned),
            message: message.into(),
        }
    }
}

/// Convenience result type for store calls.
pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Listing types
// ---------------------------------------------------------------------------

/// A listing request. `start` is a continuation token for V2 listings and a
/// marker for V1 listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    /// Bucket name.
    pub bucket: String,
    /// Key prefix.
    pub prefix: String,
    /// Delimiter; `None` lists recursively.
    pub delimiter: Option<String>,
    /// Continuation token or marker.
    pub start: Option<String>,
    /// Maximum entries (objects plus common prefixes) to return.
    pub max_keys: usize,
}

/// A listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    /// Full key.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPage {
    /// Objects in this page.
    pub objects: Vec<ObjectSummary>,
    /// Common prefixes in this page.
    pub common_prefixes: Vec<String>,
    /// Whether more entries follow.
    pub is_truncated: bool,
    /// Token (V2) or marker (V1) for the next page.
    pub next: Option<String>,
}

impl ObjectPage {
    /// Objects plus common prefixes.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.objects.len() + self.common_prefixes.len()
    }
}

/// A version listing request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionListRequest {
    /// Bucket name.
    pub bucket: String,
    /// Key prefix.
    pub prefix: String,
    /// Delimiter; `None` lists recursively.
    pub delimiter: Option<String>,
    /// Resume after this key.
    pub key_marker: Option<String>,
    /// Resume after this version of `key_marker`.
    pub version_id_marker: Option<String>,
    /// Maximum entries (versions, delete markers, and common prefixes).
    pub max_keys: usize,
}

/// A listed object version or delete marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSummary {
    /// Full key.
    pub key: String,
    /// Version ID.
    pub version_id: String,
    /// Size in bytes (0 for delete markers).
    pub size: u64,
    /// Last modification time.
    pub last_modified: Option<DateTime<Utc>>,
    /// Whether this is the current version of its key.
    pub is_latest: bool,
    /// Whether this entry is a delete marker.
    pub is_delete_marker: bool,
}

/// One page of a version listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionPage {
    /// Versions and delete markers, in key order then newest first.
    pub versions: Vec<VersionSummary>,
    /// Common prefixes in this page.
    pub common_prefixes: Vec<String>,
    /// Whether more entries follow.
    pub is_truncated: bool,
    /// Key marker for the next page.
    pub next_key_marker: Option<String>,
    /// Version-id marker for the next page.
    pub next_version_id_marker: Option<String>,
}

// ---------------------------------------------------------------------------
// Write / delete / lock types
// ---------------------------------------------------------------------------

/// A key, optionally pinned to one version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIdentifier {
    /// Object key.
    pub key: String,
    /// Version ID; `None` targets the current version.
    pub version_id: Option<String>,
}

impl ObjectIdentifier {
    /// Identify the current version of `key`.
    #[must_use]
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version_id: None,
        }
    }

    /// Identify one version of `key`.
    #[must_use]
    pub fn version(key: impl Into<String>, version_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version_id: Some(version_id.into()),
        }
    }
}

/// A deletion that did not happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    /// Object key (or prefix, when listing the prefix failed).
    pub key: String,
    /// Version ID, if one was targeted.
    pub version_id: Option<String>,
    /// S3 error code.
    pub code: Option<String>,
    /// Error message.
    pub message: String,
}

/// Result of one `DeleteObjects` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// Entries the backend deleted.
    pub deleted: Vec<ObjectIdentifier>,
    /// Entries the backend refused.
    pub errors: Vec<DeleteFailure>,
}

/// An uploaded multipart part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number.
    pub part_number: i32,
    /// Part ETag.
    pub etag: String,
}

/// Object lock retention mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionMode {
    /// Privileged users may shorten or remove retention.
    Governance,
    /// Nobody may shorten or remove retention.
    Compliance,
}

impl fmt::Display for RetentionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Governance => "GOVERNANCE",
            Self::Compliance => "COMPLIANCE",
        })
    }
}

/// Object lock retention settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRetention {
    /// Retention mode.
    pub mode: RetentionMode,
    /// The object is locked until this instant.
    pub retain_until: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ObjectStore trait
// ---------------------------------------------------------------------------

/// The S3 operations the browser depends on.
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// `ListObjectsV2`.
    async fn list_objects_v2(&self, request: &ListRequest) -> StoreResult<ObjectPage>;

    /// `ListObjects` (V1, marker based).
    async fn list_objects_v1(&self, request: &ListRequest) -> StoreResult<ObjectPage>;

    /// `ListObjectVersions`.
    async fn list_object_versions(&self, request: &VersionListRequest)
    -> StoreResult<VersionPage>;

    /// `PutObject`.
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> StoreResult<()>;

    /// `GetObject`, returning the full body.
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> StoreResult<Bytes>;

    /// `CreateMultipartUpload`, returning the upload ID.
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> StoreResult<String>;

    /// `UploadPart`.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<CompletedPart>;

    /// `CompleteMultipartUpload`.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StoreResult<()>;

    /// `AbortMultipartUpload`.
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StoreResult<()>;

    /// `DeleteObject`.
    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> StoreResult<()>;

    /// `DeleteObjects`; at most [`MAX_DELETE_BATCH`] identifiers.
    async fn delete_objects(
        &self,
        bucket: &str,
        objects: Vec<ObjectIdentifier>,
    ) -> StoreResult<DeleteOutcome>;

    /// `CopyObject` within one bucket.
    async fn copy_object(
        &self,
        bucket: &str,
        source: &ObjectIdentifier,
        destination_key: &str,
    ) -> StoreResult<()>;

    /// `GetObjectRetention`; `None` when the object has no retention.
    async fn get_object_retention(
        &self,
        bucket: &str,
        object: &ObjectIdentifier,
    ) -> StoreResult<Option<ObjectRetention>>;

    /// `PutObjectRetention`.
    async fn put_object_retention(
        &self,
        bucket: &str,
        object: &ObjectIdentifier,
        retention: ObjectRetention,
        bypass_governance: bool,
    ) -> StoreResult<()>;

    /// `GetObjectLegalHold`.
    async fn get_object_legal_hold(
        &self,
        bucket: &str,
        object: &ObjectIdentifier,
    ) -> StoreResult<bool>;

    /// `PutObjectLegalHold`.
    async fn put_object_legal_hold(
        &self,
        bucket: &str,
        object: &ObjectIdentifier,
        enabled: bool,
    ) -> StoreResult<()>;
}
