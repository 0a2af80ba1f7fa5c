//! In-process gateway.
//!
//! [`MemoryGateway`] plays both halves of the remote side: it exchanges
//! access strings for credentials ([`CredentialExchange`]) and serves the
//! S3 calls made with those credentials ([`ObjectStore`]). Every request is
//! checked against the caveats of the key behind the credential, so a
//! download-only grant really cannot write.
//!
//! Test hooks inject latency, per-key delete failures, per-prefix listing
//! failures, exchange failures, and a storage quota.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, prelude::BASE64_STANDARD};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use dashmap::DashMap;
use md5::{Digest, Md5};
use parking_lot::RwLock;
use stowage_access::{
    AccessError, AccessGrant, AccessResult, Action, ApiKey, CredentialExchange, GatewayCredential,
};
use tracing::debug;
use uuid::Uuid;

use self::keyspace::{DeleteRefusal, KeySpace};
use crate::client::ClientFactory;
use crate::error::BrowserResult;
use crate::store::{
    CompletedPart, DeleteFailure, DeleteOutcome, ListRequest, MAX_DELETE_BATCH, ObjectIdentifier,
    ObjectPage, ObjectRetention, ObjectStore, RetentionMode, StoreError, StoreResult,
    VersionListRequest, VersionPage,
};

pub mod keyspace;

/// Endpoint reported in credentials issued by the memory gateway.
pub const MEMORY_ENDPOINT: &str = "memory://gateway";

/// Upper bound on keys per listing call, as on a real gateway.
const MAX_LIST_KEYS: usize = 1000;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct IssuedCredential {
    secret_key: String,
    api_key: ApiKey,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Debug)]
struct MemoryBucket {
    objects: RwLock<KeySpace>,
    uploads: DashMap<String, PendingUpload>,
}

#[derive(Debug, Default)]
struct GatewayState {
    root_secret: RwLock<Option<Vec<u8>>>,
    buckets: DashMap<String, Arc<MemoryBucket>>,
    credentials: DashMap<String, IssuedCredential>,
    failing_deletes: DashMap<String, String>,
    failing_lists: DashMap<String, String>,
    exchange_failure: RwLock<Option<String>>,
    latency: RwLock<Duration>,
    storage_limit: RwLock<Option<u64>>,
    requests: AtomicUsize,
    exchanges: AtomicUsize,
}

impl GatewayState {
    fn stored_bytes(&self) -> u64 {
        self.buckets
            .iter()
            .map(|b| b.objects.read().stored_bytes())
            .sum()
    }

    fn check_quota(&self, operation: &'static str, incoming: u64) -> StoreResult<()> {
        let Some(limit) = *self.storage_limit.read() else {
            return Ok(());
        };
        if self.stored_bytes() + incoming > limit {
            return Err(StoreError::new(
                operation,
                Some("StorageLimitExceeded"),
                "storage limit exceeded for this project",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryGateway
// ---------------------------------------------------------------------------

/// In-memory credential service and object store.
///
/// Cloning is cheap; clones share state.
///
/// # Examples
///
/// ```
/// use stowage_browser::{ClientSlot, DeletionEngine, MemoryGateway};
///
/// # tokio_test::block_on(async {
/// let gateway = MemoryGateway::new();
/// gateway.create_bucket("photos", false);
/// gateway.insert_object("photos", "2024/a.jpg", "a");
/// gateway.insert_object("photos", "2024/b.jpg", "b");
///
/// let slot = ClientSlot::new();
/// slot.replace(gateway.root_store());
/// let deleted = DeletionEngine::new(slot)
///     .delete_folder("photos", "2024/", false)
///     .await
///     .unwrap();
/// assert_eq!(deleted, 2);
/// assert_eq!(gateway.object_count("photos"), 0);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryGateway {
    state: Arc<GatewayState>,
}

impl MemoryGateway {
    /// An empty gateway with no buckets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify exchanged API keys against `secret`.
    #[must_use]
    pub fn with_root_secret(self, secret: impl Into<Vec<u8>>) -> Self {
        *self.state.root_secret.write() = Some(secret.into());
        self
    }

    /// Create (or reset) a bucket.
    pub fn create_bucket(&self, name: &str, versioned: bool) {
        self.state.buckets.insert(
            name.to_owned(),
            Arc::new(MemoryBucket {
                objects: RwLock::new(KeySpace::new(versioned)),
                uploads: DashMap::new(),
            }),
        );
    }

    /// Turn versioning on or off for an existing bucket.
    pub fn set_versioning(&self, bucket: &str, versioned: bool) {
        if let Some(b) = self.state.buckets.get(bucket) {
            b.objects.write().set_versioned(versioned);
        }
    }

    /// Store an object without going through a client. Not counted as a request.
    pub fn insert_object(&self, bucket: &str, key: &str, body: impl Into<Bytes>) -> Option<String> {
        let b = self.state.buckets.get(bucket)?;
        let version_id = b.objects.write().put(key, body.into());
        Some(version_id)
    }

    /// A store that bypasses credential checks.
    #[must_use]
    pub fn root_store(&self) -> Arc<dyn ObjectStore> {
        Arc::new(MemoryStore {
            state: Arc::clone(&self.state),
            principal: Principal::Root,
        })
    }

    /// Make every delete of `key` fail with `message`.
    pub fn fail_deletes_for(&self, key: &str, message: &str) {
        self.state
            .failing_deletes
            .insert(key.to_owned(), message.to_owned());
    }

    /// Make every listing of exactly `prefix` fail with `message`.
    pub fn fail_listing_for(&self, prefix: &str, message: &str) {
        self.state
            .failing_lists
            .insert(prefix.to_owned(), message.to_owned());
    }

    /// Make credential exchanges fail with `message` (or succeed again with `None`).
    pub fn fail_exchanges(&self, message: Option<&str>) {
        *self.state.exchange_failure.write() = message.map(ToOwned::to_owned);
    }

    /// Delay every store request by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.write() = latency;
    }

    /// Cap the total stored bytes across all buckets.
    pub fn set_storage_limit(&self, limit: Option<u64>) {
        *self.state.storage_limit.write() = limit;
    }

    /// Store requests served so far.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Credential exchanges attempted so far.
    #[must_use]
    pub fn exchange_count(&self) -> usize {
        self.state.exchanges.load(Ordering::SeqCst)
    }

    /// Live (non-deleted) keys in `bucket`.
    #[must_use]
    pub fn object_count(&self, bucket: &str) -> usize {
        self.state
            .buckets
            .get(bucket)
            .map_or(0, |b| b.objects.read().object_count())
    }

    /// Whether the current version of `key` exists.
    #[must_use]
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.state
            .buckets
            .get(bucket)
            .is_some_and(|b| b.objects.read().get(key, None).is_some())
    }

    /// Multipart uploads neither completed nor aborted.
    #[must_use]
    pub fn pending_uploads(&self, bucket: &str) -> usize {
        self.state.buckets.get(bucket).map_or(0, |b| b.uploads.len())
    }
}

#[async_trait]
impl CredentialExchange for MemoryGateway {
    async fn exchange(&self, access: &str, public: bool) -> AccessResult<GatewayCredential> {
        self.state.exchanges.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = self.state.exchange_failure.read().clone() {
            return Err(AccessError::ExchangeFailed {
                status: Some(500),
                message,
            });
        }

        let grant = AccessGrant::parse(access).map_err(|e| AccessError::ExchangeFailed {
            status: Some(400),
            message: e.to_string(),
        })?;
        if let Some(secret) = self.state.root_secret.read().as_deref() {
            if !grant.api_key().verify(secret) {
                return Err(AccessError::ExchangeFailed {
                    status: Some(401),
                    message: "api key signature mismatch".to_owned(),
                });
            }
        }

        let access_key_id = format!("mem{}", Uuid::new_v4().simple());
        let secret_key = Uuid::new_v4().simple().to_string();
        self.state.credentials.insert(
            access_key_id.clone(),
            IssuedCredential {
                secret_key: secret_key.clone(),
                api_key: grant.api_key().clone(),
            },
        );
        debug!(access_key_id = %access_key_id, public, "issued gateway credential");
        Ok(GatewayCredential::new(
            access_key_id,
            secret_key,
            MEMORY_ENDPOINT,
        ))
    }
}

impl ClientFactory for MemoryGateway {
    fn build(&self, credential: &GatewayCredential) -> BrowserResult<Arc<dyn ObjectStore>> {
        Ok(Arc::new(MemoryStore {
            state: Arc::clone(&self.state),
            principal: Principal::Credential {
                access_key_id: credential.access_key_id.clone(),
                secret_key: credential.secret_key.clone(),
            },
        }))
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Principal {
    Root,
    Credential {
        access_key_id: String,
        secret_key: String,
    },
}

/// An [`ObjectStore`] client bound to one principal of a [`MemoryGateway`].
#[derive(Debug)]
pub struct MemoryStore {
    state: Arc<GatewayState>,
    principal: Principal,
}

impl MemoryStore {
    /// Count the request, apply latency, authorize, and resolve the bucket.
    async fn admit(
        &self,
        operation: &'static str,
        action: Action,
        bucket: &str,
    ) -> StoreResult<Arc<MemoryBucket>> {
        self.state.requests.fetch_add(1, Ordering::SeqCst);
        let latency = *self.state.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Principal::Credential {
            access_key_id,
            secret_key,
        } = &self.principal
        {
            let Some(issued) = self.state.credentials.get(access_key_id) else {
                return Err(StoreError::new(
                    operation,
                    Some("InvalidAccessKeyId"),
                    "The access key ID you provided does not exist in our records.",
                ));
            };
            if issued.secret_key != *secret_key {
                return Err(StoreError::new(
                    operation,
                    Some("SignatureDoesNotMatch"),
                    "The request signature we calculated does not match the signature you provided.",
                ));
            }
            if !issued.api_key.allows(action, bucket, Utc::now()) {
                return Err(StoreError::new(operation, Some("AccessDenied"), "Access Denied"));
            }
        }

        self.state
            .buckets
            .get(bucket)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| {
                StoreError::new(
                    operation,
                    Some("NoSuchBucket"),
                    format!("The specified bucket does not exist: {bucket}"),
                )
            })
    }

    fn check_listing(&self, operation: &'static str, prefix: &str) -> StoreResult<()> {
        match self.state.failing_lists.get(prefix) {
            Some(message) => Err(StoreError::new(
                operation,
                Some("InternalError"),
                message.value().clone(),
            )),
            None => Ok(()),
        }
    }

    fn store(
        &self,
        operation: &'static str,
        bucket: &MemoryBucket,
        key: &str,
        body: Bytes,
    ) -> StoreResult<()> {
        self.state.check_quota(operation, body.len() as u64)?;
        bucket.objects.write().put(key, body);
        Ok(())
    }
}

fn no_such_key(operation: &'static str, key: &str) -> StoreError {
    StoreError::new(
        operation,
        Some("NoSuchKey"),
        format!("The specified key does not exist: {key}"),
    )
}

fn locked(operation: &'static str) -> StoreError {
    StoreError::new(
        operation,
        Some("AccessDenied"),
        "Access Denied because object protected by object lock",
    )
}

fn etag(body: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(body)))
}

fn decode_token(operation: &'static str, token: &str) -> StoreResult<String> {
    BASE64_STANDARD
        .decode(token)
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .ok_or_else(|| {
            StoreError::new(
                operation,
                Some("InvalidArgument"),
                "The continuation token provided is incorrect",
            )
        })
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_objects_v2(&self, request: &ListRequest) -> StoreResult<ObjectPage> {
        const OP: &str = "ListObjectsV2";
        let bucket = self.admit(OP, Action::List, &request.bucket).await?;
        self.check_listing(OP, &request.prefix)?;

        let marker = request
            .start
            .as_deref()
            .map(|t| decode_token(OP, t))
            .transpose()?;
        let mut page = bucket.objects.read().list(
            &request.prefix,
            request.delimiter.as_deref(),
            marker.as_deref(),
            request.max_keys.min(MAX_LIST_KEYS),
        );
        page.next = page.next.map(|k| BASE64_STANDARD.encode(k));
        Ok(page)
    }

    async fn list_objects_v1(&self, request: &ListRequest) -> StoreResult<ObjectPage> {
        const OP: &str = "ListObjects";
        let bucket = self.admit(OP, Action::List, &request.bucket).await?;
        self.check_listing(OP, &request.prefix)?;

        Ok(bucket.objects.read().list(
            &request.prefix,
            request.delimiter.as_deref(),
            request.start.as_deref(),
            request.max_keys.min(MAX_LIST_KEYS),
        ))
    }

    async fn list_object_versions(
        &self,
        request: &VersionListRequest,
    ) -> StoreResult<VersionPage> {
        const OP: &str = "ListObjectVersions";
        let bucket = self.admit(OP, Action::List, &request.bucket).await?;
        self.check_listing(OP, &request.prefix)?;

        Ok(bucket.objects.read().list_versions(
            &request.prefix,
            request.delimiter.as_deref(),
            request.key_marker.as_deref(),
            request.version_id_marker.as_deref(),
            request.max_keys.min(MAX_LIST_KEYS),
        ))
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> StoreResult<()> {
        const OP: &str = "PutObject";
        let b = self.admit(OP, Action::Write, bucket).await?;
        self.store(OP, &b, key, body)
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> StoreResult<Bytes> {
        const OP: &str = "GetObject";
        let b = self.admit(OP, Action::Read, bucket).await?;
        let objects = b.objects.read();
        objects
            .get(key, version_id)
            .map(|o| o.body.clone())
            .ok_or_else(|| no_such_key(OP, key))
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> StoreResult<String> {
        const OP: &str = "CreateMultipartUpload";
        let b = self.admit(OP, Action::Write, bucket).await?;
        let upload_id = Uuid::new_v4().simple().to_string();
        b.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_owned(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<CompletedPart> {
        const OP: &str = "UploadPart";
        let b = self.admit(OP, Action::Write, bucket).await?;
        let mut upload = b
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| no_such_upload(OP, upload_id))?;
        let tag = etag(&body);
        upload.parts.insert(part_number, (tag.clone(), body));
        Ok(CompletedPart {
            part_number,
            etag: tag,
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StoreResult<()> {
        const OP: &str = "CompleteMultipartUpload";
        let b = self.admit(OP, Action::Write, bucket).await?;
        let (_, upload) = b
            .uploads
            .remove(upload_id)
            .filter(|(_, u)| u.key == key)
            .ok_or_else(|| no_such_upload(OP, upload_id))?;

        let mut body = BytesMut::new();
        let mut previous = 0;
        for part in &parts {
            let stored = upload
                .parts
                .get(&part.part_number)
                .filter(|(tag, _)| *tag == part.etag && part.part_number > previous);
            let Some((_, data)) = stored else {
                return Err(StoreError::new(
                    OP,
                    Some("InvalidPart"),
                    format!("part {} is missing or out of order", part.part_number),
                ));
            };
            previous = part.part_number;
            body.extend_from_slice(data);
        }
        self.store(OP, &b, key, body.freeze())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> StoreResult<()> {
        const OP: &str = "AbortMultipartUpload";
        let b = self.admit(OP, Action::Write, bucket).await?;
        b.uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| no_such_upload(OP, upload_id))
    }

    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> StoreResult<()> {
        const OP: &str = "DeleteObject";
        let b = self.admit(OP, Action::Delete, bucket).await?;
        if let Some(message) = self.state.failing_deletes.get(key) {
            return Err(StoreError::new(
                OP,
                Some("InternalError"),
                message.value().clone(),
            ));
        }
        b.objects
            .write()
            .delete(key, version_id, false)
            .map_err(|DeleteRefusal::Locked| locked(OP))
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        objects: Vec<ObjectIdentifier>,
    ) -> StoreResult<DeleteOutcome> {
        const OP: &str = "DeleteObjects";
        let b = self.admit(OP, Action::Delete, bucket).await?;
        if objects.len() > MAX_DELETE_BATCH {
            return Err(StoreError::new(
                OP,
                Some("MalformedXML"),
                format!("at most {MAX_DELETE_BATCH} keys may be deleted per request"),
            ));
        }

        let mut outcome = DeleteOutcome::default();
        let mut space = b.objects.write();
        for object in objects {
            if let Some(message) = self.state.failing_deletes.get(&object.key) {
                outcome.errors.push(DeleteFailure {
                    key: object.key,
                    version_id: object.version_id,
                    code: Some("InternalError".to_owned()),
                    message: message.value().clone(),
                });
                continue;
            }
            match space.delete(&object.key, object.version_id.as_deref(), false) {
                Ok(()) => outcome.deleted.push(object),
                Err(DeleteRefusal::Locked) => outcome.errors.push(DeleteFailure {
                    key: object.key,
                    version_id: object.version_id,
                    code: Some("AccessDenied".to_owned()),
                    message: locked(OP).message,
                }),
            }
        }
        Ok(outcome)
    }

    async fn copy_object(
        &self,
        bucket: &str,
        source: &ObjectIdentifier,
        destination_key: &str,
    ) -> StoreResult<()> {
        const OP: &str = "CopyObject";
        let b = self.admit(OP, Action::Write, bucket).await?;
        let body = b
            .objects
            .read()
            .get(&source.key, source.version_id.as_deref())
            .map(|o| o.body.clone())
            .ok_or_else(|| no_such_key(OP, &source.key))?;
        self.store(OP, &b, destination_key, body)
    }

    async fn get_object_retention(
        &self,
        bucket: &str,
        object: &ObjectIdentifier,
    ) -> StoreResult<Option<ObjectRetention>> {
        const OP: &str = "GetObjectRetention";
        let b = self.admit(OP, Action::Read, bucket).await?;
        let objects = b.objects.read();
        objects
            .get(&object.key, object.version_id.as_deref())
            .map(|o| o.retention)
            .ok_or_else(|| no_such_key(OP, &object.key))
    }

    async fn put_object_retention(
        &self,
        bucket: &str,
        object: &ObjectIdentifier,
        retention: ObjectRetention,
        bypass_governance: bool,
    ) -> StoreResult<()> {
        const OP: &str = "PutObjectRetention";
        let b = self.admit(OP, Action::Write, bucket).await?;
        let mut objects = b.objects.write();
        let stored = objects
            .get_mut(&object.key, object.version_id.as_deref())
            .ok_or_else(|| no_such_key(OP, &object.key))?;

        if let Some(current) = stored.retention {
            let weakens = retention.retain_until < current.retain_until
                || retention.mode != current.mode;
            if current.retain_until > Utc::now()
                && weakens
                && (current.mode == RetentionMode::Compliance || !bypass_governance)
            {
                return Err(locked(OP));
            }
        }
        stored.retention = Some(retention);
        Ok(())
    }

    async fn get_object_legal_hold(
        &self,
        bucket: &str,
        object: &ObjectIdentifier,
    ) -> StoreResult<bool> {
        const OP: &str = "GetObjectLegalHold";
        let b = self.admit(OP, Action::Read, bucket).await?;
        let objects = b.objects.read();
        objects
            .get(&object.key, object.version_id.as_deref())
            .map(|o| o.legal_hold)
            .ok_or_else(|| no_such_key(OP, &object.key))
    }

    async fn put_object_legal_hold(
        &self,
        bucket: &str,
        object: &ObjectIdentifier,
        enabled: bool,
    ) -> StoreResult<()> {
        const OP: &str = "PutObjectLegalHold";
        let b = self.admit(OP, Action::Write, bucket).await?;
        let mut objects = b.objects.write();
        let stored = objects
            .get_mut(&object.key, object.version_id.as_deref())
            .ok_or_else(|| no_such_key(OP, &object.key))?;
        stored.legal_hold = enabled;
        Ok(())
    }
}

fn no_such_upload(operation: &'static str, upload_id: &str) -> StoreError {
    StoreError::new(
        operation,
        Some("NoSuchUpload"),
        format!("The specified upload does not exist: {upload_id}"),
    )
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use stowage_access::{Caveat, EncryptionKey};
    use stowage_core::Passphrase;

    use super::*;

    const SECRET: &[u8] = b"gateway-root";

    fn access_for(caveat: Option<Caveat>) -> String {
        let mut key = ApiKey::mint(SECRET);
        if let Some(caveat) = caveat {
            key = key.restrict(caveat).unwrap();
        }
        let encryption =
            EncryptionKey::derive(&Passphrase::new("correct horse"), b"salt").unwrap();
        AccessGrant::new("sat:7777", key, encryption)
            .serialize()
            .unwrap()
    }

    async fn client_for(gateway: &MemoryGateway, caveat: Option<Caveat>) -> Arc<dyn ObjectStore> {
        let credential = gateway.exchange(&access_for(caveat), false).await.unwrap();
        gateway.build(&credential).unwrap()
    }

    #[tokio::test]
    async fn test_should_issue_credentials_for_valid_grant() {
        let gateway = MemoryGateway::new().with_root_secret(SECRET);
        let credential = gateway.exchange(&access_for(None), true).await.unwrap();
        assert_eq!(credential.endpoint, MEMORY_ENDPOINT);
        assert!(credential.access_key_id.starts_with("mem"));
        assert_eq!(gateway.exchange_count(), 1);
    }

    #[tokio::test]
    async fn test_should_reject_foreign_key() {
        let gateway = MemoryGateway::new().with_root_secret(b"other".to_vec());
        let err = gateway.exchange(&access_for(None), false).await.unwrap_err();
        assert!(matches!(err, AccessError::ExchangeFailed { status: Some(401), .. }));
    }

    #[tokio::test]
    async fn test_should_reject_garbage_access() {
        let gateway = MemoryGateway::new();
        let err = gateway.exchange("not-an-access", false).await.unwrap_err();
        assert!(matches!(err, AccessError::ExchangeFailed { status: Some(400), .. }));
    }

    #[tokio::test]
    async fn test_should_deny_put_for_download_only_key() {
        let gateway = MemoryGateway::new();
        gateway.create_bucket("photos", false);
        let caveat = Caveat {
            allow_download: true,
            allow_upload: false,
            allow_list: false,
            allow_delete: false,
            not_before: None,
            not_after: Some(Utc::now() + ChronoDuration::hours(1)),
            buckets: Vec::new(),
        };
        let client = client_for(&gateway, Some(caveat)).await;

        let err = client
            .put_object("photos", "a.txt", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("AccessDenied"));
        assert_eq!(gateway.request_count(), 1);
        assert!(!gateway.contains("photos", "a.txt"));
    }

    #[tokio::test]
    async fn test_should_reject_unknown_credential() {
        let gateway = MemoryGateway::new();
        gateway.create_bucket("b", false);
        let client = gateway
            .build(&GatewayCredential::new("nobody", "secret", MEMORY_ENDPOINT))
            .unwrap();
        let err = client
            .list_objects_v2(&ListRequest {
                bucket: "b".to_owned(),
                max_keys: 10,
                ..ListRequest::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("InvalidAccessKeyId"));
    }

    #[tokio::test]
    async fn test_should_paginate_v2_with_opaque_tokens() {
        let gateway = MemoryGateway::new();
        gateway.create_bucket("b", false);
        for i in 0..5 {
            gateway.insert_object("b", &format!("k{i}"), Bytes::from_static(b"x"));
        }
        let store = gateway.root_store();
        let mut request = ListRequest {
            bucket: "b".to_owned(),
            max_keys: 2,
            ..ListRequest::default()
        };

        let mut seen = Vec::new();
        loop {
            let page = store.list_objects_v2(&request).await.unwrap();
            seen.extend(page.objects.into_iter().map(|o| o.key));
            if !page.is_truncated {
                break;
            }
            assert_ne!(page.next.as_deref(), seen.last().map(String::as_str));
            request.start = page.next;
        }
        assert_eq!(seen, vec!["k0", "k1", "k2", "k3", "k4"]);
    }

    #[tokio::test]
    async fn test_should_assemble_multipart_upload() {
        let gateway = MemoryGateway::new();
        gateway.create_bucket("b", false);
        let store = gateway.root_store();

        let id = store.create_multipart_upload("b", "big").await.unwrap();
        let p2 = store
            .upload_part("b", "big", &id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let p1 = store
            .upload_part("b", "big", &id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        store
            .complete_multipart_upload("b", "big", &id, vec![p1, p2])
            .await
            .unwrap();

        let body = store.get_object("b", "big", None).await.unwrap();
        assert_eq!(body.as_ref(), b"hello world");
        assert_eq!(gateway.pending_uploads("b"), 0);
    }

    #[tokio::test]
    async fn test_should_enforce_storage_limit() {
        let gateway = MemoryGateway::new();
        gateway.create_bucket("b", false);
        gateway.set_storage_limit(Some(4));
        let store = gateway.root_store();

        store
            .put_object("b", "small", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        let err = store
            .put_object("b", "large", Bytes::from_static(b"abcdef"))
            .await
            .unwrap_err();
        assert!(err.message.contains("storage limit exceeded"));
    }

    #[tokio::test]
    async fn test_should_report_injected_delete_failures() {
        let gateway = MemoryGateway::new();
        gateway.create_bucket("b", false);
        gateway.insert_object("b", "ok", Bytes::from_static(b"x"));
        gateway.insert_object("b", "bad", Bytes::from_static(b"x"));
        gateway.fail_deletes_for("bad", "disk on fire");

        let outcome = gateway
            .root_store()
            .delete_objects(
                "b",
                vec![ObjectIdentifier::key("ok"), ObjectIdentifier::key("bad")],
            )
            .await
            .unwrap();
        assert_eq!(outcome.deleted, vec![ObjectIdentifier::key("ok")]);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].message, "disk on fire");
        assert!(gateway.contains("b", "bad"));
    }

    #[tokio::test]
    async fn test_should_protect_compliance_retention() {
        let gateway = MemoryGateway::new();
        gateway.create_bucket("b", true);
        let version = gateway.insert_object("b", "k", Bytes::from_static(b"x")).unwrap();
        let store = gateway.root_store();
        let id = ObjectIdentifier::version("k", version);
        let until = Utc::now() + ChronoDuration::days(1);

        store
            .put_object_retention(
                "b",
                &id,
                ObjectRetention {
                    mode: RetentionMode::Compliance,
                    retain_until: until,
                },
                false,
            )
            .await
            .unwrap();
        let shortened = ObjectRetention {
            mode: RetentionMode::Compliance,
            retain_until: until - ChronoDuration::hours(1),
        };
        assert!(store.put_object_retention("b", &id, shortened, true).await.is_err());
        assert!(store.delete_object("b", "k", id.version_id.as_deref()).await.is_err());
    }
}
