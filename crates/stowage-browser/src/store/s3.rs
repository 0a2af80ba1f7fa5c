//! `aws-sdk-s3` backed object store.
//!
//! The gateway is S3-compatible but not a regioned AWS service, so clients
//! always use path-style addressing and a placeholder region.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime as AwsDateTime};
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart as S3CompletedPart, Delete, ObjectIdentifier as S3Id,
    ObjectLockLegalHold, ObjectLockLegalHoldStatus, ObjectLockRetention, ObjectLockRetentionMode,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use stowage_access::GatewayCredential;
use tracing::debug;

use super::{
    CompletedPart, DeleteFailure, DeleteOutcome, ListRequest, ObjectIdentifier, ObjectPage,
    ObjectRetention, ObjectStore, ObjectSummary, RetentionMode, StoreError, StoreResult,
    VersionListRequest, VersionPage, VersionSummary,
};
use crate::client::ClientFactory;
use crate::error::BrowserResult;

/// Region sent to the gateway, which ignores it.
pub const PLACEHOLDER_REGION: &str = "us-east-1";

/// Provider name attached to gateway credentials.
const PROVIDER_NAME: &str = "stowage-gateway";

/// Characters escaped in a `CopySource` key; `/` separates path segments.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Build an S3 client bound to `credential`.
#[must_use]
pub fn build_client(credential: &GatewayCredential) -> Client {
    let credentials = Credentials::new(
        &credential.access_key_id,
        &credential.secret_key,
        None,
        None,
        PROVIDER_NAME,
    );

    let config = aws_sdk_s3::config::Builder::new()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(PLACEHOLDER_REGION))
        .credentials_provider(credentials)
        .endpoint_url(&credential.endpoint)
        .force_path_style(true)
        .build();

    Client::from_conf(config)
}

/// Object store backed by an S3-compatible gateway.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    endpoint: String,
}

impl fmt::Debug for S3Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Store")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl S3Store {
    /// Wrap an existing client.
    #[must_use]
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Build a store for `credential`.
    #[must_use]
    pub fn from_credential(credential: &GatewayCredential) -> Self {
        Self::new(build_client(credential), credential.endpoint.clone())
    }
}

/// Builds [`S3Store`] clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct S3ClientFactory;

impl ClientFactory for S3ClientFactory {
    fn build(&self, credential: &GatewayCredential) -> BrowserResult<Arc<dyn ObjectStore>> {
        debug!(endpoint = %credential.endpoint, "building S3 client");
        Ok(Arc::new(S3Store::from_credential(credential)))
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn sdk_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: fmt::Debug + 'static,
{
    match err.as_service_error() {
        Some(service) => StoreError::new(
            operation,
            service.code(),
            service
                .message()
                .map_or_else(|| service.to_string(), ToOwned::to_owned),
        ),
        None => StoreError::new(operation, None, DisplayErrorContext(err).to_string()),
    }
}

fn is_code<E, R>(err: &SdkError<E, R>, code: &str) -> bool
where
    E: ProvideErrorMetadata,
{
    err.as_service_error().and_then(|e| e.code()) == Some(code)
}

fn to_chrono(value: Option<&AwsDateTime>) -> Option<DateTime<Utc>> {
    value.and_then(|d| DateTime::from_timestamp(d.secs(), d.subsec_nanos()))
}

fn to_aws(value: DateTime<Utc>) -> AwsDateTime {
    AwsDateTime::from_secs_and_nanos(value.timestamp(), value.timestamp_subsec_nanos())
}

fn to_size(size: Option<i64>) -> u64 {
    size.and_then(|s| u64::try_from(s).ok()).unwrap_or(0)
}

fn to_max_keys(max_keys: usize) -> i32 {
    i32::try_from(max_keys).unwrap_or(i32::MAX)
}

fn copy_source(bucket: &str, source: &ObjectIdentifier) -> String {
    let mut value = format!("{bucket}/{}", utf8_percent_encode(&source.key, COPY_SOURCE));
    if let Some(version_id) = &source.version_id {
        value.push_str("?versionId=");
        value.push_str(&utf8_percent_encode(version_id, NON_ALPHANUMERIC).to_string());
    }
    value
}

// ---------------------------------------------------------------------------
// ObjectStore impl
// ---------------------------------------------------------------------------

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_objects_v2(&self, request: &ListRequest) -> StoreResult<ObjectPage> {
        let out = self
            .client
            .list_objects_v2()
            .bucket(&request.bucket)
            .prefix(&request.prefix)
            .set_delimiter(request.delimiter.clone())
            .set_continuation_token(request.start.clone())
            .max_keys(to_max_keys(request.max_keys))
            .send()
            .await
            .map_err(|e| sdk_error("ListObjectsV2", e))?;

        Ok(ObjectPage {
            objects: out
                .contents()
                .iter()
                .map(|o| ObjectSummary {
                    key: o.key().unwrap_or_default().to_owned(),
                    size: to_size(o.size()),
                    last_modified: to_chrono(o.last_modified()),
                })
                .collect(),
            common_prefixes: out
                .common_prefixes()
                .iter()
                .filter_map(|p| p.prefix().map(ToOwned::to_owned))
                .collect(),
            is_truncated: out.is_truncated().unwrap_or(false),
            next: out.next_continuation_token().map(ToOwned::to_owned),
        })
    }

    async fn list_objects_v1(&self, request: &ListRequest) -> StoreResult<ObjectPage> {
        let out = self
            .client
            .list_objects()
            .bucket(&request.bucket)
            .prefix(&request.prefix)
            .set_delimiter(request.delimiter.clone())
            .set_marker(request.start.clone())
            .max_keys(to_max_keys(request.max_keys))
            .send()
            .await
            .map_err(|e| sdk_error("ListObjects", e))?;

        let mut page = ObjectPage {
            objects: out
                .contents()
                .iter()
                .map(|o| ObjectSummary {
                    key: o.key().unwrap_or_default().to_owned(),
                    size: to_size(o.size()),
                    last_modified: to_chrono(o.last_modified()),
                })
                .collect(),
            common_prefixes: out
                .common_prefixes()
                .iter()
                .filter_map(|p| p.prefix().map(ToOwned::to_owned))
                .collect(),
            is_truncated: out.is_truncated().unwrap_or(false),
            next: out.next_marker().map(ToOwned::to_owned),
        };
        // NextMarker is only returned when a delimiter is set.
        if page.is_truncated && page.next.is_none() {
            let last_key = page.objects.last().map(|o| o.key.clone());
            let last_prefix = page.common_prefixes.last().cloned();
            page.next = last_key.max(last_prefix);
        }
        Ok(page)
    }

    async fn list_object_versions(
        &self,
        request: &VersionListRequest,
    ) -> StoreResult<VersionPage> {
        let out = self
            .client
            .list_object_versions()
            .bucket(&request.bucket)
            .prefix(&request.prefix)
            .set_delimiter(request.delimiter.clone())
            .set_key_marker(request.key_marker.clone())
            .set_version_id_marker(request.version_id_marker.clone())
            .max_keys(to_max_keys(request.max_keys))
            .send()
            .await
            .map_err(|e| sdk_error("ListObjectVersions", e))?;

        let mut versions: Vec<VersionSummary> = out
            .versions()
            .iter()
            .map(|v| VersionSummary {
                key: v.key().unwrap_or_default().to_owned(),
                version_id: v.version_id().unwrap_or("null").to_owned(),
                size: to_size(v.size()),
                last_modified: to_chrono(v.last_modified()),
                is_latest: v.is_latest().unwrap_or(false),
                is_delete_marker: false,
            })
            .chain(out.delete_markers().iter().map(|m| VersionSummary {
                key: m.key().unwrap_or_default().to_owned(),
                version_id: m.version_id().unwrap_or("null").to_owned(),
                size: 0,
                last_modified: to_chrono(m.last_modified()),
                is_latest: m.is_latest().unwrap_or(false),
                is_delete_marker: true,
            }))
            .collect();
        // Versions and delete markers arrive in separate lists; restore the
        // backend's key-then-newest-first order.
        versions.sort_by(|a, b| {
            a.key
                .cmp(&b.key)
                .then_with(|| b.last_modified.cmp(&a.last_modified))
        });

        Ok(VersionPage {
            versions,
            common_prefixes: out
                .common_prefixes()
                .iter()
                .filter_map(|p| p.prefix().map(ToOwned::to_owned))
                .collect(),
            is_truncated: out.is_truncated().unwrap_or(false),
            next_key_marker: out.next_key_marker().map(ToOwned::to_owned),
            next_version_id_marker: out.next_version_id_marker().map(ToOwned::to_owned),
        })
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> StoreResult<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| sdk_error("PutObject", e))?;
        Ok(())
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> StoreResult<Bytes> {
        let out = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_version_id(version_id.map(ToOwned::to_owned))
            .send()
            .await
            .map_err(|e| sdk_error("GetObject", e))?;
        let data = out
            .body
            .collect()
            .await
            .map_err(|e| StoreError::new("GetObject", None, e.to_string()))?;
        Ok(data.into_bytes())
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> StoreResult<String> {
        let out = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("CreateMultipartUpload", e))?;
        out.upload_id().map(ToOwned::to_owned).ok_or_else(|| {
            StoreError::new("CreateMultipartUpload", None, "response carried no upload ID")
        })
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<CompletedPart> {
        let out = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| sdk_error("UploadPart", e))?;
        Ok(CompletedPart {
            part_number,
            etag: out.e_tag().unwrap_or_default().to_owned(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StoreResult<()> {
        let parts = parts
            .into_iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(p.etag)
                    .build()
            })
            .collect();
        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_error("CompleteMultipartUpload", e))?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StoreResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| sdk_error("AbortMultipartUpload", e))?;
        Ok(())
    }

    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> StoreResult<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .set_version_id(version_id.map(ToOwned::to_owned))
            .send()
            .await
            .map_err(|e| sdk_error("DeleteObject", e))?;
        Ok(())
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        objects: Vec<ObjectIdentifier>,
    ) -> StoreResult<DeleteOutcome> {
        if objects.is_empty() {
            return Ok(DeleteOutcome::default());
        }
        let identifiers = objects
            .into_iter()
            .map(|o| {
                S3Id::builder()
                    .key(o.key)
                    .set_version_id(o.version_id)
                    .build()
                    .map_err(|e| StoreError::new("DeleteObjects", None, e.to_string()))
            })
            .collect::<StoreResult<Vec<_>>>()?;
        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .quiet(false)
            .build()
            .map_err(|e| StoreError::new("DeleteObjects", None, e.to_string()))?;

        let out = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| sdk_error("DeleteObjects", e))?;

        Ok(DeleteOutcome {
            deleted: out
                .deleted()
                .iter()
                .map(|d| ObjectIdentifier {
                    key: d.key().unwrap_or_default().to_owned(),
                    version_id: d.version_id().map(ToOwned::to_owned),
                })
                .collect(),
            errors: out
                .errors()
                .iter()
                .map(|e| DeleteFailure {
                    key: e.key().unwrap_or_default().to_owned(),
                    version_id: e.version_id().map(ToOwned::to_owned),
                    code: e.code().map(ToOwned::to_owned),
                    message: e.message().unwrap_or("delete failed").to_owned(),
                })
                .collect(),
        })
    }

    async fn copy_object(
        &self,
        bucket: &str,
        source: &ObjectIdentifier,
        destination_key: &str,
    ) -> StoreResult<()> {
        self.client
            .copy_object()
            .bucket(bucket)
            .key(destination_key)
            .copy_source(copy_source(bucket, source))
            .send()
            .await
            .map_err(|e| sdk_error("CopyObject", e))?;
        Ok(())
    }

    async fn get_object_retention(
        &self,
        bucket: &str,
        object: &ObjectIdentifier,
    ) -> StoreResult<Option<ObjectRetention>> {
        let result = self
            .client
            .get_object_retention()
            .bucket(bucket)
            .key(&object.key)
            .set_version_id(object.version_id.clone())
            .send()
            .await;
        let out = match result {
            Ok(out) => out,
            Err(e) if is_code(&e, "NoSuchObjectLockConfiguration") => return Ok(None),
            Err(e) => return Err(sdk_error("GetObjectRetention", e)),
        };
        let Some(retention) = out.retention() else {
            return Ok(None);
        };
        let mode = match retention.mode() {
            Some(ObjectLockRetentionMode::Compliance) => RetentionMode::Compliance,
            Some(ObjectLockRetentionMode::Governance) => RetentionMode::Governance,
            _ => return Ok(None),
        };
        Ok(to_chrono(retention.retain_until_date())
            .map(|retain_until| ObjectRetention { mode, retain_until }))
    }

    async fn put_object_retention(
        &self,
        bucket: &str,
        object: &ObjectIdentifier,
        retention: ObjectRetention,
        bypass_governance: bool,
    ) -> StoreResult<()> {
        let mode = match retention.mode {
            RetentionMode::Governance => ObjectLockRetentionMode::Governance,
            RetentionMode::Compliance => ObjectLockRetentionMode::Compliance,
        };
        self.client
            .put_object_retention()
            .bucket(bucket)
            .key(&object.key)
            .set_version_id(object.version_id.clone())
            .retention(
                ObjectLockRetention::builder()
                    .mode(mode)
                    .retain_until_date(to_aws(retention.retain_until))
                    .build(),
            )
            .bypass_governance_retention(bypass_governance)
            .send()
            .await
            .map_err(|e| sdk_error("PutObjectRetention", e))?;
        Ok(())
    }

    async fn get_object_legal_hold(
        &self,
        bucket: &str,
        object: &ObjectIdentifier,
    ) -> StoreResult<bool> {
        let result = self
            .client
            .get_object_legal_hold()
            .bucket(bucket)
            .key(&object.key)
            .set_version_id(object.version_id.clone())
            .send()
            .await;
        match result {
            Ok(out) => Ok(out
                .legal_hold()
                .and_then(|hold| hold.status())
                .is_some_and(|s| *s == ObjectLockLegalHoldStatus::On)),
            Err(e) if is_code(&e, "NoSuchObjectLockConfiguration") => Ok(false),
            Err(e) => Err(sdk_error("GetObjectLegalHold", e)),
        }
    }

    async fn put_object_legal_hold(
        &self,
        bucket: &str,
        object: &ObjectIdentifier,
        enabled: bool,
    ) -> StoreResult<()> {
        let status = if enabled {
            ObjectLockLegalHoldStatus::On
        } else {
            ObjectLockLegalHoldStatus::Off
        };
        self.client
            .put_object_legal_hold()
            .bucket(bucket)
            .key(&object.key)
            .set_version_id(object.version_id.clone())
            .legal_hold(ObjectLockLegalHold::builder().status(status).build())
            .send()
            .await
            .map_err(|e| sdk_error("PutObjectLegalHold", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_encode_copy_source_with_version() {
        let source = ObjectIdentifier::version("photos/my cat.jpg", "v1+2");
        assert_eq!(
            copy_source("bucket", &source),
            "bucket/photos/my%20cat.jpg?versionId=v1%2B2"
        );
        assert_eq!(
            copy_source("bucket", &ObjectIdentifier::key("a/b.txt")),
            "bucket/a/b.txt"
        );
    }

    #[test]
    fn test_should_convert_timestamps() {
        let now = DateTime::from_timestamp(1_700_000_000, 123).unwrap();
        assert_eq!(to_chrono(Some(&to_aws(now))), Some(now));
        assert_eq!(to_chrono(None), None);
    }

    #[test]
    fn test_should_clamp_sizes_and_max_keys() {
        assert_eq!(to_size(Some(-1)), 0);
        assert_eq!(to_size(Some(42)), 42);
        assert_eq!(to_max_keys(usize::MAX), i32::MAX);
    }

    #[test]
    fn test_should_build_path_style_client_for_credential() {
        let credential = GatewayCredential::new("AK", "SK", "https://gateway.example.test");
        let store = S3Store::from_credential(&credential);
        assert_eq!(store.endpoint, "https://gateway.example.test");
        let config = store.client.config();
        assert_eq!(
            config.region().map(ToString::to_string).as_deref(),
            Some(PLACEHOLDER_REGION)
        );
    }
}
