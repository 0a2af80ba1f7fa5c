//! Integration tests for Stowage against a live S3-compatible gateway.
//!
//! These tests require a gateway at `GATEWAY_ENDPOINT_URL` (default
//! `http://localhost:7777`). The session tests additionally need the console
//! and credential service configured through `StowageConfig::from_env`.
//! They are marked `#[ignore]` so they don't run during normal `cargo test`.
//!
//! Run them with:
//! ```text
//! cargo test -p stowage-integration -- --ignored
//! ```

use std::sync::{Arc, Once};

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use stowage_access::GatewayCredential;
use stowage_browser::{ClientSlot, S3Store};

static INIT: Once = Once::new();

/// Initialize tracing (once).
fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .init();
    });
}

/// Endpoint URL of the gateway.
fn endpoint_url() -> String {
    std::env::var("GATEWAY_ENDPOINT_URL").unwrap_or_else(|_| "http://localhost:7777".to_owned())
}

/// Gateway credential taken from `GATEWAY_ACCESS_KEY_ID` / `GATEWAY_SECRET_KEY`.
#[must_use]
pub fn gateway_credential() -> GatewayCredential {
    let access = std::env::var("GATEWAY_ACCESS_KEY_ID").unwrap_or_else(|_| "test".to_owned());
    let secret = std::env::var("GATEWAY_SECRET_KEY").unwrap_or_else(|_| "test".to_owned());
    GatewayCredential::new(access, secret, endpoint_url())
}

/// Raw SDK client used for fixtures and assertions.
#[must_use]
pub fn s3_client() -> aws_sdk_s3::Client {
    init_tracing();

    let credential = gateway_credential();
    let creds = Credentials::new(
        &credential.access_key_id,
        &credential.secret_key,
        None,
        None,
        "integration-test",
    );

    let config = aws_sdk_s3::config::Builder::new()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(creds)
        .endpoint_url(endpoint_url())
        .force_path_style(true)
        .build();

    aws_sdk_s3::Client::from_conf(config)
}

/// A client slot holding an [`S3Store`] for the env credential.
#[must_use]
pub fn store_slot() -> ClientSlot {
    init_tracing();
    let slot = ClientSlot::new();
    slot.replace(Arc::new(S3Store::from_credential(&gateway_credential())));
    slot
}

/// Generate a unique bucket name for a test.
#[must_use]
pub fn test_bucket_name(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().to_string()[..8].to_owned();
    format!("test-{prefix}-{id}")
}

/// Create a bucket and return its name. Caller is responsible for cleanup.
pub async fn create_test_bucket(client: &aws_sdk_s3::Client, prefix: &str) -> String {
    let name = test_bucket_name(prefix);
    client
        .create_bucket()
        .bucket(&name)
        .send()
        .await
        .unwrap_or_else(|e| panic!("failed to create bucket {name}: {e}"));
    name
}

/// Store `count` small objects named `{prefix}{n:05}`.
pub async fn seed_objects(client: &aws_sdk_s3::Client, bucket: &str, prefix: &str, count: usize) {
    let puts = (0..count).map(|n| {
        client
            .put_object()
            .bucket(bucket)
            .key(format!("{prefix}{n:05}"))
            .body(ByteStream::from_static(b"x"))
            .send()
    });
    for result in futures::future::join_all(puts).await {
        result.unwrap_or_else(|e| panic!("failed to seed {bucket}: {e}"));
    }
}

/// Delete all object versions and pending uploads in a bucket, then the bucket.
pub async fn cleanup_bucket(client: &aws_sdk_s3::Client, bucket: &str) {
    let mut key_marker = None;
    let mut version_marker = None;
    loop {
        let Ok(resp) = client
            .list_object_versions()
            .bucket(bucket)
            .set_key_marker(key_marker.take())
            .set_version_id_marker(version_marker.take())
            .send()
            .await
        else {
            return; // Bucket may not exist.
        };

        for version in resp.versions() {
            if let Some(key) = version.key() {
                let _ = client
                    .delete_object()
                    .bucket(bucket)
                    .key(key)
                    .set_version_id(version.version_id().map(ToOwned::to_owned))
                    .send()
                    .await;
            }
        }
        for marker in resp.delete_markers() {
            if let Some(key) = marker.key() {
                let _ = client
                    .delete_object()
                    .bucket(bucket)
                    .key(key)
                    .set_version_id(marker.version_id().map(ToOwned::to_owned))
                    .send()
                    .await;
            }
        }

        if resp.is_truncated() == Some(true) {
            key_marker = resp.next_key_marker().map(ToOwned::to_owned);
            version_marker = resp.next_version_id_marker().map(ToOwned::to_owned);
        } else {
            break;
        }
    }

    if let Ok(uploads) = client.list_multipart_uploads().bucket(bucket).send().await {
        for upload in uploads.uploads() {
            if let (Some(key), Some(id)) = (upload.key(), upload.upload_id()) {
                let _ = client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(id)
                    .send()
                    .await;
            }
        }
    }

    let _ = client.delete_bucket().bucket(bucket).send().await;
}

mod test_deletion;
mod test_listing;
mod test_session;
mod test_upload;
