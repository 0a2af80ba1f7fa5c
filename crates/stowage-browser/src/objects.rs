//! Per-object operations: version restore, object lock, folders, download.

use bytes::Bytes;
use tracing::{debug, info};

use crate::client::ClientSlot;
use crate::error::{BrowserError, BrowserResult};
use crate::store::{DELIMITER, FOLDER_PLACEHOLDER, ObjectIdentifier, ObjectRetention};

/// Object operations through one session's client.
#[derive(Debug, Clone)]
pub struct ObjectOperations {
    slot: ClientSlot,
}

impl ObjectOperations {
    /// Operations using `slot`.
    #[must_use]
    pub fn new(slot: ClientSlot) -> Self {
        Self { slot }
    }

    /// Make `version_id` the current version of `key` by copying it over.
    pub async fn restore_version(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
    ) -> BrowserResult<()> {
        let client = self.slot.get()?;
        client
            .copy_object(bucket, &ObjectIdentifier::version(key, version_id), key)
            .await?;
        info!(bucket, key, version_id, "restored object version");
        Ok(())
    }

    /// Retention settings of an object version.
    pub async fn retention(
        &self,
        bucket: &str,
        object: &ObjectIdentifier,
    ) -> BrowserResult<Option<ObjectRetention>> {
        let client = self.slot.get()?;
        Ok(client.get_object_retention(bucket, object).await?)
    }

    /// Set retention on an object version.
    pub async fn set_retention(
        &self,
        bucket: &str,
        object: &ObjectIdentifier,
        retention: ObjectRetention,
        bypass_governance: bool,
    ) -> BrowserResult<()> {
        let client = self.slot.get()?;
        client
            .put_object_retention(bucket, object, retention, bypass_governance)
            .await?;
        debug!(bucket, key = %object.key, mode = %retention.mode, until = %retention.retain_until, "set object retention");
        Ok(())
    }

    /// Whether a legal hold is on.
    pub async fn legal_hold(&self, bucket: &str, object: &ObjectIdentifier) -> BrowserResult<bool> {
        let client = self.slot.get()?;
        Ok(client.get_object_legal_hold(bucket, object).await?)
    }

    /// Turn a legal hold on or off.
    pub async fn set_legal_hold(
        &self,
        bucket: &str,
        object: &ObjectIdentifier,
        enabled: bool,
    ) -> BrowserResult<()> {
        let client = self.slot.get()?;
        client.put_object_legal_hold(bucket, object, enabled).await?;
        debug!(bucket, key = %object.key, enabled, "set legal hold");
        Ok(())
    }

    /// Create folder `name` under `path` by storing its placeholder object.
    /// Returns the folder prefix.
    pub async fn create_folder(&self, bucket: &str, path: &str, name: &str) -> BrowserResult<String> {
        let name = name.trim();
        if name.is_empty() || name.contains(DELIMITER) || name == "." || name == ".." {
            return Err(BrowserError::InvalidRequest(format!(
                "invalid folder name: {name:?}"
            )));
        }
        let client = self.slot.get()?;
        let prefix = format!("{path}{name}{DELIMITER}");
        client
            .put_object(bucket, &format!("{prefix}{FOLDER_PLACEHOLDER}"), Bytes::new())
            .await?;
        info!(bucket, prefix = %prefix, "created folder");
        Ok(prefix)
    }

    /// Download an object (or one version of it).
    pub async fn download(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> BrowserResult<Bytes> {
        let client = self.slot.get()?;
        let body = client.get_object(bucket, key, version_id).await?;
        debug!(bucket, key, size = body.len(), "downloaded object");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::listing::{Cursor, ListingEngine};
    use crate::store::RetentionMode;
    use crate::store::memory::MemoryGateway;
    use crate::config::BrowserConfig;

    fn operations(gateway: &MemoryGateway) -> ObjectOperations {
        let slot = ClientSlot::new();
        slot.replace(gateway.root_store());
        ObjectOperations::new(slot)
    }

    #[tokio::test]
    async fn test_should_restore_older_version() {
        let gateway = MemoryGateway::new();
        gateway.create_bucket("v", true);
        let old = gateway.insert_object("v", "doc", Bytes::from_static(b"old")).unwrap();
        gateway.insert_object("v", "doc", Bytes::from_static(b"new"));
        let ops = operations(&gateway);

        ops.restore_version("v", "doc", &old).await.unwrap();
        assert_eq!(ops.download("v", "doc", None).await.unwrap().as_ref(), b"old");
        assert_eq!(ops.download("v", "doc", Some(&old)).await.unwrap().as_ref(), b"old");
    }

    #[tokio::test]
    async fn test_should_round_trip_lock_settings() {
        let gateway = MemoryGateway::new();
        gateway.create_bucket("b", false);
        gateway.insert_object("b", "k", Bytes::from_static(b"x"));
        let ops = operations(&gateway);
        let id = ObjectIdentifier::key("k");

        assert_eq!(ops.retention("b", &id).await.unwrap(), None);
        assert!(!ops.legal_hold("b", &id).await.unwrap());

        let retention = ObjectRetention {
            mode: RetentionMode::Governance,
            retain_until: Utc::now() + Duration::days(1),
        };
        ops.set_retention("b", &id, retention, false).await.unwrap();
        ops.set_legal_hold("b", &id, true).await.unwrap();
        assert_eq!(ops.retention("b", &id).await.unwrap(), Some(retention));
        assert!(ops.legal_hold("b", &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_should_create_folder_visible_in_listing() {
        let gateway = MemoryGateway::new();
        gateway.create_bucket("b", false);
        let ops = operations(&gateway);

        let prefix = ops.create_folder("b", "photos/", "2024").await.unwrap();
        assert_eq!(prefix, "photos/2024/");
        assert!(gateway.contains("b", "photos/2024/.file_placeholder"));

        let slot = ClientSlot::new();
        slot.replace(gateway.root_store());
        let mut listing = ListingEngine::new(slot, BrowserConfig::default());
        listing.set_bucket("b");
        listing.set_path("photos/2024/");
        assert!(listing.list(Cursor::default()).await.unwrap().is_empty());
        assert_eq!(listing.total_object_count(), Some(0));
    }

    #[tokio::test]
    async fn test_should_reject_invalid_folder_names() {
        let gateway = MemoryGateway::new();
        gateway.create_bucket("b", false);
        let ops = operations(&gateway);
        for name in ["", "  ", "a/b", ".."] {
            assert!(matches!(
                ops.create_folder("b", "", name).await,
                Err(BrowserError::InvalidRequest(_))
            ));
        }
        assert_eq!(gateway.request_count(), 0);
    }

    #[tokio::test]
    async fn test_should_surface_missing_key() {
        let gateway = MemoryGateway::new();
        gateway.create_bucket("b", false);
        let err = operations(&gateway)
            .download("b", "missing", None)
            .await
            .unwrap_err();
        match err {
            BrowserError::Store(e) => assert_eq!(e.code.as_deref(), Some("NoSuchKey")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
