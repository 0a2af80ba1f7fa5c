//! Deletion engine.
//!
//! Deletes single objects, selections of files and folders, and whole
//! prefixes. Nothing fails fast: every requested key is attempted and the
//! outcome is summarized in a [`DeletionAccounting`], which becomes
//! [`BrowserError::ObjectDelete`] (carrying the deleted count) when anything
//! failed.
//!
//! Folder recursion lists one level at a time with `/` as delimiter, deletes
//! the leaves in batches of at most [`MAX_DELETE_BATCH`], then descends into
//! each sub-prefix in order.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tracing::{debug, info, warn};

use crate::client::ClientSlot;
use crate::error::{BrowserError, BrowserResult};
use crate::store::{
    DELIMITER, DeleteFailure, ListRequest, MAX_DELETE_BATCH, ObjectIdentifier, ObjectStore,
    StoreError, VersionListRequest,
};

/// Outcome of a deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionAccounting {
    /// Objects (or versions) a deletion was attempted for.
    pub requested: usize,
    /// Objects actually deleted.
    pub deleted: usize,
    /// Every failure, including listing failures keyed by prefix.
    pub errors: Vec<DeleteFailure>,
}

impl DeletionAccounting {
    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: Self) {
        self.requested += other.requested;
        self.deleted += other.deleted;
        self.errors.extend(other.errors);
    }

    /// The deleted count, or [`BrowserError::ObjectDelete`] if anything failed.
    pub fn into_result(self) -> BrowserResult<usize> {
        if self.errors.is_empty() {
            Ok(self.deleted)
        } else {
            Err(BrowserError::ObjectDelete {
                deleted: self.deleted,
                failures: self.errors,
            })
        }
    }

    fn record_call_failure(&mut self, key: &str, version_id: Option<&str>, err: &StoreError) {
        self.errors.push(DeleteFailure {
            key: key.to_owned(),
            version_id: version_id.map(ToOwned::to_owned),
            code: err.code.clone(),
            message: err.message.clone(),
        });
    }
}

/// Runs deletions through the delete session's client.
#[derive(Debug, Clone)]
pub struct DeletionEngine {
    slot: ClientSlot,
}

impl DeletionEngine {
    /// An engine using `slot`.
    #[must_use]
    pub fn new(slot: ClientSlot) -> Self {
        Self { slot }
    }

    /// Delete one object, or one version of it.
    pub async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> BrowserResult<usize> {
        let client = self.slot.get()?;
        let mut accounting = DeletionAccounting {
            requested: 1,
            ..DeletionAccounting::default()
        };
        match client.delete_object(bucket, key, version_id).await {
            Ok(()) => accounting.deleted = 1,
            Err(e) => accounting.record_call_failure(key, version_id, &e),
        }
        debug!(bucket, key, version_id, "deleted object");
        accounting.into_result()
    }

    /// Delete every version and delete marker of `key`.
    pub async fn delete_all_versions(&self, bucket: &str, key: &str) -> BrowserResult<usize> {
        let client = self.slot.get()?;
        let mut accounting = DeletionAccounting::default();
        let mut request = VersionListRequest {
            bucket: bucket.to_owned(),
            prefix: key.to_owned(),
            max_keys: MAX_DELETE_BATCH,
            ..VersionListRequest::default()
        };

        let mut ids = Vec::new();
        loop {
            let page = match client.list_object_versions(&request).await {
                Ok(page) => page,
                Err(e) => {
                    accounting.record_call_failure(key, None, &e);
                    break;
                }
            };
            ids.extend(
                page.versions
                    .into_iter()
                    .filter(|v| v.key == key)
                    .map(|v| ObjectIdentifier::version(v.key, v.version_id)),
            );
            if !page.is_truncated || page.next_key_marker.is_none() {
                break;
            }
            request.key_marker = page.next_key_marker;
            request.version_id_marker = page.next_version_id_marker;
        }

        accounting.merge(delete_batches(client.as_ref(), bucket, ids).await);
        accounting.into_result()
    }

    /// Delete `objects` in batches.
    pub async fn delete_objects(
        &self,
        bucket: &str,
        objects: Vec<ObjectIdentifier>,
    ) -> BrowserResult<usize> {
        let client = self.slot.get()?;
        delete_batches(client.as_ref(), bucket, objects)
            .await
            .into_result()
    }

    /// Delete everything under `prefix`; with `all_versions`, every version
    /// and delete marker too.
    pub async fn delete_folder(
        &self,
        bucket: &str,
        prefix: &str,
        all_versions: bool,
    ) -> BrowserResult<usize> {
        let client = self.slot.get()?;
        delete_prefix(client, bucket.to_owned(), prefix.to_owned(), all_versions)
            .await
            .into_result()
    }

    /// Delete a selection of files and folders. The file batch and each
    /// folder run concurrently and all of them finish before the outcome is
    /// reported.
    pub async fn delete_selection(
        &self,
        bucket: &str,
        files: Vec<ObjectIdentifier>,
        folders: Vec<String>,
        all_versions: bool,
    ) -> BrowserResult<usize> {
        let client = self.slot.get()?;
        let folder_count = folders.len();

        let mut jobs: Vec<BoxFuture<'_, DeletionAccounting>> = Vec::with_capacity(folders.len() + 1);
        if !files.is_empty() {
            let client = Arc::clone(&client);
            jobs.push(async move { delete_batches(client.as_ref(), bucket, files).await }.boxed());
        }
        for folder in folders {
            jobs.push(delete_prefix(Arc::clone(&client), bucket.to_owned(), folder, all_versions));
        }

        let mut total = DeletionAccounting::default();
        for accounting in join_all(jobs).await {
            total.merge(accounting);
        }
        info!(
            bucket,
            folders = folder_count,
            requested = total.requested,
            deleted = total.deleted,
            failed = total.errors.len(),
            "deleted selection"
        );
        total.into_result()
    }
}

/// Delete `objects` in `DeleteObjects` calls of at most [`MAX_DELETE_BATCH`].
async fn delete_batches(
    client: &dyn ObjectStore,
    bucket: &str,
    objects: Vec<ObjectIdentifier>,
) -> DeletionAccounting {
    let mut accounting = DeletionAccounting {
        requested: objects.len(),
        ..DeletionAccounting::default()
    };

    for batch in objects.chunks(MAX_DELETE_BATCH) {
        match client.delete_objects(bucket, batch.to_vec()).await {
            Ok(outcome) => {
                accounting.deleted += outcome.deleted.len();
                accounting.errors.extend(outcome.errors);
            }
            Err(e) => {
                warn!(bucket, keys = batch.len(), error = %e, "delete batch failed");
                for object in batch {
                    accounting.record_call_failure(&object.key, object.version_id.as_deref(), &e);
                }
            }
        }
    }
    accounting
}

/// One level of a prefix: leaves to delete and sub-prefixes to descend into.
#[derive(Default)]
struct Level {
    leaves: Vec<ObjectIdentifier>,
    prefixes: Vec<String>,
}

async fn list_level(
    client: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
    all_versions: bool,
) -> Result<Level, StoreError> {
    let mut level = Level::default();
    if all_versions {
        let mut request = VersionListRequest {
            bucket: bucket.to_owned(),
            prefix: prefix.to_owned(),
            delimiter: Some(DELIMITER.to_owned()),
            max_keys: MAX_DELETE_BATCH,
            ..VersionListRequest::default()
        };
        loop {
            let page = client.list_object_versions(&request).await?;
            level.leaves.extend(
                page.versions
                    .into_iter()
                    .map(|v| ObjectIdentifier::version(v.key, v.version_id)),
            );
            level.prefixes.extend(page.common_prefixes);
            if !page.is_truncated || page.next_key_marker.is_none() {
                break;
            }
            request.key_marker = page.next_key_marker;
            request.version_id_marker = page.next_version_id_marker;
        }
    } else {
        let mut request = ListRequest {
            bucket: bucket.to_owned(),
            prefix: prefix.to_owned(),
            delimiter: Some(DELIMITER.to_owned()),
            start: None,
            max_keys: MAX_DELETE_BATCH,
        };
        loop {
            let page = client.list_objects_v1(&request).await?;
            level
                .leaves
                .extend(page.objects.into_iter().map(|o| ObjectIdentifier::key(o.key)));
            level.prefixes.extend(page.common_prefixes);
            match page.next {
                Some(marker) if page.is_truncated => request.start = Some(marker),
                _ => break,
            }
        }
    }
    level.prefixes.dedup();
    Ok(level)
}

/// Delete everything under `prefix`, depth-first.
fn delete_prefix(
    client: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    all_versions: bool,
) -> BoxFuture<'static, DeletionAccounting> {
    async move {
        let mut accounting = DeletionAccounting::default();
        let level = match list_level(client.as_ref(), &bucket, &prefix, all_versions).await {
            Ok(level) => level,
            Err(e) => {
                warn!(bucket = %bucket, prefix = %prefix, error = %e, "listing prefix for deletion failed");
                accounting.record_call_failure(&prefix, None, &e);
                return accounting;
            }
        };
        debug!(
            bucket = %bucket,
            prefix = %prefix,
            leaves = level.leaves.len(),
            prefixes = level.prefixes.len(),
            "deleting prefix level"
        );

        accounting.merge(delete_batches(client.as_ref(), &bucket, level.leaves).await);
        for sub in level.prefixes {
            if sub == prefix {
                continue;
            }
            accounting
                .merge(delete_prefix(Arc::clone(&client), bucket.clone(), sub, all_versions).await);
        }
        accounting
    }
    .boxed()
}
