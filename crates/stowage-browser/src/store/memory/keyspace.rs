//! Sorted, optionally versioned key storage for the in-memory gateway.
//!
//! Every key maps to its versions, newest first. Un-versioned buckets keep a
//! single `"null"` version per key. `BTreeMap` keeps keys sorted, which is
//! what makes marker-based pagination deterministic.

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use md5::{Digest, Md5};
use tracing::debug;
use uuid::Uuid;

use crate::store::{
    ObjectPage, ObjectRetention, ObjectSummary, RetentionMode, VersionPage, VersionSummary,
};

/// Version ID used by un-versioned buckets.
pub const NULL_VERSION: &str = "null";

// ---------------------------------------------------------------------------
// Stored entries
// ---------------------------------------------------------------------------

/// A stored object version.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Object key.
    pub key: String,
    /// Version ID, or `"null"` in an un-versioned bucket.
    pub version_id: String,
    /// Hex MD5 of the body.
    pub etag: String,
    /// Write time.
    pub last_modified: DateTime<Utc>,
    /// Object data.
    pub body: Bytes,
    /// Retention lock, if set.
    pub retention: Option<ObjectRetention>,
    /// Whether a legal hold is on.
    pub legal_hold: bool,
}

impl StoredObject {
    fn size(&self) -> u64 {
        self.body.len() as u64
    }

    /// Whether lock settings forbid deleting this version.
    pub fn is_locked(&self, now: DateTime<Utc>, bypass_governance: bool) -> bool {
        if self.legal_hold {
            return true;
        }
        match self.retention {
            Some(r) if r.retain_until > now => {
                r.mode == RetentionMode::Compliance || !bypass_governance
            }
            _ => false,
        }
    }
}

/// An object version or a delete marker.
#[derive(Debug, Clone)]
pub enum StoredVersion {
    /// Object data.
    Object(StoredObject),
    /// A delete marker.
    DeleteMarker {
        /// Version ID of the marker.
        version_id: String,
        /// Time of the delete.
        last_modified: DateTime<Utc>,
    },
}

impl StoredVersion {
    fn version_id(&self) -> &str {
        match self {
            Self::Object(o) => &o.version_id,
            Self::DeleteMarker { version_id, .. } => version_id,
        }
    }

    fn as_object(&self) -> Option<&StoredObject> {
        match self {
            Self::Object(o) => Some(o),
            Self::DeleteMarker { .. } => None,
        }
    }

    fn summary(&self, key: &str, is_latest: bool) -> VersionSummary {
        match self {
            Self::Object(o) => VersionSummary {
                key: key.to_owned(),
                version_id: o.version_id.clone(),
                size: o.size(),
                last_modified: Some(o.last_modified),
                is_latest,
                is_delete_marker: false,
            },
            Self::DeleteMarker {
                version_id,
                last_modified,
            } => VersionSummary {
                key: key.to_owned(),
                version_id: version_id.clone(),
                size: 0,
                last_modified: Some(*last_modified),
                is_latest,
                is_delete_marker: true,
            },
        }
    }
}

/// Why a delete was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteRefusal {
    /// Retention or legal hold protects the version.
    Locked,
}

// ---------------------------------------------------------------------------
// KeySpace
// ---------------------------------------------------------------------------

/// All keys of one bucket.
#[derive(Debug)]
pub struct KeySpace {
    versioned: bool,
    objects: BTreeMap<String, Vec<StoredVersion>>,
    clock: DateTime<Utc>,
}

impl KeySpace {
    /// An empty key space.
    pub fn new(versioned: bool) -> Self {
        Self {
            versioned,
            objects: BTreeMap::new(),
            clock: DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Whether new writes create versions.
    pub fn is_versioned(&self) -> bool {
        self.versioned
    }

    /// Switch versioning on or off. Existing versions are kept.
    pub fn set_versioned(&mut self, versioned: bool) {
        self.versioned = versioned;
    }

    /// Strictly increasing modification time, so versions written within the
    /// same clock tick still order newest first.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        self.clock = if now > self.clock {
            now
        } else {
            self.clock + Duration::microseconds(1)
        };
        self.clock
    }

    /// Store `body` under `key`, returning the new version ID.
    pub fn put(&mut self, key: &str, body: Bytes) -> String {
        let last_modified = self.tick();
        let version_id = if self.versioned {
            Uuid::new_v4().simple().to_string()
        } else {
            NULL_VERSION.to_owned()
        };
        let object = StoredObject {
            key: key.to_owned(),
            version_id: version_id.clone(),
            etag: format!("\"{}\"", hex::encode(Md5::digest(&body))),
            last_modified,
            body,
            retention: None,
            legal_hold: false,
        };

        let versions = self.objects.entry(key.to_owned()).or_default();
        if !self.versioned {
            versions.retain(|v| v.version_id() != NULL_VERSION);
        }
        versions.insert(0, StoredVersion::Object(object));
        debug!(key, version_id = %version_id, "stored object");
        version_id
    }

    /// Current object, or one specific version.
    pub fn get(&self, key: &str, version_id: Option<&str>) -> Option<&StoredObject> {
        let versions = self.objects.get(key)?;
        match version_id {
            Some(id) => versions
                .iter()
                .find(|v| v.version_id() == id)
                .and_then(StoredVersion::as_object),
            None => versions.first().and_then(StoredVersion::as_object),
        }
    }

    /// Mutable access to an object version.
    pub fn get_mut(&mut self, key: &str, version_id: Option<&str>) -> Option<&mut StoredObject> {
        let versions = self.objects.get_mut(key)?;
        let version = match version_id {
            Some(id) => versions.iter_mut().find(|v| v.version_id() == id)?,
            None => versions.first_mut()?,
        };
        match version {
            StoredVersion::Object(o) => Some(o),
            StoredVersion::DeleteMarker { .. } => None,
        }
    }

    /// Delete a key (inserting a delete marker when versioned) or remove one
    /// version permanently. Deleting something absent succeeds.
    pub fn delete(
        &mut self,
        key: &str,
        version_id: Option<&str>,
        bypass_governance: bool,
    ) -> Result<(), DeleteRefusal> {
        let now = Utc::now();
        match version_id {
            Some(id) => {
                let Some(versions) = self.objects.get_mut(key) else {
                    return Ok(());
                };
                let Some(idx) = versions.iter().position(|v| v.version_id() == id) else {
                    return Ok(());
                };
                if versions[idx]
                    .as_object()
                    .is_some_and(|o| o.is_locked(now, bypass_governance))
                {
                    return Err(DeleteRefusal::Locked);
                }
                versions.remove(idx);
                if versions.is_empty() {
                    self.objects.remove(key);
                }
            }
            None if self.versioned => {
                let last_modified = self.tick();
                let marker = StoredVersion::DeleteMarker {
                    version_id: Uuid::new_v4().simple().to_string(),
                    last_modified,
                };
                self.objects
                    .entry(key.to_owned())
                    .or_default()
                    .insert(0, marker);
            }
            None => {
                if self
                    .get(key, None)
                    .is_some_and(|o| o.is_locked(now, bypass_governance))
                {
                    return Err(DeleteRefusal::Locked);
                }
                if let Some(versions) = self.objects.get_mut(key) {
                    versions.retain(|v| v.version_id() != NULL_VERSION);
                    if versions.is_empty() {
                        self.objects.remove(key);
                    }
                }
            }
        }
        Ok(())
    }

    /// Keys whose current version is an object.
    pub fn object_count(&self) -> usize {
        self.objects
            .values()
            .filter(|versions| versions.first().is_some_and(|v| v.as_object().is_some()))
            .count()
    }

    /// Total bytes across every stored version.
    pub fn stored_bytes(&self) -> u64 {
        self.objects
            .values()
            .flatten()
            .filter_map(StoredVersion::as_object)
            .map(StoredObject::size)
            .sum()
    }

    /// List current objects after `marker`. Objects and common prefixes both
    /// count toward `max_keys`; the returned `next` is the last entry emitted.
    pub fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&str>,
        max_keys: usize,
    ) -> ObjectPage {
        let marker = marker.unwrap_or_default();
        let mut page = ObjectPage::default();
        let mut last: Option<String> = None;

        for (key, versions) in self.objects.range::<str, _>(lower_bound(prefix, marker)) {
            if !key.starts_with(prefix) {
                if key.as_str() > prefix {
                    break;
                }
                continue;
            }
            let Some(object) = versions.first().and_then(StoredVersion::as_object) else {
                continue;
            };

            if let Some(common) = common_prefix(key, prefix, delimiter) {
                if common.as_str() <= marker || page.common_prefixes.last() == Some(&common) {
                    continue;
                }
                if page.entry_count() >= max_keys {
                    page.is_truncated = true;
                    break;
                }
                last = Some(common.clone());
                page.common_prefixes.push(common);
                continue;
            }

            if page.entry_count() >= max_keys {
                page.is_truncated = true;
                break;
            }
            last = Some(key.clone());
            page.objects.push(ObjectSummary {
                key: key.clone(),
                size: object.size(),
                last_modified: Some(object.last_modified),
            });
        }

        if page.is_truncated {
            page.next = last;
        }
        page
    }

    /// List versions and delete markers after (`key_marker`, `version_id_marker`).
    pub fn list_versions(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        key_marker: Option<&str>,
        version_id_marker: Option<&str>,
        max_keys: usize,
    ) -> VersionPage {
        let key_marker = key_marker.unwrap_or_default();
        let mut page = VersionPage::default();
        let mut seen_prefixes = HashSet::new();
        let mut count = 0_usize;
        let mut last: Option<(String, Option<String>)> = None;

        'keys: for (key, versions) in self.objects.range::<str, _>(lower_bound(prefix, "")) {
            if !key.starts_with(prefix) {
                if key.as_str() > prefix {
                    break;
                }
                continue;
            }
            if key.as_str() < key_marker
                || (key.as_str() == key_marker && version_id_marker.is_none())
            {
                continue;
            }

            if let Some(common) = common_prefix(key, prefix, delimiter) {
                if common.as_str() <= key_marker || !seen_prefixes.insert(common.clone()) {
                    continue;
                }
                if count >= max_keys {
                    page.is_truncated = true;
                    break;
                }
                count += 1;
                last = Some((common.clone(), None));
                page.common_prefixes.push(common);
                continue;
            }

            let mut skipping = key.as_str() == key_marker;
            for (idx, version) in versions.iter().enumerate() {
                if skipping {
                    if Some(version.version_id()) == version_id_marker {
                        skipping = false;
                    }
                    continue;
                }
                if count >= max_keys {
                    page.is_truncated = true;
                    break 'keys;
                }
                count += 1;
                last = Some((key.clone(), Some(version.version_id().to_owned())));
                page.versions.push(version.summary(key, idx == 0));
            }
        }

        if page.is_truncated {
            if let Some((key, version_id)) = last {
                page.next_key_marker = Some(key);
                page.next_version_id_marker = version_id;
            }
        }
        page
    }
}

fn lower_bound<'a>(prefix: &'a str, marker: &'a str) -> (Bound<&'a str>, Bound<&'a str>) {
    if marker >= prefix && !marker.is_empty() {
        (Bound::Excluded(marker), Bound::Unbounded)
    } else {
        (Bound::Included(prefix), Bound::Unbounded)
    }
}

fn common_prefix(key: &str, prefix: &str, delimiter: Option<&str>) -> Option<String> {
    let delimiter = delimiter.filter(|d| !d.is_empty())?;
    let rest = &key[prefix.len()..];
    rest.find(delimiter)
        .map(|pos| format!("{prefix}{}", &rest[..pos + delimiter.len()]))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- helpers ----

    fn populated(keys: &[&str]) -> KeySpace {
        let mut space = KeySpace::new(false);
        for key in keys {
            space.put(key, Bytes::from_static(b"x"));
        }
        space
    }

    fn names(page: &ObjectPage) -> Vec<String> {
        let mut all: Vec<String> = page
            .objects
            .iter()
            .map(|o| o.key.clone())
            .chain(page.common_prefixes.iter().cloned())
            .collect();
        all.sort();
        all
    }

    // ---- listing ----

    #[test]
    fn test_should_group_common_prefixes() {
        let space = populated(&["a/1", "a/2", "b", "c/d/e"]);
        let page = space.list("", Some("/"), None, 1000);
        assert_eq!(names(&page), vec!["a/", "b", "c/"]);
        assert!(!page.is_truncated);
    }

    #[test]
    fn test_should_count_prefixes_toward_max_keys() {
        let space = populated(&["a/1", "a/2", "b", "c/1", "d"]);
        let first = space.list("", Some("/"), None, 2);
        assert_eq!(names(&first), vec!["a/", "b"]);
        assert!(first.is_truncated);
        assert_eq!(first.next.as_deref(), Some("b"));

        let second = space.list("", Some("/"), first.next.as_deref(), 2);
        assert_eq!(names(&second), vec!["c/", "d"]);
        assert!(!second.is_truncated);
    }

    #[test]
    fn test_should_resume_after_prefix_marker() {
        let space = populated(&["a/1", "a/2", "a/3", "b"]);
        let first = space.list("", Some("/"), None, 1);
        assert_eq!(first.next.as_deref(), Some("a/"));
        let second = space.list("", Some("/"), Some("a/"), 10);
        assert_eq!(names(&second), vec!["b"]);
    }

    #[test]
    fn test_should_list_within_prefix() {
        let space = populated(&["docs/a", "docs/sub/b", "docsx", "z"]);
        let page = space.list("docs/", Some("/"), None, 10);
        assert_eq!(names(&page), vec!["docs/a", "docs/sub/"]);
    }

    #[test]
    fn test_should_list_recursively_without_delimiter() {
        let space = populated(&["a/1", "a/b/2", "c"]);
        let page = space.list("", None, None, 10);
        assert_eq!(page.objects.len(), 3);
        assert!(page.common_prefixes.is_empty());
    }

    // ---- versioning ----

    #[test]
    fn test_should_hide_deleted_key_but_keep_versions() {
        let mut space = KeySpace::new(true);
        let v1 = space.put("k", Bytes::from_static(b"1"));
        let v2 = space.put("k", Bytes::from_static(b"2"));
        space.delete("k", None, false).unwrap();

        assert!(space.get("k", None).is_none());
        assert_eq!(space.get("k", Some(&v1)).unwrap().body.as_ref(), b"1");
        assert_eq!(space.object_count(), 0);

        let page = space.list_versions("", None, None, None, 10);
        assert_eq!(page.versions.len(), 3);
        assert!(page.versions[0].is_delete_marker);
        assert!(page.versions[0].is_latest);
        assert_eq!(page.versions[1].version_id, v2);
        assert_eq!(page.versions[2].version_id, v1);
    }

    #[test]
    fn test_should_paginate_versions_with_markers() {
        let mut space = KeySpace::new(true);
        for _ in 0..3 {
            space.put("a", Bytes::from_static(b"x"));
        }
        space.put("b", Bytes::from_static(b"x"));

        let first = space.list_versions("", None, None, None, 2);
        assert!(first.is_truncated);
        assert_eq!(first.next_key_marker.as_deref(), Some("a"));

        let second = space.list_versions(
            "",
            None,
            first.next_key_marker.as_deref(),
            first.next_version_id_marker.as_deref(),
            10,
        );
        assert_eq!(second.versions.len(), 2);
        assert_eq!(second.versions[0].key, "a");
        assert_eq!(second.versions[1].key, "b");
    }

    #[test]
    fn test_should_remove_specific_version() {
        let mut space = KeySpace::new(true);
        let v1 = space.put("k", Bytes::from_static(b"1"));
        space.put("k", Bytes::from_static(b"2"));
        space.delete("k", Some(&v1), false).unwrap();
        assert!(space.get("k", Some(&v1)).is_none());
        assert!(space.get("k", None).is_some());
    }

    #[test]
    fn test_should_refuse_deleting_locked_object() {
        let mut space = KeySpace::new(false);
        space.put("k", Bytes::from_static(b"1"));
        space.get_mut("k", None).unwrap().legal_hold = true;
        assert_eq!(space.delete("k", None, false), Err(DeleteRefusal::Locked));

        space.get_mut("k", None).unwrap().legal_hold = false;
        space.get_mut("k", None).unwrap().retention = Some(ObjectRetention {
            mode: RetentionMode::Governance,
            retain_until: Utc::now() + Duration::days(1),
        });
        assert!(space.delete("k", None, false).is_err());
        assert!(space.delete("k", None, true).is_ok());
    }

    #[test]
    fn test_should_overwrite_null_version_when_unversioned() {
        let mut space = KeySpace::new(false);
        space.put("k", Bytes::from_static(b"1"));
        space.put("k", Bytes::from_static(b"22"));
        assert_eq!(space.stored_bytes(), 2);
        assert_eq!(space.list_versions("", None, None, None, 10).versions.len(), 1);
    }
}
