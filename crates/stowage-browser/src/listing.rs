//! Paginated listing engine.
//!
//! The engine lists one bucket location (bucket, path, version mode) at a
//! time and materializes one page of [`ObjectEntry`] rows for a [`Cursor`].
//!
//! # Strategies
//!
//! - **Standard**: an eager pass walks the whole location in fixed 500-entry
//!   requests and records the continuation token found at every absolute
//!   offset. A page then needs one request starting from the nearest token
//!   at or below its offset. The eager pass also yields the object count.
//! - **Alt**: for large buckets. One request per page; the token for page
//!   `k + 1` is recorded after page `k` is fetched. Nothing is pre-fetched.
//! - **Versioned**: lists versions and delete markers, groups them by key
//!   newest first, and shows the newest entry of each key as its row.
//!
//! The strategy for a bucket is chosen once by an object-count probe.
//!
//! # Invalidation
//!
//! Tokens are only valid for the location they were recorded in. Changing
//! the bucket, the path, or the version mode replaces the whole cache in one
//! assignment and starts a new epoch.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::mem;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::client::ClientSlot;
use crate::config::BrowserConfig;
use crate::error::{BrowserError, BrowserResult};
use crate::store::{
    DELIMITER, FOLDER_PLACEHOLDER, ListRequest, ObjectIdentifier, ObjectStore, ObjectSummary,
    VersionListRequest, VersionPage, VersionSummary,
};

/// Largest page a single listing request may ask for.
const MAX_REQUEST_KEYS: usize = 1000;

// ---------------------------------------------------------------------------
// Entries, cursor, sorting
// ---------------------------------------------------------------------------

/// Whether an entry is a folder (common prefix) or a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A common prefix.
    Folder,
    /// An object or object version.
    File,
}

/// One row of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Key relative to the listed path. Folders keep their trailing `/`.
    pub key: String,
    /// Absolute key in the bucket.
    pub full_key: String,
    /// Size in bytes; 0 for folders and delete markers.
    pub size: u64,
    /// Last modification time; `None` for folders.
    pub last_modified: Option<DateTime<Utc>>,
    /// Folder or file.
    pub kind: EntryKind,
    /// Version ID in versioned listings.
    pub version_id: Option<String>,
    /// Whether this version is a delete marker.
    pub is_delete_marker: bool,
    /// Whether this is the current version. Always true outside versioned mode.
    pub is_latest: bool,
}

impl ObjectEntry {
    fn folder(path: &str, prefix: String) -> Self {
        Self {
            key: relative(path, &prefix),
            full_key: prefix,
            size: 0,
            last_modified: None,
            kind: EntryKind::Folder,
            version_id: None,
            is_delete_marker: false,
            is_latest: true,
        }
    }

    fn object(path: &str, summary: ObjectSummary) -> Self {
        Self {
            key: relative(path, &summary.key),
            full_key: summary.key,
            size: summary.size,
            last_modified: summary.last_modified,
            kind: EntryKind::File,
            version_id: None,
            is_delete_marker: false,
            is_latest: true,
        }
    }

    fn version(path: &str, summary: VersionSummary) -> Self {
        Self {
            key: relative(path, &summary.key),
            full_key: summary.key,
            size: summary.size,
            last_modified: summary.last_modified,
            kind: EntryKind::File,
            version_id: Some(summary.version_id),
            is_delete_marker: summary.is_delete_marker,
            is_latest: summary.is_latest,
        }
    }

    /// Whether this entry is a folder.
    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }

    /// Identifier of this file (pinned to its version, if any).
    #[must_use]
    pub fn identifier(&self) -> ObjectIdentifier {
        ObjectIdentifier {
            key: self.full_key.clone(),
            version_id: self.version_id.clone(),
        }
    }
}

fn relative(path: &str, key: &str) -> String {
    key.strip_prefix(path).unwrap_or(key).to_owned()
}

fn is_placeholder(path: &str, key: &str) -> bool {
    relative(path, key) == FOLDER_PLACEHOLDER
}

/// A 1-indexed page of `limit` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    /// Page number, starting at 1.
    pub page: usize,
    /// Rows per page.
    pub limit: usize,
}

impl Default for Cursor {
    fn default() -> Self {
        Self { page: 1, limit: 25 }
    }
}

impl Cursor {
    /// A cursor; page and limit are raised to at least 1.
    #[must_use]
    pub fn new(page: usize, limit: usize) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, MAX_REQUEST_KEYS),
        }
    }

    /// Absolute offset of the first row.
    #[must_use]
    pub fn offset(&self) -> usize {
        (self.page - 1) * self.limit
    }

    /// The following page.
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.page + 1, self.limit)
    }
}

/// Column a listing is sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    /// Relative key.
    #[default]
    Name,
    /// Size in bytes.
    Size,
    /// Last modification time.
    Date,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

impl SortDirection {
    /// The opposite direction.
    #[must_use]
    pub fn toggled(self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }
}

/// Folders first, then `key`/`direction` within each kind; name breaks ties.
fn compare_entries(
    a: &ObjectEntry,
    b: &ObjectEntry,
    key: SortKey,
    direction: SortDirection,
) -> Ordering {
    match (a.kind, b.kind) {
        (EntryKind::Folder, EntryKind::File) => return Ordering::Less,
        (EntryKind::File, EntryKind::Folder) => return Ordering::Greater,
        _ => {}
    }
    let by_name = a.key.cmp(&b.key);
    let ordering = match key {
        SortKey::Name => by_name,
        SortKey::Size => a.size.cmp(&b.size).then(by_name),
        SortKey::Date => a.last_modified.cmp(&b.last_modified).then(by_name),
    };
    match direction {
        SortDirection::Ascending => ordering,
        SortDirection::Descending => ordering.reverse(),
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// A resume point for a listing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinuationToken {
    /// Opaque `ListObjectsV2` continuation token.
    Continuation(String),
    /// `ListObjectVersions` markers.
    Versions {
        /// Resume after this key.
        key_marker: String,
        /// Resume after this version of `key_marker`.
        version_id_marker: Option<String>,
    },
}

/// Tokens keyed by absolute offset (standard) or page number (alt, versioned).
///
/// Append-only: once recorded, a position keeps its first token until the
/// whole map is dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContinuationTokenMap {
    tokens: BTreeMap<usize, ContinuationToken>,
}

impl ContinuationTokenMap {
    /// Record `token` at `position` unless one is already there.
    pub fn insert(&mut self, position: usize, token: ContinuationToken) {
        self.tokens.entry(position).or_insert(token);
    }

    /// Token recorded at exactly `position`.
    #[must_use]
    pub fn get(&self, position: usize) -> Option<&ContinuationToken> {
        self.tokens.get(&position)
    }

    /// Highest recorded position at or below `position`, with its token.
    #[must_use]
    pub fn nearest_at_or_below(&self, position: usize) -> Option<(usize, &ContinuationToken)> {
        self.tokens
            .range(..=position)
            .next_back()
            .map(|(p, t)| (*p, t))
    }

    /// Number of recorded tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no token is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// How a non-versioned location is paged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingStrategy {
    /// Eager offset-indexed tokens.
    Standard,
    /// Lazy per-page tokens.
    Alt,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Location {
    bucket: String,
    path: String,
    versioned: bool,
}

/// Everything derived from one location. Replaced wholesale on invalidation.
#[derive(Debug, Default)]
struct ListingCache {
    tokens: ContinuationTokenMap,
    expanded: HashSet<String>,
    // Page size the per-page tokens were recorded with.
    token_limit: Option<usize>,
    // Raw entries (placeholders included) seen by the eager pass.
    raw_count: Option<usize>,
    total_object_count: Option<usize>,
}

enum RawEntry {
    Object(ObjectSummary),
    Prefix(String),
}

impl RawEntry {
    fn key(&self) -> &str {
        match self {
            Self::Object(o) => &o.key,
            Self::Prefix(p) => p,
        }
    }
}

/// Lists one location of one bucket.
#[derive(Debug)]
pub struct ListingEngine {
    slot: ClientSlot,
    config: BrowserConfig,
    location: Location,
    epoch: u64,
    cache: ListingCache,
    strategy: Option<(String, ListingStrategy)>,
    cursor: Cursor,
    sort_key: SortKey,
    sort_direction: SortDirection,
    entries: Vec<ObjectEntry>,
    versions: HashMap<String, Vec<ObjectEntry>>,
    has_more: bool,
}

impl ListingEngine {
    /// An engine with no bucket selected.
    #[must_use]
    pub fn new(slot: ClientSlot, config: BrowserConfig) -> Self {
        let versioned = config.versioning_ui;
        Self {
            slot,
            config,
            location: Location {
                versioned,
                ..Location::default()
            },
            epoch: 0,
            cache: ListingCache::default(),
            strategy: None,
            cursor: Cursor::default(),
            sort_key: SortKey::default(),
            sort_direction: SortDirection::default(),
            entries: Vec::new(),
            versions: HashMap::new(),
            has_more: false,
        }
    }

    // ---- location ----

    /// Selected bucket.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.location.bucket
    }

    /// Current path; empty or ending in `/`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.location.path
    }

    /// Whether versions are listed.
    #[must_use]
    pub fn is_versioned(&self) -> bool {
        self.location.versioned
    }

    /// Incremented on every invalidation.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Select a bucket, resetting the path to the root.
    pub fn set_bucket(&mut self, bucket: &str) {
        if self.location.bucket != bucket {
            self.location.bucket = bucket.to_owned();
            self.location.path.clear();
            self.strategy = None;
            self.invalidate();
        }
    }

    /// Move to `path`; a trailing `/` is added when missing.
    pub fn set_path(&mut self, path: &str) {
        let path = if path.is_empty() || path.ends_with(DELIMITER) {
            path.to_owned()
        } else {
            format!("{path}{DELIMITER}")
        };
        if self.location.path != path {
            self.location.path = path;
            self.invalidate();
        }
    }

    /// Switch between object and version listings.
    pub fn set_versioned(&mut self, versioned: bool) {
        if self.location.versioned != versioned {
            self.location.versioned = versioned;
            self.invalidate();
        }
    }

    /// Drop every token, count and expanded key for the current location.
    pub fn invalidate(&mut self) {
        self.cache = ListingCache::default();
        self.epoch += 1;
        self.entries.clear();
        self.versions.clear();
        self.has_more = false;
        debug!(
            bucket = %self.location.bucket,
            path = %self.location.path,
            versioned = self.location.versioned,
            epoch = self.epoch,
            "listing cache invalidated"
        );
    }

    // ---- results ----

    /// Rows of the last listed page, in display order.
    #[must_use]
    pub fn entries(&self) -> &[ObjectEntry] {
        &self.entries
    }

    /// Cursor of the last listed page.
    #[must_use]
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Whether rows exist beyond the last listed page.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Objects under the current path, once the standard eager pass ran.
    #[must_use]
    pub fn total_object_count(&self) -> Option<usize> {
        self.cache.total_object_count
    }

    /// Tokens recorded for the current location.
    #[must_use]
    pub fn tokens(&self) -> &ContinuationTokenMap {
        &self.cache.tokens
    }

    /// Strategy chosen for the selected bucket, if probed.
    #[must_use]
    pub fn strategy(&self) -> Option<ListingStrategy> {
        self.strategy
            .as_ref()
            .filter(|(bucket, _)| *bucket == self.location.bucket)
            .map(|(_, s)| *s)
    }

    // ---- listing ----

    /// List the page at `cursor`.
    pub async fn list(&mut self, cursor: Cursor) -> BrowserResult<&[ObjectEntry]> {
        let client = self.slot.get()?;
        if self.location.bucket.is_empty() {
            return Err(BrowserError::InvalidRequest("no bucket selected".to_owned()));
        }

        if self.location.versioned {
            self.list_versioned(client.as_ref(), cursor).await?;
        } else {
            match self.ensure_strategy(client.as_ref()).await {
                ListingStrategy::Standard => self.list_standard(client.as_ref(), cursor).await?,
                ListingStrategy::Alt => self.list_alt(client.as_ref(), cursor).await?,
            }
        }

        self.cursor = cursor;
        self.apply_sort();
        debug!(
            bucket = %self.location.bucket,
            path = %self.location.path,
            page = cursor.page,
            rows = self.entries.len(),
            "listed page"
        );
        Ok(&self.entries)
    }

    /// Re-list the current page with fresh tokens, keeping expanded keys.
    pub async fn refresh(&mut self) -> BrowserResult<&[ObjectEntry]> {
        let expanded = mem::take(&mut self.cache.expanded);
        self.cache = ListingCache {
            expanded,
            ..ListingCache::default()
        };
        self.list(self.cursor).await
    }

    /// Count every object in the selected bucket, giving up after the
    /// configured timeout. A timeout or failure counts as zero.
    pub async fn count_objects(&self) -> BrowserResult<u64> {
        let client = self.slot.get()?;
        Ok(self.probe(client.as_ref()).await)
    }

    async fn probe(&self, client: &dyn ObjectStore) -> u64 {
        let bucket = self.location.bucket.as_str();
        let count = async {
            let mut request = ListRequest {
                bucket: bucket.to_owned(),
                max_keys: MAX_REQUEST_KEYS,
                ..ListRequest::default()
            };
            let mut total = 0_u64;
            loop {
                let page = client.list_objects_v2(&request).await?;
                total += page.objects.len() as u64;
                match page.next {
                    Some(next) if page.is_truncated => request.start = Some(next),
                    _ => return Ok::<_, BrowserError>(total),
                }
            }
        };

        match tokio::time::timeout(self.config.object_count_timeout(), count).await {
            Ok(Ok(total)) => total,
            Ok(Err(e)) => {
                warn!(bucket, error = %e, "object count probe failed");
                0
            }
            Err(_) => {
                warn!(bucket, "object count probe timed out");
                0
            }
        }
    }

    async fn ensure_strategy(&mut self, client: &dyn ObjectStore) -> ListingStrategy {
        if let Some(strategy) = self.strategy() {
            return strategy;
        }
        let count = self.probe(client).await;
        let strategy = if count > self.config.alt_pagination_threshold {
            ListingStrategy::Alt
        } else {
            ListingStrategy::Standard
        };
        debug!(bucket = %self.location.bucket, count, ?strategy, "selected listing strategy");
        self.strategy = Some((self.location.bucket.clone(), strategy));
        strategy
    }

    fn request(&self, start: Option<String>, max_keys: usize) -> ListRequest {
        ListRequest {
            bucket: self.location.bucket.clone(),
            prefix: self.location.path.clone(),
            delimiter: Some(DELIMITER.to_owned()),
            start,
            max_keys,
        }
    }

    // ---- standard ----

    async fn eager_pass(&mut self, client: &dyn ObjectStore) -> BrowserResult<()> {
        let page_size = self.config.listing_page_size;
        let path = self.location.path.clone();
        let mut offset = 0;
        let mut placeholders = 0;
        let mut start = None;

        loop {
            let page = client.list_objects_v2(&self.request(start, page_size)).await?;
            if !path.is_empty() {
                placeholders += page
                    .objects
                    .iter()
                    .filter(|o| is_placeholder(&path, &o.key))
                    .count();
            }
            offset += page.entry_count();
            match page.next {
                Some(next) if page.is_truncated => {
                    self.cache
                        .tokens
                        .insert(offset, ContinuationToken::Continuation(next.clone()));
                    start = Some(next);
                }
                _ => break,
            }
        }

        self.cache.raw_count = Some(offset);
        self.cache.total_object_count = Some(offset - placeholders);
        debug!(path = %path, entries = offset, tokens = self.cache.tokens.len(), "eager listing pass done");
        Ok(())
    }

    async fn list_standard(&mut self, client: &dyn ObjectStore, cursor: Cursor) -> BrowserResult<()> {
        if self.cache.raw_count.is_none() {
            self.eager_pass(client).await?;
        }
        let raw_count = self.cache.raw_count.unwrap_or_default();
        let offset = cursor.offset();

        let (base, mut start) = match self.cache.tokens.nearest_at_or_below(offset) {
            Some((base, ContinuationToken::Continuation(token))) => (base, Some(token.clone())),
            _ => (0, None),
        };
        let skip = offset - base;
        let wanted = skip + cursor.limit;

        let mut raw = Vec::with_capacity(wanted);
        while offset < raw_count && raw.len() < wanted {
            let page = client
                .list_objects_v2(&self.request(start, (wanted - raw.len()).min(MAX_REQUEST_KEYS)))
                .await?;
            let truncated = page.is_truncated;
            let next = page.next.clone();
            raw.extend(merge_page(page.objects, page.common_prefixes));
            match next {
                Some(next) if truncated => start = Some(next),
                _ => break,
            }
        }

        let path = self.location.path.clone();
        self.entries = raw
            .into_iter()
            .skip(skip)
            .take(cursor.limit)
            .filter(|e| !is_placeholder(&path, e.key()))
            .map(|e| match e {
                RawEntry::Object(o) => ObjectEntry::object(&path, o),
                RawEntry::Prefix(p) => ObjectEntry::folder(&path, p),
            })
            .collect();
        self.versions.clear();
        self.has_more = offset + cursor.limit < raw_count;
        Ok(())
    }

    // ---- alt ----

    fn reset_page_tokens(&mut self, limit: usize) {
        if self.cache.token_limit != Some(limit) {
            self.cache.tokens = ContinuationTokenMap::default();
            self.cache.token_limit = Some(limit);
        }
    }

    /// Highest page at or below `target` that can be fetched directly.
    fn resume_page(&self, target: usize) -> (usize, Option<ContinuationToken>) {
        match self.cache.tokens.nearest_at_or_below(target) {
            Some((page, token)) if page > 1 => (page, Some(token.clone())),
            _ => (1, None),
        }
    }

    async fn list_alt(&mut self, client: &dyn ObjectStore, cursor: Cursor) -> BrowserResult<()> {
        self.reset_page_tokens(cursor.limit);
        let (mut page_no, token) = self.resume_page(cursor.page);
        let mut start = match token {
            Some(ContinuationToken::Continuation(t)) => Some(t),
            _ => None,
        };

        let path = self.location.path.clone();
        loop {
            let page = client
                .list_objects_v2(&self.request(start, cursor.limit))
                .await?;
            let next = page.next.clone().filter(|_| page.is_truncated);
            if let Some(next) = &next {
                self.cache
                    .tokens
                    .insert(page_no + 1, ContinuationToken::Continuation(next.clone()));
            }

            if page_no == cursor.page || next.is_none() {
                self.entries = if page_no == cursor.page {
                    merge_page(page.objects, page.common_prefixes)
                        .into_iter()
                        .filter(|e| !is_placeholder(&path, e.key()))
                        .map(|e| match e {
                            RawEntry::Object(o) => ObjectEntry::object(&path, o),
                            RawEntry::Prefix(p) => ObjectEntry::folder(&path, p),
                        })
                        .collect()
                } else {
                    Vec::new()
                };
                self.has_more = page_no == cursor.page && next.is_some();
                break;
            }
            page_no += 1;
            start = next;
        }
        self.versions.clear();
        Ok(())
    }

    // ---- versioned ----

    async fn list_versioned(
        &mut self,
        client: &dyn ObjectStore,
        cursor: Cursor,
    ) -> BrowserResult<()> {
        self.reset_page_tokens(cursor.limit);
        let (mut page_no, mut token) = self.resume_page(cursor.page);

        loop {
            let (key_marker, version_id_marker) = match token {
                Some(ContinuationToken::Versions {
                    key_marker,
                    version_id_marker,
                }) => (Some(key_marker), version_id_marker),
                _ => (None, None),
            };
            let request = VersionListRequest {
                bucket: self.location.bucket.clone(),
                prefix: self.location.path.clone(),
                delimiter: Some(DELIMITER.to_owned()),
                key_marker,
                version_id_marker,
                max_keys: (cursor.limit + 1).min(MAX_REQUEST_KEYS),
            };
            let page = client.list_object_versions(&request).await?;
            let grouped = group_versions(page, cursor.limit);
            if let Some(next) = &grouped.next {
                self.cache.tokens.insert(page_no + 1, next.clone());
            }

            if page_no == cursor.page || grouped.next.is_none() {
                self.has_more = page_no == cursor.page && grouped.next.is_some();
                if page_no == cursor.page {
                    self.materialize_versions(grouped);
                } else {
                    self.entries.clear();
                    self.versions.clear();
                }
                return Ok(());
            }
            page_no += 1;
            token = grouped.next;
        }
    }

    fn materialize_versions(&mut self, grouped: GroupedVersions) {
        let path = self.location.path.clone();
        let mut entries: Vec<ObjectEntry> = grouped
            .prefixes
            .into_iter()
            .map(|p| ObjectEntry::folder(&path, p))
            .collect();
        let mut versions = HashMap::new();

        for (key, group) in grouped.groups {
            if is_placeholder(&path, &key) {
                continue;
            }
            let rows: Vec<ObjectEntry> = group
                .into_iter()
                .map(|v| ObjectEntry::version(&path, v))
                .collect();
            if let Some(newest) = rows.first() {
                entries.push(newest.clone());
            }
            versions.insert(key, rows);
        }

        self.entries = entries;
        self.versions = versions;
    }

    // ---- sorting ----

    /// Current sort column.
    #[must_use]
    pub fn sort_key(&self) -> SortKey {
        self.sort_key
    }

    /// Current sort direction.
    #[must_use]
    pub fn sort_direction(&self) -> SortDirection {
        self.sort_direction
    }

    /// Re-sort the listed page without fetching.
    pub fn sort(&mut self, key: SortKey, direction: SortDirection) {
        self.sort_key = key;
        self.sort_direction = direction;
        self.apply_sort();
    }

    /// Sort by `key`, flipping the direction if it is already the sort key.
    pub fn toggle_sort(&mut self, key: SortKey) {
        let direction = if self.sort_key == key {
            self.sort_direction.toggled()
        } else {
            SortDirection::Ascending
        };
        self.sort(key, direction);
    }

    fn apply_sort(&mut self) {
        let (key, direction) = (self.sort_key, self.sort_direction);
        self.entries
            .sort_by(|a, b| compare_entries(a, b, key, direction));
    }

    // ---- versions ----

    /// Versions of `full_key` on the listed page, newest first.
    #[must_use]
    pub fn versions_of(&self, full_key: &str) -> &[ObjectEntry] {
        self.versions.get(full_key).map_or(&[], Vec::as_slice)
    }

    /// Show the older versions of `full_key`.
    pub fn expand(&mut self, full_key: &str) {
        self.cache.expanded.insert(full_key.to_owned());
    }

    /// Hide the older versions of `full_key`.
    pub fn collapse(&mut self, full_key: &str) {
        self.cache.expanded.remove(full_key);
    }

    /// Flip the expansion of `full_key`.
    pub fn toggle_expanded(&mut self, full_key: &str) {
        if !self.cache.expanded.remove(full_key) {
            self.cache.expanded.insert(full_key.to_owned());
        }
    }

    /// Whether `full_key` is expanded.
    #[must_use]
    pub fn is_expanded(&self, full_key: &str) -> bool {
        self.cache.expanded.contains(full_key)
    }

    /// Rows to display: every entry, each expanded key followed by its
    /// older versions.
    #[must_use]
    pub fn visible_rows(&self) -> Vec<&ObjectEntry> {
        let mut rows = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            rows.push(entry);
            if entry.is_folder() || !self.is_expanded(&entry.full_key) {
                continue;
            }
            rows.extend(self.versions_of(&entry.full_key).iter().skip(1));
        }
        rows
    }

    /// The client slot this engine lists through.
    #[must_use]
    pub fn slot(&self) -> ClientSlot {
        self.slot.clone()
    }

    /// Shared handle used by the upload pipeline for post-upload refreshes.
    #[must_use]
    pub fn shared(self) -> Arc<tokio::sync::Mutex<Self>> {
        Arc::new(tokio::sync::Mutex::new(self))
    }
}

/// Objects and prefixes of one response, in key order.
fn merge_page(objects: Vec<ObjectSummary>, prefixes: Vec<String>) -> Vec<RawEntry> {
    let mut raw: Vec<RawEntry> = objects
        .into_iter()
        .map(RawEntry::Object)
        .chain(prefixes.into_iter().map(RawEntry::Prefix))
        .collect();
    raw.sort_by(|a, b| a.key().cmp(b.key()));
    raw
}

struct GroupedVersions {
    prefixes: Vec<String>,
    groups: BTreeMap<String, Vec<VersionSummary>>,
    next: Option<ContinuationToken>,
}

enum VersionItem {
    Version(VersionSummary),
    Prefix(String),
}

impl VersionItem {
    fn key(&self) -> &str {
        match self {
            Self::Version(v) => &v.key,
            Self::Prefix(p) => p,
        }
    }

    /// Token that resumes right after this item.
    fn resume_token(&self) -> ContinuationToken {
        match self {
            Self::Version(v) => ContinuationToken::Versions {
                key_marker: v.key.clone(),
                version_id_marker: Some(v.version_id.clone()),
            },
            Self::Prefix(p) => ContinuationToken::Versions {
                key_marker: p.clone(),
                version_id_marker: None,
            },
        }
    }
}

/// Group the first `limit` items of a version page by key, newest first.
///
/// The page is requested with one extra item. When that item continues the
/// last shown key, the key's versions are left for the next page, unless they
/// are the only thing on this one.
fn group_versions(page: VersionPage, limit: usize) -> GroupedVersions {
    let mut items: Vec<VersionItem> = page
        .versions
        .into_iter()
        .map(VersionItem::Version)
        .chain(page.common_prefixes.into_iter().map(VersionItem::Prefix))
        .collect();
    // Stable: versions of one key keep their newest-first order.
    items.sort_by(|a, b| a.key().cmp(b.key()));

    let rest = items.split_off(limit.min(items.len()));
    let more = !rest.is_empty() || page.is_truncated;
    let split_group = match (items.last(), rest.first()) {
        (Some(VersionItem::Version(last)), Some(VersionItem::Version(peek))) => peek.key == last.key,
        // Listing capped below the extra item; the boundary is unknown.
        (Some(VersionItem::Version(_)), None) => page.is_truncated,
        _ => false,
    };
    if split_group {
        if let Some(partial) = items.last().map(|i| i.key().to_owned()) {
            if items.iter().any(|i| i.key() != partial) {
                items.retain(|i| i.key() != partial);
            }
        }
    }

    let next = items
        .last()
        .filter(|_| more)
        .map(VersionItem::resume_token);

    let mut prefixes = Vec::new();
    let mut groups: BTreeMap<String, Vec<VersionSummary>> = BTreeMap::new();
    for item in items {
        match item {
            VersionItem::Version(v) => groups.entry(v.key.clone()).or_default().push(v),
            VersionItem::Prefix(p) => prefixes.push(p),
        }
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| a.version_id.cmp(&b.version_id))
        });
    }

    GroupedVersions {
        prefixes,
        groups,
        next,
    }
}
