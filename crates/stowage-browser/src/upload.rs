//! Upload pipeline.
//!
//! Every accepted upload runs as its own tokio task right away, so several
//! files transfer at once and each multipart upload keeps up to
//! `upload_queue_size` parts in flight. The join handles also go into a FIFO
//! queue drained by a single consumer, which waits for each transfer in
//! submission order and refreshes the listing after every success. Refreshes
//! therefore never overtake each other, even when transfers finish out of
//! order.
//!
//! Tasks only move forward (`InProgress` to one terminal status) and are
//! removed only by [`UploadPipeline::clear`].

use std::collections::HashSet;
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::ClientSlot;
use crate::config::BrowserConfig;
use crate::error::{BrowserError, BrowserResult};
use crate::listing::ListingEngine;
use crate::store::{CompletedPart, DELIMITER, FOLDER_PLACEHOLDER, ListRequest, ObjectStore};

/// Lower-cased fragments that identify a storage quota rejection.
const STORAGE_LIMIT_MARKERS: [&str; 3] = [
    "storage limit exceeded",
    "exceeded storage limit",
    "exceeded usage limit",
];

/// Largest listing the first-upload check asks for.
const MAX_LIST_KEYS: usize = 1000;

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Data to upload, read one part at a time.
#[async_trait]
pub trait UploadSource: Send + Sync + fmt::Debug {
    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Read `len` bytes starting at `offset`.
    async fn read_part(&self, offset: u64, len: usize) -> std::io::Result<Bytes>;
}

/// An in-memory body.
#[derive(Debug, Clone)]
pub struct BytesSource(Bytes);

impl BytesSource {
    /// Wrap `data`.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }
}

#[async_trait]
impl UploadSource for BytesSource {
    fn size(&self) -> u64 {
        self.0.len() as u64
    }

    async fn read_part(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        let start = usize::try_from(offset)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?
            .min(self.0.len());
        let end = start.saturating_add(len).min(self.0.len());
        Ok(self.0.slice(start..end))
    }
}

/// A file on disk, opened per part.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    size: u64,
}

impl FileSource {
    /// Stat `path` and wrap it.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let size = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, size })
    }
}

#[async_trait]
impl UploadSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_part(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Status of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// Transferring.
    InProgress,
    /// Stored.
    Finished,
    /// Rejected or failed.
    Failed,
    /// Cancelled by the user.
    Cancelled,
}

impl UploadStatus {
    /// Whether the status is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::InProgress
    }
}

/// Failure class of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Above the size ceiling; nothing was sent.
    FileTooLarge,
    /// The project storage quota is exhausted.
    StorageLimit,
    /// Any other backend or I/O failure.
    Other,
}

/// Why an upload failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailure {
    /// Failure class.
    pub kind: FailureKind,
    /// Message as reported by the backend.
    pub message: String,
}

impl UploadFailure {
    fn classify(message: String) -> Self {
        let lowered = message.to_lowercase();
        let kind = if STORAGE_LIMIT_MARKERS.iter().any(|m| lowered.contains(m)) {
            FailureKind::StorageLimit
        } else {
            FailureKind::Other
        };
        Self { kind, message }
    }
}

/// One upload as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    /// Task ID.
    pub id: Uuid,
    /// Target bucket.
    pub bucket: String,
    /// Target key.
    pub key: String,
    /// Total size in bytes.
    pub size: u64,
    /// Current status.
    pub status: UploadStatus,
    /// Bytes acknowledged by the backend.
    pub progress: u64,
    /// Failure details when `status` is `Failed`.
    pub failure: Option<UploadFailure>,
}

impl UploadTask {
    fn advance(&mut self, status: UploadStatus, failure: Option<UploadFailure>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.failure = failure;
        if status == UploadStatus::Finished {
            self.progress = self.size;
        }
        true
    }
}

/// Notifications from the refresh consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// An upload finished and the listing was refreshed.
    Completed {
        /// Task ID.
        id: Uuid,
        /// Uploaded key.
        key: String,
    },
    /// The upload was the first object under the listed path.
    FirstUpload {
        /// Task ID.
        id: Uuid,
        /// Uploaded key.
        key: String,
    },
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Registry {
    tasks: Vec<UploadTask>,
    cancels: Vec<(Uuid, CancellationToken)>,
    // Uploads the refresh consumer has not handled yet.
    unrefreshed: HashSet<Uuid>,
}

impl Registry {
    fn get_mut(&mut self, id: Uuid) -> Option<&mut UploadTask> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Keys in `bucket` still waiting for their post-upload refresh.
    fn unrefreshed_keys(&self, bucket: &str) -> HashSet<String> {
        self.tasks
            .iter()
            .filter(|t| t.bucket == bucket && self.unrefreshed.contains(&t.id))
            .map(|t| t.key.clone())
            .collect()
    }
}

type SharedRegistry = Arc<Mutex<Registry>>;

struct QueuedUpload {
    id: Uuid,
    bucket: String,
    key: String,
    handle: JoinHandle<UploadStatus>,
}

enum TransferError {
    Cancelled,
    Failed(String),
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Accepts uploads and tracks them to completion.
pub struct UploadPipeline {
    slot: ClientSlot,
    config: BrowserConfig,
    registry: SharedRegistry,
    queue: mpsc::UnboundedSender<QueuedUpload>,
    events: broadcast::Sender<UploadEvent>,
}

impl fmt::Debug for UploadPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadPipeline")
            .field("slot", &self.slot)
            .field("tasks", &self.registry.lock().tasks.len())
            .finish_non_exhaustive()
    }
}

impl UploadPipeline {
    /// Create the pipeline and start its refresh consumer.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(
        slot: ClientSlot,
        config: BrowserConfig,
        listing: Arc<tokio::sync::Mutex<ListingEngine>>,
    ) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let registry: SharedRegistry = Arc::new(Mutex::new(Registry::default()));
        tokio::spawn(run_refresh_queue(RefreshConsumer {
            queue: rx,
            slot: slot.clone(),
            listing,
            registry: Arc::clone(&registry),
            events: events.clone(),
        }));
        Self {
            slot,
            config,
            registry,
            queue,
            events,
        }
    }

    /// Subscribe to completion events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    /// Start uploading `source` to `bucket`/`key`.
    ///
    /// Oversized sources are recorded as a `Failed` task and rejected with
    /// [`BrowserError::FileTooLarge`] before any network call.
    pub fn enqueue(
        &self,
        bucket: &str,
        key: &str,
        source: Arc<dyn UploadSource>,
    ) -> BrowserResult<Uuid> {
        let size = source.size();
        let limit = self.config.upload_max_size;
        let id = Uuid::new_v4();
        let mut task = UploadTask {
            id,
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            size,
            status: UploadStatus::InProgress,
            progress: 0,
            failure: None,
        };

        if size > limit {
            let err = BrowserError::FileTooLarge {
                key: key.to_owned(),
                size,
                limit,
            };
            task.advance(
                UploadStatus::Failed,
                Some(UploadFailure {
                    kind: FailureKind::FileTooLarge,
                    message: err.to_string(),
                }),
            );
            self.registry.lock().tasks.push(task);
            warn!(bucket, key, size, limit, "rejected oversized upload");
            return Err(err);
        }

        let client = self.slot.get()?;
        let cancel = CancellationToken::new();
        {
            let mut registry = self.registry.lock();
            let duplicate = registry.tasks.iter().any(|t| {
                t.status == UploadStatus::InProgress && t.bucket == bucket && t.key == key
            });
            if duplicate {
                return Err(BrowserError::DuplicateUpload {
                    key: key.to_owned(),
                });
            }
            registry.tasks.push(task);
            registry.cancels.push((id, cancel.clone()));
            registry.unrefreshed.insert(id);
        }

        let job = Transfer {
            id,
            client,
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            source,
            part_size: self.config.upload_part_size.max(1),
            concurrency: self.config.upload_queue_size.max(1),
            registry: Arc::clone(&self.registry),
        };
        let handle = tokio::spawn(job.run(cancel));
        debug!(id = %id, bucket, key, size, "upload enqueued");

        if self
            .queue
            .send(QueuedUpload {
                id,
                bucket: bucket.to_owned(),
                key: key.to_owned(),
                handle,
            })
            .is_err()
        {
            warn!(id = %id, "upload refresh consumer is gone");
        }
        Ok(id)
    }

    /// Cancel an in-progress upload. Returns whether a cancellation was issued.
    pub fn cancel(&self, id: Uuid) -> bool {
        let registry = self.registry.lock();
        let running = registry
            .tasks
            .iter()
            .any(|t| t.id == id && t.status == UploadStatus::InProgress);
        match registry.cancels.iter().find(|(task, _)| *task == id) {
            Some((_, token)) if running => {
                token.cancel();
                info!(id = %id, "upload cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Snapshot of every task, in submission order.
    #[must_use]
    pub fn tasks(&self) -> Vec<UploadTask> {
        self.registry.lock().tasks.clone()
    }

    /// Snapshot of one task.
    #[must_use]
    pub fn task(&self, id: Uuid) -> Option<UploadTask> {
        self.registry.lock().tasks.iter().find(|t| t.id == id).cloned()
    }

    /// Remove every terminal task. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut registry = self.registry.lock();
        let before = registry.tasks.len();
        registry.tasks.retain(|t| !t.status.is_terminal());
        let Registry { tasks, cancels, .. } = &mut *registry;
        cancels.retain(|(id, _)| tasks.iter().any(|t| t.id == *id));
        before - registry.tasks.len()
    }
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

struct Transfer {
    id: Uuid,
    client: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    source: Arc<dyn UploadSource>,
    part_size: u64,
    concurrency: usize,
    registry: SharedRegistry,
}

impl Transfer {
    async fn run(self, cancel: CancellationToken) -> UploadStatus {
        let result = if self.source.size() <= self.part_size {
            tokio::select! {
                () = cancel.cancelled() => Err(TransferError::Cancelled),
                r = self.put_single() => r,
            }
        } else {
            self.put_multipart(&cancel).await
        };

        let (status, failure) = match result {
            Ok(()) => (UploadStatus::Finished, None),
            Err(TransferError::Cancelled) => (UploadStatus::Cancelled, None),
            Err(TransferError::Failed(message)) => {
                (UploadStatus::Failed, Some(UploadFailure::classify(message)))
            }
        };
        match &failure {
            Some(f) => warn!(id = %self.id, key = %self.key, kind = ?f.kind, error = %f.message, "upload failed"),
            None => info!(id = %self.id, key = %self.key, ?status, "upload finished"),
        }
        if let Some(task) = self.registry.lock().get_mut(self.id) {
            task.advance(status, failure);
        }
        status
    }

    fn add_progress(&self, bytes: u64) {
        if let Some(task) = self.registry.lock().get_mut(self.id) {
            task.progress = (task.progress + bytes).min(task.size);
        }
    }

    async fn put_single(&self) -> Result<(), TransferError> {
        let len = usize::try_from(self.source.size()).map_err(|e| failed(&e))?;
        let body = self.source.read_part(0, len).await.map_err(|e| failed(&e))?;
        let size = body.len() as u64;
        self.client
            .put_object(&self.bucket, &self.key, body)
            .await
            .map_err(|e| failed(&e))?;
        self.add_progress(size);
        Ok(())
    }

    async fn put_multipart(&self, cancel: &CancellationToken) -> Result<(), TransferError> {
        let upload_id = tokio::select! {
            () = cancel.cancelled() => return Err(TransferError::Cancelled),
            r = self.client.create_multipart_upload(&self.bucket, &self.key) => r.map_err(|e| failed(&e))?,
        };
        debug!(id = %self.id, upload_id = %upload_id, "multipart upload created");

        let result = tokio::select! {
            () = cancel.cancelled() => Err(TransferError::Cancelled),
            r = self.upload_parts(&upload_id) => r,
        };
        let result = match result {
            Ok(parts) => self
                .client
                .complete_multipart_upload(&self.bucket, &self.key, &upload_id, parts)
                .await
                .map_err(|e| failed(&e)),
            Err(e) => Err(e),
        };

        if result.is_err() {
            if let Err(e) = self
                .client
                .abort_multipart_upload(&self.bucket, &self.key, &upload_id)
                .await
            {
                warn!(id = %self.id, upload_id = %upload_id, error = %e, "failed to abort multipart upload");
            }
        }
        result
    }

    async fn upload_parts(&self, upload_id: &str) -> Result<Vec<CompletedPart>, TransferError> {
        let size = self.source.size();
        let part_count = size.div_ceil(self.part_size);

        let mut parts: Vec<CompletedPart> = stream::iter(0..part_count)
            .map(|index| async move {
                let offset = index * self.part_size;
                let len = usize::try_from(self.part_size.min(size - offset))
                    .map_err(|e| failed(&e))?;
                let body = self
                    .source
                    .read_part(offset, len)
                    .await
                    .map_err(|e| failed(&e))?;
                let part_number = i32::try_from(index + 1).map_err(|e| failed(&e))?;
                let part = self
                    .client
                    .upload_part(&self.bucket, &self.key, upload_id, part_number, body)
                    .await
                    .map_err(|e| failed(&e))?;
                self.add_progress(len as u64);
                Ok::<_, TransferError>(part)
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }
}

fn failed(err: &dyn std::error::Error) -> TransferError {
    TransferError::Failed(err.to_string())
}

fn parent_path(key: &str) -> &str {
    key.rfind(DELIMITER).map_or("", |pos| &key[..=pos])
}

struct RefreshConsumer {
    queue: mpsc::UnboundedReceiver<QueuedUpload>,
    slot: ClientSlot,
    listing: Arc<tokio::sync::Mutex<ListingEngine>>,
    registry: SharedRegistry,
    events: broadcast::Sender<UploadEvent>,
}

impl RefreshConsumer {
    /// Whether `upload` is the only object under its parent path, ignoring the
    /// folder placeholder and uploads that are still waiting for a refresh.
    async fn is_first_under_parent(&self, upload: &QueuedUpload) -> BrowserResult<bool> {
        let client = self.slot.get()?;
        let mut ignored = self.registry.lock().unrefreshed_keys(&upload.bucket);
        let parent = parent_path(&upload.key);
        ignored.insert(upload.key.clone());
        ignored.insert(format!("{parent}{FOLDER_PLACEHOLDER}"));

        let request = ListRequest {
            bucket: upload.bucket.clone(),
            prefix: parent.to_owned(),
            delimiter: Some(DELIMITER.to_owned()),
            start: None,
            max_keys: (ignored.len() + 1).min(MAX_LIST_KEYS),
        };
        let page = client.list_objects_v2(&request).await?;
        let others = page
            .objects
            .iter()
            .map(|o| o.key.as_str())
            .chain(page.common_prefixes.iter().map(String::as_str))
            .any(|key| !ignored.contains(key));
        Ok(!others)
    }
}

/// Await transfers in submission order and refresh the listing after each
/// success.
async fn run_refresh_queue(mut consumer: RefreshConsumer) {
    while let Some(mut upload) = consumer.queue.recv().await {
        let status = (&mut upload.handle).await;
        consumer.registry.lock().unrefreshed.remove(&upload.id);
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                warn!(id = %upload.id, error = %e, "upload task panicked");
                continue;
            }
        };
        if status != UploadStatus::Finished {
            continue;
        }

        let mut engine = consumer.listing.lock().await;
        let in_view = engine.bucket() == upload.bucket && engine.path() == parent_path(&upload.key);
        let mut first = false;
        if in_view {
            first = match consumer.is_first_under_parent(&upload).await {
                Ok(first) => first,
                Err(e) => {
                    warn!(id = %upload.id, error = %e, "could not check for first upload");
                    false
                }
            };
            if let Err(e) = engine.refresh().await {
                warn!(id = %upload.id, error = %e, "listing refresh after upload failed");
            }
        }
        drop(engine);

        // No subscribers is fine.
        let _ = consumer.events.send(UploadEvent::Completed {
            id: upload.id,
            key: upload.key.clone(),
        });
        if first {
            let _ = consumer.events.send(UploadEvent::FirstUpload {
                id: upload.id,
                key: upload.key,
            });
        }
    }
    debug!("upload refresh consumer stopped");
}
