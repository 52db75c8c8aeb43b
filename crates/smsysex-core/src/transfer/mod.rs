//! File transfer engine.
//!
//! High-level operations over the [`SysexClient`]: chunked uploads and
//! downloads, directory listings with a conflict-detection cache, deletes,
//! and directory/file creation. Transfers run through a queue with a
//! bounded number of concurrently active items, per-item cancellation
//! tokens, and throttled progress publication on `watch` channels the UI
//! subscribes to.
//!
//! ## Concurrency
//!
//! Uploads are processed in fixed batches of `max_concurrent` items; a
//! batch fully completes (or aborts on cancellation) before the next one
//! starts. Chunk writes of one file are issued strictly in offset order;
//! chunks of different files in a batch may interleave on the wire.
//! Cancellation is cooperative: tokens are polled at chunk boundaries and
//! between directory-listing retries, and an in-flight send is never
//! recalled - only its continuation short-circuits.
//!
//! ## Cache policy
//!
//! Mutating operations update the [`DirectoryCache`] optimistically and
//! the delete path re-fetches the parent listing afterwards to reconcile
//! with the device - a deliberate two-phase policy rather than trusting
//! the optimistic value long-term.

pub mod progress;

pub use progress::{QueueProgress, SpeedEstimator};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::error::{DeviceStatus, Error, Result};
use crate::fat;
use crate::protocol::{Command, DirReply, Envelope, FileEntry, OpenReply, ReadReply};
use crate::retry::RetryPolicy;
use crate::session::SysexClient;

/// Identifier of one queued transfer.
pub type TransferId = u64;

/// What a transfer item does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Host to device
    Upload,
    /// Device to host
    Download,
    /// Copy to a new device path, then delete the source
    Move,
}

/// Lifecycle of a transfer item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Waiting for a batch slot
    Pending,
    /// Currently transferring
    Active,
    /// Completed successfully
    Done,
    /// Failed with an error
    Failed,
    /// Cancelled by the user
    Canceled,
}

impl TransferStatus {
    /// Whether the item has settled and will not change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }
}

/// Read-only view of one transfer item.
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    /// Item identifier
    pub id: TransferId,
    /// Upload, download, or move
    pub kind: TransferKind,
    /// Source path or file name
    pub source: String,
    /// Destination path, when the operation has one
    pub dest: Option<String>,
    /// Bytes moved so far
    pub bytes_transferred: u64,
    /// Total bytes of the item
    pub total_bytes: u64,
    /// Current lifecycle state
    pub status: TransferStatus,
    /// Human-readable failure message, when status is `Failed`
    pub error: Option<String>,
}

struct TransferItem {
    snapshot: TransferSnapshot,
    token: CancellationToken,
    /// Remote path a write handle was opened for; the cleanup target when
    /// the item is cancelled mid-upload.
    opened_remote: Option<String>,
}

/// The user's answer to a name collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Replace the existing remote file
    Overwrite,
    /// Leave the existing file; skip this upload
    Skip,
}

/// A name collision awaiting a decision.
///
/// Emitted on the engine's conflict channel; the embedding UI shows its
/// dialog and answers exactly once via [`ConflictRequest::resolve`].
/// Dropping the request unanswered aborts the waiting operation.
#[derive(Debug)]
pub struct ConflictRequest {
    /// The colliding file name
    pub name: String,
    reply: oneshot::Sender<ConflictChoice>,
}

impl ConflictRequest {
    /// Deliver the decision to the suspended transfer.
    pub fn resolve(self, choice: ConflictChoice) {
        let _ = self.reply.send(choice);
    }
}

/// One file handed to [`TransferEngine::upload_files`].
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// Target file name inside the destination directory
    pub name: String,
    /// File content
    pub data: Vec<u8>,
}

/// Options for an upload batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadOptions {
    /// Preset conflict answer; `None` asks through the conflict channel
    pub on_conflict: Option<ConflictChoice>,
}

/// Options for a directory listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// Bypass any device-side listing cache
    pub force: bool,
}

/// Cached directory listings plus the browser bookkeeping the delete path
/// reconciles.
#[derive(Debug, Default)]
struct DirectoryCache {
    listings: HashMap<String, Vec<FileEntry>>,
    expanded: HashSet<String>,
    selected: HashSet<String>,
}

struct State {
    items: Vec<TransferItem>,
    next_id: TransferId,
    cache: DirectoryCache,
}

struct ProgressClock {
    last_publish: Instant,
    speed: SpeedEstimator,
}

struct Inner {
    client: Arc<SysexClient>,
    config: TransferConfig,
    retry: RetryPolicy,
    state: Mutex<State>,
    /// Parent of every item token; replaced wholesale by `cancel_all` so
    /// later operations start uncancelled.
    global_cancel: Mutex<CancellationToken>,
    queue_tx: watch::Sender<Vec<TransferSnapshot>>,
    progress_tx: watch::Sender<QueueProgress>,
    progress_clock: Mutex<ProgressClock>,
    conflict_tx: mpsc::UnboundedSender<ConflictRequest>,
}

/// The file transfer engine.
///
/// Cheap to clone; all clones share the same queue, cache, and client.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TransferEngine")
            .field("items", &state.items.len())
            .field("cached_dirs", &state.cache.listings.len())
            .finish_non_exhaustive()
    }
}

/// Window the speed estimate averages over.
const SPEED_WINDOW: Duration = Duration::from_secs(3);

impl TransferEngine {
    /// Create an engine over an established client.
    ///
    /// Returns the engine plus the channel conflict prompts arrive on.
    #[must_use]
    pub fn new(
        client: Arc<SysexClient>,
        config: TransferConfig,
        retry: RetryPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<ConflictRequest>) {
        let (conflict_tx, conflict_rx) = mpsc::unbounded_channel();
        let (queue_tx, _) = watch::channel(Vec::new());
        let (progress_tx, _) = watch::channel(QueueProgress::default());
        let inner = Arc::new(Inner {
            client,
            config,
            retry,
            state: Mutex::new(State {
                items: Vec::new(),
                next_id: 1,
                cache: DirectoryCache::default(),
            }),
            global_cancel: Mutex::new(CancellationToken::new()),
            queue_tx,
            progress_tx,
            progress_clock: Mutex::new(ProgressClock {
                last_publish: Instant::now(),
                speed: SpeedEstimator::new(SPEED_WINDOW),
            }),
            conflict_tx,
        });
        (Self { inner }, conflict_rx)
    }

    /// Observe the transfer queue.
    #[must_use]
    pub fn queue(&self) -> watch::Receiver<Vec<TransferSnapshot>> {
        self.inner.queue_tx.subscribe()
    }

    /// Observe aggregated progress.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<QueueProgress> {
        self.inner.progress_tx.subscribe()
    }

    /// The cached listing for `path`, if one exists.
    #[must_use]
    pub fn cached_listing(&self, path: &str) -> Option<Vec<FileEntry>> {
        self.inner.state.lock().cache.listings.get(path).cloned()
    }

    /// Mark a directory as expanded or collapsed in the browser state.
    pub fn set_expanded(&self, path: &str, expanded: bool) {
        let mut state = self.inner.state.lock();
        if expanded {
            state.cache.expanded.insert(path.to_string());
        } else {
            state.cache.expanded.remove(path);
        }
    }

    /// Whether a directory is currently expanded.
    #[must_use]
    pub fn is_expanded(&self, path: &str) -> bool {
        self.inner.state.lock().cache.expanded.contains(path)
    }

    /// Add or remove a path from the selection.
    pub fn set_selected(&self, path: &str, selected: bool) {
        let mut state = self.inner.state.lock();
        if selected {
            state.cache.selected.insert(path.to_string());
        } else {
            state.cache.selected.remove(path);
        }
    }

    /// Currently selected paths.
    #[must_use]
    pub fn selected(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .inner
            .state
            .lock()
            .cache
            .selected
            .iter()
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    /// Upload a batch of files into `dest_dir`.
    ///
    /// Names are screened against the cached listing of `dest_dir`; each
    /// collision suspends the batch until a [`ConflictChoice`] arrives
    /// (or uses the preset from `options`). Skipped files never enter the
    /// queue; everything else is transferred in batches of
    /// `max_concurrent`. Returns the ids of the queued items.
    pub async fn upload_files(
        &self,
        files: Vec<UploadFile>,
        dest_dir: &str,
        options: UploadOptions,
    ) -> Result<Vec<TransferId>> {
        let dest_dir = normalize_path(dest_dir)?;
        let existing: HashSet<String> = self
            .inner
            .state
            .lock()
            .cache
            .listings
            .get(&dest_dir)
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| entry.name.to_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        let mut accepted = Vec::new();
        for file in files {
            if existing.contains(&file.name.to_lowercase()) {
                let choice = match options.on_conflict {
                    Some(choice) => choice,
                    None => self.prompt_conflict(&file.name).await?,
                };
                if choice == ConflictChoice::Skip {
                    tracing::info!(name = %file.name, "skipping conflicting upload");
                    continue;
                }
            }
            accepted.push(file);
        }
        if accepted.is_empty() {
            return Ok(Vec::new());
        }

        let global = self.inner.global_cancel.lock().clone();
        let mut queued = Vec::with_capacity(accepted.len());
        {
            let mut state = self.inner.state.lock();
            for file in accepted {
                let id = state.next_id;
                state.next_id += 1;
                let dest = join_path(&dest_dir, &file.name);
                state.items.push(TransferItem {
                    snapshot: TransferSnapshot {
                        id,
                        kind: TransferKind::Upload,
                        source: file.name.clone(),
                        dest: Some(dest),
                        bytes_transferred: 0,
                        total_bytes: file.data.len() as u64,
                        status: TransferStatus::Pending,
                        error: None,
                    },
                    token: global.child_token(),
                    opened_remote: None,
                });
                queued.push((id, file));
            }
        }
        self.publish_queue();
        let ids: Vec<TransferId> = queued.iter().map(|(id, _)| *id).collect();

        let mut remaining = queued.into_iter().peekable();
        while remaining.peek().is_some() {
            if global.is_cancelled() {
                break;
            }
            let batch: Vec<(TransferId, UploadFile)> = remaining
                .by_ref()
                .take(self.inner.config.max_concurrent)
                .collect();
            let mut handles = Vec::with_capacity(batch.len());
            for (id, file) in batch {
                let engine = self.clone();
                let dir = dest_dir.clone();
                handles.push(tokio::spawn(async move {
                    engine.run_upload(id, file, &dir).await;
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        }

        self.publish_queue();
        self.publish_progress(Instant::now());
        Ok(ids)
    }

    /// Download a file and return its bytes.
    pub async fn download_file(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize_path(path)?;
        let id = self.enqueue(TransferKind::Download, path.clone(), None, 0);
        self.set_status(id, TransferStatus::Active, None);
        let token = self.item_token(id)?;

        match self.read_remote(id, &token, &path).await {
            Ok(data) => {
                self.set_status(id, TransferStatus::Done, None);
                Ok(data)
            }
            Err(e) if e.is_cancellation() || token.is_cancelled() => {
                self.set_status(id, TransferStatus::Canceled, None);
                Err(Error::Cancelled)
            }
            Err(e) => {
                tracing::warn!(%path, error = %e, "download failed");
                self.set_status(id, TransferStatus::Failed, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// List a directory, refresh the cache, and return the sorted entries.
    ///
    /// Entries are ordered directories-first, then case-insensitively by
    /// name. Failures are retried a bounded number of times; after that
    /// the listing degrades to empty rather than surfacing an error.
    pub async fn list_directory(&self, path: &str, options: ListOptions) -> Result<Vec<FileEntry>> {
        let path = normalize_path(path)?;
        let global = self.inner.global_cancel.lock().clone();
        let mut attempt = 0u32;
        loop {
            match self.fetch_listing(&path, options.force).await {
                Ok(mut entries) => {
                    sort_entries(&mut entries);
                    self.inner
                        .state
                        .lock()
                        .cache
                        .listings
                        .insert(path.clone(), entries.clone());
                    return Ok(entries);
                }
                Err(e) => {
                    attempt += 1;
                    if global.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    if attempt >= self.inner.config.dir_retries {
                        tracing::error!(%path, error = %e, "listing failed, falling back to empty");
                        self.inner
                            .state
                            .lock()
                            .cache
                            .listings
                            .insert(path.clone(), Vec::new());
                        return Ok(Vec::new());
                    }
                    tracing::warn!(%path, attempt, error = %e, "listing failed, retrying");
                    tokio::time::sleep(self.inner.config.dir_retry_delay()).await;
                }
            }
        }
    }

    /// Delete a file or directory.
    ///
    /// A "file not found" from the device counts as success, so deletes
    /// are idempotent. The cache entry is removed optimistically - for
    /// directories every cached listing under the path is purged and the
    /// expanded/selected sets are pruned - and the parent listing is
    /// re-fetched afterwards to reconcile with the device.
    pub async fn delete_path(&self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        match self
            .command(&Command::Delete { path: path.clone() }, None)
            .await
        {
            Ok(_) => {}
            Err(Error::Device(DeviceStatus::NotFound)) => {
                tracing::debug!(%path, "delete of missing path treated as success");
            }
            Err(e) => return Err(e),
        }

        let parent = parent_of(&path);
        let name = file_name_of(&path).to_string();
        {
            let mut state = self.inner.state.lock();
            let was_directory = state.cache.listings.contains_key(&path)
                || state.cache.listings.get(&parent).is_some_and(|listing| {
                    listing
                        .iter()
                        .any(|e| e.name.eq_ignore_ascii_case(&name) && e.is_directory())
                });
            if let Some(listing) = state.cache.listings.get_mut(&parent) {
                listing.retain(|e| !e.name.eq_ignore_ascii_case(&name));
            }
            let prefix = format!("{path}/");
            if was_directory {
                state
                    .cache
                    .listings
                    .retain(|key, _| key != &path && !key.starts_with(&prefix));
                state
                    .cache
                    .expanded
                    .retain(|key| key != &path && !key.starts_with(&prefix));
            }
            state
                .cache
                .selected
                .retain(|key| key != &path && !key.starts_with(&prefix));
        }

        // reconcile with the device regardless of the optimistic update
        let _ = self.list_directory(&parent, ListOptions { force: true }).await;
        Ok(())
    }

    /// Create a directory.
    pub async fn create_directory(&self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        let (date, time) = fat::now();
        self.command(
            &Command::Mkdir {
                path: path.clone(),
                date,
                time,
            },
            None,
        )
        .await?;

        let parent = parent_of(&path);
        let entry = FileEntry {
            name: file_name_of(&path).to_string(),
            size: 0,
            attr: fat::ATTR_DIRECTORY,
            date,
            time,
        };
        self.apply_optimistic_entry(&parent, entry);
        Ok(())
    }

    /// Create a file, optionally with initial content.
    pub async fn create_file(&self, path: &str, initial: &[u8]) -> Result<()> {
        let path = normalize_path(path)?;
        let (date, time) = fat::now();
        let envelope = self
            .command(
                &Command::Open {
                    path: path.clone(),
                    write: 1,
                    date,
                    time,
                },
                None,
            )
            .await?;
        let open: OpenReply = envelope.reply("open")?;

        let mut offset = 0u32;
        for chunk in initial.chunks(self.inner.config.chunk_size) {
            self.command(
                &Command::Write {
                    fid: open.fid,
                    addr: offset,
                    size: chunk.len() as u32,
                },
                Some(chunk),
            )
            .await?;
            offset += chunk.len() as u32;
            tokio::time::sleep(self.inner.config.chunk_delay()).await;
        }
        self.command(&Command::Close { fid: open.fid }, None).await?;

        let entry = FileEntry {
            name: file_name_of(&path).to_string(),
            size: initial.len() as u64,
            attr: fat::ATTR_ARCHIVE,
            date,
            time,
        };
        self.apply_optimistic_entry(&parent_of(&path), entry);
        Ok(())
    }

    /// Move a file to a new path (download, re-upload, delete source).
    ///
    /// The device protocol has no rename command, so a move is a copy
    /// followed by a delete, tracked as one queue item.
    pub async fn move_path(&self, source: &str, dest: &str) -> Result<()> {
        let source = normalize_path(source)?;
        let dest = normalize_path(dest)?;
        let dest_parent = parent_of(&dest);
        let dest_name = file_name_of(&dest).to_string();

        let collides = self
            .inner
            .state
            .lock()
            .cache
            .listings
            .get(&dest_parent)
            .is_some_and(|listing| {
                listing
                    .iter()
                    .any(|e| e.name.eq_ignore_ascii_case(&dest_name))
            });
        if collides && self.prompt_conflict(&dest_name).await? == ConflictChoice::Skip {
            tracing::info!(%dest, "move skipped on conflict");
            return Ok(());
        }

        let id = self.enqueue(TransferKind::Move, source.clone(), Some(dest.clone()), 0);
        self.set_status(id, TransferStatus::Active, None);
        let token = self.item_token(id)?;

        let result = async {
            let data = self.read_remote(id, &token, &source).await?;
            self.write_remote(id, &token, &data, &dest).await?;
            match self
                .command(&Command::Delete { path: source.clone() }, None)
                .await
            {
                Ok(_) | Err(Error::Device(DeviceStatus::NotFound)) => {}
                Err(e) => return Err(e),
            }
            Ok(data.len() as u64)
        }
        .await;

        match result {
            Ok(size) => {
                {
                    let mut state = self.inner.state.lock();
                    let source_parent = parent_of(&source);
                    let source_name = file_name_of(&source).to_string();
                    if let Some(listing) = state.cache.listings.get_mut(&source_parent) {
                        listing.retain(|e| !e.name.eq_ignore_ascii_case(&source_name));
                    }
                }
                let (date, time) = fat::now();
                self.apply_optimistic_entry(
                    &dest_parent,
                    FileEntry {
                        name: dest_name,
                        size,
                        attr: fat::ATTR_ARCHIVE,
                        date,
                        time,
                    },
                );
                self.set_status(id, TransferStatus::Done, None);
                Ok(())
            }
            Err(e) if e.is_cancellation() || token.is_cancelled() => {
                self.cleanup_partial(id).await;
                self.set_status(id, TransferStatus::Canceled, None);
                Err(Error::Cancelled)
            }
            Err(e) => {
                tracing::warn!(%source, %dest, error = %e, "move failed");
                self.set_status(id, TransferStatus::Failed, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Cancel one transfer item.
    ///
    /// A pending item settles to `Canceled` immediately; an active item's
    /// token is cancelled and its worker settles the status after cleanup.
    /// Sibling items are unaffected.
    pub fn cancel_transfer(&self, id: TransferId) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            let item = state
                .items
                .iter_mut()
                .find(|item| item.snapshot.id == id)
                .ok_or(Error::UnknownTransfer(id))?;
            match item.snapshot.status {
                TransferStatus::Pending => {
                    item.token.cancel();
                    item.snapshot.status = TransferStatus::Canceled;
                }
                TransferStatus::Active => item.token.cancel(),
                _ => {}
            }
        }
        self.publish_queue();
        Ok(())
    }

    /// Cancel everything.
    ///
    /// Cancels the shared token (checked between chunks and batches) and
    /// every item token, marks pending items `Canceled`, and flushes the
    /// reassembly buffers so replies to abandoned requests cannot pin
    /// memory. Active workers settle their own items after best-effort
    /// deletion of partially written remote files.
    pub fn cancel_all(&self) {
        tracing::info!("cancelling all transfers");
        let old = {
            let mut global = self.inner.global_cancel.lock();
            std::mem::replace(&mut *global, CancellationToken::new())
        };
        old.cancel();
        {
            let mut state = self.inner.state.lock();
            for item in &mut state.items {
                match item.snapshot.status {
                    TransferStatus::Pending => {
                        item.token.cancel();
                        item.snapshot.status = TransferStatus::Canceled;
                    }
                    TransferStatus::Active => item.token.cancel(),
                    _ => {}
                }
            }
        }
        self.inner.client.flush_reassembly();
        self.publish_queue();
    }

    /// Remove a settled item from the queue.
    pub fn remove_transfer(&self, id: TransferId) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            let index = state
                .items
                .iter()
                .position(|item| item.snapshot.id == id)
                .ok_or(Error::UnknownTransfer(id))?;
            if !state.items[index].snapshot.status.is_terminal() {
                return Err(Error::Internal(
                    "cancel a transfer before removing it".to_string(),
                ));
            }
            state.items.remove(index);
        }
        self.publish_queue();
        Ok(())
    }

    // ---- internals ----

    /// Issue one command, retrying retryable device errors with backoff.
    async fn command(&self, command: &Command, binary: Option<&[u8]>) -> Result<Envelope> {
        let mut attempt = 0u32;
        loop {
            let envelope = self.inner.client.request(command, binary).await?;
            let status = envelope.status();
            if status == DeviceStatus::Ok {
                return Ok(envelope);
            }
            if status.is_retryable() && self.inner.retry.allows_retry(attempt) {
                let delay = self.inner.retry.delay(attempt);
                tracing::warn!(
                    ?status,
                    attempt,
                    ?delay,
                    command = command.reply_key(),
                    "retrying after device error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(Error::Device(status));
        }
    }

    async fn run_upload(&self, id: TransferId, file: UploadFile, dest_dir: &str) {
        let Ok(token) = self.item_token(id) else {
            return;
        };
        if token.is_cancelled() {
            self.set_status(id, TransferStatus::Canceled, None);
            return;
        }
        self.set_status(id, TransferStatus::Active, None);
        let dest = join_path(dest_dir, &file.name);

        match self.write_remote(id, &token, &file.data, &dest).await {
            Ok(()) => {
                let (date, time) = fat::now();
                self.apply_optimistic_entry(
                    dest_dir,
                    FileEntry {
                        name: file.name,
                        size: file.data.len() as u64,
                        attr: fat::ATTR_ARCHIVE,
                        date,
                        time,
                    },
                );
                self.set_status(id, TransferStatus::Done, None);
            }
            Err(e) if e.is_cancellation() || token.is_cancelled() => {
                self.cleanup_partial(id).await;
                self.set_status(id, TransferStatus::Canceled, None);
            }
            Err(e) => {
                tracing::warn!(id, name = %dest, error = %e, "upload failed");
                self.set_status(id, TransferStatus::Failed, Some(e.to_string()));
            }
        }
    }

    /// Chunked write of `data` to `dest`; open, write in offset order,
    /// close. The cancellation token is polled at every chunk boundary.
    async fn write_remote(
        &self,
        id: TransferId,
        token: &CancellationToken,
        data: &[u8],
        dest: &str,
    ) -> Result<()> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (date, time) = fat::now();
        let envelope = self
            .command(
                &Command::Open {
                    path: dest.to_string(),
                    write: 1,
                    date,
                    time,
                },
                None,
            )
            .await?;
        let open: OpenReply = envelope.reply("open")?;
        self.set_opened_remote(id, Some(dest.to_string()));
        self.set_total(id, data.len() as u64);

        let mut offset = 0usize;
        for chunk in data.chunks(self.inner.config.chunk_size) {
            if token.is_cancelled() {
                let _ = self
                    .inner
                    .client
                    .request(&Command::Close { fid: open.fid }, None)
                    .await;
                return Err(Error::Cancelled);
            }
            let write = Command::Write {
                fid: open.fid,
                addr: offset as u32,
                size: chunk.len() as u32,
            };
            if let Err(e) = self.command(&write, Some(chunk)).await {
                let _ = self
                    .inner
                    .client
                    .request(&Command::Close { fid: open.fid }, None)
                    .await;
                return Err(e);
            }
            offset += chunk.len();
            self.record_progress(id, offset as u64);
            tokio::time::sleep(self.inner.config.chunk_delay()).await;
        }

        self.command(&Command::Close { fid: open.fid }, None).await?;
        self.set_opened_remote(id, None);
        Ok(())
    }

    /// Chunked read of a remote file; open, read in offset order, close.
    async fn read_remote(
        &self,
        id: TransferId,
        token: &CancellationToken,
        path: &str,
    ) -> Result<Vec<u8>> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let envelope = self
            .command(
                &Command::Open {
                    path: path.to_string(),
                    write: 0,
                    date: 0,
                    time: 0,
                },
                None,
            )
            .await?;
        let open: OpenReply = envelope.reply("open")?;
        self.set_total(id, open.size);

        let mut data = Vec::with_capacity(usize::try_from(open.size).unwrap_or(0));
        while (data.len() as u64) < open.size {
            if token.is_cancelled() {
                let _ = self
                    .inner
                    .client
                    .request(&Command::Close { fid: open.fid }, None)
                    .await;
                return Err(Error::Cancelled);
            }
            let want = (open.size - data.len() as u64).min(self.inner.config.chunk_size as u64);
            let read = Command::Read {
                fid: open.fid,
                addr: data.len() as u32,
                size: want as u32,
            };
            let envelope = match self.command(&read, None).await {
                Ok(envelope) => envelope,
                Err(e) => {
                    let _ = self
                        .inner
                        .client
                        .request(&Command::Close { fid: open.fid }, None)
                        .await;
                    return Err(e);
                }
            };
            let reply: ReadReply = envelope.reply("read")?;
            let mut block = envelope
                .binary
                .ok_or_else(|| Error::MalformedReply("read reply missing binary".to_string()))?;
            block.truncate(reply.size as usize);
            if block.is_empty() {
                return Err(Error::MalformedReply("empty read block".to_string()));
            }
            data.extend_from_slice(&block);
            self.record_progress(id, data.len() as u64);
            tokio::time::sleep(self.inner.config.chunk_delay()).await;
        }

        self.command(&Command::Close { fid: open.fid }, None).await?;
        Ok(data)
    }

    async fn fetch_listing(&self, path: &str, force: bool) -> Result<Vec<FileEntry>> {
        let lines = self.inner.config.dir_lines;
        let mut offset = 0u32;
        let mut entries = Vec::new();
        loop {
            let envelope = self
                .command(
                    &Command::Dir {
                        path: path.to_string(),
                        offset,
                        lines,
                        force,
                    },
                    None,
                )
                .await?;
            let page: DirReply = envelope.reply("dir")?;
            let count = page.list.len();
            entries.extend(page.list);
            if count < lines as usize {
                break;
            }
            offset += lines;
        }
        Ok(entries)
    }

    async fn prompt_conflict(&self, name: &str) -> Result<ConflictChoice> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .conflict_tx
            .send(ConflictRequest {
                name: name.to_string(),
                reply: tx,
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    fn enqueue(
        &self,
        kind: TransferKind,
        source: String,
        dest: Option<String>,
        total_bytes: u64,
    ) -> TransferId {
        let global = self.inner.global_cancel.lock().clone();
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.items.push(TransferItem {
                snapshot: TransferSnapshot {
                    id,
                    kind,
                    source,
                    dest,
                    bytes_transferred: 0,
                    total_bytes,
                    status: TransferStatus::Pending,
                    error: None,
                },
                token: global.child_token(),
                opened_remote: None,
            });
            id
        };
        self.publish_queue();
        id
    }

    fn item_token(&self, id: TransferId) -> Result<CancellationToken> {
        self.inner
            .state
            .lock()
            .items
            .iter()
            .find(|item| item.snapshot.id == id)
            .map(|item| item.token.clone())
            .ok_or(Error::UnknownTransfer(id))
    }

    fn set_status(&self, id: TransferId, status: TransferStatus, error: Option<String>) {
        {
            let mut state = self.inner.state.lock();
            if let Some(item) = state.items.iter_mut().find(|item| item.snapshot.id == id) {
                item.snapshot.status = status;
                item.snapshot.error = error;
            }
        }
        self.publish_queue();
    }

    fn set_total(&self, id: TransferId, total_bytes: u64) {
        let mut state = self.inner.state.lock();
        if let Some(item) = state.items.iter_mut().find(|item| item.snapshot.id == id) {
            item.snapshot.total_bytes = total_bytes;
        }
    }

    fn set_opened_remote(&self, id: TransferId, path: Option<String>) {
        let mut state = self.inner.state.lock();
        if let Some(item) = state.items.iter_mut().find(|item| item.snapshot.id == id) {
            item.opened_remote = path;
        }
    }

    /// Best-effort delete of the partially written remote file of a
    /// cancelled item.
    async fn cleanup_partial(&self, id: TransferId) {
        let path = {
            let mut state = self.inner.state.lock();
            state
                .items
                .iter_mut()
                .find(|item| item.snapshot.id == id)
                .and_then(|item| item.opened_remote.take())
        };
        if let Some(path) = path {
            tracing::debug!(%path, "best-effort delete of partial remote file");
            let _ = self
                .inner
                .client
                .request(&Command::Delete { path }, None)
                .await;
        }
    }

    /// Insert or replace an entry in a cached listing, keeping sort order.
    fn apply_optimistic_entry(&self, dir: &str, entry: FileEntry) {
        let mut state = self.inner.state.lock();
        if let Some(listing) = state.cache.listings.get_mut(dir) {
            listing.retain(|e| !e.name.eq_ignore_ascii_case(&entry.name));
            listing.push(entry);
            sort_entries(listing);
        }
    }

    /// Track exact byte progress; deliveries to observers are throttled.
    fn record_progress(&self, id: TransferId, bytes_now: u64) {
        let delta = {
            let mut state = self.inner.state.lock();
            let Some(item) = state.items.iter_mut().find(|item| item.snapshot.id == id) else {
                return;
            };
            let delta = bytes_now.saturating_sub(item.snapshot.bytes_transferred);
            item.snapshot.bytes_transferred = bytes_now;
            delta
        };
        let now = Instant::now();
        let should_publish = {
            let mut clock = self.inner.progress_clock.lock();
            clock.speed.record(now, delta);
            if now.duration_since(clock.last_publish) >= self.inner.config.progress_interval() {
                clock.last_publish = now;
                true
            } else {
                false
            }
        };
        if should_publish {
            self.publish_progress(now);
            self.publish_queue();
        }
    }

    fn publish_progress(&self, now: Instant) {
        let mut progress = QueueProgress::default();
        {
            let state = self.inner.state.lock();
            for item in &state.items {
                match item.snapshot.status {
                    TransferStatus::Active => progress.active += 1,
                    TransferStatus::Pending => progress.pending += 1,
                    _ => {}
                }
                if item.snapshot.status != TransferStatus::Canceled
                    && item.snapshot.status != TransferStatus::Failed
                {
                    progress.bytes_transferred += item.snapshot.bytes_transferred;
                    progress.total_bytes += item.snapshot.total_bytes;
                }
            }
        }
        progress.speed_bps = self.inner.progress_clock.lock().speed.bytes_per_sec(now);
        let _ = self.inner.progress_tx.send(progress);
    }

    fn publish_queue(&self) {
        let snapshots: Vec<TransferSnapshot> = self
            .inner
            .state
            .lock()
            .items
            .iter()
            .map(|item| item.snapshot.clone())
            .collect();
        let _ = self.inner.queue_tx.send(snapshots);
    }
}

/// Directories first, then case-insensitive by name.
fn sort_entries(entries: &mut [FileEntry]) {
    entries.sort_by(|a, b| {
        b.is_directory()
            .cmp(&a.is_directory())
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}

/// Validate and canonicalize an absolute device path.
fn normalize_path(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(Error::InvalidPath(path.to_string()));
    }
    let trimmed = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };
    if trimmed.is_empty() || trimmed.contains("//") || trimmed.split('/').any(|seg| seg == "..") {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(trimmed.to_string())
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => path[..index].to_string(),
    }
}

fn file_name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}
