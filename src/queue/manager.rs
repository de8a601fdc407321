use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ConfigHandle;
use crate::models::item::{far_future, RoutedItem};
use crate::queue::cache::CorrelationCache;
use crate::queue::error::{QueueError, QueueResult};
use crate::queue::layout::{is_meta_file, QueuePath, META_SUFFIX};
use crate::queue::metadata;
use crate::queue::ordered::OrderedQueue;
use crate::queue::resources::ResourceTable;
use crate::storage::StorageBackend;

/// Durable enqueue and dequeue for ordered queues and the correlation cache.
///
/// Every enqueue writes the item's metadata snapshot before the item becomes
/// visible in memory, so a restart can rebuild all lists from disk with
/// `recover` and `recover_cache`.
#[derive(Debug)]
pub struct QueueManager {
    storage: Arc<dyn StorageBackend>,
    config: ConfigHandle,
    resources: ResourceTable,
}

impl QueueManager {
    pub fn new(storage: Arc<dyn StorageBackend>, config: ConfigHandle) -> Self {
        Self {
            storage,
            config,
            resources: ResourceTable::new(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    /// Persist `item` into `queue` and insert it by priority.
    ///
    /// Attempt bookkeeping starts over. A source file is moved into the
    /// queue directory when the item has exactly one destination and `copy`
    /// is false, and copied otherwise.
    pub async fn enqueue(
        &self,
        mut item: RoutedItem,
        queue: &OrderedQueue,
        copy: bool,
    ) -> QueueResult<RoutedItem> {
        item.attempts = 0;
        item.last_attempt = None;

        let item = self.persist_new(item, queue.path(), copy).await?;
        queue.insert(item.clone());
        debug!(
            item_id = %item.id,
            connection = queue.connection(),
            queue = queue.name(),
            priority = ?item.priority,
            "enqueued item"
        );
        Ok(item)
    }

    /// Take `item` out of `queue`.
    ///
    /// On success its metadata and source file are deleted. With `error`
    /// both are moved into the queue's `errors` directory together with a
    /// final snapshot, and the returned item points at the archived copies.
    /// The item leaves memory only once its files are disposed, so a failed
    /// dequeue leaves it queued for the next cycle.
    pub async fn dequeue(
        &self,
        item: &RoutedItem,
        queue: &OrderedQueue,
        error: bool,
    ) -> QueueResult<RoutedItem> {
        let disposed = self.dispose(item.clone(), queue.path(), error).await?;
        if queue.remove(item).is_none() {
            debug!(
                item_id = %item.id,
                queue = queue.name(),
                "dequeued item was no longer in memory"
            );
        }
        self.resources.release(&item.id);

        if error {
            warn!(
                item_id = %disposed.id,
                connection = queue.connection(),
                queue = queue.name(),
                attempts = disposed.attempts,
                last_error = disposed.last_error.as_deref().unwrap_or(""),
                "moved item to error archive"
            );
        } else {
            debug!(
                item_id = %disposed.id,
                connection = queue.connection(),
                queue = queue.name(),
                "dequeued item"
            );
        }
        Ok(disposed)
    }

    /// Add a responder entry to the cache.
    ///
    /// The first arrival for an id opens a bucket. A later arrival from
    /// another connection becomes a new entry; one from the same connection
    /// is merged into the existing entry and its snapshot rewritten.
    pub async fn enqueue_cache(
        &self,
        item: RoutedItem,
        cache: &CorrelationCache,
        copy: bool,
    ) -> QueueResult<RoutedItem> {
        let mut buckets = cache.lock().await;

        let existing = buckets.get(&item.id).and_then(|bucket| {
            bucket
                .iter()
                .position(|entry| entry.from_connection == item.from_connection)
        });

        if let Some(position) = existing {
            let bucket = buckets.entry(item.id.clone()).or_default();
            let mut merged = bucket[position].clone();
            merged.merge_from(&item);
            self.write_metadata(&merged).await?;
            bucket[position] = merged.clone();
            debug!(
                item_id = %merged.id,
                from = %merged.from_connection,
                cache = cache.name(),
                "merged reply into cache entry"
            );
            return Ok(merged);
        }

        let stored = self.persist_new(item, cache.path(), copy).await?;
        let bucket = buckets.entry(stored.id.clone()).or_default();
        bucket.push(stored.clone());
        debug!(
            item_id = %stored.id,
            from = %stored.from_connection,
            cache = cache.name(),
            responders = bucket.len(),
            "added cache entry"
        );
        Ok(stored)
    }

    /// Remove the whole bucket of `item.id`, deleting or archiving every
    /// entry's snapshot. Returns the removed entries.
    pub async fn dequeue_cache(
        &self,
        item: &RoutedItem,
        cache: &CorrelationCache,
        error: bool,
    ) -> QueueResult<Vec<RoutedItem>> {
        let entries = cache.lock().await.remove(&item.id).unwrap_or_default();
        let disposed = self.dispose_cache_entries(entries, cache, error).await?;
        debug!(
            item_id = %item.id,
            cache = cache.name(),
            entries = disposed.len(),
            error,
            "dequeued cache bucket"
        );
        Ok(disposed)
    }

    /// Delete or archive snapshots of entries already taken out of `cache`
    pub async fn dispose_cache_entries(
        &self,
        entries: Vec<RoutedItem>,
        cache: &CorrelationCache,
        error: bool,
    ) -> QueueResult<Vec<RoutedItem>> {
        let mut disposed = Vec::with_capacity(entries.len());
        let mut failure = None;
        let mut released = Vec::new();
        for entry in entries {
            if !released.contains(&entry.id) {
                released.push(entry.id.clone());
            }
            match self.dispose(entry, cache.path(), error).await {
                Ok(entry) => disposed.push(entry),
                Err(err) => {
                    warn!(cache = cache.name(), error = %err, "failed to dispose cache entry");
                    failure.get_or_insert(err);
                }
            }
        }
        for id in released {
            self.resources.release(&id);
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(disposed),
        }
    }

    /// Independent copy of `item` for one destination.
    ///
    /// The copy is not persisted yet and shares the original's resources.
    pub fn clone_item(&self, item: &RoutedItem) -> RoutedItem {
        let mut clone = item.clone();
        clone.metadata_file_path = None;
        clone.routed_to.clear();
        self.resources.share(&item.id);
        clone
    }

    /// Count one more send attempt and persist it before the send starts
    pub async fn record_attempt(
        &self,
        item: &RoutedItem,
        queue: &OrderedQueue,
    ) -> QueueResult<RoutedItem> {
        let mut item = item.clone();
        item.attempts += 1;
        item.last_attempt = Some(Utc::now());
        self.save(&item, queue).await?;
        Ok(item)
    }

    /// Rewrite the snapshot of a queued item and refresh the in-memory copy
    pub async fn save(&self, item: &RoutedItem, queue: &OrderedQueue) -> QueueResult<()> {
        self.write_metadata(item).await?;
        if !queue.update(item) {
            debug!(item_id = %item.id, queue = queue.name(), "saved item is not queued in memory");
        }
        Ok(())
    }

    /// Rebuild `queue` from the metadata files on disk.
    ///
    /// Unreadable snapshots are moved to the error archive. Returns the
    /// number of items restored.
    pub async fn recover(&self, queue: &OrderedQueue) -> QueueResult<usize> {
        let mut items = self.load_snapshots(queue.path()).await?;
        items.sort_by_key(|item| item.created_at);

        let mut restored = 0;
        for item in items {
            if !queue.contains(&item) {
                queue.insert(item);
                restored += 1;
            }
        }
        if restored > 0 {
            info!(
                connection = queue.connection(),
                queue = queue.name(),
                restored,
                "recovered queued items"
            );
        }
        Ok(restored)
    }

    /// Rebuild the cache buckets from disk, merging snapshots of the same
    /// responder the way `enqueue_cache` would
    pub async fn recover_cache(&self, cache: &CorrelationCache) -> QueueResult<usize> {
        let mut items = self.load_snapshots(cache.path()).await?;
        items.sort_by_key(|item| item.created_at);

        let mut buckets = cache.lock().await;
        let mut restored = 0;
        for item in items {
            let bucket = buckets.entry(item.id.clone()).or_default();
            if bucket
                .iter()
                .any(|entry| entry.metadata_file_path == item.metadata_file_path)
            {
                continue;
            }
            match bucket
                .iter_mut()
                .find(|entry| entry.from_connection == item.from_connection)
            {
                Some(entry) => {
                    entry.merge_from(&item);
                    // the merged entry keeps one snapshot
                    if let Some(path) = &item.metadata_file_path {
                        self.storage.remove_file(path).await?;
                    }
                    self.write_metadata(entry).await?;
                }
                None => bucket.push(item),
            }
            restored += 1;
        }
        if restored > 0 {
            info!(cache = cache.name(), restored, "recovered cache entries");
        }
        Ok(restored)
    }

    async fn load_snapshots(&self, path: &QueuePath) -> QueueResult<Vec<RoutedItem>> {
        let files = self.storage.list_files(&path.meta_dir()).await?;

        let mut items = Vec::with_capacity(files.len());
        for file in files.into_iter().filter(|file| is_meta_file(file)) {
            let bytes = match self.storage.read_file(&file).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(path = %file.display(), error = %err, "skipping unreadable metadata");
                    continue;
                }
            };
            match metadata::decode(&bytes, &file) {
                Ok(item) => items.push(item),
                Err(err) => {
                    error!(error = %err, "corrupt metadata, moving to error archive");
                    let target = archive_path(&path.errors_meta_dir(), &file);
                    self.storage.move_file(&file, &target).await?;
                }
            }
        }
        Ok(items)
    }

    fn check_free_space(&self) -> QueueResult<()> {
        let floor = self.config.current().agent.min_free_disk_bytes;
        self.storage.check_free_space(floor).map_err(|err| {
            warn!(error = %err, "free space check failed");
            QueueError::from(err)
        })
    }

    /// Place the payload and write the first snapshot under `path`
    async fn persist_new(
        &self,
        mut item: RoutedItem,
        path: &QueuePath,
        copy: bool,
    ) -> QueueResult<RoutedItem> {
        self.check_free_space()?;
        // serialization problems surface before any file is touched
        metadata::encode(&item)?;

        let guid = Uuid::new_v4().to_string();
        let mut placed = None;
        if let Some(source) = item.source_file_name.clone() {
            let target = path.payload_path(&guid, source.extension());
            let moved = item.to_connections.len() == 1 && !copy;
            let relocated = if moved {
                self.storage.move_file(&source, &target).await?
            } else {
                self.storage.copy_file(&source, &target).await?
            };
            item.source_file_name = Some(relocated.clone());
            placed = Some((source, relocated, moved));
        }

        let meta = self.storage.subpath(&path.meta_path(&guid));
        item.metadata_file_path = Some(meta.clone());
        if let Err(err) = self.write_metadata(&item).await {
            if let Err(cleanup) = self.storage.remove_file(&meta).await {
                warn!(path = %meta.display(), error = %cleanup, "failed to remove partial metadata");
            }
            if let Some((source, relocated, moved)) = placed {
                self.undo_placement(&source, &relocated, moved).await;
            }
            return Err(err);
        }
        Ok(item)
    }

    /// Put a payload back where `persist_new` found it
    async fn undo_placement(&self, source: &Path, relocated: &Path, moved: bool) {
        let undone = if moved {
            self.storage.move_file(relocated, source).await.map(|_| ())
        } else {
            self.storage.remove_file(relocated).await
        };
        match undone {
            Ok(()) => debug!(path = %source.display(), moved, "rolled back payload placement"),
            Err(err) => error!(
                source = %source.display(),
                placed = %relocated.display(),
                error = %err,
                "failed to roll back payload placement"
            ),
        }
    }

    async fn write_metadata(&self, item: &RoutedItem) -> QueueResult<PathBuf> {
        let bytes = metadata::encode(item)?;
        let path = item
            .metadata_file_path
            .as_ref()
            .ok_or_else(|| QueueError::Serialization {
                id: item.id.clone(),
                reason: "item has no metadata path".to_string(),
            })?;
        Ok(self.storage.write_file(path, &bytes).await?)
    }

    /// Delete, or archive under `errors`, the snapshot and payload of an item
    async fn dispose(
        &self,
        mut item: RoutedItem,
        path: &QueuePath,
        error: bool,
    ) -> QueueResult<RoutedItem> {
        item.last_attempt = Some(far_future());

        if !error {
            if let Some(meta) = &item.metadata_file_path {
                self.storage.remove_file(meta).await?;
            }
            if let Some(source) = &item.source_file_name {
                self.storage.remove_file(source).await?;
            }
            return Ok(item);
        }

        if let Some(source) = item.source_file_name.clone() {
            if self.storage.exists(&source) {
                let target = archive_path(&path.errors_dir(), &source);
                item.source_file_name = Some(self.storage.move_file(&source, &target).await?);
            } else {
                warn!(item_id = %item.id, path = %source.display(), "source file missing, archiving metadata only");
            }
        }

        let original_meta = item.metadata_file_path.clone();
        let archived_meta = match &original_meta {
            Some(meta) => archive_path(&path.errors_meta_dir(), meta),
            None => path
                .errors_meta_dir()
                .join(format!("{}{}", Uuid::new_v4(), META_SUFFIX)),
        };
        item.metadata_file_path = Some(self.storage.subpath(&archived_meta));
        self.write_metadata(&item).await?;
        if let Some(meta) = original_meta {
            self.storage.remove_file(&meta).await?;
        }
        Ok(item)
    }
}

/// `file`'s name placed inside `dir`
fn archive_path(dir: &Path, file: &Path) -> PathBuf {
    match file.file_name() {
        Some(name) => dir.join(name),
        None => dir.join(Uuid::new_v4().to_string()),
    }
}
