use std::collections::HashMap;
use tokio::sync::{Mutex, MutexGuard};

use crate::models::item::RoutedItem;
use crate::queue::layout::QueuePath;

pub(crate) type Buckets = HashMap<String, Vec<RoutedItem>>;

/// Expected responders per request id.
///
/// Each bucket holds one entry per responding connection. The lock is held
/// across the small metadata write of an enqueue so merges of concurrent
/// replies never interleave.
#[derive(Debug)]
pub struct CorrelationCache {
    name: String,
    path: QueuePath,
    buckets: Mutex<Buckets>,
}

impl CorrelationCache {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let path = QueuePath::cache(&name);
        Self {
            name,
            path,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &QueuePath {
        &self.path
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Buckets> {
        self.buckets.lock().await
    }

    /// Number of open requests
    pub async fn len(&self) -> usize {
        self.buckets.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.lock().await.is_empty()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.buckets.lock().await.contains_key(id)
    }

    pub async fn bucket(&self, id: &str) -> Vec<RoutedItem> {
        self.buckets
            .lock()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Connections expected to answer request `id`
    pub async fn responders(&self, id: &str) -> Vec<String> {
        self.buckets
            .lock()
            .await
            .get(id)
            .map(|bucket| {
                bucket
                    .iter()
                    .map(|entry| entry.from_connection.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove the bucket of `id` if it is complete, in one step so concurrent
    /// replies cannot both see it complete
    pub(crate) async fn take_if_complete(&self, id: &str) -> Option<Vec<RoutedItem>> {
        let mut buckets = self.buckets.lock().await;
        let complete = buckets.get(id).is_some_and(|bucket| {
            !bucket.is_empty() && bucket.iter().all(|entry| entry.status.is_terminal())
        });
        if complete {
            buckets.remove(id)
        } else {
            None
        }
    }

    /// Put back a bucket taken with `take_if_complete`
    pub(crate) async fn restore(&self, id: &str, entries: Vec<RoutedItem>) {
        self.buckets
            .lock()
            .await
            .entry(id.to_string())
            .or_default()
            .extend(entries);
    }

    /// True once every responder of a known request reached a terminal status
    pub async fn is_complete(&self, id: &str) -> bool {
        self.buckets
            .lock()
            .await
            .get(id)
            .is_some_and(|bucket| {
                !bucket.is_empty() && bucket.iter().all(|entry| entry.status.is_terminal())
            })
    }
}
