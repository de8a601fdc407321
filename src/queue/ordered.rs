use std::sync::Mutex;
use tokio::sync::Notify;

use crate::models::item::{Priority, RoutedItem};
use crate::queue::layout::QueuePath;
use crate::sync::lock;

/// In-memory list of one connection's queue, mirrored on disk by the
/// metadata files the queue manager writes.
///
/// Entries are identified by their metadata path: fan-out clones share the
/// business id but each has its own snapshot.
#[derive(Debug)]
pub struct OrderedQueue {
    connection: String,
    name: String,
    path: QueuePath,
    items: Mutex<Vec<RoutedItem>>,
    notify: Notify,
}

impl OrderedQueue {
    pub fn new(connection: impl Into<String>, name: impl Into<String>) -> Self {
        let connection = connection.into();
        let name = name.into();
        let path = QueuePath::queue(&connection, &name);
        Self {
            connection,
            name,
            path,
            items: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &QueuePath {
        &self.path
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    /// Copy of the current list, in dispatch order
    pub fn snapshot(&self) -> Vec<RoutedItem> {
        lock(&self.items).clone()
    }

    /// Copy of the first `limit` items
    pub fn peek(&self, limit: usize) -> Vec<RoutedItem> {
        lock(&self.items).iter().take(limit).cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        lock(&self.items).iter().map(|item| item.id.clone()).collect()
    }

    /// Insert by priority: High in front, Medium at the midpoint, Low at the end
    pub(crate) fn insert(&self, item: RoutedItem) {
        {
            let mut items = lock(&self.items);
            match item.priority {
                Priority::High => items.insert(0, item),
                Priority::Medium => {
                    let middle = items.len() / 2;
                    items.insert(middle, item);
                }
                Priority::Low => items.push(item),
            }
        }
        self.notify.notify_one();
    }

    pub(crate) fn contains(&self, item: &RoutedItem) -> bool {
        lock(&self.items).iter().any(|queued| same_entry(queued, item))
    }

    pub(crate) fn remove(&self, item: &RoutedItem) -> Option<RoutedItem> {
        let mut items = lock(&self.items);
        let position = items.iter().position(|queued| same_entry(queued, item))?;
        Some(items.remove(position))
    }

    /// Replace the queued copy of `item` in place; false when it is gone
    pub(crate) fn update(&self, item: &RoutedItem) -> bool {
        let mut items = lock(&self.items);
        match items.iter_mut().find(|queued| same_entry(queued, item)) {
            Some(queued) => {
                *queued = item.clone();
                true
            }
            None => false,
        }
    }

    /// Wake a waiting dispatch loop without inserting anything
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Resolves after the next insertion, or immediately if one happened
    /// since the last call
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

fn same_entry(a: &RoutedItem, b: &RoutedItem) -> bool {
    match (&a.metadata_file_path, &b.metadata_file_path) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
