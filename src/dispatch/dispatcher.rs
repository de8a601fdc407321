use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigHandle;
use crate::dispatch::transport::{Transport, TransportError};
use crate::models::connections::Connection;
use crate::models::item::{
    ConnectionSet, ItemStatus, ItemType, ResultRecord, RoutedItem,
};
use crate::queue::{CorrelationCache, OrderedQueue, QueueError, QueueManager, RetryPolicy};
use crate::rules::RuleEngine;
use crate::scheduler::{BoxError, JobResult, TaskOwner, TaskRegistry};
use crate::sync::{lock, read, write};

pub const INBOUND_QUEUE: &str = "inbound";
pub const OUTBOUND_QUEUE: &str = "outbound";
pub const REQUEST_CACHE: &str = "requests";

/// Scheduler operation names, combined with the connection name into a
/// task type (`pacs.Send`)
pub const SEND_OPERATION: &str = "Send";
pub const DISPATCH_OPERATION: &str = "Dispatch";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown connection '{0}'")]
    UnknownConnection(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl DispatchError {
    pub fn is_transient(&self) -> bool {
        match self {
            DispatchError::UnknownConnection(_) => false,
            DispatchError::Queue(err) => err.is_transient(),
        }
    }
}

/// Moves items from inbound queues through rule evaluation into outbound
/// queues, and from outbound queues to their destination transport.
///
/// Every connection has an inbound and an outbound queue; request items
/// additionally prime the correlation cache with one entry per expected
/// responder so the combined reply can be routed back to the requester.
pub struct Dispatcher {
    config: ConfigHandle,
    queues: Arc<QueueManager>,
    rules: RuleEngine,
    registry: Arc<TaskRegistry>,
    transport: Arc<dyn Transport>,
    inbound: HashMap<String, Arc<OrderedQueue>>,
    outbound: HashMap<String, Arc<OrderedQueue>>,
    requests: CorrelationCache,
    in_flight: Mutex<HashSet<PathBuf>>,
    stop: RwLock<CancellationToken>,
}

impl Dispatcher {
    /// Queues are created for the connections configured at construction
    pub fn new(
        config: ConfigHandle,
        queues: Arc<QueueManager>,
        rules: RuleEngine,
        registry: Arc<TaskRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let current = config.current();
        let mut inbound = HashMap::new();
        let mut outbound = HashMap::new();
        for name in current.connections.keys() {
            inbound.insert(
                name.clone(),
                Arc::new(OrderedQueue::new(name.clone(), INBOUND_QUEUE)),
            );
            outbound.insert(
                name.clone(),
                Arc::new(OrderedQueue::new(name.clone(), OUTBOUND_QUEUE)),
            );
        }

        Self {
            config,
            queues,
            rules,
            registry,
            transport,
            inbound,
            outbound,
            requests: CorrelationCache::new(REQUEST_CACHE),
            in_flight: Mutex::new(HashSet::new()),
            stop: RwLock::new(CancellationToken::new()),
        }
    }

    pub fn inbound(&self, connection: &str) -> Option<&Arc<OrderedQueue>> {
        self.inbound.get(connection)
    }

    pub fn outbound(&self, connection: &str) -> Option<&Arc<OrderedQueue>> {
        self.outbound.get(connection)
    }

    pub fn requests(&self) -> &CorrelationCache {
        &self.requests
    }

    fn batch_size(&self) -> usize {
        self.config.current().agent.dispatch_batch_size.max(1)
    }

    fn is_stopping(&self) -> bool {
        read(&self.stop).is_cancelled() || self.registry.is_cancelled()
    }

    /// Reload every queue and the request cache from disk
    pub async fn recover(&self) -> Result<usize, DispatchError> {
        let mut restored = 0;
        for queue in self.inbound.values().chain(self.outbound.values()) {
            restored += self.queues.recover(queue).await?;
        }
        restored += self.queues.recover_cache(&self.requests).await?;
        Ok(restored)
    }

    /// Accept an item from a transport into its source connection's
    /// inbound queue
    pub async fn receive(&self, item: RoutedItem) -> Result<RoutedItem, DispatchError> {
        let inbound = self
            .inbound
            .get(&item.from_connection)
            .ok_or_else(|| DispatchError::UnknownConnection(item.from_connection.clone()))?;
        Ok(self.queues.enqueue(item, inbound, false).await?)
    }

    /// Route a batch of the connection's inbound items. Returns how many
    /// were forwarded to at least one outbound queue.
    pub async fn route_cycle(&self, connection: &str) -> Result<usize, DispatchError> {
        let inbound = self
            .inbound
            .get(connection)
            .ok_or_else(|| DispatchError::UnknownConnection(connection.to_string()))?;

        let mut routed = 0;
        for item in inbound.peek(self.batch_size()) {
            if self.is_stopping() {
                break;
            }
            if self.route_item(inbound, item).await? {
                routed += 1;
            }
        }
        Ok(routed)
    }

    /// Place `item` on the outbound queue of every destination.
    ///
    /// Each placement is recorded on the inbound snapshot before the next one
    /// starts, so a cycle that fails halfway resumes with the destinations
    /// still missing instead of placing the earlier ones again.
    async fn route_item(
        &self,
        inbound: &OrderedQueue,
        mut item: RoutedItem,
    ) -> Result<bool, DispatchError> {
        if let Err(err) = self.rules.pre_process(&mut item).await {
            tracing::warn!(item_id = %item.id, error = %err, "pre-process failed, retrying next cycle");
            return Ok(false);
        }

        let destinations = match self.rules.eval(&item) {
            Ok(destinations) => destinations,
            Err(err) => {
                tracing::warn!(item_id = %item.id, error = %err, "rule evaluation failed, retrying next cycle");
                return Ok(false);
            }
        };

        if destinations.is_empty() {
            tracing::warn!(
                item_id = %item.id,
                from = %item.from_connection,
                "item matched no rule and is dropped"
            );
            self.queues.dequeue(&item, inbound, false).await?;
            return Ok(false);
        }

        let resumed = !item.routed_to.is_empty();
        item.to_connections = destinations.clone();
        if item.item_type == ItemType::Rpc && !resumed {
            self.prime_requests(&item).await?;
        }

        for destination in &destinations {
            let name = &destination.connection_name;
            if item.routed_to.contains(name) {
                continue;
            }
            let Some(outbound) = self.outbound.get(name) else {
                tracing::warn!(item_id = %item.id, destination = %name, "no outbound queue for destination");
                continue;
            };
            let clone = self.queues.clone_item(&item);
            match self.queues.enqueue(clone, outbound, false).await {
                Ok(_) => {}
                Err(err @ QueueError::Serialization { .. }) => {
                    tracing::error!(item_id = %item.id, error = %err, "item cannot be stored, archiving");
                    item.status = ItemStatus::Failed;
                    item.last_error = Some(err.to_string());
                    self.queues.dequeue(&item, inbound, true).await?;
                    return Ok(false);
                }
                Err(err) => return Err(err.into()),
            }
            item.routed_to.push(name.clone());
            // memory first, so a failed save cannot place this destination twice
            inbound.update(&item);
            self.queues.save(&item, inbound).await?;
        }

        self.queues.dequeue(&item, inbound, false).await?;
        tracing::debug!(
            item_id = %item.id,
            destinations = destinations.len(),
            resumed,
            "routed item"
        );
        Ok(true)
    }

    /// One cache entry per responder, addressed back to the requester
    async fn prime_requests(&self, request: &RoutedItem) -> Result<(), DispatchError> {
        for destination in &request.to_connections {
            let mut expected = RoutedItem::new(
                request.id.clone(),
                request.item_type,
                destination.connection_name.clone(),
            )
            .with_priority(request.priority)
            .with_destination(ConnectionSet::new(request.from_connection.clone()));
            expected.tag_data = request.tag_data.clone();
            self.queues
                .enqueue_cache(expected, &self.requests, false)
                .await?;
        }
        Ok(())
    }

    /// Start sends for the connection's eligible outbound items, as many as
    /// its parallelism admits. Returns how many sends were started.
    pub async fn send_cycle(self: &Arc<Self>, connection: &str) -> Result<usize, DispatchError> {
        let config = self.config.current();
        let descriptor = config
            .connection(connection)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownConnection(connection.to_string()))?;
        let outbound = self
            .outbound
            .get(connection)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownConnection(connection.to_string()))?;
        if !descriptor.enabled {
            return Ok(0);
        }

        let policy = RetryPolicy::from(&descriptor);
        let task_type = descriptor.task_type(SEND_OPERATION);
        self.registry.register(&task_type, descriptor.parallelism);

        let now = Utc::now();
        let mut started = 0;
        for item in outbound.peek(self.batch_size()) {
            if self.is_stopping() {
                break;
            }
            if self.is_in_flight(&item) {
                continue;
            }
            if policy.is_exhausted(&item) {
                self.retire(&outbound, item, policy.max_attempts).await?;
                continue;
            }
            if !policy.is_eligible(&item, now) {
                continue;
            }
            if !self.registry.can_start(&task_type) {
                break;
            }

            let item = self.queues.record_attempt(&item, &outbound).await?;
            if policy.is_exhausted(&item) {
                self.retire(&outbound, item, policy.max_attempts).await?;
                continue;
            }

            if !self
                .start_send(&task_type, &descriptor, &outbound, item)
                .await
            {
                break;
            }
            started += 1;
        }
        Ok(started)
    }

    async fn retire(
        &self,
        outbound: &OrderedQueue,
        mut item: RoutedItem,
        max_attempts: u32,
    ) -> Result<(), DispatchError> {
        tracing::error!(
            item_id = %item.id,
            connection = outbound.connection(),
            max_attempts,
            "item exceeded its send attempts, moving to error archive"
        );
        item.status = ItemStatus::Failed;
        item.last_error = Some(format!("maximum of {max_attempts} attempts exceeded"));
        self.queues.dequeue(&item, outbound, true).await?;
        Ok(())
    }

    fn is_in_flight(&self, item: &RoutedItem) -> bool {
        item.metadata_file_path
            .as_ref()
            .is_some_and(|path| lock(&self.in_flight).contains(path))
    }

    fn set_in_flight(&self, item: &RoutedItem, in_flight: bool) {
        let Some(path) = item.metadata_file_path.clone() else {
            return;
        };
        let mut set = lock(&self.in_flight);
        if in_flight {
            set.insert(path);
        } else {
            set.remove(&path);
        }
    }

    async fn start_send(
        self: &Arc<Self>,
        task_type: &str,
        destination: &Connection,
        outbound: &Arc<OrderedQueue>,
        item: RoutedItem,
    ) -> bool {
        self.set_in_flight(&item, true);
        let key = item.clone();
        let reference = format!("send '{}' to '{}'", item.id, destination.name);

        let dispatcher = Arc::clone(self);
        let queue = Arc::clone(outbound);
        let destination = destination.clone();
        let started = self
            .registry
            .start(
                self.registry.new_task_id(),
                task_type,
                reference,
                false,
                move |token| async move { dispatcher.deliver(&queue, &destination, item, token).await },
            )
            .await;

        if !started {
            self.set_in_flight(&key, false);
        }
        started
    }

    async fn deliver(
        &self,
        outbound: &OrderedQueue,
        destination: &Connection,
        item: RoutedItem,
        token: CancellationToken,
    ) -> JobResult {
        let key = item.clone();
        let outcome = self.complete_send(outbound, destination, item, token).await;
        self.set_in_flight(&key, false);
        outbound.wake();
        outcome
    }

    async fn complete_send(
        &self,
        outbound: &OrderedQueue,
        destination: &Connection,
        mut item: RoutedItem,
        token: CancellationToken,
    ) -> JobResult {
        match self.transport.send(&item, destination, token).await {
            Ok(()) => {
                item.status = ItemStatus::Completed;
                if let Err(err) = self.rules.post_process(&mut item, &destination.name).await {
                    tracing::warn!(item_id = %item.id, error = %err, "post-process failed");
                }
                self.queues.dequeue(&item, outbound, false).await?;
                tracing::info!(
                    item_id = %item.id,
                    destination = %destination.name,
                    attempts = item.attempts,
                    "sent item"
                );
                Ok(())
            }
            Err(TransportError::Canceled) => {
                tracing::info!(
                    item_id = %item.id,
                    destination = %destination.name,
                    "send canceled, item stays queued"
                );
                Ok(())
            }
            Err(err) if err.is_permanent() => {
                item.status = ItemStatus::Failed;
                item.last_error = Some(err.to_string());
                self.queues.dequeue(&item, outbound, true).await?;
                Err(BoxError::from(err))
            }
            Err(err) => {
                tracing::warn!(
                    item_id = %item.id,
                    destination = %destination.name,
                    attempts = item.attempts,
                    error = %err,
                    "send failed"
                );
                item.last_error = Some(err.to_string());
                self.queues.save(&item, outbound).await?;
                Err(BoxError::from(err))
            }
        }
    }

    /// Record a responder's reply to a request.
    ///
    /// Once every expected responder has answered, the combined reply is
    /// queued on the first responder's inbound queue, already addressed to
    /// the requester, and the request's cache bucket is removed. Returns
    /// whether this reply completed the request.
    pub async fn accept_reply(&self, reply: RoutedItem) -> Result<bool, DispatchError> {
        let id = reply.id.clone();
        self.queues
            .enqueue_cache(reply, &self.requests, false)
            .await?;

        let Some(entries) = self.requests.take_if_complete(&id).await else {
            return Ok(false);
        };
        let combined = combine_replies(&entries);
        let Some(inbound) = self.inbound.get(&combined.from_connection) else {
            self.requests.restore(&id, entries).await;
            return Err(DispatchError::UnknownConnection(combined.from_connection));
        };

        if let Err(err) = self.queues.enqueue(combined, inbound, false).await {
            self.requests.restore(&id, entries).await;
            return Err(err.into());
        }
        self.queues
            .dispose_cache_entries(entries, &self.requests, false)
            .await?;
        tracing::info!(item_id = %id, "request complete, reply queued for delivery");
        Ok(true)
    }

    /// Route and send for one connection until `cancel` fires or the
    /// dispatcher is stopped. Wakes on the kick-off interval or whenever one
    /// of the connection's queues receives an item.
    pub async fn run_connection(self: Arc<Self>, connection: String, cancel: CancellationToken) {
        let (Some(inbound), Some(outbound)) = (
            self.inbound.get(&connection).cloned(),
            self.outbound.get(&connection).cloned(),
        ) else {
            tracing::warn!(connection = %connection, "no queues for connection, dispatch loop not started");
            return;
        };
        let stop = read(&self.stop).clone();
        tracing::info!(connection = %connection, "dispatch loop started");

        loop {
            if let Err(err) = self.route_cycle(&connection).await {
                log_cycle_error("route", &connection, &err);
            }
            if let Err(err) = self.send_cycle(&connection).await {
                log_cycle_error("send", &connection, &err);
            }

            let kickoff = self.config.current().agent.kickoff_interval();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = stop.cancelled() => break,
                _ = inbound.notified() => {}
                _ = outbound.notified() => {}
                _ = tokio::time::sleep(kickoff) => {}
            }
        }
        tracing::info!(connection = %connection, "dispatch loop stopped");
    }

    /// Start a long-running dispatch loop per enabled connection. Returns
    /// how many loops were started.
    pub async fn start(self: &Arc<Self>) -> usize {
        *write(&self.stop) = CancellationToken::new();

        let config = self.config.current();
        let mut names: Vec<&String> = config
            .connections
            .iter()
            .filter(|(name, connection)| connection.enabled && self.outbound.contains_key(*name))
            .map(|(name, _)| name)
            .collect();
        names.sort();

        let mut started = 0;
        for name in names {
            let Some(connection) = config.connection(name) else {
                continue;
            };
            let dispatcher = Arc::clone(self);
            let loop_name = name.clone();
            let ok = self
                .registry
                .start(
                    self.registry.new_task_id(),
                    &connection.task_type(DISPATCH_OPERATION),
                    format!("dispatch loop for '{name}'"),
                    true,
                    move |token| async move {
                        dispatcher.run_connection(loop_name, token).await;
                        Ok(())
                    },
                )
                .await;
            if ok {
                started += 1;
            }
        }
        started
    }
}

#[async_trait]
impl TaskOwner for Dispatcher {
    fn name(&self) -> &str {
        "dispatcher"
    }

    async fn stop(&self) {
        tracing::info!("stopping dispatch loops");
        read(&self.stop).cancel();
    }
}

/// One reply carrying every responder's payloads and outcome
fn combine_replies(entries: &[RoutedItem]) -> RoutedItem {
    let first = &entries[0];
    let mut combined = RoutedItem::new(
        first.id.clone(),
        ItemType::Completion,
        first.from_connection.clone(),
    )
    .with_priority(first.priority);

    for entry in entries {
        for destination in &entry.to_connections {
            combined.add_destination(destination.clone());
        }
        for payload in &entry.response {
            combined.add_response(payload.clone());
        }
        for record in &entry.results {
            combined.add_result(record.clone());
        }
        combined.add_result(ResultRecord {
            connection: entry.from_connection.clone(),
            status: entry.status,
            detail: entry.last_error.clone(),
        });
        match (&mut combined.tag_data, &entry.tag_data) {
            (Some(ours), Some(theirs)) => ours.merge(theirs),
            (None, Some(theirs)) => combined.tag_data = Some(theirs.clone()),
            _ => {}
        }
    }

    combined.status = if entries.iter().any(|e| e.status == ItemStatus::Failed) {
        ItemStatus::Failed
    } else {
        ItemStatus::Completed
    };
    combined
}

fn log_cycle_error(cycle: &str, connection: &str, err: &DispatchError) {
    if err.is_transient() {
        tracing::warn!(cycle, connection, error = %err, "dispatch cycle skipped");
    } else {
        tracing::error!(cycle, connection, error = %err, "dispatch cycle failed");
    }
}
