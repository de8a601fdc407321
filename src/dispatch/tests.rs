#![cfg(test)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigHandle};
use crate::dispatch::{
    Dispatcher, Transport, TransportError, INBOUND_QUEUE, OUTBOUND_QUEUE, REQUEST_CACHE,
};
use crate::models::connections::Connection;
use crate::models::item::{ConnectionSet, ItemStatus, ItemType, RoutedItem};
use crate::models::rules::DestRule;
use crate::queue::{QueueManager, QueuePath};
use crate::rules::RuleEngine;
use crate::scheduler::{SchedulerSettings, TaskRegistry};
use crate::storage::flaky::{FlakyStorage, StorageOp};
use crate::storage::{FilesystemStorage, StorageBackend};

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Deliver,
    Unavailable,
    Reject,
    Hold,
}

/// Records every send and answers with a scripted outcome per destination
#[derive(Default)]
struct MockTransport {
    outcomes: Mutex<HashMap<String, Outcome>>,
    sent: Mutex<Vec<(String, String)>>,
    release: Notify,
}

impl MockTransport {
    fn with(destination: &str, outcome: Outcome) -> Self {
        let transport = Self::default();
        transport.set(destination, outcome);
        transport
    }

    fn set(&self, destination: &str, outcome: Outcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(destination.to_string(), outcome);
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_to(&self, destination: &str) -> usize {
        self.sent()
            .iter()
            .filter(|(_, to)| to == destination)
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        item: &RoutedItem,
        destination: &Connection,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((item.id.clone(), destination.name.clone()));
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get(&destination.name)
            .copied()
            .unwrap_or(Outcome::Deliver);

        match outcome {
            Outcome::Deliver => Ok(()),
            Outcome::Unavailable => Err(TransportError::Unavailable {
                connection: destination.name.clone(),
                reason: "connection refused".to_string(),
            }),
            Outcome::Reject => Err(TransportError::Rejected {
                connection: destination.name.clone(),
                reason: "unsupported SOP class".to_string(),
            }),
            Outcome::Hold => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(TransportError::Canceled),
                    _ = self.release.notified() => Ok(()),
                }
            }
        }
    }

    fn summary(&self) -> String {
        "MockTransport".to_string()
    }
}

struct Fixture {
    dir: TempDir,
    registry: Arc<TaskRegistry>,
    transport: Arc<MockTransport>,
    dispatcher: Arc<Dispatcher>,
}

impl Fixture {
    fn incoming(&self, name: &str) -> PathBuf {
        let dir = self.dir.path().join("incoming");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, b"DICM").unwrap();
        path
    }

    fn archived(&self, connection: &str) -> Vec<PathBuf> {
        let dir = self
            .dir
            .path()
            .join(QueuePath::queue(connection, OUTBOUND_QUEUE).errors_meta_dir());
        files_in(&dir)
    }

    async fn settle(&self, connection: &str) {
        let task_type = format!("{connection}.Send");
        let registry = self.registry.clone();
        wait_until(move || registry.in_use(&task_type) == 0).await;
    }
}

fn files_in(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect(),
        Err(_) => Vec::new(),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn config(rules: Vec<DestRule>) -> Config {
    let mut config = Config::default();
    config.agent.min_free_disk_bytes = 0;
    config.agent.kickoff_interval_ms = 20;
    for name in ["modality", "portal", "cloud", "archive"] {
        let mut connection = Connection::new(name);
        connection.retry_delay_minutes = 0;
        connection.max_attempts = 2;
        connection.parallelism = 1;
        config.connections.insert(name.to_string(), connection);
    }
    for name in ["cloud", "archive"] {
        if let Some(connection) = config.connections.get_mut(name) {
            connection.request_response_enabled = true;
        }
    }
    config.rules = rules;
    config
}

fn fixture(rules: Vec<DestRule>, transport: MockTransport) -> Fixture {
    fixture_with(config(rules), transport)
}

fn fixture_with(config: Config, transport: MockTransport) -> Fixture {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(FilesystemStorage::new(dir.path()).unwrap());
    fixture_on(dir, storage, config, transport)
}

/// Dispatcher over storage whose operations can be made to fail
fn flaky_fixture(rules: Vec<DestRule>) -> (Fixture, Arc<FlakyStorage>) {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(FlakyStorage::new(dir.path()).unwrap());
    let fixture = fixture_on(dir, storage.clone(), config(rules), MockTransport::default());
    (fixture, storage)
}

fn fixture_on(
    dir: TempDir,
    storage: Arc<dyn StorageBackend>,
    config: Config,
    transport: MockTransport,
) -> Fixture {
    let handle = ConfigHandle::new(config);
    let queues = Arc::new(QueueManager::new(storage, handle.clone()));
    let registry = Arc::new(TaskRegistry::new(SchedulerSettings {
        task_delay: Duration::from_millis(20),
        max_task_duration: Duration::from_secs(60),
        shutdown_grace: Duration::from_secs(2),
    }));
    let transport = Arc::new(transport);
    let dispatcher = Arc::new(Dispatcher::new(
        handle.clone(),
        queues,
        RuleEngine::new(handle),
        registry.clone(),
        transport.clone(),
    ));
    Fixture {
        dir,
        registry,
        transport,
        dispatcher,
    }
}

fn to_cloud_and_archive() -> Vec<DestRule> {
    vec![DestRule::new("modality")
        .to(ConnectionSet::new("cloud"))
        .to(ConnectionSet::new("archive"))]
}

fn to_cloud() -> Vec<DestRule> {
    vec![DestRule::new("modality").to(ConnectionSet::new("cloud"))]
}

fn study(fixture: &Fixture, id: &str) -> RoutedItem {
    RoutedItem::new(id, ItemType::Dicom, "modality").with_source_file(fixture.incoming(&format!("{id}.dcm")))
}

#[tokio::test]
async fn test_route_fans_out_to_every_destination() {
    let fixture = fixture(to_cloud_and_archive(), MockTransport::default());
    let item = study(&fixture, "study-1");
    fixture.dispatcher.receive(item).await.unwrap();

    assert_eq!(fixture.dispatcher.route_cycle("modality").await.unwrap(), 1);

    let dispatcher = &fixture.dispatcher;
    assert!(dispatcher.inbound("modality").unwrap().is_empty());
    for name in ["cloud", "archive"] {
        let queued = dispatcher.outbound(name).unwrap().snapshot();
        assert_eq!(queued.len(), 1);
        let payload = queued[0].source_file_name.as_ref().unwrap();
        assert_eq!(std::fs::read(payload).unwrap(), b"DICM");
    }
}

#[tokio::test]
async fn test_partial_fan_out_resumes_without_duplicates() {
    let (fixture, storage) = flaky_fixture(to_cloud_and_archive());
    storage.fail(
        StorageOp::Copy,
        QueuePath::queue("archive", OUTBOUND_QUEUE).dir(),
        1,
    );
    let item = study(&fixture, "study-1");
    fixture.dispatcher.receive(item).await.unwrap();

    let dispatcher = &fixture.dispatcher;
    assert!(dispatcher.route_cycle("modality").await.is_err());
    let pending = dispatcher.inbound("modality").unwrap().snapshot();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].routed_to, ["cloud"]);
    assert_eq!(dispatcher.outbound("cloud").unwrap().len(), 1);
    assert!(dispatcher.outbound("archive").unwrap().is_empty());

    assert_eq!(dispatcher.route_cycle("modality").await.unwrap(), 1);
    assert!(dispatcher.inbound("modality").unwrap().is_empty());
    for name in ["cloud", "archive"] {
        assert_eq!(dispatcher.outbound(name).unwrap().len(), 1, "{name}");
        let meta_dir = fixture
            .dir
            .path()
            .join(QueuePath::queue(name, OUTBOUND_QUEUE).meta_dir());
        assert_eq!(files_in(&meta_dir).len(), 1, "{name}");
    }
}

#[tokio::test]
async fn test_failed_progress_save_does_not_place_again() {
    let (fixture, storage) = flaky_fixture(to_cloud());
    let item = study(&fixture, "study-1");
    fixture.dispatcher.receive(item).await.unwrap();
    storage.fail(
        StorageOp::Write,
        QueuePath::queue("modality", INBOUND_QUEUE).meta_dir(),
        1,
    );

    let dispatcher = &fixture.dispatcher;
    assert!(dispatcher.route_cycle("modality").await.is_err());
    assert_eq!(dispatcher.outbound("cloud").unwrap().len(), 1);

    assert_eq!(dispatcher.route_cycle("modality").await.unwrap(), 1);
    assert!(dispatcher.inbound("modality").unwrap().is_empty());
    let queued = dispatcher.outbound("cloud").unwrap().snapshot();
    assert_eq!(queued.len(), 1);
    let payload = queued[0].source_file_name.as_ref().unwrap();
    assert_eq!(std::fs::read(payload).unwrap(), b"DICM");
}

#[tokio::test]
async fn test_unrouted_item_is_dropped() {
    let fixture = fixture(Vec::new(), MockTransport::default());
    let item = study(&fixture, "study-1");
    fixture.dispatcher.receive(item).await.unwrap();

    assert_eq!(fixture.dispatcher.route_cycle("modality").await.unwrap(), 0);
    assert!(fixture.dispatcher.inbound("modality").unwrap().is_empty());
    assert!(fixture.dispatcher.outbound("cloud").unwrap().is_empty());
}

#[tokio::test]
async fn test_receive_rejects_unknown_connection() {
    let fixture = fixture(to_cloud(), MockTransport::default());
    let item = RoutedItem::new("study-1", ItemType::Dicom, "nowhere");
    assert!(fixture.dispatcher.receive(item).await.is_err());
}

#[tokio::test]
async fn test_successful_send_dequeues() {
    let fixture = fixture(to_cloud(), MockTransport::default());
    let item = study(&fixture, "study-1");
    fixture.dispatcher.receive(item).await.unwrap();
    fixture.dispatcher.route_cycle("modality").await.unwrap();

    assert_eq!(fixture.dispatcher.send_cycle("cloud").await.unwrap(), 1);
    fixture.settle("cloud").await;

    assert_eq!(
        fixture.transport.sent(),
        [("study-1".to_string(), "cloud".to_string())]
    );
    assert!(fixture.dispatcher.outbound("cloud").unwrap().is_empty());
    assert!(fixture.archived("cloud").is_empty());
}

#[tokio::test]
async fn test_transient_failures_retry_until_attempts_run_out() {
    let fixture = fixture(
        to_cloud(),
        MockTransport::with("cloud", Outcome::Unavailable),
    );
    let item = study(&fixture, "study-1");
    fixture.dispatcher.receive(item).await.unwrap();
    fixture.dispatcher.route_cycle("modality").await.unwrap();
    let outbound = fixture.dispatcher.outbound("cloud").unwrap().clone();

    fixture.dispatcher.send_cycle("cloud").await.unwrap();
    fixture.settle("cloud").await;
    let queued = outbound.snapshot();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].attempts, 1);
    assert!(queued[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("connection refused"));

    fixture.dispatcher.send_cycle("cloud").await.unwrap();
    fixture.settle("cloud").await;
    assert_eq!(outbound.snapshot()[0].attempts, 2);

    // the third cycle finds the attempts used up
    assert_eq!(fixture.dispatcher.send_cycle("cloud").await.unwrap(), 0);
    assert!(outbound.is_empty());
    assert_eq!(fixture.transport.sent_to("cloud"), 2);

    let archived = fixture.archived("cloud");
    assert_eq!(archived.len(), 1);
    let snapshot: RoutedItem = serde_json::from_slice(&std::fs::read(&archived[0]).unwrap()).unwrap();
    assert_eq!(snapshot.status, ItemStatus::Failed);
}

#[tokio::test]
async fn test_rejected_item_is_archived_at_once() {
    let fixture = fixture(to_cloud(), MockTransport::with("cloud", Outcome::Reject));
    let item = study(&fixture, "study-1");
    fixture.dispatcher.receive(item).await.unwrap();
    fixture.dispatcher.route_cycle("modality").await.unwrap();

    fixture.dispatcher.send_cycle("cloud").await.unwrap();
    fixture.settle("cloud").await;

    assert!(fixture.dispatcher.outbound("cloud").unwrap().is_empty());
    assert_eq!(fixture.transport.sent_to("cloud"), 1);
    let archived = fixture.archived("cloud");
    assert_eq!(archived.len(), 1);
    let snapshot: RoutedItem = serde_json::from_slice(&std::fs::read(&archived[0]).unwrap()).unwrap();
    assert!(snapshot
        .last_error
        .as_deref()
        .unwrap()
        .contains("unsupported SOP class"));
}

#[tokio::test]
async fn test_parallelism_limits_concurrent_sends() {
    let fixture = fixture(to_cloud(), MockTransport::with("cloud", Outcome::Hold));
    for id in ["study-1", "study-2"] {
        let item = study(&fixture, id);
        fixture.dispatcher.receive(item).await.unwrap();
    }
    fixture.dispatcher.route_cycle("modality").await.unwrap();

    assert_eq!(fixture.dispatcher.send_cycle("cloud").await.unwrap(), 1);
    let transport = fixture.transport.clone();
    wait_until(move || transport.sent_to("cloud") == 1).await;

    // the held send keeps the only slot
    assert_eq!(fixture.dispatcher.send_cycle("cloud").await.unwrap(), 0);

    fixture.transport.release.notify_one();
    fixture.settle("cloud").await;
    assert_eq!(fixture.dispatcher.outbound("cloud").unwrap().len(), 1);

    assert_eq!(fixture.dispatcher.send_cycle("cloud").await.unwrap(), 1);
    let transport = fixture.transport.clone();
    wait_until(move || transport.sent_to("cloud") == 2).await;
    fixture.transport.release.notify_one();
    fixture.settle("cloud").await;
    assert!(fixture.dispatcher.outbound("cloud").unwrap().is_empty());
}

#[tokio::test]
async fn test_request_replies_are_correlated() {
    let rules = vec![DestRule::new("portal")
        .to(ConnectionSet::new("cloud"))
        .to(ConnectionSet::new("archive"))];
    let fixture = fixture(rules, MockTransport::default());
    let dispatcher = &fixture.dispatcher;

    dispatcher
        .receive(RoutedItem::request("portal", "req-1"))
        .await
        .unwrap();
    dispatcher.route_cycle("portal").await.unwrap();

    let requests = dispatcher.requests();
    assert_eq!(requests.name(), REQUEST_CACHE);
    let mut responders = requests.responders("req-1").await;
    responders.sort();
    assert_eq!(responders, ["archive", "cloud"]);

    let mut reply = RoutedItem::new("req-1", ItemType::Rpc, "cloud");
    reply.status = ItemStatus::Completed;
    reply.add_response("cloud says yes");
    assert!(!dispatcher.accept_reply(reply).await.unwrap());
    assert!(requests.contains("req-1").await);

    let mut reply = RoutedItem::new("req-1", ItemType::Rpc, "archive");
    reply.status = ItemStatus::Failed;
    reply.last_error = Some("study not found".to_string());
    assert!(dispatcher.accept_reply(reply).await.unwrap());
    assert!(!requests.contains("req-1").await);

    let combined = dispatcher.inbound("cloud").unwrap().snapshot();
    assert_eq!(combined.len(), 1);
    let combined = &combined[0];
    assert_eq!(combined.item_type, ItemType::Completion);
    assert_eq!(combined.status, ItemStatus::Failed);
    assert_eq!(combined.to_connections, [ConnectionSet::new("portal")]);
    assert_eq!(combined.response, ["cloud says yes"]);
    assert_eq!(combined.results.len(), 2);

    // the combined reply routes back to the requester without rules
    assert_eq!(dispatcher.route_cycle("cloud").await.unwrap(), 1);
    assert_eq!(dispatcher.outbound("portal").unwrap().len(), 1);
}

#[tokio::test]
async fn test_recover_restores_queues_and_requests() {
    let rules = vec![
        DestRule::new("portal").to(ConnectionSet::new("cloud")),
        DestRule::new("modality").to(ConnectionSet::new("archive")),
    ];
    let config = config(rules);
    let fixture = fixture_with(config.clone(), MockTransport::default());
    let item = study(&fixture, "study-1");
    fixture.dispatcher.receive(item).await.unwrap();
    fixture
        .dispatcher
        .receive(RoutedItem::request("portal", "req-1"))
        .await
        .unwrap();
    fixture.dispatcher.route_cycle("portal").await.unwrap();

    let handle = ConfigHandle::new(config);
    let storage = Arc::new(FilesystemStorage::new(fixture.dir.path()).unwrap());
    let restarted = Dispatcher::new(
        handle.clone(),
        Arc::new(QueueManager::new(storage, handle.clone())),
        RuleEngine::new(handle),
        Arc::new(TaskRegistry::default()),
        Arc::new(MockTransport::default()),
    );

    assert_eq!(restarted.recover().await.unwrap(), 3);
    assert_eq!(restarted.inbound("modality").unwrap().ids(), ["study-1"]);
    assert_eq!(restarted.outbound("cloud").unwrap().ids(), ["req-1"]);
    assert_eq!(restarted.requests().responders("req-1").await, ["cloud"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dispatch_loops_deliver_and_stop() {
    let fixture = fixture(to_cloud(), MockTransport::default());
    fixture.registry.add_owner(fixture.dispatcher.clone());

    assert_eq!(fixture.dispatcher.start().await, 4);

    let item = study(&fixture, "study-1");
    fixture.dispatcher.receive(item).await.unwrap();

    let transport = fixture.transport.clone();
    wait_until(move || transport.sent_to("cloud") == 1).await;
    let outbound = fixture.dispatcher.outbound("cloud").unwrap().clone();
    wait_until(move || outbound.is_empty()).await;

    assert!(fixture.registry.stop_all(false).await);
    assert!(fixture.registry.is_empty());
}
