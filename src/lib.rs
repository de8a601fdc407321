pub mod config;
pub mod dispatch;
pub mod logging;
pub mod models;
pub mod queue;
pub mod rules;
pub mod scheduler;
pub mod storage;
mod sync;

use anyhow::Context;
use std::future::Future;
use std::sync::Arc;

use crate::config::{Config, ConfigHandle};
use crate::dispatch::{Dispatcher, FolderTransport, Transport};
use crate::queue::QueueManager;
use crate::rules::RuleEngine;
use crate::scheduler::{SchedulerSettings, TaskRegistry};

/// Directory under the temp path where the folder transport delivers
pub const OUTBOX_DIR: &str = "outbox";

/// Assemble the agent from `config`, run until `shutdown` resolves and stop
/// every task. Logging must already be initialized.
pub async fn run<S>(config: Config, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()>,
{
    let transport = Arc::new(FolderTransport::new(config.temp_path().join(OUTBOX_DIR)));
    run_with(config, transport, shutdown).await
}

/// `run` with a caller-supplied transport
pub async fn run_with<S>(
    config: Config,
    transport: Arc<dyn Transport>,
    shutdown: S,
) -> anyhow::Result<()>
where
    S: Future<Output = ()>,
{
    tracing::info!("🔧 Starting Courier agent '{}'", config.agent.id);

    let storage = storage::create_storage_backend(&config.storage)
        .context("failed to open queue storage")?;
    let settings = SchedulerSettings::from_agent(&config.agent);
    let handle = ConfigHandle::new(config);

    let registry = Arc::new(TaskRegistry::new(settings));
    if !registry.start_monitors().await {
        anyhow::bail!("scheduler monitors could not be started");
    }

    tracing::info!("📦 Using transport: {}", transport.summary());
    let queues = Arc::new(QueueManager::new(storage, handle.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        handle.clone(),
        queues,
        RuleEngine::new(handle),
        registry.clone(),
        transport,
    ));

    let recovered = dispatcher
        .recover()
        .await
        .context("failed to recover queued items")?;
    tracing::info!("♻️ Recovered {} queued item(s)", recovered);

    registry.add_owner(dispatcher.clone());
    let loops = dispatcher.start().await;
    tracing::info!("🚀 Dispatching for {} connection(s)", loops);

    shutdown.await;

    tracing::info!("🛑 Shutting down");
    if !registry.stop_all(true).await {
        tracing::warn!("Some tasks did not stop within the grace period");
    }
    Ok(())
}
