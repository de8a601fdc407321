use serde::Deserialize;
use std::time::Duration;

/// Represents the configuration for the agent process
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_id")]
    pub id: String,
    /// Interval of the scheduler status sweep
    #[serde(default = "default_task_delay_ms")]
    pub task_delay_ms: u64,
    /// Watchdog age after which a short-running task is asked to cancel
    #[serde(default = "default_max_task_duration_secs")]
    pub max_task_duration_secs: u64,
    /// Interval between dispatch cycles when no enqueue wakes the loop
    #[serde(default = "default_kickoff_interval_ms")]
    pub kickoff_interval_ms: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Enqueue refuses to write below this much free space in the temp path
    #[serde(default = "default_min_free_disk_bytes")]
    pub min_free_disk_bytes: u64,
    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_id(),
            task_delay_ms: default_task_delay_ms(),
            max_task_duration_secs: default_max_task_duration_secs(),
            kickoff_interval_ms: default_kickoff_interval_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            min_free_disk_bytes: default_min_free_disk_bytes(),
            dispatch_batch_size: default_dispatch_batch_size(),
        }
    }
}

impl AgentConfig {
    pub fn task_delay(&self) -> Duration {
        Duration::from_millis(self.task_delay_ms)
    }

    pub fn max_task_duration(&self) -> Duration {
        Duration::from_secs(self.max_task_duration_secs)
    }

    pub fn kickoff_interval(&self) -> Duration {
        Duration::from_millis(self.kickoff_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_id() -> String {
    "courier".to_string()
}

fn default_task_delay_ms() -> u64 {
    1000
}

fn default_max_task_duration_secs() -> u64 {
    // one hour covers large study uploads
    3600
}

fn default_kickoff_interval_ms() -> u64 {
    5000
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_min_free_disk_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_dispatch_batch_size() -> usize {
    50
}
