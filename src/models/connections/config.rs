use serde::{Deserialize, Serialize};

/// Descriptor of a configured endpoint the agent exchanges items with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Filled from the table key when loaded from configuration
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether the connection answers remote-procedure requests
    #[serde(default)]
    pub request_response_enabled: bool,
    #[serde(default)]
    pub share_destinations: Vec<String>,
    #[serde(default = "default_retry_delay_minutes")]
    pub retry_delay_minutes: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Concurrent sends allowed to this connection
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl Connection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            request_response_enabled: false,
            share_destinations: Vec::new(),
            retry_delay_minutes: default_retry_delay_minutes(),
            max_attempts: default_max_attempts(),
            parallelism: default_parallelism(),
        }
    }

    /// Scheduler task-class for an operation on this connection, e.g. `pacs.Send`
    pub fn task_type(&self, operation: &str) -> String {
        format!("{}.{}", self.name, operation)
    }

    pub fn retry_delay(&self) -> chrono::Duration {
        // clamp keeps the conversion below chrono's bound
        chrono::Duration::minutes(self.retry_delay_minutes.min(1_000_000_000) as i64)
    }
}

fn default_true() -> bool {
    true
}

fn default_retry_delay_minutes() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_parallelism() -> usize {
    2
}
