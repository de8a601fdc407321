use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Error type a scheduled job may fail with
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result every scheduled job resolves to
pub type JobResult = Result<(), BoxError>;

/// Lifecycle of a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Registered, waiting for an admission token
    Waiting,
    Running,
    Completed,
    Canceled,
    Faulted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Canceled | TaskState::Faulted
        )
    }
}

/// Registry entry for one asynchronous job
#[derive(Debug)]
pub struct Task {
    pub task_id: u64,
    /// Concurrency class the task was admitted through, e.g. `pacs.Send`
    pub task_type: String,
    pub reference: String,
    pub is_long_running: bool,
    pub born_on: DateTime<Utc>,
    pub completed_on: Option<DateTime<Utc>>,
    pub state: TaskState,
    pub(crate) cancel: CancellationToken,
    pub(crate) handle: Option<JoinHandle<()>>,
}

impl Task {
    pub(crate) fn new(
        task_id: u64,
        task_type: &str,
        reference: String,
        is_long_running: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            task_type: task_type.to_string(),
            reference,
            is_long_running,
            born_on: Utc::now(),
            completed_on: None,
            state: TaskState::Waiting,
            cancel,
            handle: None,
        }
    }

    /// Terminal by state, or its join handle finished without reporting
    pub(crate) fn is_done(&self) -> bool {
        self.state.is_terminal() || self.handle.as_ref().is_some_and(|h| h.is_finished())
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            task_id: self.task_id,
            task_type: self.task_type.clone(),
            reference: self.reference.clone(),
            is_long_running: self.is_long_running,
            born_on: self.born_on,
            completed_on: self.completed_on,
            state: self.state,
            cancel_requested: self.cancel.is_cancelled(),
        }
    }
}

/// Point-in-time view of a task, safe to hand out of the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub task_id: u64,
    pub task_type: String,
    pub reference: String,
    pub is_long_running: bool,
    pub born_on: DateTime<Utc>,
    pub completed_on: Option<DateTime<Utc>>,
    pub state: TaskState,
    pub cancel_requested: bool,
}
