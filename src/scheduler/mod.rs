mod registry;
mod task;

pub use registry::{
    SchedulerSettings, TaskOwner, TaskRegistry, TASK_COMPLETION_TASK, UPDATE_STATUS_TASK,
};
pub use task::{BoxError, JobResult, TaskInfo, TaskState};
