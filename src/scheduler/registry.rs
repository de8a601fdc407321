use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::scheduler::task::{JobResult, Task, TaskInfo, TaskState};
use crate::sync::{lock, read, write};

const DRAIN_POLL: Duration = Duration::from_millis(50);

pub const UPDATE_STATUS_TASK: &str = "Scheduler.UpdateStatus";
pub const TASK_COMPLETION_TASK: &str = "Scheduler.TaskCompletion";

/// Timing knobs for the registry loops
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub task_delay: Duration,
    pub max_task_duration: Duration,
    pub shutdown_grace: Duration,
}

impl SchedulerSettings {
    pub fn from_agent(agent: &AgentConfig) -> Self {
        Self {
            task_delay: agent.task_delay(),
            max_task_duration: agent.max_task_duration(),
            shutdown_grace: agent.shutdown_grace(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_agent(&AgentConfig::default())
    }
}

/// Something that runs its own work and must be told to stop on shutdown,
/// typically a connection with listeners or dispatch loops.
#[async_trait]
pub trait TaskOwner: Send + Sync {
    fn name(&self) -> &str;

    async fn stop(&self);
}

#[derive(Debug)]
pub(super) struct AdmissionGate {
    pub(super) semaphore: Arc<Semaphore>,
    capacity: usize,
    in_use: AtomicUsize,
}

impl AdmissionGate {
    fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_use: AtomicUsize::new(0),
        }
    }
}

/// One admitted slot of a task type, owned by the task it admitted.
///
/// `release` is the stop of that task type: it hands the permit back to its
/// gate once. Dropping an unreleased slot releases it, so a job that is
/// aborted still frees its slot, and no caller can free a slot it does not own.
pub(super) struct AdmissionSlot {
    gate: Arc<AdmissionGate>,
    task_type: String,
    permit: Option<OwnedSemaphorePermit>,
}

impl AdmissionSlot {
    pub(super) fn new(
        gate: Arc<AdmissionGate>,
        task_type: impl Into<String>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        gate.in_use.fetch_add(1, Ordering::SeqCst);
        Self {
            gate,
            task_type: task_type.into(),
            permit: Some(permit),
        }
    }

    /// Returns false, and logs, when the slot was already released
    pub(super) fn release(&mut self) -> bool {
        match self.permit.take() {
            Some(permit) => {
                self.gate.in_use.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
                true
            }
            None => {
                warn!(task_type = %self.task_type, "admission slot released more than once");
                false
            }
        }
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        if self.permit.is_some() {
            self.release();
        }
    }
}

/// Removes a task entry again if `start` gives up before the job is spawned,
/// including when the caller drops the `start` future mid-admission.
struct PendingStart<'a> {
    registry: &'a TaskRegistry,
    task_id: u64,
    armed: bool,
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.registry.tasks).remove(&self.task_id);
        }
    }
}

/// Admission control and lifecycle tracking for every asynchronous job.
///
/// One registry is created at the process root and shared as `Arc<TaskRegistry>`.
/// Each task type owns a counting gate sized by `register`; `start` waits for a
/// slot, spawns the job with its own child cancellation token and gives the
/// slot back when the job finishes, however it finishes. Slots are only ever
/// released by the task holding them.
pub struct TaskRegistry {
    gates: Mutex<HashMap<String, Arc<AdmissionGate>>>,
    tasks: Mutex<HashMap<u64, Task>>,
    owners: Mutex<Vec<Arc<dyn TaskOwner>>>,
    cancel: RwLock<CancellationToken>,
    next_id: AtomicU64,
    completions_tx: mpsc::UnboundedSender<u64>,
    completions_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<u64>>,
    settings: SchedulerSettings,
}

impl TaskRegistry {
    pub fn new(settings: SchedulerSettings) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            gates: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            owners: Mutex::new(Vec::new()),
            cancel: RwLock::new(CancellationToken::new()),
            next_id: AtomicU64::new(0),
            completions_tx,
            completions_rx: tokio::sync::Mutex::new(completions_rx),
            settings,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn new_task_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Ensure a gate of `capacity` slots exists for `task_type`.
    ///
    /// Registering an existing type keeps its gate as is, so tasks already
    /// holding slots are unaffected.
    pub fn register(&self, task_type: &str, capacity: usize) {
        let capacity = if capacity == 0 {
            warn!(task_type, "parallelism of 0 requested, using 1");
            1
        } else {
            capacity
        };

        let mut gates = lock(&self.gates);
        match gates.get(task_type) {
            Some(gate) if gate.capacity != capacity => {
                debug!(
                    task_type,
                    existing = gate.capacity,
                    requested = capacity,
                    "task type already registered, keeping existing capacity"
                );
            }
            Some(_) => {}
            None => {
                debug!(task_type, capacity, "registered task type");
                gates.insert(task_type.to_string(), Arc::new(AdmissionGate::new(capacity)));
            }
        }
    }

    pub(super) fn gate(&self, task_type: &str) -> Arc<AdmissionGate> {
        let mut gates = lock(&self.gates);
        gates
            .entry(task_type.to_string())
            .or_insert_with(|| {
                debug!(task_type, "auto-registered task type with capacity 1");
                Arc::new(AdmissionGate::new(1))
            })
            .clone()
    }

    /// Whether a slot is free right now. Unknown types get a gate of one.
    pub fn can_start(&self, task_type: &str) -> bool {
        self.gate(task_type).semaphore.available_permits() > 0
    }

    pub fn capacity(&self, task_type: &str) -> Option<usize> {
        lock(&self.gates).get(task_type).map(|gate| gate.capacity)
    }

    /// Slots currently held for `task_type`
    pub fn in_use(&self, task_type: &str) -> usize {
        lock(&self.gates)
            .get(task_type)
            .map(|gate| gate.in_use.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Register a task, wait for an admission slot and spawn `job`.
    ///
    /// The job receives the task's cancellation token, a child of the global
    /// one. Returns false without running the job when the registry is
    /// canceled (before or while waiting) or `task_id` is already in use.
    pub async fn start<F, Fut>(
        self: &Arc<Self>,
        task_id: u64,
        task_type: &str,
        reference: impl Into<String>,
        is_long_running: bool,
        job: F,
    ) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let reference = reference.into();
        let global = self.cancellation();
        if global.is_cancelled() {
            debug!(task_id, task_type, %reference, "scheduler canceled, not starting task");
            return false;
        }

        let token = global.child_token();
        {
            let mut tasks = lock(&self.tasks);
            if tasks.contains_key(&task_id) {
                warn!(task_id, task_type, "task id already registered");
                return false;
            }
            tasks.insert(
                task_id,
                Task::new(task_id, task_type, reference.clone(), is_long_running, token.clone()),
            );
        }
        let mut pending = PendingStart {
            registry: self.as_ref(),
            task_id,
            armed: true,
        };

        let gate = self.gate(task_type);
        let admitted = tokio::select! {
            biased;
            _ = global.cancelled() => None,
            permit = gate.semaphore.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = admitted else {
            debug!(task_id, task_type, "admission abandoned on cancellation");
            return false;
        };
        let mut slot = AdmissionSlot::new(gate, task_type, permit);

        let running = match lock(&self.tasks).get_mut(&task_id) {
            Some(task) => {
                task.state = TaskState::Running;
                true
            }
            None => false,
        };
        if !running {
            return false;
        }
        pending.armed = false;

        let registry = Arc::clone(self);
        let class = task_type.to_string();
        let job_token = token.clone();
        let handle = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(job(job_token.clone())).catch_unwind().await;
            let state = match outcome {
                Ok(Ok(())) if job_token.is_cancelled() => TaskState::Canceled,
                Ok(Ok(())) => TaskState::Completed,
                Ok(Err(err)) => {
                    warn!(task_id, task_type = %class, error = %err, "task faulted");
                    TaskState::Faulted
                }
                Err(panic) => {
                    error!(
                        task_id,
                        task_type = %class,
                        panic = %panic_message(&*panic),
                        "task panicked"
                    );
                    TaskState::Faulted
                }
            };
            slot.release();
            registry.finish(task_id, state);
        });

        if let Some(task) = lock(&self.tasks).get_mut(&task_id) {
            task.handle = Some(handle);
        }
        debug!(task_id, task_type, %reference, is_long_running, "task started");
        true
    }

    fn finish(&self, task_id: u64, state: TaskState) {
        let short_running = {
            let mut tasks = lock(&self.tasks);
            let Some(task) = tasks.get_mut(&task_id) else {
                return;
            };
            task.state = state;
            task.completed_on = Some(Utc::now());
            !task.is_long_running
        };
        if short_running {
            let _ = self.completions_tx.send(task_id);
        }
    }

    pub fn cancellation(&self) -> CancellationToken {
        read(&self.cancel).clone()
    }

    pub fn is_cancelled(&self) -> bool {
        read(&self.cancel).is_cancelled()
    }

    /// Raise the global cancellation signal
    pub fn cancel(&self) {
        read(&self.cancel).cancel();
    }

    pub fn add_owner(&self, owner: Arc<dyn TaskOwner>) {
        lock(&self.owners).push(owner);
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.tasks).is_empty()
    }

    pub fn task(&self, task_id: u64) -> Option<TaskInfo> {
        lock(&self.tasks).get(&task_id).map(Task::info)
    }

    /// All registered tasks ordered by id
    pub fn snapshot(&self) -> Vec<TaskInfo> {
        let mut infos: Vec<TaskInfo> = lock(&self.tasks).values().map(Task::info).collect();
        infos.sort_by_key(|info| info.task_id);
        infos
    }

    /// One status sweep: drop finished tasks and ask overdue short-running
    /// tasks to cancel. Returns how many tasks were removed.
    pub fn update_status_once(&self) -> usize {
        let now = Utc::now();
        let mut tasks = lock(&self.tasks);

        let finished: Vec<u64> = tasks
            .values()
            .filter(|task| task.is_done())
            .map(|task| task.task_id)
            .collect();
        for task_id in &finished {
            if let Some(task) = tasks.remove(task_id) {
                debug!(
                    task_id,
                    task_type = %task.task_type,
                    state = ?task.state,
                    "removed finished task"
                );
            }
        }

        for task in tasks.values() {
            if task.is_long_running
                || task.state != TaskState::Running
                || task.cancel.is_cancelled()
            {
                continue;
            }
            let age = (now - task.born_on).to_std().unwrap_or_default();
            if age > self.settings.max_task_duration {
                warn!(
                    task_id = task.task_id,
                    task_type = %task.task_type,
                    reference = %task.reference,
                    age_secs = age.as_secs(),
                    "task exceeded max duration, requesting cancellation"
                );
                task.cancel.cancel();
            }
        }

        finished.len()
    }

    /// Periodic status sweep until `cancel` fires
    pub async fn update_status(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.task_delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.update_status_once();
                }
            }
        }
        debug!("status loop stopped");
    }

    /// Remove short-running tasks as they finish, until `cancel` fires
    pub async fn task_completion(&self, cancel: CancellationToken) {
        let mut completions = self.completions_rx.lock().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = completions.recv() => match next {
                    Some(task_id) => self.complete(task_id),
                    None => break,
                },
            }
        }
        debug!("completion loop stopped");
    }

    fn complete(&self, task_id: u64) {
        let mut tasks = lock(&self.tasks);
        let finished = tasks
            .get(&task_id)
            .is_some_and(|task| task.state.is_terminal());
        if finished {
            if let Some(task) = tasks.remove(&task_id) {
                debug!(
                    task_id,
                    task_type = %task.task_type,
                    state = ?task.state,
                    "task completed"
                );
            }
        }
    }

    /// Start both registry loops as long-running tasks of their own.
    ///
    /// They stop with the global signal, so call this again after a
    /// non-shutdown `stop_all`.
    pub async fn start_monitors(self: &Arc<Self>) -> bool {
        let status = Arc::clone(self);
        let started_status = self
            .start(
                self.new_task_id(),
                UPDATE_STATUS_TASK,
                "scheduler status sweep",
                true,
                move |token| async move {
                    status.update_status(token).await;
                    Ok(())
                },
            )
            .await;

        let completion = Arc::clone(self);
        let started_completion = self
            .start(
                self.new_task_id(),
                TASK_COMPLETION_TASK,
                "scheduler completion tracking",
                true,
                move |token| async move {
                    completion.task_completion(token).await;
                    Ok(())
                },
            )
            .await;

        started_status && started_completion
    }

    /// Cancel everything, tell every owner to stop and wait for the registry
    /// to drain, at most for the configured grace period.
    ///
    /// With `shutdown` false a fresh cancellation signal is installed
    /// afterwards so new work can be started. Returns whether the registry
    /// drained in time.
    pub async fn stop_all(&self, shutdown: bool) -> bool {
        info!(shutdown, tasks = self.len(), "stopping all tasks");
        self.cancel();

        let owners: Vec<Arc<dyn TaskOwner>> = lock(&self.owners).clone();
        for owner in owners {
            debug!(owner = owner.name(), "stopping owner");
            owner.stop().await;
        }

        let deadline = tokio::time::Instant::now() + self.settings.shutdown_grace;
        let drained = loop {
            self.update_status_once();
            if self.is_empty() {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        };

        if drained {
            info!("all tasks stopped");
        } else {
            for task in self.snapshot() {
                warn!(
                    task_id = task.task_id,
                    task_type = %task.task_type,
                    reference = %task.reference,
                    state = ?task.state,
                    "task still running after grace period"
                );
            }
        }

        if !shutdown {
            *write(&self.cancel) = CancellationToken::new();
        }
        drained
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(SchedulerSettings::default())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
