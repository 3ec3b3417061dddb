//! Task scheduler: admission, FIFO queue, stop signals and queries.
//!
//! Scheduler state sits behind one `std::sync::Mutex`. The concurrency-slot
//! check and the admission it guards run in the same critical section, and
//! no lock is held across an `.await`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use agentyard_core::Config;
use chrono::Utc;
use tokio::sync::{Notify, broadcast, watch};
use tracing::{debug, info, warn};

use super::events::{EventSink, TaskEvents};
use super::runner::{self, RunEnd};
use super::types::{Task, TaskError, TaskEvent, TaskMessage, TaskResult, TaskSpec, TaskStatus};
use crate::lease::{LeasePool, PoolStats};
use crate::permission::{PermissionBroker, PermissionResolution, PermissionResponse};
use crate::ports::PortAllocator;
use crate::process::{AgentLauncher, CliLauncher};

/// How a running task is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopKind {
    /// Kill immediately.
    Cancel,
    /// Ask the agent to stop, kill after the grace period.
    Interrupt,
}

impl StopKind {
    const fn status(self) -> TaskStatus {
        match self {
            Self::Cancel => TaskStatus::Cancelled,
            Self::Interrupt => TaskStatus::Interrupted,
        }
    }
}

struct RunningTask {
    stop_tx: watch::Sender<Option<StopKind>>,
    sink: EventSink,
}

struct QueuedTask {
    id: String,
    sink: EventSink,
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<String, Task>,
    running: HashMap<String, RunningTask>,
    queue: VecDeque<QueuedTask>,
    shutting_down: bool,
}

pub(crate) struct ManagerInner {
    pub(crate) config: Config,
    pub(crate) pool: LeasePool,
    pub(crate) ports: PortAllocator,
    pub(crate) broker: PermissionBroker,
    pub(crate) launcher: Arc<dyn AgentLauncher>,
    state: Mutex<SchedulerState>,
    idle: Notify,
}

/// Task lifecycle manager.
///
/// Owns the task records, the FIFO queue and the concurrency limit, and
/// composes the lease pool, the port allocator and the permission broker for
/// each task it runs.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("active", &self.get_active_task_ids())
            .field("queued", &self.get_queue_length())
            .finish_non_exhaustive()
    }
}

impl TaskManager {
    /// Manager backed by the configured agent CLI.
    ///
    /// Must be called from within a tokio runtime; the pool starts warming
    /// immediately.
    pub fn new(config: Config) -> Result<Self, TaskError> {
        config.validate()?;
        let launcher = Arc::new(CliLauncher::new(config.pool.clone())?);
        let ports = PortAllocator::new(&config.ports)?;
        Ok(Self::from_parts(config, launcher, ports))
    }

    /// Manager with an explicit launcher and port allocator.
    pub fn from_parts(
        config: Config,
        launcher: Arc<dyn AgentLauncher>,
        ports: PortAllocator,
    ) -> Self {
        let pool = LeasePool::start(config.pool.clone(), Arc::clone(&launcher));
        let broker = PermissionBroker::new(config.permissions.default_timeout());
        Self {
            inner: Arc::new(ManagerInner {
                config,
                pool,
                ports,
                broker,
                launcher,
                state: Mutex::new(SchedulerState::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Submit a task under `id`.
    ///
    /// Runs immediately when a slot is free, otherwise queues it. The returned
    /// channel carries every event of the task, ending with `Finished`.
    pub fn start_task(&self, id: impl Into<String>, spec: TaskSpec) -> Result<TaskEvents, TaskError> {
        let id = id.into();
        if id.is_empty() {
            return Err(TaskError::InvalidSpec("task id must not be empty".into()));
        }
        if spec.prompt.trim().is_empty() {
            return Err(TaskError::InvalidSpec("prompt must not be empty".into()));
        }

        let mut state = self.inner.lock();
        if state.shutting_down {
            return Err(TaskError::ShuttingDown);
        }
        if state.running.contains_key(&id)
            || state.tasks.get(&id).is_some_and(|task| task.status.is_active())
        {
            return Err(TaskError::AlreadyActive { task_id: id });
        }

        let (sink, events) = EventSink::channel(&id);
        state.tasks.insert(id.clone(), Task::new(id.clone(), spec));
        sink.emit(TaskEvent::Status {
            task_id: id.clone(),
            status: TaskStatus::Pending,
        });

        if state.running.len() < self.inner.config.tasks.max_concurrent_tasks {
            self.inner.admit(&mut state, &id, sink);
        } else {
            if let Some(task) = state.tasks.get_mut(&id) {
                task.status = TaskStatus::Queued;
            }
            sink.emit(TaskEvent::Status {
                task_id: id.clone(),
                status: TaskStatus::Queued,
            });
            state.queue.push_back(QueuedTask {
                id: id.clone(),
                sink,
            });
            info!(task_id = %id, position = state.queue.len(), "Task queued");
        }
        Ok(events)
    }

    /// Submit a task under a generated id.
    pub fn submit(&self, spec: TaskSpec) -> Result<(String, TaskEvents), TaskError> {
        let id = uuid::Uuid::new_v4().to_string();
        let events = self.start_task(id.clone(), spec)?;
        Ok((id, events))
    }

    /// Hard-abort a task. Queued tasks leave the queue.
    pub fn cancel_task(&self, id: &str) -> Result<(), TaskError> {
        self.stop_task(id, StopKind::Cancel)
    }

    /// Soft-stop a task: interrupt, wait the grace period, then kill.
    pub fn interrupt_task(&self, id: &str) -> Result<(), TaskError> {
        self.stop_task(id, StopKind::Interrupt)
    }

    fn stop_task(&self, id: &str, kind: StopKind) -> Result<(), TaskError> {
        let mut state = self.inner.lock();
        let Some(task) = state.tasks.get(id) else {
            return Err(TaskError::NotFound {
                task_id: id.to_string(),
            });
        };
        if task.status.is_terminal() {
            debug!(task_id = %id, status = %task.status, "Stop requested for finished task");
            return Ok(());
        }

        if let Some(pos) = state.queue.iter().position(|queued| queued.id == id) {
            if let Some(queued) = state.queue.remove(pos) {
                finish_task(&mut state, id, kind.status(), &queued.sink, None);
            }
            info!(task_id = %id, ?kind, "Removed task from queue");
            return Ok(());
        }

        let Some(sink) = state.running.get(id).map(|running| {
            running.stop_tx.send_replace(Some(kind));
            running.sink.clone()
        }) else {
            return Ok(());
        };
        finish_task(&mut state, id, kind.status(), &sink, None);
        drop(state);

        info!(task_id = %id, ?kind, "Stopping running task");
        self.inner.broker.cancel_for_task(id);
        Ok(())
    }

    /// Remove a task that has not started yet. Returns whether it was queued.
    pub fn cancel_queued_task(&self, id: &str) -> bool {
        let mut state = self.inner.lock();
        let Some(pos) = state.queue.iter().position(|queued| queued.id == id) else {
            return false;
        };
        let Some(queued) = state.queue.remove(pos) else {
            return false;
        };
        finish_task(&mut state, id, TaskStatus::Cancelled, &queued.sink, None);
        info!(task_id = %id, "Cancelled queued task");
        true
    }

    /// Answer the task's outstanding permission request.
    ///
    /// An empty `request_id` targets the task's only outstanding request.
    /// Returns `false` when no matching request is outstanding.
    pub fn send_response(
        &self,
        task_id: &str,
        mut response: PermissionResponse,
    ) -> Result<bool, TaskError> {
        if !self.inner.lock().tasks.contains_key(task_id) {
            return Err(TaskError::NotFound {
                task_id: task_id.to_string(),
            });
        }

        let pending = self.inner.broker.pending_for_task(task_id);
        if response.request_id.is_empty() {
            match pending.as_slice() {
                [only] => response.request_id = only.id.clone(),
                _ => return Ok(false),
            }
        } else if !pending.iter().any(|request| request.id == response.request_id) {
            debug!(task_id, request_id = %response.request_id, "No matching permission request");
            return Ok(false);
        }

        let request_id = response.request_id.clone();
        Ok(self.inner.broker.resolve(&request_id, response))
    }

    /// Resolve a permission request by id alone.
    pub fn resolve_permission(&self, response: PermissionResponse) -> bool {
        let request_id = response.request_id.clone();
        self.inner.broker.resolve(&request_id, response)
    }

    /// Every permission resolution, including timeouts.
    pub fn subscribe_permissions(&self) -> broadcast::Receiver<PermissionResolution> {
        self.inner.broker.subscribe()
    }

    pub fn is_task_running(&self, id: &str) -> bool {
        self.inner.lock().running.contains_key(id)
    }

    /// Whether anything is running or queued.
    pub fn has_active_task(&self) -> bool {
        let state = self.inner.lock();
        !state.running.is_empty() || !state.queue.is_empty()
    }

    pub fn get_queue_length(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Ids of running tasks, sorted.
    pub fn get_active_task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().running.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.inner.lock().tasks.get(id).cloned()
    }

    /// All task records, oldest first.
    pub fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.inner.lock().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Evict a finished task record.
    pub fn delete_task(&self, id: &str) -> Result<Task, TaskError> {
        let not_found = || TaskError::NotFound {
            task_id: id.to_string(),
        };
        let mut state = self.inner.lock();
        let active = state
            .tasks
            .get(id)
            .map(|task| task.status.is_active())
            .ok_or_else(not_found)?;
        // A stopped task keeps its slot until the process is gone.
        if active || state.running.contains_key(id) {
            return Err(TaskError::StillActive {
                task_id: id.to_string(),
            });
        }
        state.tasks.remove(id).ok_or_else(not_found)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Cancel everything, wait for running tasks to wind down, stop the pool.
    pub async fn shutdown(&self) {
        let (queued, running) = {
            let mut state = self.inner.lock();
            state.shutting_down = true;
            let queued: Vec<String> = state.queue.iter().map(|q| q.id.clone()).collect();
            let running: Vec<String> = state.running.keys().cloned().collect();
            (queued, running)
        };
        info!(
            queued = queued.len(),
            running = running.len(),
            "Shutting down task manager"
        );

        for id in &queued {
            self.cancel_queued_task(id);
        }
        for id in &running {
            if let Err(e) = self.cancel_task(id) {
                warn!(task_id = %id, error = %e, "Failed to cancel task during shutdown");
            }
        }

        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().running.is_empty() {
                break;
            }
            notified.await;
        }

        self.inner.pool.shutdown().await;
    }
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move a task into a free slot and spawn its run.
    fn admit(self: &Arc<Self>, state: &mut SchedulerState, id: &str, sink: EventSink) {
        let Some(task) = state.tasks.get_mut(id) else {
            return;
        };
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        let spec = task.spec.clone();

        sink.emit(TaskEvent::Status {
            task_id: id.to_string(),
            status: TaskStatus::Running,
        });
        let (stop_tx, stop_rx) = watch::channel(None);
        state.running.insert(
            id.to_string(),
            RunningTask {
                stop_tx,
                sink: sink.clone(),
            },
        );
        info!(task_id = %id, running = state.running.len(), "Task started");

        let inner = Arc::clone(self);
        let task_id = id.to_string();
        tokio::spawn(async move {
            let end = runner::run(&inner, &task_id, spec, &sink, stop_rx).await;
            inner.complete_run(&task_id, end, &sink);
        });
    }

    /// Record a run's outcome, free its slot, and promote queued tasks.
    fn complete_run(self: &Arc<Self>, id: &str, end: RunEnd, sink: &EventSink) {
        let mut state = self.lock();
        state.running.remove(id);

        let (status, summary, error) = match end {
            RunEnd::Completed { summary } => (TaskStatus::Completed, summary, None),
            RunEnd::Failed(e) => (TaskStatus::Failed, None, Some(e)),
            RunEnd::Stopped(kind) => (kind.status(), None, None),
        };

        let already_final = state
            .tasks
            .get(id)
            .is_some_and(|task| task.status.is_terminal());
        if already_final {
            debug!(task_id = %id, "Run wound down after stop");
        } else {
            if let Some(e) = &error {
                warn!(task_id = %id, error = %e, "Task failed");
            } else {
                info!(task_id = %id, %status, "Task finished");
            }
            let failure = error.as_ref().and_then(TaskError::failure_context);
            let result = TaskResult {
                status,
                summary,
                error: error.map(|e| e.to_string()),
                failure,
                duration_ms: 0,
            };
            finish_task(&mut state, id, status, sink, Some(result));
        }

        self.promote_next(&mut state);
        if state.running.is_empty() {
            self.idle.notify_waiters();
        }
    }

    /// Admit queued tasks in submission order while slots are free.
    fn promote_next(self: &Arc<Self>, state: &mut SchedulerState) {
        while state.running.len() < self.config.tasks.max_concurrent_tasks {
            let Some(next) = state.queue.pop_front() else {
                break;
            };
            debug!(task_id = %next.id, remaining = state.queue.len(), "Promoting queued task");
            self.admit(state, &next.id, next.sink);
        }
    }

    /// Non-terminal status change reported by a run.
    pub(crate) fn set_status(&self, id: &str, status: TaskStatus, sink: &EventSink) {
        let mut state = self.lock();
        let Some(task) = state.tasks.get_mut(id) else {
            return;
        };
        if task.status.is_terminal() || task.status == status {
            return;
        }
        task.status = status;
        sink.emit(TaskEvent::Status {
            task_id: id.to_string(),
            status,
        });
    }

    pub(crate) fn record_message(&self, id: &str, message: TaskMessage, sink: &EventSink) {
        let mut state = self.lock();
        if let Some(task) = state.tasks.get_mut(id) {
            task.messages.push(message.clone());
        }
        sink.emit(TaskEvent::Message {
            task_id: id.to_string(),
            message,
        });
    }

    pub(crate) fn record_session(&self, id: &str, session_id: String, sink: &EventSink) {
        let mut state = self.lock();
        if let Some(task) = state.tasks.get_mut(id) {
            task.session_id = Some(session_id.clone());
        }
        sink.emit(TaskEvent::Session {
            task_id: id.to_string(),
            session_id,
        });
    }
}

/// Move a task to a terminal status and emit its final events.
fn finish_task(
    state: &mut SchedulerState,
    id: &str,
    status: TaskStatus,
    sink: &EventSink,
    result: Option<TaskResult>,
) {
    let Some(task) = state.tasks.get_mut(id) else {
        return;
    };
    let now = Utc::now();
    let mut result = result.unwrap_or(TaskResult {
        status,
        summary: None,
        error: None,
        failure: None,
        duration_ms: 0,
    });
    result.duration_ms = task.elapsed_ms(now);

    task.status = status;
    task.completed_at = Some(now);
    task.result = Some(result.clone());

    sink.emit(TaskEvent::Status {
        task_id: id.to_string(),
        status,
    });
    sink.emit(TaskEvent::Finished {
        task_id: id.to_string(),
        result,
    });
}
