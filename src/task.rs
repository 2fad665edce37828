//! Asynchronous task lifecycle: fire-and-poll execution, cooperative
//! cancellation, and single-slot alert dispatch.
//!
//! Callers see the contract the driver scripts poll against: `start()`
//! returns immediately, `is_running()` is a non-blocking snapshot, and
//! `stop()` requests cancellation that the task body honors at batch
//! boundaries, never mid-batch. At most one task runs per runner; a second
//! `start()` is rejected, never queued.
//!
//! Task bodies run on the tokio blocking pool since training and scoring
//! are CPU-bound. `start()` must therefore be called from within a tokio
//! runtime.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::{Error, Result};

/// What a task is doing; used for logging and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Training,
    Detection,
    Drift,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Training => write!(f, "training"),
            TaskKind::Detection => write!(f, "detection"),
            TaskKind::Drift => write!(f, "drift"),
        }
    }
}

/// Lifecycle state of the runner's task slot.
///
/// A task transitions Running to exactly one of Completed, Failed, or
/// Stopped. After a terminal state the runner accepts a new `start()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl TaskState {
    fn as_u8(self) -> u8 {
        match self {
            TaskState::Idle => 0,
            TaskState::Running => 1,
            TaskState::Completed => 2,
            TaskState::Failed => 3,
            TaskState::Stopped => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Idle,
            1 => TaskState::Running,
            2 => TaskState::Completed,
            3 => TaskState::Failed,
            _ => TaskState::Stopped,
        }
    }
}

/// How a task body ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// The body observed cancellation at a batch boundary and flushed what
    /// it had.
    Stopped,
}

/// Cancellation flag handed to the task body; checked between batches.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Alert callback: invoked once per finished task with `None` on clean
/// completion, or a status log describing the failure or stop.
pub type AlertCallback = Box<dyn Fn(Option<String>) + Send>;

/// Owns the lifecycle of one background task at a time.
pub struct TaskRunner {
    kind: TaskKind,
    state: Arc<AtomicU8>,
    cancel: CancelToken,
    alert: Arc<Mutex<Option<AlertCallback>>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    task_id: Mutex<Option<Uuid>>,
}

impl TaskRunner {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            state: Arc::new(AtomicU8::new(TaskState::Idle.as_u8())),
            cancel: CancelToken::new(),
            alert: Arc::new(Mutex::new(None)),
            handle: Mutex::new(None),
            task_id: Mutex::new(None),
        }
    }

    /// Launch `body` on a background execution context and return
    /// immediately.
    ///
    /// Fails with [`Error::AlreadyRunning`] when a task is in flight; any
    /// terminal state (or Idle) allows a new start. The body receives a
    /// [`CancelToken`] it must check between batches.
    pub fn start<F>(&self, body: F) -> Result<()>
    where
        F: FnOnce(CancelToken) -> Result<TaskOutcome> + Send + 'static,
    {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                if s == TaskState::Running.as_u8() {
                    None
                } else {
                    Some(TaskState::Running.as_u8())
                }
            })
            .map_err(|_| Error::AlreadyRunning)?;

        self.cancel.reset();

        let task_id = Uuid::new_v4();
        *self.task_id.lock().unwrap() = Some(task_id);
        tracing::info!(task = %task_id, kind = %self.kind, "task started");

        let kind = self.kind;
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let alert = Arc::clone(&self.alert);

        let handle = tokio::task::spawn_blocking(move || {
            let result = catch_unwind(AssertUnwindSafe(|| body(cancel)));

            let (terminal, status_log) = match result {
                Ok(Ok(TaskOutcome::Completed)) => (TaskState::Completed, None),
                Ok(Ok(TaskOutcome::Stopped)) => (
                    TaskState::Stopped,
                    Some(format!("{} task stopped before completion", kind)),
                ),
                Ok(Err(e)) => (TaskState::Failed, Some(e.to_string())),
                Err(_) => (
                    TaskState::Failed,
                    Some(format!("{} task panicked", kind)),
                ),
            };

            match terminal {
                TaskState::Completed => {
                    tracing::info!(task = %task_id, kind = %kind, "task completed")
                }
                TaskState::Stopped => {
                    tracing::info!(task = %task_id, kind = %kind, "task stopped")
                }
                _ => tracing::error!(
                    task = %task_id,
                    kind = %kind,
                    status = status_log.as_deref().unwrap_or(""),
                    "task failed"
                ),
            }

            // Terminal state is visible to pollers before the alert fires.
            state.store(terminal.as_u8(), Ordering::SeqCst);
            dispatch_alert(&alert, status_log);
        });

        *self.handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Non-blocking snapshot of whether the task slot is still running.
    /// Safe to call concurrently with the running task.
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == TaskState::Running.as_u8()
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Id of the most recently started task, if any.
    pub fn current_task_id(&self) -> Option<Uuid> {
        *self.task_id.lock().unwrap()
    }

    /// Request cooperative cancellation. Never blocks; the transition to
    /// Stopped happens when the body reaches the next batch boundary. A
    /// no-op when nothing is running.
    pub fn stop(&self) {
        if self.is_running() {
            self.cancel.cancel();
        }
    }

    /// Register the alert callback. At most one is held; the last
    /// registration wins.
    pub fn alert<F>(&self, callback: F)
    where
        F: Fn(Option<String>) + Send + 'static,
    {
        *self.alert.lock().unwrap() = Some(Box::new(callback));
    }

    /// Await the background task's completion. The fire-and-poll contract
    /// does not require this; it exists so embedders and tests can avoid
    /// sleep loops.
    pub async fn wait(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn dispatch_alert(alert: &Arc<Mutex<Option<AlertCallback>>>, status_log: Option<String>) {
    let guard = alert.lock().unwrap();
    if let Some(callback) = guard.as_ref() {
        // A misbehaving callback must not poison the runner.
        if catch_unwind(AssertUnwindSafe(|| callback(status_log))).is_err() {
            tracing::error!("alert callback panicked");
        }
    }
}
