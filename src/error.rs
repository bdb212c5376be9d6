use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Exception object carried by a cancelled task.
///
/// Shared so that [`propagate`](crate::propagate) and terminal callbacks can
/// hand the same error to several observers without cloning the error itself.
pub type TaskException = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Signal delivered into a live coroutine when its task reaches a terminal
/// state.
///
/// Every suspended yield resolves to `Err(ETaskDone)` exactly once after the
/// task is done, giving the coroutine a single chance to release external
/// resources before it is closed. The runtime never records this signal as a
/// task failure.
#[derive(Debug, Clone)]
pub struct ETaskDone {
    task_name: Option<Arc<str>>,
}

impl ETaskDone {
    pub(crate) fn new(task_name: Option<Arc<str>>) -> Self {
        Self { task_name }
    }

    /// Name of the task that terminated, if it had one.
    pub fn task_name(&self) -> Option<&str> {
        self.task_name.as_deref()
    }
}

impl fmt::Display for ETaskDone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task_name {
            Some(name) => write!(f, "task `{name}` is done"),
            None => write!(f, "task is done"),
        }
    }
}

impl std::error::Error for ETaskDone {}

/// Errors for misusing the runtime API.
///
/// These are programmer errors, not runtime conditions: every variant is
/// returned immediately by the offending call instead of being stored on a
/// task.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// `result()` was called on a task that has not succeeded.
    #[error("no result for a task that has not succeeded")]
    NotSucceeded,

    /// `exception()` was called on a task that has not been cancelled.
    #[error("no exception for a task that has not been cancelled")]
    NotCancelled,

    /// The task succeeded with a value of a different type.
    #[error("task result has a different type than requested")]
    ResultType,

    /// `wait()` was called from inside a running task.
    #[error("wait() is not allowed inside a task; use the wait yield instead")]
    WaitInsideTask,

    /// A thread-affine operation was called from a foreign OS thread.
    #[error("{0} must be called from the OS thread owning this Thread")]
    WrongOsThread(&'static str),
}
