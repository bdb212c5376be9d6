use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use crate::error::TaskException;
use crate::executor::{Coroutine, TaskExecutor};
use crate::task::{Task, TaskRef};

/// Creates a task named `name` driven by `future` and starts it on the
/// calling host thread.
///
/// The body runs until its first suspending yield before this returns. A
/// plain `Ok(value)` return succeeds the task with `value`; an `Err` cancels
/// it carrying the error. Tasks created while the body runs become children
/// of this task (or are adopted by an entered TaskSet scope).
pub fn spawn_named<T, E, F>(name: impl Into<String>, future: F) -> Task<T>
where
    T: Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
    F: Future<Output = Result<T, E>> + Send + 'static,
{
    let task = TaskRef::new_named(Some(name.into().into()));
    let coroutine: Coroutine = Box::pin(async move {
        match future.await {
            Ok(value) => Ok(Arc::new(value) as Arc<dyn Any + Send + Sync>),
            Err(error) => Err(Arc::new(error) as TaskException),
        }
    });
    let executor = TaskExecutor::new(task.clone(), coroutine);
    task.set_executor(executor.clone());
    executor.exec();
    Task::from_ref(task)
}

/// [`spawn_named`] with the task named after the future's type, the way a
/// task factory names tasks after the wrapped function.
pub fn spawn<T, E, F>(future: F) -> Task<T>
where
    T: Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
    F: Future<Output = Result<T, E>> + Send + 'static,
{
    spawn_named(std::any::type_name::<F>(), future)
}
