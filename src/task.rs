use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::context::context;
use crate::error::{RuntimeError, TaskException};
use crate::executor::TaskExecutor;
use crate::logging;
use crate::section::Section;
use crate::task_set::TaskSetInner;
use crate::thread::get_current_thread;
use crate::tls;

pub(crate) type TaskId = u64;

const ACTIVE: u8 = 0;
const SUCCEEDED: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared task state.
///
/// The state tag is atomic so predicates never take a lock. Terminal
/// transitions go through `TaskRef::finish`: the tag flips inside the
/// critical section that also releases held sections and detaches the parent
/// link, children are cancelled after the flip, and on-done callbacks run
/// last with every task lock released.
pub(crate) struct TaskCore {
    id: TaskId,
    name: Option<Arc<str>>,
    state: AtomicU8,
    body: Mutex<BodyState>,
    pub(crate) done: Mutex<DoneState>,
    /// `None` once the task is terminal; late attachments are refused.
    children: Mutex<Option<Vec<Weak<TaskCore>>>>,
    executor: Mutex<Option<Arc<TaskExecutor>>>,
    /// TaskSets that adopt tasks created during this task's execution.
    ts_scope: OnceLock<Vec<Arc<TaskSetInner>>>,
}

struct BodyState {
    result: Option<Arc<dyn Any + Send + Sync>>,
    exception: Option<TaskException>,
    parent: Option<Weak<TaskCore>>,
}

pub(crate) struct DoneState {
    /// `None` once drained; registration after that invokes immediately.
    pub(crate) callbacks: Option<Vec<DoneCallback>>,
    /// Sections currently held; released before any callback fires.
    pub(crate) sections: Vec<Section>,
}

pub(crate) type DoneCallback = Box<dyn FnOnce(&TaskRef) + Send>;

impl TaskCore {
    pub(crate) fn id(&self) -> TaskId {
        self.id
    }
}

/// Untyped handle to a task.
///
/// Cheap to clone; all lifecycle operations live here. [`Task<T>`] adds the
/// typed [`result()`](Task::result) accessor on top.
#[derive(Clone)]
pub struct TaskRef {
    pub(crate) core: Arc<TaskCore>,
}

impl TaskRef {
    /// Creates an ACTIVE task bound to the ambient parent and scopes of the
    /// current host thread.
    pub(crate) fn new_named(name: Option<Arc<str>>) -> TaskRef {
        // Ensure the calling OS thread is registered and has storage.
        let _ = get_current_thread();

        let ctx = context();
        let core = Arc::new(TaskCore {
            id: ctx.next_task_id(),
            name,
            state: AtomicU8::new(ACTIVE),
            body: Mutex::new(BodyState {
                result: None,
                exception: None,
                parent: None,
            }),
            done: Mutex::new(DoneState {
                callbacks: Some(Vec::new()),
                sections: Vec::new(),
            }),
            children: Mutex::new(Some(Vec::new())),
            executor: Mutex::new(None),
            ts_scope: OnceLock::new(),
        });
        ctx.register_task(&core);
        let task = TaskRef { core };

        // Ambient adoption: scopes entered on this thread plus the scopes
        // inherited by the task currently executing here. Adoption severs the
        // parent link; otherwise the executing task becomes the parent.
        let parent = tls::current_task();
        let mut scopes = tls::scopes_snapshot();
        if let Some(parent) = &parent {
            for ts in parent.core.ts_scope.get().into_iter().flatten() {
                if !scopes.iter().any(|s| Arc::ptr_eq(s, ts)) {
                    scopes.push(ts.clone());
                }
            }
        }
        let adopted = !scopes.is_empty();
        for ts in &scopes {
            TaskSetInner::add_ref(ts, &task, true);
        }
        let _ = task.core.ts_scope.set(scopes);
        if !adopted {
            if let Some(parent) = parent {
                parent.attach_child(&task);
            }
        }

        logging::lifecycle("Starting", &task);
        task
    }

    fn attach_child(&self, child: &TaskRef) {
        let mut children = self.core.children.lock();
        if let Some(list) = children.as_mut() {
            list.push(Arc::downgrade(&child.core));
            drop(children);
            child.core.body.lock().parent = Some(Arc::downgrade(&self.core));
        }
        // A terminal parent leaves the child unparented.
    }

    pub(crate) fn id(&self) -> TaskId {
        self.core.id
    }

    /// Name given at creation, if any.
    pub fn name(&self) -> Option<&str> {
        self.core.name.as_deref()
    }

    pub(crate) fn name_arc(&self) -> Option<Arc<str>> {
        self.core.name.clone()
    }

    /// Whether the task reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.core.state.load(Ordering::Acquire) != ACTIVE
    }

    /// Whether the task terminated successfully.
    pub fn is_succeeded(&self) -> bool {
        self.core.state.load(Ordering::Acquire) == SUCCEEDED
    }

    pub(crate) fn is_active(&self) -> bool {
        self.core.state.load(Ordering::Acquire) == ACTIVE
    }

    /// Exception carried by a cancelled task (`Ok(None)` for a clean cancel).
    ///
    /// Fails for a task that is not cancelled.
    pub fn exception(&self) -> Result<Option<TaskException>, RuntimeError> {
        if self.core.state.load(Ordering::Acquire) != CANCELLED {
            return Err(RuntimeError::NotCancelled);
        }
        Ok(self.core.body.lock().exception.clone())
    }

    pub(crate) fn exception_raw(&self) -> Option<TaskException> {
        self.core.body.lock().exception.clone()
    }

    pub(crate) fn result_boxed(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.core.body.lock().result.clone()
    }

    /// Calls `f` when the task is done; immediately if it already is.
    ///
    /// Queued callbacks run exactly once, in registration order, after the
    /// terminal state is observable.
    pub fn call_on_done(&self, f: impl FnOnce(&TaskRef) + Send + 'static) {
        {
            let mut done = self.core.done.lock();
            if let Some(callbacks) = done.callbacks.as_mut() {
                callbacks.push(Box::new(f));
                return;
            }
        }
        f(self);
    }

    /// Cancels the task without an exception. No-op when already done.
    pub fn cancel(&self) {
        self.finish(false, None, None);
    }

    /// Cancels the task carrying `exception`. No-op when already done.
    pub fn cancel_with<E>(&self, exception: E)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.finish(false, None, Some(Arc::new(exception)));
    }

    pub(crate) fn cancel_exc(&self, exception: Option<TaskException>) {
        self.finish(false, None, exception);
    }

    pub(crate) fn success_boxed(&self, result: Option<Arc<dyn Any + Send + Sync>>) {
        self.finish(true, result, None);
    }

    /// Single terminal transition behind `success`/`cancel`.
    fn finish(
        &self,
        success: bool,
        result: Option<Arc<dyn Any + Send + Sync>>,
        exception: Option<TaskException>,
    ) {
        if self.is_done() {
            return;
        }

        let callbacks;
        let parent;
        {
            let mut body = self.core.body.lock();
            let mut done = self.core.done.lock();
            if self.core.state.load(Ordering::Relaxed) != ACTIVE {
                return;
            }
            logging::lifecycle("Finishing", self);

            if success {
                body.result = Some(result.unwrap_or_else(|| Arc::new(())));
            } else {
                body.exception = exception;
            }

            for section in done.sections.drain(..) {
                section.force_release(self.core.id);
            }
            callbacks = done.callbacks.take().unwrap_or_default();
            parent = body.parent.take();

            self.core
                .state
                .store(if success { SUCCEEDED } else { CANCELLED }, Ordering::Release);
        }

        if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
            if let Some(list) = parent.children.lock().as_mut() {
                list.retain(|weak| weak.upgrade().is_some_and(|c| c.id != self.core.id));
            }
        }

        // Children snapshotted before callbacks; the slot is closed so tasks
        // attaching concurrently are refused rather than silently missed.
        let children = self.core.children.lock().take().unwrap_or_default();
        for child in children {
            if let Some(core) = child.upgrade() {
                TaskRef { core }.cancel();
            }
        }

        for callback in callbacks {
            callback(self);
        }

        self.core.executor.lock().take();
        context().unregister_task(self.core.id);
        logging::lifecycle("Done", self);
    }

    /// Blocks the calling host thread, draining its runqueue, until this task
    /// is done.
    ///
    /// Fails when called from inside a task; yield on the task instead.
    pub fn wait(&self) -> Result<&TaskRef, RuntimeError> {
        if tls::current_task().is_some() {
            return Err(RuntimeError::WaitInsideTask);
        }
        let task = self.clone();
        get_current_thread().execute_tasks_loop_until(move || task.is_done())?;
        Ok(self)
    }

    /// Adopts `other`'s terminal outcome as this task's own once `other`
    /// terminates.
    pub fn propagate(&self, other: &TaskRef) {
        let target = self.clone();
        other.call_on_done(move |done| {
            if done.is_succeeded() {
                target.success_boxed(done.result_boxed());
            } else {
                target.cancel_exc(done.exception_raw());
            }
        });
    }

    /// Severs the parent link, used when a TaskSet adopts the task.
    pub(crate) fn detach_from_parent(&self) {
        let parent = self.core.body.lock().parent.take();
        if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
            if let Some(list) = parent.children.lock().as_mut() {
                list.retain(|weak| weak.upgrade().is_some_and(|c| c.id != self.core.id));
            }
        }
    }

    pub(crate) fn set_executor(&self, executor: Arc<TaskExecutor>) {
        *self.core.executor.lock() = Some(executor);
    }

    /// Re-enters the executor; called by the owning thread's drain loop.
    pub(crate) fn run_executor(&self) {
        let executor = self.core.executor.lock().clone();
        if let Some(executor) = executor {
            executor.exec();
        }
    }
}

impl AsRef<TaskRef> for TaskRef {
    fn as_ref(&self) -> &TaskRef {
        self
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Task][{}]", self.name().unwrap_or("-"))?;
        match self.core.state.load(Ordering::Acquire) {
            SUCCEEDED => write!(f, "[SUCCEEDED]"),
            CANCELLED => {
                write!(f, "[CANCELLED]")?;
                if let Some(exception) = self.exception_raw() {
                    write!(f, "[Exception:{exception}]")?;
                }
                Ok(())
            }
            _ => write!(f, "[ACTIVE]"),
        }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Typed handle to a task producing a `T`.
///
/// Derefs to [`TaskRef`] for everything except result access. Handles are
/// cheap clones of the same underlying task.
pub struct Task<T> {
    raw: TaskRef,
    _result: PhantomData<fn() -> T>,
}

impl<T> Task<T> {
    pub(crate) fn from_ref(raw: TaskRef) -> Self {
        Task {
            raw,
            _result: PhantomData,
        }
    }

    /// Untyped view of this task.
    pub fn as_untyped(&self) -> &TaskRef {
        &self.raw
    }
}

impl<T: Send + Sync + 'static> Task<T> {
    /// Creates a task that is already done with `value`, the factory path for
    /// bodies that produce a plain value instead of a coroutine.
    pub fn completed(value: T) -> Task<T> {
        let raw = TaskRef::new_named(None);
        raw.success_boxed(Some(Arc::new(value)));
        Task::from_ref(raw)
    }

    /// Terminates the task successfully with `value`. No-op when already
    /// done.
    pub fn success(&self, value: T) {
        self.raw.success_boxed(Some(Arc::new(value)));
    }
}

impl<T: Clone + Send + Sync + 'static> Task<T> {
    /// Result of a succeeded task.
    ///
    /// Fails for a task that has not succeeded, or whose stored result is of
    /// a different type (a `success(..)` yield with a mismatched value).
    pub fn result(&self) -> Result<T, RuntimeError> {
        if !self.raw.is_succeeded() {
            return Err(RuntimeError::NotSucceeded);
        }
        let stored = self.raw.result_boxed().ok_or(RuntimeError::NotSucceeded)?;
        stored
            .downcast::<T>()
            .map(|value| (*value).clone())
            .map_err(|_| RuntimeError::ResultType)
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Task {
            raw: self.raw.clone(),
            _result: PhantomData,
        }
    }
}

impl<T> Deref for Task<T> {
    type Target = TaskRef;

    fn deref(&self) -> &TaskRef {
        &self.raw
    }
}

impl<T> AsRef<TaskRef> for Task<T> {
    fn as_ref(&self) -> &TaskRef {
        &self.raw
    }
}

impl<T> fmt::Display for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.raw, f)
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.raw, f)
    }
}

/// Task currently executing on the calling host thread, if any.
pub fn get_current_task() -> Option<TaskRef> {
    tls::current_task()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn completed_task_has_result() {
        let task = Task::completed(41u32);
        assert!(task.is_done());
        assert!(task.is_succeeded());
        assert_eq!(task.result().unwrap(), 41);
    }

    #[test]
    fn terminal_transition_happens_once() {
        let task = TaskRef::new_named(Some(Arc::from("once")));
        task.success_boxed(Some(Arc::new(1u32)));
        task.cancel();
        assert!(task.is_succeeded());

        let typed: Task<u32> = Task::from_ref(task);
        assert_eq!(typed.result().unwrap(), 1);
    }

    #[test]
    fn result_demands_success() {
        let task: Task<u32> = Task::from_ref(TaskRef::new_named(None));
        assert!(matches!(task.result(), Err(RuntimeError::NotSucceeded)));
        task.cancel();
        assert!(matches!(task.result(), Err(RuntimeError::NotSucceeded)));
        assert!(task.exception().unwrap().is_none());
    }

    #[test]
    fn result_downcast_mismatch_is_visible() {
        let task = TaskRef::new_named(None);
        task.success_boxed(Some(Arc::new("text")));
        let typed: Task<u32> = Task::from_ref(task);
        assert!(matches!(typed.result(), Err(RuntimeError::ResultType)));
    }

    #[test]
    fn exception_demands_cancelled() {
        let task = Task::completed(());
        assert!(matches!(task.exception(), Err(RuntimeError::NotCancelled)));
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let task = TaskRef::new_named(None);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            task.call_on_done(move |_| order.lock().push(i));
        }
        task.cancel();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn late_callback_runs_immediately() {
        let task = TaskRef::new_named(None);
        task.cancel();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        task.call_on_done(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_carries_exception() {
        let task = TaskRef::new_named(None);
        task.cancel_with(RuntimeError::NotSucceeded);
        let exception = task.exception().unwrap().expect("exception stored");
        assert!(exception.to_string().contains("has not succeeded"));
    }

    #[test]
    fn terminated_task_leaves_registry() {
        let task = TaskRef::new_named(None);
        assert!(context().task_registered(task.id()));
        task.cancel();
        assert!(!context().task_registered(task.id()));
    }
}
