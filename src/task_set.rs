use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::logging;
use crate::task::{Task, TaskRef};
use crate::thread::get_current_thread;
use crate::tls;

/// Untyped shared membership, also used by the ambient-scope machinery.
pub(crate) struct TaskSetInner {
    name: Option<Arc<str>>,
    /// `None` is the finalized sentinel: no further additions.
    members: Mutex<Option<Vec<TaskRef>>>,
}

impl TaskSetInner {
    /// Inserts `task`; refuses terminal tasks and finalized sets.
    ///
    /// Lock order: task done-lock, then the member list. With
    /// `remove_on_done` the removal callback is queued under the same
    /// done-lock, so the task cannot terminate between the insert and the
    /// registration.
    pub(crate) fn add_ref(set: &Arc<TaskSetInner>, task: &TaskRef, remove_on_done: bool) -> bool {
        let mut done = task.core.done.lock();
        if !task.is_active() {
            return false;
        }
        {
            let mut members = set.members.lock();
            let Some(list) = members.as_mut() else {
                return false;
            };
            if !list.iter().any(|member| member.id() == task.id()) {
                list.push(task.clone());
            }
        }
        if remove_on_done {
            if let Some(callbacks) = done.callbacks.as_mut() {
                let set = set.clone();
                callbacks.push(Box::new(move |task: &TaskRef| set.remove_ref(task)));
            }
        }
        true
    }

    pub(crate) fn remove_ref(&self, task: &TaskRef) {
        if let Some(list) = self.members.lock().as_mut() {
            list.retain(|member| member.id() != task.id());
        }
    }

    fn count(&self) -> usize {
        self.members.lock().as_ref().map_or(0, Vec::len)
    }

    /// Swaps the membership out: to an empty list for `cancel_all`, to the
    /// finalized sentinel for `finalize`. Cancellation happens outside the
    /// lock.
    fn drain(&self, finalize: bool) -> Vec<TaskRef> {
        let mut members = self.members.lock();
        if finalize {
            members.take().unwrap_or_default()
        } else {
            members.as_mut().map(std::mem::take).unwrap_or_default()
        }
    }
}

/// Thread-safe collection of tasks.
///
/// Tasks can be added, removed, fetched, and cancelled from any thread.
/// Finalizing the set cancels every member and refuses future additions;
/// a task offered to a finalized set through the [`add_to`](crate::add_to)
/// yield is cancelled without an exception.
pub struct TaskSet<T = ()> {
    inner: Arc<TaskSetInner>,
    _member: PhantomData<fn() -> T>,
}

impl<T> TaskSet<T> {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::build(Some(name.into().into()))
    }

    fn build(name: Option<Arc<str>>) -> Self {
        Self {
            inner: Arc::new(TaskSetInner {
                name,
                members: Mutex::new(Some(Vec::new())),
            }),
            _member: PhantomData,
        }
    }

    pub(crate) fn inner(&self) -> &Arc<TaskSetInner> {
        &self.inner
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn count(&self) -> usize {
        self.inner.count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Adds `task`, returning whether it was accepted. With
    /// `remove_on_done` the task removes itself when it terminates.
    pub fn add(&self, task: &Task<T>, remove_on_done: bool) -> bool {
        TaskSetInner::add_ref(&self.inner, task.as_untyped(), remove_on_done)
    }

    /// Removes `task` if present; ignores a finalized set.
    pub fn remove(&self, task: &Task<T>) {
        self.inner.remove_ref(task.as_untyped());
    }

    /// Cancels every current member. The set stays usable.
    pub fn cancel_all(&self) {
        let members = self.inner.drain(false);
        if !members.is_empty() {
            logging::lifecycle("Cancelling", &DisplayInner(&self.inner));
        }
        for task in members {
            task.cancel();
        }
    }

    /// Cancels every member and refuses future additions.
    pub fn finalize(&self) {
        logging::lifecycle("Finalizing", &DisplayInner(&self.inner));
        for task in self.inner.drain(true) {
            task.cancel();
        }
    }

    /// Removes and returns the members matching both predicates
    /// (`None` means "don't check"): `done` against `is_done()`, `success`
    /// against `is_succeeded()`. Both `None` fetches everything.
    pub fn fetch(&self, done: Option<bool>, success: Option<bool>) -> Vec<Task<T>> {
        let mut fetched = Vec::new();
        let mut members = self.inner.members.lock();
        if let Some(list) = members.as_mut() {
            let mut kept = Vec::with_capacity(list.len());
            for task in list.drain(..) {
                let matches = done.map_or(true, |d| d == task.is_done())
                    && success.map_or(true, |s| s == task.is_succeeded());
                if matches {
                    fetched.push(Task::from_ref(task));
                } else {
                    kept.push(task);
                }
            }
            *list = kept;
        }
        fetched
    }

    /// Enters an ambient scope on the calling host thread: every task created
    /// on this thread while the returned guard lives is adopted by this set
    /// (with remove-on-done) instead of being parented to its creator. The
    /// guard is not `Send`, so it is released on the thread that entered it.
    pub fn as_scope(&self) -> TaskSetScope {
        let _ = get_current_thread();
        tls::push_scope(self.inner.clone());
        TaskSetScope {
            inner: self.inner.clone(),
            _entered_thread: PhantomData,
        }
    }
}

impl<T> Default for TaskSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for TaskSet<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _member: PhantomData,
        }
    }
}

impl<T> fmt::Display for TaskSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        DisplayInner(&self.inner).fmt(f)
    }
}

impl<T> fmt::Debug for TaskSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

struct DisplayInner<'a>(&'a Arc<TaskSetInner>);

impl fmt::Display for DisplayInner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[TaskSet]")?;
        if let Some(name) = self.0.name.as_deref() {
            write!(f, "[{name}]")?;
        }
        match self.0.members.lock().as_ref() {
            Some(list) => write!(f, "[{} tasks]", list.len()),
            None => write!(f, "[FINALIZED]"),
        }
    }
}

/// Guard returned by [`TaskSet::as_scope`]; leaves the scope on drop.
pub struct TaskSetScope {
    inner: Arc<TaskSetInner>,
    _entered_thread: PhantomData<*const ()>,
}

impl Drop for TaskSetScope {
    fn drop(&mut self) {
        tls::pop_scope(&self.inner);
    }
}
