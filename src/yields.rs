//! Yield constructors: the requests a task body sends to its scheduler.
//!
//! Awaiting one of these futures is the only suspension point a task has.
//! The first poll publishes a tagged command into the thread-local slot and
//! suspends; the executor interprets the command and either resumes the
//! future on the spot or parks the task on a runqueue. After the task is
//! done, every yield resolves to `Err(ETaskDone)` instead — the cleanup
//! signal.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::error::{ETaskDone, TaskException};
use crate::section::Section;
use crate::task::TaskRef;
use crate::task_set::{TaskSet, TaskSetInner};
use crate::thread::Thread;
use crate::tls::{self, ExecSlot};

/// Scheduling command carried from a yield future to the executor.
pub(crate) enum YieldRequest {
    AddTo(Arc<TaskSetInner>),
    SwitchThread(Thread),
    Wait(Arc<AtomicUsize>),
    Success(Option<Arc<dyn Any + Send + Sync>>),
    Cancel(Option<TaskException>),
    Propagate(TaskRef),
    Sleep { deadline: Instant, immediate: bool },
    SleepTick { remaining: u32 },
    Enter(Section),
    Leave(Section),
}

/// Shared poll step for every yield future.
fn poll_request(publish: impl FnOnce() -> YieldRequest) -> Poll<Result<(), ETaskDone>> {
    let state = tls::with_slot(|slot| match slot {
        ExecSlot::Resume => {
            *slot = ExecSlot::Idle;
            Some(Ok(()))
        }
        ExecSlot::Finish(task_name) => Some(Err(ETaskDone::new(task_name.clone()))),
        ExecSlot::Idle => {
            *slot = ExecSlot::Command(publish());
            None
        }
        // A second in-flight yield on the same thread; only the first one is
        // serviced this pass.
        ExecSlot::Command(_) => None,
    });
    match state {
        Some(Some(result)) => Poll::Ready(result),
        // Published, or polled outside the runtime.
        Some(None) | None => Poll::Pending,
    }
}

/// Suspends the task until `duration` has elapsed.
///
/// The deadline is captured here, not at the first poll. A zero duration
/// continues without interruption; precision is otherwise bounded by the
/// drain pacing of the host thread (typically ≥ 5 ms).
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        deadline: Instant::now() + duration,
        immediate: duration.is_zero(),
    }
}

pub struct Sleep {
    deadline: Instant,
    immediate: bool,
}

impl Future for Sleep {
    type Output = Result<(), ETaskDone>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_request(|| YieldRequest::Sleep {
            deadline: self.deadline,
            immediate: self.immediate,
        })
    }
}

/// Suspends the task for a single tick: the minimum possible time between
/// two executions on the same host thread.
pub fn sleep_tick() -> SleepTick {
    SleepTick {}
}

pub struct SleepTick {}

impl Future for SleepTick {
    type Output = Result<(), ETaskDone>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_request(|| YieldRequest::SleepTick { remaining: 1 })
    }
}

/// Suspends the task until every task in `tasks` is done.
///
/// Completion hooks are registered here, at construction; tasks that are
/// already done count immediately.
pub fn wait_all<I>(tasks: I) -> Wait
where
    I: IntoIterator,
    I::Item: AsRef<TaskRef>,
{
    let tasks: Vec<TaskRef> = tasks.into_iter().map(|t| t.as_ref().clone()).collect();
    let remaining = Arc::new(AtomicUsize::new(tasks.len()));
    for task in &tasks {
        let remaining = remaining.clone();
        task.call_on_done(move |_| {
            remaining.fetch_sub(1, Ordering::AcqRel);
        });
    }
    Wait { remaining }
}

/// Suspends the task until `task` is done.
pub fn wait(task: impl AsRef<TaskRef>) -> Wait {
    wait_all([task.as_ref()])
}

pub struct Wait {
    remaining: Arc<AtomicUsize>,
}

impl Future for Wait {
    type Output = Result<(), ETaskDone>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_request(|| YieldRequest::Wait(self.remaining.clone()))
    }
}

/// Terminates the task successfully with `value`.
///
/// Equivalent to returning the value, but usable from nested loops, and the
/// code after the yield still observes the done signal for cleanup.
pub fn success<T: Send + Sync + 'static>(value: T) -> Success {
    Success {
        value: Some(Arc::new(value)),
    }
}

pub struct Success {
    value: Option<Arc<dyn Any + Send + Sync>>,
}

impl Future for Success {
    type Output = Result<(), ETaskDone>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let value = self.value.take();
        poll_request(|| YieldRequest::Success(value))
    }
}

/// Terminates the task as cancelled, without an exception.
pub fn cancel() -> Cancel {
    Cancel { exception: None }
}

/// Terminates the task as cancelled, carrying `exception`.
pub fn cancel_with<E>(exception: E) -> Cancel
where
    E: std::error::Error + Send + Sync + 'static,
{
    Cancel {
        exception: Some(Arc::new(exception)),
    }
}

pub struct Cancel {
    exception: Option<TaskException>,
}

impl Future for Cancel {
    type Output = Result<(), ETaskDone>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let exception = self.exception.take();
        poll_request(|| YieldRequest::Cancel(exception))
    }
}

/// Parks the task until `task` terminates, then adopts its outcome (result
/// or exception) as this task's own.
pub fn propagate(task: impl AsRef<TaskRef>) -> Propagate {
    Propagate {
        task: task.as_ref().clone(),
    }
}

pub struct Propagate {
    task: TaskRef,
}

impl Future for Propagate {
    type Output = Result<(), ETaskDone>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_request(|| YieldRequest::Propagate(self.task.clone()))
    }
}

/// Migrates the task to `thread`.
///
/// Continues immediately when the task is already there; the task is
/// cancelled if the thread no longer accepts work.
pub fn switch_thread(thread: &Thread) -> SwitchThread {
    SwitchThread {
        thread: thread.clone(),
    }
}

pub struct SwitchThread {
    thread: Thread,
}

impl Future for SwitchThread {
    type Output = Result<(), ETaskDone>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_request(|| YieldRequest::SwitchThread(self.thread.clone()))
    }
}

/// Adds the task to `set` with remove-on-done, severing its parent link.
///
/// The task is cancelled without an exception when the set is finalized.
pub fn add_to<T>(set: &TaskSet<T>) -> AddTo {
    AddTo {
        set: set.inner().clone(),
    }
}

pub struct AddTo {
    set: Arc<TaskSetInner>,
}

impl Future for AddTo {
    type Output = Result<(), ETaskDone>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_request(|| YieldRequest::AddTo(self.set.clone()))
    }
}

/// Acquires `section` for this task, retrying on the next drain while some
/// other task holds it. Holding survives yields and is released
/// automatically when the task terminates.
pub fn enter(section: &Section) -> Enter {
    Enter {
        section: section.clone(),
    }
}

pub struct Enter {
    section: Section,
}

impl Future for Enter {
    type Output = Result<(), ETaskDone>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_request(|| YieldRequest::Enter(self.section.clone()))
    }
}

/// Releases `section` if this task is the holder; continues either way.
pub fn leave(section: &Section) -> Leave {
    Leave {
        section: section.clone(),
    }
}

pub struct Leave {
    section: Section,
}

impl Future for Leave {
    type Output = Result<(), ETaskDone>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_request(|| YieldRequest::Leave(self.section.clone()))
    }
}
