use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::Instant;

use parking_lot::Mutex;

use crate::logging;
use crate::task::TaskRef;
use crate::thread::{get_current_thread, Thread};
use crate::tls;
use crate::yields::YieldRequest;

/// Type-erased task body: result and error are shared so terminal callbacks
/// and `propagate` can hand them to several observers.
pub(crate) type Coroutine = std::pin::Pin<
    Box<
        dyn std::future::Future<
                Output = Result<
                    Arc<dyn std::any::Any + Send + Sync>,
                    crate::error::TaskException,
                >,
            > + Send,
    >,
>;

struct ExecState {
    /// `None` once the coroutine finished or was closed.
    gen: Option<Coroutine>,
    /// Stay in the drive loop vs. park the task on a runqueue.
    continue_execution: bool,
    /// Thread the task is assigned to when it goes non-ready. Cleared by
    /// `propagate`: that task is revived by the other task's terminal
    /// callback, not by a drain.
    thread: Option<Thread>,
    /// Last yield command; re-dispatched on re-entry without polling.
    pending: Option<YieldRequest>,
    /// Whether a yield future is parked and expects a resume signal.
    suspended: bool,
}

/// Drives exactly one coroutine-backed task through its yields.
///
/// The state mutex doubles as the drive lock: a task is never polled by two
/// host threads at once. The executor registers the first on-done callback
/// of its task, which closes the coroutine with the done signal (one final
/// poll in which every yield resolves to `Err(ETaskDone)`), wherever the
/// terminal transition came from.
pub(crate) struct TaskExecutor {
    task: TaskRef,
    state: Mutex<ExecState>,
}

impl TaskExecutor {
    pub(crate) fn new(task: TaskRef, gen: Coroutine) -> Arc<TaskExecutor> {
        let executor = Arc::new(TaskExecutor {
            task: task.clone(),
            state: Mutex::new(ExecState {
                gen: Some(gen),
                continue_execution: true,
                thread: Some(get_current_thread()),
                pending: None,
                suspended: false,
            }),
        });
        let hook = executor.clone();
        task.call_on_done(move |_| hook.on_task_done());
        executor
    }

    /// Terminal callback: close the coroutine unless the executor currently
    /// driving it on this very thread will do so at loop exit.
    fn on_task_done(&self) {
        if tls::task_on_stack(self.task.id()) {
            return;
        }
        let _ = get_current_thread();
        let mut state = self.state.lock();
        self.close_coroutine(&mut state);
    }

    /// One final poll with the finish signal in the slot, then drop (close).
    /// User code at the interrupted yield gets its single cleanup chance.
    fn close_coroutine(&self, state: &mut ExecState) {
        let Some(mut gen) = state.gen.take() else {
            return;
        };
        let saved = tls::replace_slot(tls::ExecSlot::Finish(self.task.name_arc()));
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let _ = gen.as_mut().poll(&mut cx);
        tls::replace_slot(saved);
        drop(gen);
    }

    /// Drive loop: resume the coroutine while it continues inline, interpret
    /// each yield, and park the task on its target thread when it suspends.
    pub(crate) fn exec(&self) {
        if !self.task.is_active() {
            // Contended means an executor is mid-drive (possibly this one,
            // re-entered from a terminal callback); the driver closes at
            // loop exit.
            if let Some(mut state) = self.state.try_lock() {
                self.close_coroutine(&mut state);
            }
            return;
        }

        let mut state = self.state.lock();
        if !self.task.is_active() {
            self.close_coroutine(&mut state);
            return;
        }

        tls::push_task(self.task.clone());
        let saved_slot = tls::replace_slot(tls::ExecSlot::Idle);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        loop {
            if state.continue_execution {
                if state.suspended {
                    tls::set_resume();
                }
                let Some(gen) = state.gen.as_mut() else {
                    tls::clear_slot();
                    break;
                };
                match gen.as_mut().poll(&mut cx) {
                    Poll::Ready(Ok(result)) => {
                        tls::clear_slot();
                        state.gen = None;
                        self.task.success_boxed(Some(result));
                        break;
                    }
                    Poll::Ready(Err(exception)) => {
                        tls::clear_slot();
                        state.gen = None;
                        logging::critical(format_args!(
                            "unhandled error in {}: {exception}",
                            self.task
                        ));
                        self.task.cancel_exc(Some(exception));
                        break;
                    }
                    Poll::Pending => {
                        state.suspended = true;
                        match tls::take_command() {
                            Some(request) => state.pending = Some(request),
                            None => {
                                // Pending without a command: the body awaited
                                // something that is not a yield of this
                                // runtime.
                                logging::critical(format_args!(
                                    "{} suspended on an unknown await; cancelling",
                                    self.task
                                ));
                                self.task.cancel_exc(None);
                                break;
                            }
                        }
                    }
                }
            }

            let Some(mut request) = state.pending.take() else {
                break;
            };
            state.continue_execution =
                dispatch_request(&self.task, &mut request, &mut state.thread);
            state.pending = Some(request);

            if self.task.is_done() {
                break;
            }
            if !state.continue_execution {
                if let Some(thread) = state.thread.clone() {
                    if !thread.enqueue(&self.task) {
                        self.task.cancel_exc(None);
                    }
                }
                break;
            }
        }

        if self.task.is_done() {
            self.close_coroutine(&mut state);
        }
        tls::replace_slot(saved_slot);
        tls::pop_task();
    }
}

/// Interprets one yield command; returns whether execution continues inline.
fn dispatch_request(
    task: &TaskRef,
    request: &mut YieldRequest,
    bound_thread: &mut Option<Thread>,
) -> bool {
    match request {
        YieldRequest::AddTo(set) => {
            if crate::task_set::TaskSetInner::add_ref(set, task, true) {
                task.detach_from_parent();
                true
            } else {
                task.cancel_exc(None);
                false
            }
        }
        YieldRequest::SwitchThread(target) => {
            let current = bound_thread.as_ref().and_then(Thread::ident);
            let same = matches!((current, target.ident()), (Some(a), Some(b)) if a == b);
            if same {
                true
            } else {
                *bound_thread = Some(target.clone());
                false
            }
        }
        YieldRequest::Wait(remaining) => remaining.load(std::sync::atomic::Ordering::Acquire) == 0,
        YieldRequest::Success(value) => {
            task.success_boxed(value.take());
            false
        }
        YieldRequest::Cancel(exception) => {
            task.cancel_exc(exception.take());
            false
        }
        YieldRequest::Propagate(other) => {
            task.propagate(other);
            *bound_thread = None;
            false
        }
        YieldRequest::Sleep {
            deadline,
            immediate,
        } => *immediate || Instant::now() >= *deadline,
        YieldRequest::SleepTick { remaining } => {
            if *remaining == 0 {
                true
            } else {
                *remaining -= 1;
                false
            }
        }
        YieldRequest::Enter(section) => section.try_enter(task),
        YieldRequest::Leave(section) => {
            section.leave(task);
            true
        }
    }
}

/// No-op waker for manual polling; the scheduler re-polls on its own terms.
fn noop_waker() -> Waker {
    fn noop(_: *const ()) {}
    fn clone(p: *const ()) -> RawWaker {
        RawWaker::new(p, &VTABLE)
    }
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}
