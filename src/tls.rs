//! Per-host-thread runtime state.
//!
//! Each registered [`Thread`](crate::Thread) owns one `Tls` instance for the
//! lifetime of its registration. It carries the stack of tasks currently
//! being driven on this OS thread (the innermost entry is the ambient parent
//! for newly created tasks), the stack of entered TaskSet scopes, and the
//! command slot through which a polled yield future talks to the executor
//! that is polling it.

use std::cell::RefCell;
use std::sync::Arc;

use crate::task::{TaskId, TaskRef};
use crate::task_set::TaskSetInner;
use crate::yields::YieldRequest;

/// Executor ↔ yield-future channel.
///
/// The protocol is driven entirely by the executor: a yield future that
/// finds the slot `Idle` publishes its command and suspends; `Resume` tells
/// the parked future its command was accepted and it may complete;
/// `Finish` makes every yield resolve to the done signal while the coroutine
/// is being closed.
pub(crate) enum ExecSlot {
    Idle,
    Command(YieldRequest),
    Resume,
    Finish(Option<Arc<str>>),
}

pub(crate) struct Tls {
    exec_stack: Vec<TaskRef>,
    scope_stack: Vec<Arc<TaskSetInner>>,
    slot: ExecSlot,
}

thread_local! {
    static TLS: RefCell<Option<Tls>> = const { RefCell::new(None) };
}

/// Installs storage for the current OS thread. No-op when already installed.
pub(crate) fn install() {
    TLS.with(|tls| {
        let mut tls = tls.borrow_mut();
        if tls.is_none() {
            *tls = Some(Tls {
                exec_stack: Vec::new(),
                scope_stack: Vec::new(),
                slot: ExecSlot::Idle,
            });
        }
    });
}

/// Removes storage for the current OS thread on finalization.
pub(crate) fn remove() {
    TLS.with(|tls| tls.borrow_mut().take());
}

fn with<R>(f: impl FnOnce(&mut Tls) -> R) -> Option<R> {
    TLS.with(|tls| tls.borrow_mut().as_mut().map(f))
}

pub(crate) fn push_task(task: TaskRef) {
    with(|tls| tls.exec_stack.push(task));
}

pub(crate) fn pop_task() {
    with(|tls| tls.exec_stack.pop());
}

/// Innermost task currently executing on this OS thread.
pub(crate) fn current_task() -> Option<TaskRef> {
    with(|tls| tls.exec_stack.last().cloned()).flatten()
}

/// Whether the given task is being driven anywhere on this thread's stack.
pub(crate) fn task_on_stack(id: TaskId) -> bool {
    with(|tls| tls.exec_stack.iter().any(|t| t.id() == id)).unwrap_or(false)
}

pub(crate) fn push_scope(ts: Arc<TaskSetInner>) {
    with(|tls| tls.scope_stack.push(ts));
}

pub(crate) fn pop_scope(ts: &Arc<TaskSetInner>) {
    with(|tls| {
        if let Some(pos) = tls.scope_stack.iter().rposition(|s| Arc::ptr_eq(s, ts)) {
            tls.scope_stack.remove(pos);
        }
    });
}

/// Snapshot of the entered scopes, innermost last, without duplicates.
pub(crate) fn scopes_snapshot() -> Vec<Arc<TaskSetInner>> {
    with(|tls| {
        let mut out: Vec<Arc<TaskSetInner>> = Vec::with_capacity(tls.scope_stack.len());
        for ts in &tls.scope_stack {
            if !out.iter().any(|s| Arc::ptr_eq(s, ts)) {
                out.push(ts.clone());
            }
        }
        out
    })
    .unwrap_or_default()
}

/// Takes a command published by the last poll, resetting the slot.
pub(crate) fn take_command() -> Option<YieldRequest> {
    with(|tls| match std::mem::replace(&mut tls.slot, ExecSlot::Idle) {
        ExecSlot::Command(request) => Some(request),
        finish @ ExecSlot::Finish(_) => {
            tls.slot = finish;
            None
        }
        ExecSlot::Idle | ExecSlot::Resume => None,
    })
    .flatten()
}

pub(crate) fn set_resume() {
    with(|tls| tls.slot = ExecSlot::Resume);
}

pub(crate) fn clear_slot() {
    with(|tls| tls.slot = ExecSlot::Idle);
}

/// Swaps the slot wholesale; executors bracket their drive and close polls
/// with this so nested execution sees a clean channel.
pub(crate) fn replace_slot(new: ExecSlot) -> ExecSlot {
    with(|tls| std::mem::replace(&mut tls.slot, new)).unwrap_or(ExecSlot::Idle)
}

/// Runs `f` with mutable access to the slot; `None` outside the runtime.
pub(crate) fn with_slot<R>(f: impl FnOnce(&mut ExecSlot) -> R) -> Option<R> {
    with(|tls| f(&mut tls.slot))
}
