use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::task::{TaskCore, TaskId};
use crate::thread::Thread;

/// Process-wide runtime state.
///
/// Holds the OS-thread → [`Thread`] registry and the weak registry of all
/// tasks that are still active. [`clear()`](crate::clear) drains both.
pub(crate) struct Context {
    pub(crate) threads: Mutex<HashMap<ThreadId, Thread>>,
    pub(crate) tasks: Mutex<HashMap<TaskId, Weak<TaskCore>>>,
    next_task_id: AtomicU64,
}

impl Context {
    pub(crate) fn next_task_id(&self) -> TaskId {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_task(&self, core: &Arc<TaskCore>) {
        self.tasks.lock().insert(core.id(), Arc::downgrade(core));
    }

    pub(crate) fn unregister_task(&self, id: TaskId) {
        self.tasks.lock().remove(&id);
    }

    pub(crate) fn active_task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn task_registered(&self, id: TaskId) -> bool {
        self.tasks.lock().contains_key(&id)
    }
}

pub(crate) fn context() -> &'static Context {
    static CONTEXT: OnceLock<Context> = OnceLock::new();
    CONTEXT.get_or_init(|| Context {
        threads: Mutex::new(HashMap::new()),
        tasks: Mutex::new(HashMap::new()),
        next_task_id: AtomicU64::new(1),
    })
}
