use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::task::{TaskId, TaskRef};

/// Single-holder mutual exclusion between tasks.
///
/// At most one task holds a Section at a time, and holding survives across
/// yields. Acquisition through the [`enter`](crate::enter) yield is
/// opportunistic: a contending task is rescheduled and retries on its next
/// drain, so host threads never block. There is no wait queue and no
/// fairness guarantee. Every Section a task still holds when it terminates
/// is released before any of its on-done callbacks run.
#[derive(Clone)]
pub struct Section {
    inner: Arc<SectionInner>,
}

struct SectionInner {
    holder: Mutex<Option<TaskId>>,
}

impl Section {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SectionInner {
                holder: Mutex::new(None),
            }),
        }
    }

    /// Whether some task currently holds this Section.
    pub fn is_held(&self) -> bool {
        self.inner.holder.lock().is_some()
    }

    /// Attempts to assign the Section to `task`.
    ///
    /// Takes the task's done-lock first so a concurrently terminating task
    /// cannot acquire a Section its terminal transition will never release.
    pub(crate) fn try_enter(&self, task: &TaskRef) -> bool {
        let mut done = task.core.done.lock();
        if !task.is_active() {
            return false;
        }
        {
            let mut holder = self.inner.holder.lock();
            if holder.is_some() {
                return false;
            }
            *holder = Some(task.id());
        }
        done.sections.push(self.clone());
        true
    }

    /// Releases the Section if `task` is the holder; no-op otherwise.
    pub(crate) fn leave(&self, task: &TaskRef) {
        let mut done = task.core.done.lock();
        done.sections
            .retain(|section| !Arc::ptr_eq(&section.inner, &self.inner));
        drop(done);
        self.force_release(task.id());
    }

    /// Clears the holder during a terminal transition. The caller already
    /// holds the task's done-lock and has drained its held-sections list.
    pub(crate) fn force_release(&self, id: TaskId) {
        let mut holder = self.inner.holder.lock();
        if *holder == Some(id) {
            *holder = None;
        }
    }
}

impl Default for Section {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Section")
            .field("held", &self.is_held())
            .finish()
    }
}
