use std::collections::HashSet;

use crate::context::context;
use crate::error::RuntimeError;
use crate::task::{TaskId, TaskRef};
use crate::thread::Thread;

/// Finalizes every known Thread, then cancels every task still in the
/// process-wide registry until it is empty.
///
/// Fails if a registered Thread belonging to a different OS thread is still
/// alive; such threads can only finalize themselves.
pub fn clear() -> Result<(), RuntimeError> {
    // Cancelling an orphaned task closes its coroutine, which may register
    // the calling thread again; repeat until both registries stay empty.
    loop {
        loop {
            let thread = context().threads.lock().values().next().cloned();
            match thread {
                Some(thread) => thread.finalize()?,
                None => break,
            }
        }

        loop {
            let tasks: Vec<_> = context().tasks.lock().values().cloned().collect();
            if tasks.is_empty() {
                break;
            }
            for weak in tasks {
                if let Some(core) = weak.upgrade() {
                    TaskRef { core }.cancel();
                }
            }
            // Entries whose task was dropped without terminating cannot
            // cancel themselves out of the registry.
            context()
                .tasks
                .lock()
                .retain(|_, weak| weak.strong_count() > 0);
        }

        if context().threads.lock().is_empty() && context().tasks.lock().is_empty() {
            return Ok(());
        }
    }
}

/// Renders the unfinalized Threads and active tasks of the process.
pub fn debug_info() -> String {
    let threads: Vec<Thread> = context().threads.lock().values().cloned().collect();
    let mut active: Vec<TaskRef> = context()
        .tasks
        .lock()
        .values()
        .filter_map(|weak| weak.upgrade())
        .map(|core| TaskRef { core })
        .collect();

    let mut out = String::new();

    if !threads.is_empty() {
        out.push_str("\nUnfinalized threads: ");
        let mut queued: HashSet<TaskId> = HashSet::new();
        for (i, thread) in threads.iter().enumerate() {
            for task in thread.snapshot_tasks() {
                queued.insert(task.id());
            }
            out.push_str(&format!("\n[{i}]: {}", thread.printable_info(true)));
        }
        active.retain(|task| !queued.contains(&task.id()));
    }

    if !active.is_empty() {
        out.push_str("\nTasks not attached to threads: ");
        for (i, task) in active.iter().enumerate() {
            out.push_str(&format!("\n[{i}]: {task}"));
        }
    }

    if out.is_empty() {
        out
    } else {
        format!("\ncotask debug info:{out}\n")
    }
}

/// Prints [`debug_info`] to stdout when there is anything to show.
pub fn print_debug_info() {
    let info = debug_info();
    if !info.is_empty() {
        println!("{info}");
    }
}
