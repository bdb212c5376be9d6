//! # Cotask
//!
//! Cooperative task runtime: many lightweight resumable tasks scheduled over
//! a small pool of OS threads. Each task is a coroutine (an async block
//! polled manually by the runtime) whose awaits on the yield constructors
//! below are its only suspension points; everything between two yields runs
//! on exactly one host thread without preemption.
//!
//! ## Core Types
//!
//! - [`Task<T>`] / [`TaskRef`] — Handles to a task: terminal state, result or
//!   exception, callbacks, cancellation
//! - [`Thread`] — A host OS thread owning a FIFO runqueue and a drain loop
//! - [`TaskSet`] — Thread-safe task collection with ambient-scope adoption
//! - [`Section`] — Single-holder mutual exclusion between tasks
//! - [`ETaskDone`] — The done signal a coroutine observes for cleanup
//!
//! ## Yields
//!
//! [`sleep`], [`sleep_tick`], [`wait`] / [`wait_all`], [`switch_thread`],
//! [`add_to`], [`enter`] / [`leave`], [`success`], [`cancel`] /
//! [`cancel_with`], [`propagate`].
//!
//! ## Example
//!
//! ```
//! use cotask::{spawn_named, sleep_tick, ETaskDone};
//!
//! let task = spawn_named("double", async {
//!     let mut total = 0u32;
//!     for i in 1..=4 {
//!         total += i;
//!         sleep_tick().await?;
//!     }
//!     Ok::<_, ETaskDone>(total)
//! });
//! task.wait().unwrap();
//! assert_eq!(task.result().unwrap(), 10);
//! # cotask::clear().unwrap();
//! ```
//!
//! See `DESIGN.md` in this crate for architecture decisions and goals.

mod context;
mod error;
mod executor;
mod logging;
mod section;
mod service;
mod spawn;
mod task;
mod task_set;
mod thread;
mod tls;
mod yields;

pub use error::{ETaskDone, RuntimeError, TaskException};
pub use logging::{get_log_level, set_log_level};
pub use section::Section;
pub use service::{clear, debug_info, print_debug_info};
pub use spawn::{spawn, spawn_named};
pub use task::{get_current_task, Task, TaskRef};
pub use task_set::{TaskSet, TaskSetScope};
pub use thread::{get_current_thread, loop_pacing, set_loop_pacing, LoopPacing, Thread};
pub use yields::{
    add_to, cancel, cancel_with, enter, leave, propagate, sleep, sleep_tick, success,
    switch_thread, wait, wait_all, AddTo, Cancel, Enter, Leave, Propagate, Sleep, SleepTick,
    Success, SwitchThread, Wait,
};
