use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::context::context;
use crate::error::RuntimeError;
use crate::logging;
use crate::task::TaskRef;
use crate::tls;

/// Pacing policy for [`Thread::execute_tasks_loop`].
///
/// Each drain cycle lasts at least `min_cycle` (short drains sleep the
/// remainder, yielding the CPU on empty runqueues), and after
/// `forced_sleep_after` of wall-clock without a sleep the loop sleeps
/// `forced_sleep` regardless, bounding sustained busy-looping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopPacing {
    pub min_cycle: Duration,
    pub forced_sleep_after: Duration,
    pub forced_sleep: Duration,
}

impl Default for LoopPacing {
    fn default() -> Self {
        Self {
            min_cycle: Duration::from_millis(5),
            forced_sleep_after: Duration::from_secs(1),
            forced_sleep: Duration::from_millis(5),
        }
    }
}

static PACING: Mutex<LoopPacing> = Mutex::new(LoopPacing {
    min_cycle: Duration::from_millis(5),
    forced_sleep_after: Duration::from_secs(1),
    forced_sleep: Duration::from_millis(5),
});

/// Sets the process-wide drain-loop pacing. Loops already running pick the
/// new policy up on their next entry.
pub fn set_loop_pacing(pacing: LoopPacing) {
    *PACING.lock() = pacing;
}

/// Current process-wide drain-loop pacing.
pub fn loop_pacing() -> LoopPacing {
    *PACING.lock()
}

static UNNAMED_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Binary event in the style of a latch: set once, waited on by many.
struct Event {
    state: Mutex<bool>,
    signal: Condvar,
}

impl Event {
    const fn new() -> Self {
        Self {
            state: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    /// Sets the event; returns whether this call was the one that set it.
    fn set(&self) -> bool {
        let mut state = self.state.lock();
        let first = !*state;
        *state = true;
        self.signal.notify_all();
        first
    }

    fn is_set(&self) -> bool {
        *self.state.lock()
    }

    fn wait(&self) {
        let mut state = self.state.lock();
        while !*state {
            self.signal.wait(&mut state);
        }
    }
}

struct ThreadInner {
    name: Mutex<String>,
    /// Spawned (own OS thread) vs. registered (wrapping an external one).
    created: bool,
    ident: OnceLock<ThreadId>,
    /// `None` once the final drain ran.
    queue: Mutex<Option<VecDeque<TaskRef>>>,
    has_work: AtomicBool,
    finalizing: Event,
    finalized: Event,
}

/// A host OS thread owning a FIFO runqueue of ready tasks.
///
/// Spawn a dedicated worker with [`Thread::new`]; any OS thread touching the
/// runtime is registered implicitly and drains through
/// [`execute_tasks_loop`](Thread::execute_tasks_loop) or
/// [`TaskRef::wait`](crate::TaskRef::wait). Tasks migrate between threads
/// only through the [`switch_thread`](crate::switch_thread) yield.
#[derive(Clone)]
pub struct Thread {
    inner: Arc<ThreadInner>,
}

impl Thread {
    /// Spawns a dedicated OS thread that drains its runqueue until
    /// [`finalize`](Thread::finalize).
    pub fn new(name: impl Into<String>) -> Thread {
        let name = name.into();
        let thread = Thread {
            inner: Arc::new(ThreadInner {
                name: Mutex::new(name.clone()),
                created: true,
                ident: OnceLock::new(),
                queue: Mutex::new(Some(VecDeque::new())),
                has_work: AtomicBool::new(false),
                finalizing: Event::new(),
                finalized: Event::new(),
            }),
        };
        logging::lifecycle("Creating", &thread);

        let worker = thread.clone();
        std::thread::Builder::new()
            .name(format!("cotask: {name}"))
            .spawn(move || {
                worker.initialize_current();
                let _ = worker.execute_tasks_loop();
                worker.finalize_on_thread();
            })
            .expect("Failed to spawn worker OS thread");
        thread
    }

    /// Wraps the calling OS thread; used implicitly on first contact.
    fn register_current() -> Thread {
        let thread = Thread {
            inner: Arc::new(ThreadInner {
                name: Mutex::new(format!(
                    "Unnamed #{}",
                    UNNAMED_COUNTER.fetch_add(1, Ordering::Relaxed)
                )),
                created: false,
                ident: OnceLock::new(),
                queue: Mutex::new(Some(VecDeque::new())),
                has_work: AtomicBool::new(false),
                finalizing: Event::new(),
                finalized: Event::new(),
            }),
        };
        thread.initialize_current();
        thread
    }

    fn initialize_current(&self) {
        let id = std::thread::current().id();
        let _ = self.inner.ident.set(id);
        context().threads.lock().insert(id, self.clone());
        tls::install();
        logging::lifecycle("Initialized", self);
    }

    /// Whether this Thread owns its OS thread (spawned) or wraps an external
    /// one (registered).
    pub fn is_created(&self) -> bool {
        self.inner.created
    }

    /// OS-thread identity; `None` until a spawned worker has started.
    pub fn ident(&self) -> Option<ThreadId> {
        self.inner.ident.get().copied()
    }

    pub fn name(&self) -> String {
        self.inner.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.inner.name.lock() = name.into();
    }

    pub fn queued_task_count(&self) -> usize {
        self.inner.queue.lock().as_ref().map_or(0, VecDeque::len)
    }

    pub(crate) fn snapshot_tasks(&self) -> Vec<TaskRef> {
        self.inner
            .queue
            .lock()
            .as_ref()
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Appends a ready task; refused once finalizing.
    pub(crate) fn enqueue(&self, task: &TaskRef) -> bool {
        if self.inner.finalizing.is_set() {
            return false;
        }
        let mut queue = self.inner.queue.lock();
        match queue.as_mut() {
            Some(queue) => {
                queue.push_back(task.clone());
                self.inner.has_work.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    fn fetch(&self, for_finalize: bool) -> VecDeque<TaskRef> {
        if !for_finalize && !self.inner.has_work.load(Ordering::Acquire) {
            return VecDeque::new();
        }
        let mut queue = self.inner.queue.lock();
        self.inner.has_work.store(false, Ordering::Release);
        if for_finalize {
            queue.take().unwrap_or_default()
        } else {
            queue.as_mut().map(std::mem::take).unwrap_or_default()
        }
    }

    fn assert_current(&self, operation: &'static str) -> Result<(), RuntimeError> {
        if self.ident() != Some(std::thread::current().id()) {
            return Err(RuntimeError::WrongOsThread(operation));
        }
        Ok(())
    }

    /// Drains one snapshot of the runqueue, re-entering each task's executor
    /// in FIFO order. Must run on the owning OS thread.
    pub fn execute_tasks_once(&self) -> Result<(), RuntimeError> {
        self.assert_current("execute_tasks_once")?;
        for task in self.fetch(false) {
            task.run_executor();
        }
        Ok(())
    }

    /// Drains the runqueue until the Thread is finalizing.
    pub fn execute_tasks_loop(&self) -> Result<(), RuntimeError> {
        self.execute_tasks_loop_until(|| false)
    }

    /// Drains the runqueue until the Thread is finalizing or `condition`
    /// returns true, pacing cycles per [`loop_pacing`].
    pub fn execute_tasks_loop_until(
        &self,
        mut condition: impl FnMut() -> bool,
    ) -> Result<(), RuntimeError> {
        self.assert_current("execute_tasks_loop")?;
        let pacing = loop_pacing();
        let mut last_sleep = Instant::now();

        while !self.inner.finalizing.is_set() {
            if condition() {
                break;
            }

            let cycle_start = Instant::now();
            self.execute_tasks_once()?;

            let mut to_sleep = Duration::ZERO;
            if last_sleep.elapsed() >= pacing.forced_sleep_after {
                to_sleep = pacing.forced_sleep;
            }
            let cycle = cycle_start.elapsed();
            if cycle < pacing.min_cycle {
                to_sleep = to_sleep.max(pacing.min_cycle - cycle);
            }
            if !to_sleep.is_zero() {
                std::thread::sleep(to_sleep);
                last_sleep = Instant::now();
            }
        }
        Ok(())
    }

    /// Finalizes the Thread: the runqueue stops accepting tasks and its
    /// remaining tasks are cancelled during the last drain. Idempotent;
    /// late callers block until finalization completed.
    ///
    /// A spawned Thread finalizes on its own worker (foreign callers wait
    /// for it); a registered Thread must be finalized from its own OS
    /// thread.
    pub fn finalize(&self) -> Result<(), RuntimeError> {
        if self.inner.finalizing.set() {
            logging::lifecycle("Finalizing", self);
            if self.inner.created {
                if self.ident() != Some(std::thread::current().id()) {
                    self.inner.finalized.wait();
                }
                // On the worker itself the drain loop exits and finalizes.
            } else {
                self.assert_current("finalize")?;
                self.finalize_on_thread();
            }
        } else {
            self.inner.finalized.wait();
        }
        Ok(())
    }

    fn finalize_on_thread(&self) {
        // Cancel before tearing down storage: closing coroutines still needs
        // this thread's slot for the done signal.
        for task in self.fetch(true) {
            task.cancel();
        }
        tls::remove();
        if let Some(id) = self.ident() {
            context().threads.lock().remove(&id);
        }
        self.inner.finalized.set();
        logging::lifecycle("Finalized", self);
    }

    /// Printable state, optionally with one line per queued task.
    pub fn printable_info(&self, include_tasks: bool) -> String {
        let mut out = self.to_string();
        if include_tasks {
            let queued: Vec<TaskRef> = self
                .snapshot_tasks()
                .into_iter()
                .filter(|task| !task.is_done())
                .collect();
            if !queued.is_empty() {
                out.push_str("\nThread active tasks:");
                for (i, task) in queued.iter().enumerate() {
                    out.push_str(&format!("\n[{i}]: {task}"));
                }
            }
        }
        out
    }
}

impl fmt::Display for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]",
            if self.is_created() {
                "[Thread-S]"
            } else {
                "[Thread-R]"
            },
            self.name()
        )?;
        match self.ident() {
            Some(id) => write!(f, "[{id:?}]")?,
            None => write!(f, "[...]")?,
        }
        if self.inner.finalized.is_set() {
            write!(f, "[FINALIZED]")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Returns the Thread wrapping the calling OS thread, registering it on
/// first contact.
pub fn get_current_thread() -> Thread {
    let id = std::thread::current().id();
    if let Some(thread) = context().threads.lock().get(&id) {
        return thread.clone();
    }
    Thread::register_current()
}
