use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sequential_test::sequential;

use cotask::{
    add_to, cancel, cancel_with, clear, debug_info, enter, get_current_thread, leave, propagate,
    sleep, sleep_tick, spawn_named, success, switch_thread, wait_all, ETaskDone, RuntimeError,
    Section, Task, TaskRef, TaskSet, Thread,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Finalizes the registered thread this test ran on, cancelling leftovers.
fn teardown() {
    get_current_thread().finalize().unwrap();
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

#[test]
#[sequential]
fn simple_return() {
    init_logging();
    let task = spawn_named("simple_return", async { Ok::<_, ETaskDone>(1) });
    task.wait().unwrap();
    assert!(task.is_succeeded());
    assert_eq!(task.result().unwrap(), 1);
    teardown();
}

fn branch_task(value: bool) -> Task<i32> {
    spawn_named("branch_true_false", async move {
        sleep_tick().await?;
        if value {
            success(1).await?;
        } else {
            cancel().await?;
        }
        Ok::<_, ETaskDone>(0)
    })
}

#[test]
#[sequential]
fn branch_true_succeeds_with_one() {
    init_logging();
    let task = branch_task(true);
    task.wait().unwrap();
    assert!(task.is_succeeded());
    assert_eq!(task.result().unwrap(), 1);
    teardown();
}

#[test]
#[sequential]
fn branch_false_cancels_without_exception() {
    init_logging();
    let task = branch_task(false);
    task.wait().unwrap();
    assert!(task.is_done());
    assert!(!task.is_succeeded());
    assert!(task.exception().unwrap().is_none());
    teardown();
}

#[test]
#[sequential]
fn sleep_one_second() {
    init_logging();
    let started = Instant::now();
    let task = spawn_named("sleep_1", async {
        sleep(Duration::from_secs(1)).await?;
        Ok::<_, ETaskDone>(1)
    });
    task.wait().unwrap();
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(task.is_succeeded());
    assert_eq!(task.result().unwrap(), 1);
    teardown();
}

fn partial_sum_task(count: i64) -> Task<i64> {
    spawn_named("partial_sum", async move {
        let mut total = 0;
        for i in 0..count {
            total += i;
            sleep_tick().await?;
        }
        Ok::<_, ETaskDone>(total)
    })
}

#[test]
#[sequential]
fn compute_in_single_thread() {
    init_logging();
    let top = spawn_named("compute_in_single_thread", async {
        let tasks: Vec<Task<i64>> = (0..128).map(partial_sum_task).collect();
        wait_all(&tasks).await?;
        let total = tasks.iter().map(|t| t.result().unwrap()).sum::<i64>();
        Ok::<_, ETaskDone>(total)
    });
    top.wait().unwrap();
    assert_eq!(top.result().unwrap(), 341376);
    teardown();
}

fn hopping_task(data: Arc<Mutex<Vec<i32>>>) -> Task<()> {
    spawn_named("hopping", async move {
        let home = get_current_thread();
        let away = Thread::new("temp");
        switch_thread(&away).await?;
        sleep(Duration::from_secs_f32(fastrand::f32())).await?;
        data.lock().push(1);
        switch_thread(&home).await?;
        away.finalize().unwrap();
        Ok::<_, ETaskDone>(())
    })
}

#[test]
#[sequential]
fn multi_thread() {
    init_logging();
    let data = Arc::new(Mutex::new(Vec::new()));
    let shared = data.clone();
    let top = spawn_named("multi_thread", async move {
        let tasks: Vec<Task<()>> = (0..8).map(|_| hopping_task(shared.clone())).collect();
        wait_all(&tasks).await?;
        Ok::<_, ETaskDone>(shared.lock().iter().sum::<i32>())
    });
    top.wait().unwrap();
    assert_eq!(top.result().unwrap(), 8);
    teardown();
}

#[test]
#[sequential]
fn section_guards_counter_across_threads() {
    init_logging();
    let section = Section::new();
    let counter = Arc::new(AtomicU32::new(0));
    let inside = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicU32::new(0));
    let threads: Vec<Thread> = (0..10).map(|i| Thread::new(format!("section-{i}"))).collect();

    let mut tasks = Vec::new();
    for thread in &threads {
        for increment in 0..10 {
            let section = section.clone();
            let counter = counter.clone();
            let inside = inside.clone();
            let violations = violations.clone();
            let thread = thread.clone();
            tasks.push(spawn_named("incrementer", async move {
                switch_thread(&thread).await?;
                enter(&section).await?;
                if inside.swap(true, Ordering::SeqCst) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                counter.fetch_add(1, Ordering::SeqCst);
                inside.store(false, Ordering::SeqCst);
                if increment % 2 == 0 {
                    leave(&section).await?;
                }
                // Odd increments terminate while holding; release is
                // automatic at termination.
                Ok::<_, ETaskDone>(())
            }));
        }
    }

    for task in &tasks {
        task.wait().unwrap();
        assert!(task.is_succeeded());
    }
    assert_eq!(counter.load(Ordering::SeqCst), 100);
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(!section.is_held());

    for thread in threads {
        thread.finalize().unwrap();
    }
    teardown();
}

fn cleanup_flag_task(flag: Arc<AtomicBool>) -> Task<()> {
    spawn_named("done_exception", async move {
        let outcome = async {
            sleep(Duration::from_secs(1)).await?;
            success(()).await
        }
        .await;
        if outcome.is_err() {
            flag.store(true, Ordering::SeqCst);
        }
        Ok::<_, ETaskDone>(())
    })
}

#[test]
#[sequential]
fn done_signal_reaches_cleanup_on_success() {
    init_logging();
    let flag = Arc::new(AtomicBool::new(false));
    let task = cleanup_flag_task(flag.clone());
    task.wait().unwrap();
    assert!(task.is_succeeded());
    assert!(flag.load(Ordering::SeqCst));
    teardown();
}

#[test]
#[sequential]
fn done_signal_reaches_cleanup_on_external_cancel() {
    init_logging();
    let flag = Arc::new(AtomicBool::new(false));
    let task = cleanup_flag_task(flag.clone());
    task.cancel();
    assert!(task.is_done());
    assert!(flag.load(Ordering::SeqCst));
    teardown();
}

fn nested_task(depth: u32, registry: Arc<Mutex<Vec<TaskRef>>>) -> Task<u32> {
    spawn_named("nested", async move {
        if depth > 0 {
            for _ in 0..2 {
                let child = nested_task(depth - 1, registry.clone());
                registry.lock().push(child.as_untyped().clone());
            }
        }
        sleep(Duration::from_secs(999)).await?;
        Ok::<_, ETaskDone>(depth)
    })
}

#[test]
#[sequential]
fn cancelling_root_terminates_every_descendant() {
    init_logging();
    let registry = Arc::new(Mutex::new(Vec::new()));
    let root = nested_task(2, registry.clone());
    assert_eq!(registry.lock().len(), 6, "2 children and 4 grandchildren");

    let started = Instant::now();
    root.cancel();
    assert!(root.is_done());
    for descendant in registry.lock().iter() {
        assert!(descendant.is_done());
        assert!(!descendant.is_succeeded());
    }
    assert!(started.elapsed() < Duration::from_millis(500));
    teardown();
}

// ---------------------------------------------------------------------------
// Linking and collections
// ---------------------------------------------------------------------------

#[test]
#[sequential]
fn propagate_adopts_inner_outcome() {
    init_logging();
    let outer = spawn_named("propagate_outer", async {
        let inner = spawn_named("propagate_inner", async {
            sleep_tick().await?;
            Ok::<_, ETaskDone>(1)
        });
        propagate(&inner).await?;
        Ok::<_, ETaskDone>(0)
    });
    outer.wait().unwrap();
    assert!(outer.is_succeeded());
    assert_eq!(outer.result().unwrap(), 1);
    teardown();
}

#[test]
#[sequential]
fn propagate_carries_exception() {
    init_logging();
    let outer: Task<i32> = spawn_named("propagate_failure", async {
        let inner: Task<i32> = spawn_named("failing_inner", async {
            sleep_tick().await?;
            cancel_with(RuntimeError::NotCancelled).await?;
            Ok::<_, ETaskDone>(0)
        });
        propagate(&inner).await?;
        Ok::<_, ETaskDone>(0)
    });
    outer.wait().unwrap();
    assert!(!outer.is_succeeded());
    let exception = outer.exception().unwrap().expect("inherited exception");
    assert!(exception.to_string().contains("has not been cancelled"));
    teardown();
}

#[test]
#[sequential]
fn wait_on_randomized_sleepers() {
    init_logging();
    let top = spawn_named("wait_multi", async {
        let sleepers: Vec<Task<()>> = (0..8)
            .map(|_| {
                spawn_named("sleeper", async {
                    sleep(Duration::from_secs_f32(fastrand::f32())).await?;
                    Ok::<_, ETaskDone>(())
                })
            })
            .collect();
        wait_all(&sleepers).await?;
        let finished = sleepers.iter().all(|t| t.is_succeeded());
        Ok::<_, ETaskDone>(finished)
    });
    top.wait().unwrap();
    assert!(top.result().unwrap());
    teardown();
}

fn member_task(set: &TaskSet<i32>) -> Task<i32> {
    let set = set.clone();
    spawn_named("member", async move {
        add_to(&set).await?;
        sleep(Duration::from_secs(999)).await?;
        Ok::<_, ETaskDone>(0)
    })
}

#[test]
#[sequential]
fn task_set_lifecycle() {
    init_logging();
    let set: TaskSet<i32> = TaskSet::named("taskset_1");

    let first = member_task(&set);
    assert_eq!(set.count(), 1);
    first.cancel();
    assert_eq!(set.count(), 0);

    let second = member_task(&set);
    set.finalize();
    assert!(!second.is_succeeded());
    assert_eq!(set.count(), 0);

    // Offered to a finalized set: cancelled without an exception.
    let third = member_task(&set);
    assert!(third.is_done());
    assert!(!third.is_succeeded());
    assert!(third.exception().unwrap().is_none());
    teardown();
}

#[test]
#[sequential]
fn task_set_fetch_drains_finished_members() {
    init_logging();
    let top = spawn_named("taskset_fetch", async {
        let set: TaskSet<i32> = TaskSet::new();
        for _ in 0..32 {
            let member = spawn_named("fetched", async {
                sleep(Duration::from_secs(1)).await?;
                Ok::<_, ETaskDone>(1)
            });
            assert!(set.add(&member, false));
        }

        while set.count() != 0 {
            for task in set.fetch(Some(true), None) {
                assert!(task.is_succeeded());
                assert_eq!(task.result().unwrap(), 1);
            }
            sleep_tick().await?;
        }
        Ok::<_, ETaskDone>(true)
    });
    top.wait().unwrap();
    assert!(top.result().unwrap());
    teardown();
}

fn long_sleeper() -> Task<()> {
    spawn_named("scope_member", async {
        sleep(Duration::from_secs(999)).await?;
        Ok::<_, ETaskDone>(())
    })
}

fn scoped_parent() -> Task<()> {
    spawn_named("scope_parent", async {
        let _inner = long_sleeper();
        sleep(Duration::from_secs(999)).await?;
        Ok::<_, ETaskDone>(())
    })
}

#[test]
#[sequential]
fn scope_adopts_transitively_created_tasks() {
    init_logging();
    let set: TaskSet = TaskSet::named("task_set_1");

    let parent;
    {
        let _scope = set.as_scope();
        parent = scoped_parent();
    }
    assert_eq!(set.count(), 2, "the parent and its inner task");

    // Created outside the scope: not adopted.
    let outsider = spawn_named("outsider", async { Ok::<_, ETaskDone>(()) });
    assert_eq!(set.count(), 2);
    drop(outsider);

    set.cancel_all();
    assert!(parent.is_done());
    assert!(!parent.is_succeeded());
    assert_eq!(set.count(), 0);
    teardown();
}

// ---------------------------------------------------------------------------
// Thread identity and misuse
// ---------------------------------------------------------------------------

#[test]
#[sequential]
fn switch_thread_changes_os_identity() {
    init_logging();
    let worker = Thread::new("identity");
    let observed = Arc::new(Mutex::new(None));
    let slot = observed.clone();
    let target = worker.clone();
    let task = spawn_named("switcher", async move {
        switch_thread(&target).await?;
        *slot.lock() = Some(std::thread::current().id());
        Ok::<_, ETaskDone>(())
    });
    task.wait().unwrap();
    assert!(task.is_succeeded());
    assert_eq!(*observed.lock(), worker.ident());
    worker.finalize().unwrap();
    teardown();
}

#[test]
#[sequential]
fn switching_to_finalized_thread_cancels() {
    init_logging();
    let worker = Thread::new("doomed");
    worker.finalize().unwrap();

    let target = worker.clone();
    let task: Task<i32> = spawn_named("stranded", async move {
        switch_thread(&target).await?;
        Ok::<_, ETaskDone>(1)
    });
    task.wait().unwrap();
    assert!(!task.is_succeeded());
    assert!(task.exception().unwrap().is_none());
    teardown();
}

#[test]
#[sequential]
fn wait_inside_task_is_refused() {
    init_logging();
    let task = spawn_named("waiter", async {
        let inner = spawn_named("inner", async { Ok::<_, ETaskDone>(()) });
        let refused = matches!(inner.wait(), Err(RuntimeError::WaitInsideTask));
        Ok::<_, ETaskDone>(refused)
    });
    task.wait().unwrap();
    assert!(task.result().unwrap());
    teardown();
}

#[test]
#[sequential]
fn clear_shuts_the_runtime_down() {
    init_logging();
    let _worker = Thread::new("clear-worker");
    let lingering = spawn_named("lingering", async {
        sleep(Duration::from_secs(999)).await?;
        Ok::<_, ETaskDone>(())
    });

    clear().unwrap();
    assert!(lingering.is_done());
    assert!(!lingering.is_succeeded());
    assert_eq!(debug_info(), "");
}
