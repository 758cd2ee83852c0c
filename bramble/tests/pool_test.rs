// Integration tests for bramble::ThreadPool submission, shutdown and lifecycle


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bramble::config::LifecycleHook;
use bramble::{
    ExecuteError, Failure, LifecycleHooks, PoolHandle, PoolState, ShutdownMode, ThreadPool,
    ThreadPoolConfig, UncaughtPanic,
};
use parking_lot::Mutex;
use test_helpers::{drain, pool, Gate, Latch, WAIT};

#[test]
fn test_twenty_counter_tasks_on_tiny_local_queues() -> anyhow::Result<()> {
    let pool = pool(2, 8)?;
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..20 {
        let counter = Arc::clone(&counter);
        pool.execute(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })?;
    }

    drain(&pool)?;
    assert_eq!(counter.load(Ordering::SeqCst), 20);
    assert_eq!(pool.state(), PoolState::Down);
    Ok(())
}

#[test]
fn test_worker_spawned_tasks_overflow_to_shared_queue() -> anyhow::Result<()> {
    let pool = pool(2, 8)?;
    let handle = pool.handle();
    let counter = Arc::new(AtomicUsize::new(0));
    let latch = Latch::new(20);

    let c = Arc::clone(&counter);
    let l = latch.clone();
    pool.execute(move || {
        for _ in 0..20 {
            let c = Arc::clone(&c);
            let l = l.clone();
            handle
                .execute(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    l.count_down();
                })
                .unwrap();
        }
    })?;

    latch.wait()?;
    drain(&pool)?;
    assert_eq!(counter.load(Ordering::SeqCst), 20);
    Ok(())
}

#[test]
fn test_map_chain_on_pool_executor() -> anyhow::Result<()> {
    let pool = pool(2, 64)?;
    let exec = pool.executor();
    let gate = Gate::new();

    let g = gate.clone();
    let source = pool.submit(move || {
        g.block();
        5
    })?;
    let result = source.map(&exec, |x| x * 2).map(&exec, |x| x + 1);

    gate.wait_started()?;
    assert!(!result.is_completed());
    gate.open();

    assert_eq!(result.get(WAIT)?, 11);
    drain(&pool)?;
    Ok(())
}

#[test]
fn test_panicking_task_reaches_handler_and_worker_survives() -> anyhow::Result<()> {
    let reports: Arc<Mutex<Vec<UncaughtPanic>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let pool = ThreadPool::new(ThreadPoolConfig {
        worker_count: 1,
        panic_handler: Arc::new(move |panic: &UncaughtPanic| sink.lock().push(panic.clone())),
        ..Default::default()
    })?;

    pool.execute(|| panic!("task exploded"))?;
    let after = pool.submit(|| "still alive")?;
    assert_eq!(after.get(WAIT)?, "still alive");

    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].worker, 0);
    assert_eq!(reports[0].thread_name, "bramble-worker-0");
    assert_eq!(reports[0].message, "task exploded");
    drop(reports);

    assert_eq!(pool.statistics().total_panics(), 1);
    drain(&pool)?;
    Ok(())
}

#[test]
fn test_submit_captures_panic_in_future() -> anyhow::Result<()> {
    let pool = pool(1, 16)?;
    let future = pool.submit(|| -> u32 { panic!("inside submit") })?;
    match future.get(WAIT) {
        Err(Failure::Panicked(msg)) => assert_eq!(&*msg, "inside submit"),
        other => panic!("unexpected: {:?}", other),
    }
    // submit() owns the panic, the handler never sees it
    assert_eq!(pool.statistics().total_panics(), 0);
    drain(&pool)?;
    Ok(())
}

#[test]
fn test_submit_fallible_error() -> anyhow::Result<()> {
    let pool = pool(1, 16)?;
    let ok = pool.submit_fallible(|| "42".parse::<u8>())?;
    let bad = pool.submit_fallible(|| "forty-two".parse::<u8>())?;
    assert_eq!(ok.get(WAIT)?, 42);
    assert!(matches!(bad.get(WAIT), Err(Failure::Error(_))));
    drain(&pool)?;
    Ok(())
}

#[test]
fn test_skip_unstarted_discards_queued_work() -> anyhow::Result<()> {
    let pool = pool(1, 16)?;
    let gate = Gate::new();
    let counter = Arc::new(AtomicUsize::new(0));

    let g = gate.clone();
    pool.execute(move || g.block())?;
    gate.wait_started()?;

    for _ in 0..100 {
        let counter = Arc::clone(&counter);
        pool.execute(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })?;
    }
    assert_eq!(pool.statistics().queued(), 100);

    let terminations = pool.shutdown(ShutdownMode::SkipUnstarted);
    assert_eq!(pool.execute(|| {}), Err(ExecuteError::ShutDown));
    gate.open();
    for termination in terminations {
        termination.get(WAIT)?;
    }

    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(pool.statistics().queued(), 0);
    Ok(())
}

#[test]
fn test_interrupt_is_visible_to_running_task() -> anyhow::Result<()> {
    let pool = pool(1, 16)?;
    assert!(!bramble::is_interrupted());

    let started = Gate::new();
    let s = started.clone();
    let observed = pool.submit(move || {
        s.mark_started();
        let deadline = Instant::now() + WAIT;
        while !bramble::is_interrupted() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        bramble::is_interrupted()
    })?;

    started.wait_started()?;
    let terminations = pool.shutdown(ShutdownMode::Interrupt);
    assert!(observed.get(WAIT)?);
    for termination in terminations {
        termination.get(WAIT)?;
    }
    Ok(())
}

#[test]
fn test_drop_drains_non_daemon_pool() -> anyhow::Result<()> {
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let pool = pool(3, 64)?;
        for _ in 0..200 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                thread::sleep(Duration::from_micros(50));
                counter.fetch_add(1, Ordering::SeqCst);
            })?;
        }
    }
    assert_eq!(counter.load(Ordering::SeqCst), 200);
    Ok(())
}

#[test]
fn test_daemon_pool_drop_does_not_join() -> anyhow::Result<()> {
    let gate = Gate::new();
    let pool = ThreadPool::new(ThreadPoolConfig {
        worker_count: 1,
        daemon: true,
        ..Default::default()
    })?;
    let handle = pool.handle();

    let g = gate.clone();
    pool.execute(move || g.block())?;
    gate.wait_started()?;

    // would block forever if drop joined the blocked worker
    drop(pool);
    assert_eq!(handle.state(), PoolState::ShuttingDown);
    assert_eq!(handle.execute(|| {}), Err(ExecuteError::ShutDown));

    gate.open();
    assert!(handle.await_termination(WAIT));
    assert_eq!(handle.state(), PoolState::Down);
    Ok(())
}

#[test]
fn test_lifecycle_hooks_run_in_order() -> anyhow::Result<()> {
    let events: Arc<Mutex<Vec<(&'static str, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let constructing = thread::current().id();
    let before_start_threads = Arc::new(Mutex::new(Vec::new()));

    let record = |name: &'static str| {
        let events = Arc::clone(&events);
        let hook: LifecycleHook = Arc::new(move |index: usize| events.lock().push((name, index)));
        Some(hook)
    };
    let threads = Arc::clone(&before_start_threads);

    let pool = ThreadPool::new(ThreadPoolConfig {
        worker_count: 3,
        lifecycle: LifecycleHooks {
            before_start: Some(Arc::new(move |_: usize| threads.lock().push(thread::current().id()))),
            after_start: record("after_start"),
            before_stop: record("before_stop"),
            after_stop: record("after_stop"),
        },
        ..Default::default()
    })?;

    assert_eq!(*before_start_threads.lock(), vec![constructing; 3]);
    drain(&pool)?;

    let events = events.lock();
    for index in 0..3 {
        let mine: Vec<&str> = events
            .iter()
            .filter(|(_, i)| *i == index)
            .map(|(name, _)| *name)
            .collect();
        assert_eq!(mine, vec!["after_start", "before_stop", "after_stop"]);
    }
    Ok(())
}

#[test]
fn test_await_termination_times_out_while_running() -> anyhow::Result<()> {
    let pool = pool(1, 16)?;
    assert!(!pool.await_termination(Duration::from_millis(20)));
    drain(&pool)?;
    assert!(pool.await_termination(Duration::ZERO));
    Ok(())
}

#[test]
fn test_queue_full_is_reported() -> anyhow::Result<()> {
    let pool = ThreadPool::new(ThreadPoolConfig {
        worker_count: 1,
        shared_queue_count: 1,
        shared_queue_capacity: 2,
        ..Default::default()
    })?;
    let gate = Gate::new();
    let g = gate.clone();
    pool.execute(move || g.block())?;
    gate.wait_started()?;

    pool.execute(|| {})?;
    pool.execute(|| {})?;
    assert_eq!(
        pool.execute(|| {}),
        Err(ExecuteError::QueueFull { capacity: 2 })
    );

    gate.open();
    drain(&pool)?;
    Ok(())
}

#[test]
fn test_current_worker() -> anyhow::Result<()> {
    let pool = pool(2, 16)?;
    assert_eq!(bramble::current_worker(), None);
    let index = pool.submit(bramble::current_worker)?.get(WAIT)?;
    assert!(matches!(index, Some(i) if i < 2));
    drain(&pool)?;
    Ok(())
}

#[test]
fn test_local_queue_runs_newest_first_with_periodic_oldest() -> anyhow::Result<()> {
    let pool = ThreadPool::new(ThreadPoolConfig {
        worker_count: 1,
        local_queue_capacity: 64,
        local_fifo_interval: 4,
        ..Default::default()
    })?;
    let handle = pool.handle();
    let order = Arc::new(Mutex::new(Vec::new()));
    let latch = Latch::new(32);

    let o = Arc::clone(&order);
    let l = latch.clone();
    pool.execute(move || {
        for i in 0..32usize {
            let o = Arc::clone(&o);
            let l = l.clone();
            handle
                .execute(move || {
                    o.lock().push(i);
                    l.count_down();
                })
                .unwrap();
        }
    })?;

    latch.wait()?;
    drain(&pool)?;

    let order = order.lock();
    assert_eq!(order.len(), 32);
    // one pop in four takes the oldest entry, the rest take the newest
    let mut first: Vec<usize> = order[..4].to_vec();
    first.sort_unstable();
    assert_eq!(first, vec![0, 29, 30, 31]);
    Ok(())
}

const CHAIN_LINKS: usize = 32;

// each link spawns exactly one successor onto the same worker
fn spawn_link(handle: PoolHandle, link: usize, links_run: Arc<AtomicUsize>, done: Latch) {
    let next = handle.clone();
    handle
        .execute(move || {
            links_run.fetch_add(1, Ordering::SeqCst);
            if link + 1 < CHAIN_LINKS {
                spawn_link(next, link + 1, links_run, done);
            } else {
                done.count_down();
            }
        })
        .unwrap();
}

#[test]
fn test_self_respawning_chain_cannot_starve_older_task() -> anyhow::Result<()> {
    const FIFO_INTERVAL: usize = 4;
    let pool = ThreadPool::new(ThreadPoolConfig {
        worker_count: 1,
        local_queue_capacity: 64,
        local_fifo_interval: FIFO_INTERVAL,
        ..Default::default()
    })?;
    let handle = pool.handle();
    let links_run = Arc::new(AtomicUsize::new(0));
    let links_before_old = Arc::new(AtomicUsize::new(usize::MAX));
    let done = Latch::new(2);

    let runs = Arc::clone(&links_run);
    let seen = Arc::clone(&links_before_old);
    let d = done.clone();
    pool.execute(move || {
        let old_runs = Arc::clone(&runs);
        let old_done = d.clone();
        handle
            .execute(move || {
                seen.store(old_runs.load(Ordering::SeqCst), Ordering::SeqCst);
                old_done.count_down();
            })
            .unwrap();
        spawn_link(handle, 0, runs, d);
    })?;

    done.wait()?;
    drain(&pool)?;

    assert_eq!(links_run.load(Ordering::SeqCst), CHAIN_LINKS);
    let before = links_before_old.load(Ordering::SeqCst);
    assert!(
        before < FIFO_INTERVAL,
        "older task waited for {} chain links",
        before
    );
    Ok(())
}
