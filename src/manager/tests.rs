use super::*;
use crate::test_utils::*;
use crate::utils::thread::get_current_thread_name;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::atomic::AtomicUsize;

assert_impl_all!(GcTaskManager: Send, Sync);
assert_impl_all!(GcTaskHandle: Send);
assert_impl_all!(Builder: Send);

#[rstest]
#[case::two_workers(2, 4)]
#[case::four_workers(4, 16)]
fn batch_runs_to_completion(#[case] workers: u32, #[case] tasks: u32) -> Result<()> {
    let manager = Builder::new().parallel_gc_threads(workers).try_build()?;
    let log = DispatchLog::new();

    manager.submit_and_wait(recording_batch(tasks, &log));

    // Every task ran exactly once.
    assert_eq!(log.labels_sorted(), (0..tasks).collect::<Vec<_>>());
    // The whole batch plus its barrier had been handed out by the time the
    // barrier released us.
    assert_eq!(manager.delivered_tasks(), u64::from(tasks) + 1);

    // The barrier worker's own completion may land just after we wake.
    spin_until("manager quiescence", || {
        manager.busy_workers() == 0 && manager.completed_tasks() == u64::from(tasks) + 1
    });
    assert_eq!(manager.barriers(), 1);
    assert!(manager.emptied_queue() >= 1);
    assert_eq!(manager.queue_length(), 0);

    manager.shutdown()
}

#[test]
fn barrier_isolates_batches() -> Result<()> {
    let manager = Builder::new().parallel_gc_threads(2).try_build()?;
    let log = DispatchLog::new();

    manager.submit_list(recording_batch(2, &log));
    manager.submit_and_wait(recording_batch_from(2, 2, &log));

    assert_eq!(log.labels_sorted(), vec![0, 1, 2, 3]);

    spin_until("manager quiescence", || {
        manager.busy_workers() == 0 && manager.completed_tasks() == 5
    });
    assert_eq!(manager.barriers(), 1);
    assert!(!manager.is_blocked());
    assert_eq!(manager.queue_length(), 0);

    manager.shutdown()
}

#[test]
fn worker_threads_carry_generated_names() -> Result<()> {
    let manager = Builder::new().parallel_gc_threads(2).try_build()?;
    let names = Arc::new(Mutex::new(Vec::new()));

    let mut batch = TaskQueue::new();
    for _ in 0..2 {
        let names = Arc::clone(&names);
        batch.enqueue(GcTask::new(0, move |_, _| {
            names
                .lock()
                .push(get_current_thread_name().expect("worker has a pthread name"));
        }));
    }
    manager.submit_and_wait(batch);

    {
        let names = names.lock();
        assert_eq!(names.len(), 2);
        for name in names.iter() {
            assert!(name.starts_with("gc-worker-"), "unexpected name: {}", name);
        }
    }
    manager.shutdown()?;

    // A custom prefix still gets the worker index appended.
    let manager = Builder::new()
        .parallel_gc_threads(1)
        .thread_name("relic")
        .try_build()?;
    let names = Arc::new(Mutex::new(Vec::new()));
    let mut batch = TaskQueue::new();
    {
        let names = Arc::clone(&names);
        batch.enqueue(GcTask::new(0, move |_, _| {
            names
                .lock()
                .push(get_current_thread_name().expect("worker has a pthread name"));
        }));
    }
    manager.submit_and_wait(batch);
    {
        let names = names.lock();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0], "relic-0");
    }
    manager.shutdown()
}

#[test]
fn affinity_dispatch_prefers_the_hinted_worker() -> Result<()> {
    let manager = Builder::new()
        .parallel_gc_threads(3)
        .task_affinity(true)
        .external_workers()
        .try_build()?;
    let log = DispatchLog::new();

    let mut batch = TaskQueue::new();
    for (label, affinity) in [(0, 2), (1, 1), (2, 0)] {
        let log = Arc::clone(&log);
        batch.enqueue(GcTask::with_affinity(label, affinity, move |_, which| {
            log.record(label, which)
        }));
    }
    manager.submit_list(batch);

    // With distinct affinities, nobody receives someone else's task.
    for which in 0..3 {
        let task = manager.get_task(which);
        assert_eq!(task.affinity(), which);
        task.execute(&manager, which);
        manager.note_completion(which);
    }

    let mut entries = log.entries();
    entries.sort_unstable();
    assert_eq!(entries, vec![(0, 2), (1, 1), (2, 0)]);
    assert_eq!(manager.delivered_tasks(), 3);
    assert_eq!(manager.completed_tasks(), 3);
    assert_eq!(manager.busy_workers(), 0);
    Ok(())
}

#[test]
fn affinity_never_crosses_a_barrier_and_the_queue_blocks() -> Result<()> {
    let manager = Builder::new()
        .parallel_gc_threads(2)
        .task_affinity(true)
        .external_workers()
        .try_build()?;
    let log = DispatchLog::new();

    let flag = Arc::new(WaitFlag::new(&manager.monitors));
    let mut batch = TaskQueue::new();
    {
        let log = Arc::clone(&log);
        batch.enqueue(GcTask::with_affinity(0, 1, move |_, which| {
            log.record(0, which)
        }));
    }
    batch.enqueue(GcTask::barrier(Arc::clone(&flag)));
    {
        let log = Arc::clone(&log);
        batch.enqueue(GcTask::with_affinity(1, 1, move |_, which| {
            log.record(1, which)
        }));
    }
    manager.submit_list(batch);

    // Worker 1 gets its match from before the fence, not the one behind it.
    let first = manager.get_task(1);
    assert_eq!(first.gc_id(), 0);

    // Worker 0's scan halts at the fence and the fallback hands out the
    // barrier itself, blocking the queue.
    let barrier = manager.get_task(0);
    assert_eq!(barrier.kind(), Kind::Barrier);
    assert!(manager.is_blocked());
    assert_eq!(manager.blocking_worker(), Some(0));

    first.execute(&manager, 1);
    manager.note_completion(1);

    // Worker 1's next task sits right behind the barrier, but it must not
    // come out while the queue is blocked.
    let waiter = {
        let manager = Arc::clone(&manager);
        std::thread::spawn(move || {
            let task = manager.get_task(1);
            assert!(!manager.is_blocked(), "task dispatched from a blocked queue");
            assert_eq!(task.gc_id(), 1);
            task.execute(&manager, 1);
            manager.note_completion(1);
        })
    };

    // Everything dispatched before the barrier has completed, so the
    // barrier body returns at once and signals the submitter.
    barrier.execute(&manager, 0);
    assert!(!flag.should_wait(), "barrier did not signal its submitter");
    manager.note_completion(0);

    waiter.join().expect("waiter panicked");

    assert_eq!(log.entries(), vec![(0, 1), (1, 1)]);
    assert_eq!(manager.barriers(), 1);
    assert_eq!(manager.busy_workers(), 0);
    assert_eq!(manager.completed_tasks(), 3);
    Ok(())
}

#[test]
fn surplus_workers_park_and_release() -> Result<()> {
    let manager = Builder::new().parallel_gc_threads(4).try_build()?;
    assert_eq!(manager.created_workers(), 4);
    assert_eq!(manager.active_workers(), 4);

    manager.set_active_workers(2);
    spin_until("surplus workers to park", || {
        manager.queue_length() == 0 && manager.idle_workers() == 2
    });
    assert_eq!(manager.active_workers(), 2);
    assert_eq!(manager.busy_workers(), 0);

    manager.release_idle_workers();
    spin_until("idle workers to release", || manager.idle_workers() == 0);

    // The full pool is available for work again.
    manager.set_active_workers(4);
    let counter = Arc::new(AtomicUsize::new(0));
    manager.submit_and_wait(counting_batch(8, &counter));
    assert_eq!(counter.load(Ordering::Relaxed), 8);

    manager.shutdown()
}

#[test]
fn dynamic_worker_count_starts_single_and_grows() -> Result<()> {
    let manager = Builder::new()
        .parallel_gc_threads(4)
        .dynamic_worker_count(true)
        .try_build()?;
    assert_eq!(manager.created_workers(), 1);
    assert_eq!(manager.active_workers(), 1);

    let counter = Arc::new(AtomicUsize::new(0));
    manager.submit_and_wait(counting_batch(4, &counter));
    assert_eq!(counter.load(Ordering::Relaxed), 4);

    manager.set_active_workers(3);
    assert_eq!(manager.created_workers(), 3);
    assert_eq!(manager.active_workers(), 3);

    manager.submit_and_wait(counting_batch(4, &counter));
    assert_eq!(counter.load(Ordering::Relaxed), 8);

    manager.shutdown()
}

#[test]
fn park_request_clamps_to_already_parked_workers() -> Result<()> {
    let manager = Builder::new()
        .parallel_gc_threads(4)
        .external_workers()
        .try_build()?;
    assert_eq!(manager.created_workers(), 4);

    manager.set_active_workers(1);
    assert_eq!(manager.idle_workers(), 3);
    assert_eq!(manager.queue_length(), 3);

    // Raising the target does not reclaim workers that are already parked...
    manager.set_active_workers(2);
    assert_eq!(manager.active_workers(), 2);
    assert_eq!(manager.idle_workers(), 3);

    // ...so the next park request finds more workers idle than the target
    // allows and folds the target down instead of going negative.
    manager.park_surplus_workers();
    assert_eq!(manager.active_workers(), 1);
    assert_eq!(manager.idle_workers(), 3);
    assert_eq!(manager.queue_length(), 3);

    // Once released, consuming an idle task parks nobody.
    manager.release_idle_workers();
    for _ in 0..3 {
        let task = manager.get_task(0);
        assert_eq!(task.kind(), Kind::Idle);
        task.execute(&manager, 0);
    }
    assert_eq!(manager.idle_workers(), 0);
    assert_eq!(manager.delivered_tasks(), 0, "idle tasks are not deliveries");
    Ok(())
}

#[test]
fn resource_release_handshake_wakes_sleeping_workers() -> Result<()> {
    let released = Arc::new(Mutex::new(Vec::new()));
    let manager = {
        let released = Arc::clone(&released);
        Builder::new()
            .parallel_gc_threads(2)
            .on_release_resources(move |which| released.lock().push(which))
            .try_build()?
    };

    // Both workers are asleep on an empty queue (or about to be); the
    // request must wake them so they can acknowledge.
    manager.release_all_resources();
    spin_until("workers to acknowledge", || {
        !manager.should_release(0) && !manager.should_release(1)
    });
    spin_until("the noop round to settle", || {
        manager.busy_workers() == 0 && manager.completed_tasks() == 2
    });

    let mut acknowledged = released.lock().clone();
    acknowledged.sort_unstable();
    assert_eq!(acknowledged, vec![0, 1]);

    // Each worker burned exactly one noop wakeup.
    assert_eq!(manager.delivered_tasks(), 2);
    assert_eq!(manager.queue_length(), 0);

    manager.shutdown()
}

#[test]
fn the_noop_singleton_is_shared_and_never_linked() -> Result<()> {
    let manager = Builder::new()
        .parallel_gc_threads(1)
        .external_workers()
        .try_build()?;

    manager.release_all_resources();
    let first = match manager.get_task(0) {
        GcTaskHandle::Noop(task) => task,
        other => panic!("expected the noop, got {:?}", other),
    };
    assert_eq!(first.kind(), Kind::Noop);
    manager.note_completion(0);
    manager.note_release(0);

    manager.release_all_resources();
    let second = match manager.get_task(0) {
        GcTaskHandle::Noop(task) => task,
        other => panic!("expected the noop, got {:?}", other),
    };
    manager.note_completion(0);
    manager.note_release(0);

    assert!(Arc::ptr_eq(&first, &second), "noop is not the singleton");
    assert_eq!(manager.delivered_tasks(), 2);
    assert_eq!(manager.completed_tasks(), 2);
    Ok(())
}

#[test]
fn delivered_minus_completed_tracks_busy_workers() -> Result<()> {
    let manager = Builder::new()
        .parallel_gc_threads(2)
        .external_workers()
        .try_build()?;
    let counter = Arc::new(AtomicUsize::new(0));
    manager.submit_list(counting_batch(3, &counter));

    let t0 = manager.get_task(0);
    let t1 = manager.get_task(1);
    assert_eq!(manager.delivered_tasks(), 2);
    assert_eq!(manager.completed_tasks(), 0);
    assert_eq!(manager.busy_workers(), 2);

    t0.execute(&manager, 0);
    manager.note_completion(0);
    assert_eq!(
        manager.delivered_tasks() - manager.completed_tasks(),
        u64::from(manager.busy_workers())
    );

    t1.execute(&manager, 1);
    manager.note_completion(1);

    let t2 = manager.get_task(0);
    t2.execute(&manager, 0);
    manager.note_completion(0);

    assert_eq!(counter.load(Ordering::Relaxed), 3);
    assert_eq!(manager.delivered_tasks(), 3);
    assert_eq!(manager.completed_tasks(), 3);
    assert_eq!(manager.busy_workers(), 0);
    assert_eq!(manager.emptied_queue(), 1);
    Ok(())
}

#[test]
fn submit_enqueues_a_single_task() -> Result<()> {
    let manager = Builder::new()
        .parallel_gc_threads(1)
        .external_workers()
        .try_build()?;
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let counter = Arc::clone(&counter);
        manager.submit(GcTask::new(7, move |_, _| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
    }
    assert_eq!(manager.queue_length(), 1);

    let task = manager.get_task(0);
    assert_eq!(task.gc_id(), 7);
    assert_eq!(task.kind(), Kind::Ordinary);
    task.execute(&manager, 0);
    manager.note_completion(0);

    assert_eq!(counter.load(Ordering::Relaxed), 1);
    Ok(())
}

#[test]
fn tasks_can_submit_follow_up_work() -> Result<()> {
    let manager = GcTaskManager::new(2);
    let counter = Arc::new(AtomicUsize::new(0));

    let mut batch = TaskQueue::new();
    {
        let counter = Arc::clone(&counter);
        batch.enqueue(GcTask::new(1, move |manager, _| {
            let follow_up = Arc::clone(&counter);
            manager.submit(GcTask::new(2, move |_, _| {
                follow_up.fetch_add(10, Ordering::Relaxed);
            }));
            counter.fetch_add(1, Ordering::Relaxed);
        }));
    }
    manager.submit_and_wait(batch);

    // The follow-up landed behind our barrier, so it is fenced into the next
    // round; an empty batch is just a fence.
    manager.submit_and_wait(TaskQueue::new());
    assert_eq!(counter.load(Ordering::Relaxed), 11);

    manager.shutdown()
}

#[test]
#[should_panic(expected = "out of range")]
fn out_of_range_worker_index_is_fatal() {
    let manager = Builder::new()
        .parallel_gc_threads(2)
        .external_workers()
        .try_build()
        .unwrap();
    let _ = manager.get_task(2);
}

#[test]
fn shutdown_is_idempotent() -> Result<()> {
    let manager = GcTaskManager::new(2);
    let counter = Arc::new(AtomicUsize::new(0));
    manager.submit_and_wait(counting_batch(4, &counter));

    manager.shutdown()?;
    assert!(manager.is_shutdown());
    manager.shutdown()
}
