//! The task manager: a fixed pool of long-lived workers draining one shared,
//! barrier-fenced FIFO queue.
//!
//! Everything the dispatch protocol touches lives under a single monitor, so
//! every wakeup is race-free and no notify is lost. Workers block on the
//! monitor in [`GcTaskManager::get_task`]; submitters take it briefly to
//! enqueue. Barrier and idle handshakes use separate [`WaitFlag`]s so
//! unrelated wakeups don't broadcast onto the main monitor.

mod pool;

#[cfg(test)]
mod tests;

use crate::builder::{Builder, ManagerConfig};
use crate::monitor::{MonitorPool, WaitFlag};
use crate::queue::TaskQueue;
use crate::task::{GcTask, GcTaskHandle, Kind, SENTINEL_WORKER};
use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use pool::ThreadPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

/// The shared work queue and the counter block it moves in lockstep with.
///
/// Guarded by the manager monitor: holding the [`Mutex`] guard for this
/// struct *is* holding the monitor, so none of these fields can be reached
/// without it.
#[derive(Debug)]
pub(crate) struct SharedQueue {
    queue: TaskQueue,

    /// Threads instantiated so far. Monotone, bounded by the worker capacity.
    created_workers: u32,

    /// Target concurrency. Idle workers subtract from this.
    active_workers: u32,

    /// Workers parked on an idle task.
    idle_workers: u32,

    /// Workers currently executing a non-idle task.
    busy_workers: u32,

    /// Worker executing a barrier task, or the sentinel. Non-sentinel means
    /// the queue is blocked: nothing is dispatched until the barrier
    /// completes.
    blocking_worker: u32,

    delivered_tasks: u64,
    completed_tasks: u64,
    barriers: u64,
    emptied_queue: u64,
}

impl SharedQueue {
    fn new(active_workers: u32) -> Self {
        Self {
            queue: TaskQueue::new(),
            created_workers: 0,
            active_workers,
            idle_workers: 0,
            busy_workers: 0,
            blocking_worker: SENTINEL_WORKER,
            delivered_tasks: 0,
            completed_tasks: 0,
            barriers: 0,
            emptied_queue: 0,
        }
    }

    fn is_blocked(&self) -> bool {
        self.blocking_worker != SENTINEL_WORKER
    }
}

/// Owns the shared queue, the worker pool and the dispatch protocol.
///
/// Constructed through [`Builder`]; shared behind an [`Arc`] with every
/// worker thread. Submitters use [`submit`](Self::submit),
/// [`submit_list`](Self::submit_list) and
/// [`submit_and_wait`](Self::submit_and_wait); workers (spawned or external)
/// cycle through [`get_task`](Self::get_task),
/// [`note_completion`](Self::note_completion) and the resource-release
/// handshake.
#[derive(Debug)]
pub struct GcTaskManager {
    cfg: ManagerConfig,

    /// Fixed maximum worker count.
    workers: u32,

    /// State guarded by the manager monitor.
    shared: Mutex<SharedQueue>,

    /// The manager monitor's condvar. Workers, idle workers and barrier
    /// bodies all park here, which is why every notifier uses `notify_all`:
    /// a single wake could land on the wrong class of waiter and stall the
    /// system.
    monitor: Condvar,

    /// One flag per worker. The manager sets them under the monitor; each
    /// worker reads and clears only its own cell, lock-free.
    resource_flags: Box<[AtomicBool]>,

    /// Immortal placeholder handed to any worker that wakes up with an empty
    /// queue. Never linked into the queue.
    noop: Arc<GcTask>,

    /// Parks surplus workers collectively. The bit is read and written under
    /// the manager monitor; the flag's own monitor is not used for idling.
    idle_flag: WaitFlag,

    /// Supplies monitors to barrier wait flags and recycles them.
    monitors: Arc<MonitorPool>,

    pool: ThreadPool,

    shutdown: AtomicBool,
}

impl GcTaskManager {
    /// A manager with `workers` workers and default configuration: threads
    /// spawned eagerly, no CPU binding, plain FIFO dispatch.
    pub fn new(workers: u32) -> Arc<Self> {
        Builder::new()
            .parallel_gc_threads(workers)
            .try_build()
            .expect("default configuration is valid")
    }

    pub(crate) fn with_config(cfg: ManagerConfig) -> Arc<Self> {
        let workers = cfg.workers;
        let active_workers = if cfg.dynamic_worker_count { 1 } else { workers };
        let monitors = Arc::new(MonitorPool::new());
        let resource_flags = (0..workers).map(|_| AtomicBool::new(false)).collect();

        let manager = Arc::new(Self {
            workers,
            shared: Mutex::new(SharedQueue::new(active_workers)),
            monitor: Condvar::new(),
            resource_flags,
            noop: GcTask::noop(),
            idle_flag: WaitFlag::new(&monitors),
            monitors,
            pool: ThreadPool::new(&cfg, workers),
            shutdown: AtomicBool::new(false),
            cfg,
        });
        manager.add_workers(true);
        manager
    }

    pub(crate) fn cfg(&self) -> &ManagerConfig {
        &self.cfg
    }

    /// Fixed maximum worker count.
    pub fn workers(&self) -> u32 {
        self.workers
    }

    fn check_worker_index(&self, which: u32) {
        assert!(
            which < self.workers,
            "worker index {} out of range (workers: {})",
            which,
            self.workers
        );
    }

    /// Instantiate workers up to `min(active_workers, workers)`. With
    /// external workers there is nothing to spawn; the embedder's threads
    /// count as installed.
    fn add_workers(self: &Arc<Self>, initializing: bool) {
        let mut shared = self.shared.lock();
        let target = shared.active_workers.min(self.workers);
        if self.cfg.external_workers {
            shared.created_workers = shared.created_workers.max(target);
        } else {
            while shared.created_workers < target {
                let which = shared.created_workers;
                self.pool.spawn_worker(self, which);
                shared.created_workers += 1;
            }
        }
        shared.active_workers = shared.active_workers.min(shared.created_workers);
        trace!(
            created = shared.created_workers,
            active = shared.active_workers,
            initializing,
            "workers added"
        );
    }

    // --- Submission API ---

    /// Enqueue one task and wake the workers.
    pub fn submit(&self, task: Box<GcTask>) {
        let mut shared = self.shared.lock();
        trace!(task = ?task, "submit");
        shared.queue.enqueue(task);
        // Notify with the lock held so the wakeup cannot be missed.
        self.monitor.notify_all();
    }

    /// Splice a whole batch onto the queue and wake the workers. The batch
    /// appears contiguously in dispatch order.
    pub fn submit_list(&self, mut list: TaskQueue) {
        let mut shared = self.shared.lock();
        trace!(length = list.length(), "submit_list");
        shared.queue.enqueue_list(&mut list);
        // More than one task may have been enqueued, and a barrier further
        // down must not be starved: wake every waiter, not just one.
        self.monitor.notify_all();
    }

    /// Submit `list` followed by a barrier, and block until every task in
    /// the batch has completed.
    ///
    /// Tasks submitted afterwards are not dispatched until the barrier
    /// completes, so the batch is fenced on both sides.
    pub fn submit_and_wait(&self, mut list: TaskQueue) {
        let flag = Arc::new(WaitFlag::new(&self.monitors));
        list.enqueue(GcTask::barrier(Arc::clone(&flag)));
        // Enqueueing under the monitor publishes the flag to whichever
        // worker dequeues the barrier; the lock pairing makes it visible
        // before our wait begins.
        self.submit_list(list);
        flag.wait_for(true);
    }

    // --- Worker API ---

    /// Called by worker `which` in its loop. Blocks while the queue is
    /// blocked by a barrier, or while there is nothing to do and no
    /// resource-release request pending for this worker.
    ///
    /// A worker woken with an empty queue gets the shared noop, so it can
    /// acknowledge whatever it was woken for and come back.
    pub fn get_task(&self, which: u32) -> GcTaskHandle {
        self.check_worker_index(which);
        let mut shared = self.shared.lock();

        while !self.is_shutdown()
            && (shared.is_blocked() || (shared.queue.is_empty() && !self.should_release(which)))
        {
            self.monitor.wait(&mut shared);
        }

        let handle = if !shared.is_blocked() && !shared.queue.is_empty() {
            let task = if self.cfg.task_affinity {
                shared.queue.dequeue_with_affinity(which)
            } else {
                shared.queue.dequeue()
            }
            .expect("queue is not empty");
            if task.is_barrier() {
                // The queue is now blocked until this worker completes.
                shared.blocking_worker = which;
            }
            GcTaskHandle::Queued(task)
        } else {
            GcTaskHandle::Noop(Arc::clone(&self.noop))
        };

        // Idle tasks park the worker instead of keeping it busy; they stay
        // outside the delivery accounting.
        if handle.kind() != Kind::Idle {
            shared.busy_workers += 1;
            shared.delivered_tasks += 1;
        }
        trace!(which, kind = ?handle.kind(), "get_task");
        handle
    }

    /// Called by worker `which` after executing a non-idle task.
    pub fn note_completion(&self, which: u32) {
        self.check_worker_index(which);
        let mut shared = self.shared.lock();

        if shared.blocking_worker == which {
            shared.blocking_worker = SENTINEL_WORKER;
            shared.barriers += 1;
        }
        shared.completed_tasks += 1;
        assert!(shared.busy_workers > 0, "completion without a busy worker");
        shared.busy_workers -= 1;
        if shared.busy_workers == 0 && shared.queue.is_empty() {
            shared.emptied_queue += 1;
            trace!(which, "queue emptied");
        }
        // Tell everyone: the barrier body, blocked workers and the idle
        // machinery all wait on this monitor.
        self.monitor.notify_all();
    }

    /// Lock-free read of worker `which`'s resource-release flag.
    pub fn should_release(&self, which: u32) -> bool {
        self.resource_flags[which as usize].load(Ordering::Acquire)
    }

    /// Lock-free acknowledgement: worker `which` has released its resources.
    pub fn note_release(&self, which: u32) {
        self.resource_flags[which as usize].store(false, Ordering::Release);
    }

    /// Ask every worker to release its scratch resources.
    ///
    /// Not atomic across workers: an early worker may observe and act on its
    /// flag before the later cells are set. Wrap the request in a
    /// [`submit_and_wait`](Self::submit_and_wait) batch if a fence is
    /// needed.
    pub fn release_all_resources(&self) {
        let _shared = self.shared.lock();
        for flag in self.resource_flags.iter() {
            flag.store(true, Ordering::Release);
        }
        // Workers sleeping on an empty queue must wake to acknowledge.
        self.monitor.notify_all();
    }

    // --- Dynamic worker adjustment ---

    /// Adjust the target concurrency. Growing instantiates workers up to the
    /// fixed capacity; shrinking parks the surplus on idle tasks.
    pub fn set_active_workers(self: &Arc<Self>, val: u32) {
        assert!(val > 0, "active workers cannot be 0");
        let val = val.min(self.workers);
        let grew = {
            let mut shared = self.shared.lock();
            let previous = shared.active_workers;
            shared.active_workers = val;
            val > previous
        };
        if grew {
            self.add_workers(false);
        } else {
            self.park_surplus_workers();
        }
    }

    /// Fabricate one idle task per surplus worker and enqueue the batch.
    ///
    /// Already-parked workers stay parked (the idle flag is re-armed first)
    /// and cannot be reclaimed until the next release cycle; if they exceed
    /// the surplus, the active target is folded down to match instead.
    pub fn park_surplus_workers(&self) {
        let mut shared = self.shared.lock();
        self.idle_flag.set_should_wait(true);

        let mut surplus = i64::from(shared.created_workers)
            - i64::from(shared.active_workers)
            - i64::from(shared.idle_workers);
        if surplus < 0 {
            shared.active_workers = (i64::from(shared.active_workers) + surplus) as u32;
            surplus = 0;
        }

        let mut batch = TaskQueue::new();
        for _ in 0..surplus {
            batch.enqueue(GcTask::idle());
            shared.idle_workers += 1;
        }
        debug_assert_eq!(
            shared.created_workers,
            shared.active_workers + shared.idle_workers,
            "created workers should equal active + idle"
        );
        trace!(
            surplus,
            active = shared.active_workers,
            idle = shared.idle_workers,
            "parking surplus workers"
        );
        shared.queue.enqueue_list(&mut batch);
        self.monitor.notify_all();
    }

    /// Wake every worker parked on an idle task.
    pub fn release_idle_workers(&self) {
        let _shared = self.shared.lock();
        self.idle_flag.set_should_wait(false);
        self.monitor.notify_all();
    }

    // --- Task-body protocols (invoked from GcTask::execute) ---

    /// The idle-task body: park on the manager monitor until the idle flag
    /// is cleared. Idle tasks never touch the busy accounting, so there is
    /// no completion to note afterwards.
    pub(crate) fn idle_worker_park(&self, which: u32) {
        let mut shared = self.shared.lock();
        trace!(which, idle = shared.idle_workers, "worker idle");
        // Let observers see the idle count before we go quiet.
        self.monitor.notify_all();
        while self.idle_flag.should_wait() {
            self.monitor.wait(&mut shared);
        }
        shared.idle_workers -= 1;
        trace!(which, idle = shared.idle_workers, "worker released");
    }

    /// The barrier-task body: wait until this worker is the only busy one,
    /// i.e. everything dispatched before the barrier has completed.
    pub(crate) fn wait_for_barrier(&self, which: u32) {
        let mut shared = self.shared.lock();
        debug_assert!(shared.is_blocked(), "barrier running on an unblocked queue");
        debug_assert_eq!(shared.blocking_worker, which, "blocker mismatch");
        while shared.busy_workers > 1 {
            self.monitor.wait(&mut shared);
        }
        trace!(which, "barrier reached quiescence");
    }

    // --- Shutdown ---

    /// Stop the worker loops and join the spawned threads. Idempotent.
    ///
    /// Queued work that has not been dispatched is left in place; drain with
    /// [`submit_and_wait`](Self::submit_and_wait) first. Must not be called
    /// from a worker thread.
    pub fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let _shared = self.shared.lock();
            // Unpark idle workers and wake everything blocked in get_task.
            self.idle_flag.set_should_wait(false);
            self.monitor.notify_all();
        }
        self.pool.join_all()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // --- Observability ---

    pub fn created_workers(&self) -> u32 {
        self.shared.lock().created_workers
    }

    pub fn active_workers(&self) -> u32 {
        self.shared.lock().active_workers
    }

    pub fn idle_workers(&self) -> u32 {
        self.shared.lock().idle_workers
    }

    pub fn busy_workers(&self) -> u32 {
        self.shared.lock().busy_workers
    }

    /// The worker currently executing a barrier task, if any.
    pub fn blocking_worker(&self) -> Option<u32> {
        let shared = self.shared.lock();
        (shared.blocking_worker != SENTINEL_WORKER).then_some(shared.blocking_worker)
    }

    pub fn is_blocked(&self) -> bool {
        self.shared.lock().is_blocked()
    }

    /// Tasks handed to workers so far (idle tasks excluded).
    pub fn delivered_tasks(&self) -> u64 {
        self.shared.lock().delivered_tasks
    }

    /// Tasks workers have finished so far (idle tasks excluded).
    pub fn completed_tasks(&self) -> u64 {
        self.shared.lock().completed_tasks
    }

    /// Barrier tasks completed so far.
    pub fn barriers(&self) -> u64 {
        self.shared.lock().barriers
    }

    /// Times the manager went fully quiet: no busy workers, empty queue.
    pub fn emptied_queue(&self) -> u64 {
        self.shared.lock().emptied_queue
    }

    pub fn queue_length(&self) -> u32 {
        self.shared.lock().queue.length()
    }
}

impl Drop for GcTaskManager {
    fn drop(&mut self) {
        let shared = self.shared.get_mut();
        assert_eq!(shared.busy_workers, 0, "still have busy workers");
        assert!(shared.queue.is_empty(), "still have queued work");
    }
}
