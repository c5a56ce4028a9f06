use crate::manager::GcTaskManager;
use crate::monitor::WaitFlag;
use std::fmt;
use std::ops::Deref;
use std::ptr;
use std::sync::Arc;

/// Worker index meaning "no preference" (as an affinity) or "nobody" (as the
/// blocking worker).
pub const SENTINEL_WORKER: u32 = u32::MAX;

/// Batch identifier for tasks that never perform collection work.
pub const GC_ID_UNDEFINED: u32 = u32::MAX;

/// The work a task performs when a worker executes it. The manager never
/// looks inside; it only schedules.
pub type TaskFn = Box<dyn FnOnce(&GcTaskManager, u32) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Caller-supplied collection work.
    Ordinary,
    /// Placeholder handed to a worker that woke up with nothing to do.
    Noop,
    /// Parks its worker until the manager releases idle workers.
    Idle,
    /// Waits for quiescence of everything dispatched before it, then signals
    /// its submitter.
    Barrier,
}

pub(crate) enum Body {
    Ordinary(TaskFn),
    Noop,
    Idle,
    Barrier(Arc<WaitFlag>),
}

/// A single unit of work. Heap-owned; the linkage fields thread it into at
/// most one [`TaskQueue`](crate::queue::TaskQueue) at a time, and are both
/// null whenever the task is outside a queue.
pub struct GcTask {
    gc_id: u32,
    affinity: u32,
    /// Toward the remove end of the enclosing queue. Written only by the queue.
    pub(crate) older: *mut GcTask,
    /// Toward the insert end of the enclosing queue. Written only by the queue.
    pub(crate) newer: *mut GcTask,
    body: Body,
}

// Safety: the linkage pointers are written only by the owning queue, and
// every queue is mutated under the manager monitor. A task outside a queue
// has null links and is reached through a unique Box, except for the noop
// singleton, which has no interior mutability at all.
unsafe impl Send for GcTask {}
unsafe impl Sync for GcTask {}

impl GcTask {
    /// An ordinary task with no worker preference.
    pub fn new(gc_id: u32, work: impl FnOnce(&GcTaskManager, u32) + Send + 'static) -> Box<Self> {
        Self::with_affinity(gc_id, SENTINEL_WORKER, work)
    }

    /// An ordinary task that prefers to run on worker `affinity`.
    pub fn with_affinity(
        gc_id: u32,
        affinity: u32,
        work: impl FnOnce(&GcTaskManager, u32) + Send + 'static,
    ) -> Box<Self> {
        Box::new(Self::raw(gc_id, affinity, Body::Ordinary(Box::new(work))))
    }

    pub(crate) fn noop() -> Arc<Self> {
        Arc::new(Self::raw(GC_ID_UNDEFINED, SENTINEL_WORKER, Body::Noop))
    }

    pub(crate) fn idle() -> Box<Self> {
        Box::new(Self::raw(GC_ID_UNDEFINED, SENTINEL_WORKER, Body::Idle))
    }

    pub(crate) fn barrier(flag: Arc<WaitFlag>) -> Box<Self> {
        Box::new(Self::raw(
            GC_ID_UNDEFINED,
            SENTINEL_WORKER,
            Body::Barrier(flag),
        ))
    }

    fn raw(gc_id: u32, affinity: u32, body: Body) -> Self {
        Self {
            gc_id,
            affinity,
            older: ptr::null_mut(),
            newer: ptr::null_mut(),
            body,
        }
    }

    pub fn kind(&self) -> Kind {
        match self.body {
            Body::Ordinary(_) => Kind::Ordinary,
            Body::Noop => Kind::Noop,
            Body::Idle => Kind::Idle,
            Body::Barrier(_) => Kind::Barrier,
        }
    }

    pub fn gc_id(&self) -> u32 {
        self.gc_id
    }

    pub fn affinity(&self) -> u32 {
        self.affinity
    }

    pub fn is_barrier(&self) -> bool {
        matches!(self.body, Body::Barrier(_))
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.body, Body::Idle)
    }

    pub(crate) fn is_linked(&self) -> bool {
        !self.older.is_null() || !self.newer.is_null()
    }

    pub(crate) fn execute(self: Box<Self>, manager: &GcTaskManager, which: u32) {
        debug_assert!(!self.is_linked(), "executing a task that is still linked");
        let GcTask { body, .. } = *self;
        match body {
            Body::Ordinary(work) => work(manager, which),
            Body::Noop => {}
            Body::Idle => manager.idle_worker_park(which),
            Body::Barrier(flag) => {
                manager.wait_for_barrier(which);
                // The submitter re-checks the flag under its monitor, so this
                // notify cannot be missed.
                flag.notify();
            }
        }
    }
}

impl fmt::Debug for GcTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcTask")
            .field("kind", &self.kind())
            .field("gc_id", &self.gc_id)
            .field("affinity", &self.affinity)
            .finish_non_exhaustive()
    }
}

/// What [`GcTaskManager::get_task`](crate::GcTaskManager::get_task) hands a
/// worker: either a task dequeued from the shared queue, which the worker now
/// owns, or the manager's immortal noop, which is shared by every worker and
/// never linked into the queue.
#[derive(Debug)]
pub enum GcTaskHandle {
    Queued(Box<GcTask>),
    Noop(Arc<GcTask>),
}

impl GcTaskHandle {
    /// Run the task body. For the shared noop there is nothing to run.
    pub fn execute(self, manager: &GcTaskManager, which: u32) {
        match self {
            GcTaskHandle::Queued(task) => task.execute(manager, which),
            GcTaskHandle::Noop(task) => debug_assert_eq!(task.kind(), Kind::Noop),
        }
    }
}

impl Deref for GcTaskHandle {
    type Target = GcTask;

    fn deref(&self) -> &GcTask {
        match self {
            GcTaskHandle::Queued(task) => task,
            GcTaskHandle::Noop(task) => task,
        }
    }
}
