use crate::manager::GcTaskManager;
use crate::task::SENTINEL_WORKER;
use anyhow::{Result, anyhow};
use std::fmt;
use std::sync::Arc;
use std::thread;

pub(crate) type ThreadNameFn = Arc<dyn Fn(u32) -> String + Send + Sync + 'static>;

pub(crate) type ReleaseHookFn = Arc<dyn Fn(u32) + Send + Sync + 'static>;

// Keep within the 15 usable bytes of a pthread name for worker counts up to
// five digits.
fn default_thread_name_fn() -> ThreadNameFn {
    Arc::new(|which| format!("gc-worker-{}", which))
}

/// Configures and constructs a [`GcTaskManager`].
///
/// ```
/// # use workgang::Builder;
/// let manager = Builder::new()
///     .parallel_gc_threads(4)
///     .task_affinity(true)
///     .try_build()
///     .unwrap();
/// # manager.shutdown().unwrap();
/// ```
pub struct Builder {
    /// Maximum worker count. Defaults to one worker per CPU core.
    parallel_gc_threads: Option<u32>,

    /// Pin each worker to a CPU, distributing workers across the cores the
    /// OS reports.
    bind_threads_to_cpus: bool,

    /// Start with a single active worker and grow on demand via
    /// [`GcTaskManager::set_active_workers`].
    dynamic_worker_count: bool,

    /// Honour per-task worker-affinity hints when dispatching.
    task_affinity: bool,

    /// The embedder drives the worker API from its own threads; the manager
    /// spawns none.
    external_workers: bool,

    /// Name fn for threads spawned by the manager.
    thread_name: ThreadNameFn,

    /// Stack size for threads spawned by the manager.
    thread_stack_size: Option<usize>,

    /// Invoked on the worker's thread when it acknowledges a
    /// resource-release request, before the flag is cleared.
    release_hook: Option<ReleaseHookFn>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            parallel_gc_threads: None,
            bind_threads_to_cpus: false,
            dynamic_worker_count: false,
            task_affinity: false,
            external_workers: false,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            release_hook: None,
        }
    }

    /// Sets the fixed maximum worker count.
    ///
    /// # Panics
    ///
    /// Panics if `val` is zero.
    pub fn parallel_gc_threads(mut self, val: u32) -> Self {
        assert!(val > 0, "worker count cannot be 0");
        self.parallel_gc_threads = Some(val);
        self
    }

    pub fn bind_threads_to_cpus(mut self, val: bool) -> Self {
        self.bind_threads_to_cpus = val;
        self
    }

    /// With a dynamic worker count the manager starts with one active worker
    /// and instantiates more only when the target concurrency grows.
    pub fn dynamic_worker_count(mut self, val: bool) -> Self {
        self.dynamic_worker_count = val;
        self
    }

    pub fn task_affinity(mut self, val: bool) -> Self {
        self.task_affinity = val;
        self
    }

    /// Do not spawn any worker threads: the embedder's threads call
    /// [`GcTaskManager::get_task`] and friends themselves. This is the seam
    /// for runtimes that own their thread lifecycle (and for tests that
    /// drive the protocol step by step).
    pub fn external_workers(mut self) -> Self {
        self.external_workers = true;
        self
    }

    /// Sets the name for threads spawned by the manager. The worker index is
    /// appended.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = Arc::new(move |which| format!("{}-{}", val, which));
        self
    }

    /// Sets a function mapping a worker index to its thread name.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) -> String + Send + Sync + 'static,
    {
        self.thread_name = Arc::new(f);
        self
    }

    /// Sets the stack size (in bytes) for spawned worker threads.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Runs `f(which)` on worker `which`'s thread each time it acknowledges
    /// a [`GcTaskManager::release_all_resources`] request.
    pub fn on_release_resources<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.release_hook = Some(Arc::new(f));
        self
    }

    /// Creates the configured manager and, unless `external_workers` is set,
    /// spawns its initial worker threads.
    pub fn try_build(self) -> Result<Arc<GcTaskManager>> {
        let cfg = self.try_into()?;
        Ok(GcTaskManager::with_config(cfg))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Validated configuration consumed by the manager and its thread pool.
#[derive(Clone)]
pub(crate) struct ManagerConfig {
    pub(crate) workers: u32,
    pub(crate) bind_threads_to_cpus: bool,
    pub(crate) dynamic_worker_count: bool,
    pub(crate) task_affinity: bool,
    pub(crate) external_workers: bool,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) release_hook: Option<ReleaseHookFn>,
}

impl ManagerConfig {
    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("worker count cannot be 0"));
        }
        if self.workers >= SENTINEL_WORKER {
            return Err(anyhow!(
                "worker count {} collides with the sentinel index",
                self.workers
            ));
        }
        Ok(())
    }
}

impl TryFrom<Builder> for ManagerConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let workers = match builder.parallel_gc_threads {
            Some(val) => val,
            None => thread::available_parallelism()?.get() as u32,
        };

        let cfg = ManagerConfig {
            workers,
            bind_threads_to_cpus: builder.bind_threads_to_cpus,
            dynamic_worker_count: builder.dynamic_worker_count,
            task_affinity: builder.task_affinity,
            external_workers: builder.external_workers,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            release_hook: builder.release_hook,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

impl fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The closures aren't printable.
        f.debug_struct("ManagerConfig")
            .field("workers", &self.workers)
            .field("bind_threads_to_cpus", &self.bind_threads_to_cpus)
            .field("dynamic_worker_count", &self.dynamic_worker_count)
            .field("task_affinity", &self.task_affinity)
            .field("external_workers", &self.external_workers)
            .field("thread_stack_size", &self.thread_stack_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    // The config is cloned into every spawned worker thread.
    assert_impl_all!(ManagerConfig: Send, Sync, Clone);

    #[test]
    #[should_panic(expected = "worker count cannot be 0")]
    fn zero_workers_is_rejected_at_set_time() {
        let _ = Builder::new().parallel_gc_threads(0);
    }

    #[test]
    fn default_worker_count_follows_available_parallelism() {
        let cfg: ManagerConfig = Builder::new().external_workers().try_into().unwrap();
        assert!(cfg.workers >= 1);
    }
}
