use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A mutex/condvar pair. Waiters must re-check their predicate under the
/// mutex after every wakeup; the condvar alone carries no state.
#[derive(Debug, Default)]
pub struct Monitor {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Atomically release the guard, block, and reacquire it on wakeup.
    pub fn wait(&self, guard: &mut MutexGuard<'_, ()>) {
        self.cond.wait(guard);
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

/// Free list of reusable monitors.
///
/// Barrier handshakes are frequent and short-lived, so their monitors are
/// recycled here instead of being allocated per handshake. The pool is an
/// explicit dependency of the manager, constructed eagerly alongside it.
#[derive(Debug, Default)]
pub struct MonitorPool {
    freelist: Mutex<Vec<Arc<Monitor>>>,
}

impl MonitorPool {
    pub fn new() -> Self {
        Self {
            freelist: Mutex::new(Vec::new()),
        }
    }

    /// Pop a monitor off the free list, or construct a fresh one. The
    /// returned monitor is never locked.
    pub fn reserve(&self) -> Arc<Monitor> {
        let monitor = self
            .freelist
            .lock()
            .pop()
            .unwrap_or_else(|| Arc::new(Monitor::new()));
        debug_assert!(!monitor.is_locked(), "pool handed out a locked monitor");
        monitor
    }

    /// Return a monitor to the free list. The caller must have unlocked it.
    pub fn release(&self, monitor: Arc<Monitor>) {
        debug_assert!(!monitor.is_locked(), "released a locked monitor");
        self.freelist.lock().push(monitor);
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.freelist.lock().len()
    }
}

/// One-bit signalling primitive between a waiter and a notifier, backed by a
/// monitor borrowed from the pool for the flag's lifetime.
///
/// The flag starts in the "wait" state. `notify` clears it under the
/// monitor, so a waiter that checks the flag under the same monitor can
/// never miss the wakeup. The bit may also be read and written under a
/// *different* monitor (the manager parks idle workers on its own monitor
/// while polling this flag), which is why it is atomic.
#[derive(Debug)]
pub struct WaitFlag {
    pool: Arc<MonitorPool>,
    monitor: Option<Arc<Monitor>>,
    should_wait: AtomicBool,
}

impl WaitFlag {
    pub fn new(pool: &Arc<MonitorPool>) -> Self {
        Self {
            pool: Arc::clone(pool),
            monitor: Some(pool.reserve()),
            should_wait: AtomicBool::new(true),
        }
    }

    fn monitor(&self) -> &Monitor {
        self.monitor
            .as_deref()
            .expect("wait flag outlived its monitor")
    }

    pub fn should_wait(&self) -> bool {
        self.should_wait.load(Ordering::Acquire)
    }

    pub fn set_should_wait(&self, value: bool) {
        self.should_wait.store(value, Ordering::Release);
    }

    /// Block until the flag is cleared. With `reset`, re-arm the flag on the
    /// way out so the same flag can serve another round.
    pub fn wait_for(&self, reset: bool) {
        let monitor = self.monitor();
        let mut guard = monitor.lock();
        while self.should_wait() {
            monitor.wait(&mut guard);
        }
        if reset {
            self.set_should_wait(true);
        }
    }

    /// Clear the flag and wake every waiter.
    pub fn notify(&self) {
        let monitor = self.monitor();
        let _guard = monitor.lock();
        self.set_should_wait(false);
        monitor.notify_all();
    }
}

impl Drop for WaitFlag {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            self.pool.release(monitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn reserve_recycles_released_monitors() {
        let pool = Arc::new(MonitorPool::new());

        let first = pool.reserve();
        assert_eq!(pool.available(), 0);

        pool.release(Arc::clone(&first));
        assert_eq!(pool.available(), 1);

        let second = pool.reserve();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn reserve_constructs_when_freelist_is_empty() {
        let pool = Arc::new(MonitorPool::new());

        let first = pool.reserve();
        let second = pool.reserve();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn wait_flag_returns_its_monitor_on_drop() {
        let pool = Arc::new(MonitorPool::new());

        {
            let _flag = WaitFlag::new(&pool);
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 1);

        // The recycled monitor backs the next flag.
        let _flag = WaitFlag::new(&pool);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn notify_before_wait_is_not_lost() {
        let pool = Arc::new(MonitorPool::new());
        let flag = WaitFlag::new(&pool);

        flag.notify();
        assert!(!flag.should_wait());

        // Returns immediately, and resets the flag for the next round.
        flag.wait_for(true);
        assert!(flag.should_wait());
    }

    #[test]
    fn wait_for_without_reset_leaves_flag_clear() {
        let pool = Arc::new(MonitorPool::new());
        let flag = WaitFlag::new(&pool);

        flag.notify();
        flag.wait_for(false);
        assert!(!flag.should_wait());
    }

    #[test]
    fn notify_wakes_a_blocked_waiter() {
        let pool = Arc::new(MonitorPool::new());
        let flag = Arc::new(WaitFlag::new(&pool));

        let waiter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || flag.wait_for(false))
        };

        flag.notify();
        waiter.join().expect("waiter panicked");
    }
}
