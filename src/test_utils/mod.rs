use crate::queue::TaskQueue;
use crate::task::GcTask;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Records `(label, worker)` pairs in the order task bodies ran.
#[derive(Debug, Default)]
pub(crate) struct DispatchLog {
    entries: Mutex<Vec<(u32, u32)>>,
}

impl DispatchLog {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn record(&self, label: u32, which: u32) {
        self.entries.lock().push((label, which));
    }

    pub(crate) fn entries(&self) -> Vec<(u32, u32)> {
        self.entries.lock().clone()
    }

    pub(crate) fn labels_sorted(&self) -> Vec<u32> {
        let mut labels = self
            .entries
            .lock()
            .iter()
            .map(|(label, _)| *label)
            .collect::<Vec<_>>();
        labels.sort_unstable();
        labels
    }
}

/// A batch of `n` tasks labelled `0..n` that record themselves in `log`.
pub(crate) fn recording_batch(n: u32, log: &Arc<DispatchLog>) -> TaskQueue {
    recording_batch_from(0, n, log)
}

/// Like [`recording_batch`] but with labels starting at `first`.
pub(crate) fn recording_batch_from(first: u32, n: u32, log: &Arc<DispatchLog>) -> TaskQueue {
    let mut batch = TaskQueue::new();
    for label in first..first + n {
        let log = Arc::clone(log);
        batch.enqueue(GcTask::new(label, move |_, which| log.record(label, which)));
    }
    batch
}

/// A batch of `n` tasks that bump `counter` when they run.
pub(crate) fn counting_batch(n: u32, counter: &Arc<AtomicUsize>) -> TaskQueue {
    let mut batch = TaskQueue::new();
    for _ in 0..n {
        let counter = Arc::clone(counter);
        batch.enqueue(GcTask::new(0, move |_, _| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
    }
    batch
}

/// Spin until `predicate` holds. Panics after a generous deadline so a
/// protocol bug fails the test instead of hanging it.
#[track_caller]
pub(crate) fn spin_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::yield_now();
    }
}
