use crate::builder::ManagerConfig;
use crate::manager::GcTaskManager;
use crate::task::Kind;
use anyhow::{Result, anyhow};
use core_affinity::CoreId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::trace;

/// The spawned worker threads and their CPU assignment.
///
/// Workers are long-lived: each runs [`worker_loop`] until the manager shuts
/// down. The pool only spawns and joins; all coordination happens through
/// the manager's monitor.
#[derive(Debug)]
pub(super) struct ThreadPool {
    handles: Mutex<Vec<JoinHandle<()>>>,

    /// One entry per worker. `None` means no CPU preference.
    processor_assignment: Vec<Option<CoreId>>,
}

impl ThreadPool {
    pub(super) fn new(cfg: &ManagerConfig, workers: u32) -> Self {
        Self {
            handles: Mutex::new(Vec::with_capacity(workers as usize)),
            processor_assignment: assign_processors(cfg, workers),
        }
    }

    pub(super) fn spawn_worker(&self, manager: &Arc<GcTaskManager>, which: u32) {
        let mut builder = thread::Builder::new().name((manager.cfg().thread_name)(which));
        if let Some(stack_size) = manager.cfg().thread_stack_size {
            builder = builder.stack_size(stack_size);
        }

        let core = self.processor_assignment[which as usize];
        let manager = Arc::clone(manager);
        let handle = builder
            .spawn(move || {
                if let Some(core) = core {
                    core_affinity::set_for_current(core);
                }
                worker_loop(&manager, which);
            })
            .expect("failed to spawn worker thread");

        self.handles.lock().push(handle);
    }

    pub(super) fn join_all(&self) -> Result<()> {
        let mut handles = self.handles.lock();

        let panicked = handles
            .drain(..)
            .map(|handle| handle.join())
            .filter(|result| result.is_err())
            .count();

        if panicked == 0 {
            Ok(())
        } else {
            Err(anyhow!("{} worker thread(s) panicked", panicked))
        }
    }
}

/// Distribute workers across the cores the OS reports, round-robin. Without
/// CPU binding (or when the OS won't say), every worker gets no preference.
fn assign_processors(cfg: &ManagerConfig, workers: u32) -> Vec<Option<CoreId>> {
    if !cfg.bind_threads_to_cpus {
        return vec![None; workers as usize];
    }
    match core_affinity::get_core_ids() {
        Some(cores) if !cores.is_empty() => (0..workers as usize)
            .map(|which| Some(cores[which % cores.len()]))
            .collect(),
        _ => vec![None; workers as usize],
    }
}

/// The worker body: pull a task, run it, account for it, acknowledge any
/// resource-release request, repeat until shutdown.
fn worker_loop(manager: &Arc<GcTaskManager>, which: u32) {
    trace!(which, "worker started");
    while !manager.is_shutdown() {
        let task = manager.get_task(which);
        let is_idle = task.kind() == Kind::Idle;

        task.execute(manager, which);

        // Idle tasks park instead of working; they have no completion.
        if !is_idle {
            manager.note_completion(which);
        }

        if manager.should_release(which) {
            if let Some(hook) = manager.cfg().release_hook.as_ref() {
                hook(which);
            }
            manager.note_release(which);
        }
    }
    trace!(which, "worker exiting");
}
