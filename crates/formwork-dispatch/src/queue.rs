//! Blocking Task Queue
//!
//! FIFO of boxed tasks with a condition variable, shared by the event loop
//! and the fixed pool's backlog.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Task function type
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Unbounded FIFO of tasks that consumers can block on
pub(crate) struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    // Tasks run outside the lock, so a poisoned queue is still consistent
    fn lock(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a task; returns it back if the queue is shut down
    pub(crate) fn push(&self, task: Task) -> Result<(), Task> {
        let mut queue = self.lock();
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(task);
        }
        queue.push_back(task);
        self.condvar.notify_one();
        Ok(())
    }

    /// Block until a task is available or the queue shuts down
    pub(crate) fn wait_for_task(&self) -> Option<Task> {
        let mut queue = self.lock();

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }

            if let Some(task) = queue.pop_front() {
                return Some(task);
            }

            // Wait with timeout to re-check shutdown
            let (guard, _) = self
                .condvar
                .wait_timeout(queue, Duration::from_millis(100))
                .unwrap_or_else(PoisonError::into_inner);
            queue = guard;
        }
    }

    /// Stop accepting tasks and drop the ones still queued
    ///
    /// Returns the number of tasks that never started.
    pub(crate) fn shutdown(&self) -> usize {
        let dropped = {
            let mut queue = self.lock();
            self.shutdown.store(true, Ordering::SeqCst);
            self.condvar.notify_all();
            std::mem::take(&mut *queue)
        };
        // Released outside the lock: dropped tasks may own handles to us
        dropped.len()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
