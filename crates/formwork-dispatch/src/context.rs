//! Serialized Execution Context
//!
//! The single logical thread on which dispatcher state changes are ordered,
//! the equivalent of a UI event loop. [`ExecutionContext`] is the capability
//! the dispatcher depends on; [`EventLoop`] is a thread-backed implementation.

use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread::{self, JoinHandle};

use crate::error::{ContextError, panic_message};
use crate::queue::{Task, TaskQueue};

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the event loop driving this thread, 0 when none
    static CURRENT_LOOP: Cell<u64> = const { Cell::new(0) };
}

/// A serialized execution context tasks can be posted to
pub trait ExecutionContext: Send + Sync {
    /// True if the calling thread is this context
    fn is_current(&self) -> bool;

    /// Queue a task to run on the context after everything already queued
    fn post(&self, task: Task) -> Result<(), ContextError>;
}

/// Dedicated thread draining a FIFO of tasks one at a time
pub struct EventLoop {
    id: u64,
    name: String,
    queue: Arc<TaskQueue>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pending_tasks", &self.queue.len())
            .field("closed", &self.queue.is_shutdown())
            .finish()
    }
}

impl EventLoop {
    /// Start a new event loop thread
    pub fn spawn(name: &str) -> Result<Arc<Self>, ContextError> {
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::new(TaskQueue::new());
        let loop_queue = Arc::clone(&queue);

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                CURRENT_LOOP.with(|current| current.set(id));
                while let Some(task) = loop_queue.wait_for_task() {
                    // A failing task must not stop the loop
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                        tracing::error!(
                            "Event loop task panicked: {}",
                            panic_message(payload.as_ref())
                        );
                    }
                }
                CURRENT_LOOP.with(|current| current.set(0));
            })
            .map_err(ContextError::Spawn)?;

        tracing::debug!("Event loop {} started", name);
        Ok(Arc::new(Self {
            id,
            name: name.to_string(),
            queue,
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `task` on the loop later; never runs it synchronously
    pub fn invoke_later<F>(&self, task: F) -> Result<(), ContextError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(Box::new(task))
    }

    /// Run `task` now if on the loop thread, otherwise post it and return
    pub fn run_or_defer<F>(&self, task: F) -> Result<(), ContextError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_current() {
            task();
            Ok(())
        } else {
            self.invoke_later(task)
        }
    }

    /// Run `task` on the loop and block until it has finished
    ///
    /// Runs directly when already on the loop thread. Returns `None` when the
    /// wait was cut short because the loop closed before running the task; a
    /// panic inside the task is re-raised on the calling thread.
    pub fn invoke_and_wait<F, R>(&self, task: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Some(task());
        }

        let (tx, rx) = mpsc::sync_channel(1);
        let posted = self.invoke_later(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task));
            let _ = tx.send(outcome);
        });
        if let Err(e) = posted {
            tracing::warn!("Interrupted while waiting for {}: {}", self.name, e);
            return None;
        }

        match rx.recv() {
            Ok(Ok(value)) => Some(value),
            Ok(Err(payload)) => {
                tracing::error!(
                    "Programming error in task awaited on {}: {}",
                    self.name,
                    panic_message(payload.as_ref())
                );
                panic::resume_unwind(payload)
            }
            Err(_) => {
                tracing::warn!("Interrupted while waiting for {}: task dropped", self.name);
                None
            }
        }
    }

    /// Stop the loop; tasks still queued are dropped
    ///
    /// Joins the loop thread unless called from it.
    pub fn shutdown(&self) {
        let dropped = self.queue.shutdown();
        if dropped > 0 {
            tracing::warn!("Event loop {} closed with {} queued tasks", self.name, dropped);
        }

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if self.is_current() {
                return;
            }
            let _ = handle.join();
            tracing::debug!("Event loop {} stopped", self.name);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_shutdown()
    }
}

impl ExecutionContext for EventLoop {
    fn is_current(&self) -> bool {
        CURRENT_LOOP.with(|current| current.get() == self.id)
    }

    fn post(&self, task: Task) -> Result<(), ContextError> {
        self.queue.push(task).map_err(|_| ContextError::Closed)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn test_is_current_only_on_loop_thread() {
        let event_loop = EventLoop::spawn("test-loop").unwrap();

        assert!(!event_loop.is_current());
        let probe = Arc::clone(&event_loop);
        let inside = event_loop.invoke_and_wait(move || probe.is_current());
        assert_eq!(inside, Some(true));
    }

    #[test]
    fn test_tasks_run_in_post_order() {
        let event_loop = EventLoop::spawn("test-order").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            event_loop.invoke_later(move || order.lock().unwrap().push(i)).unwrap();
        }
        event_loop.invoke_and_wait(|| ());

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_run_or_defer_is_synchronous_on_loop() {
        let event_loop = EventLoop::spawn("test-defer").unwrap();
        let probe = Arc::clone(&event_loop);

        let ran_inline = event_loop.invoke_and_wait(move || {
            let flag = Arc::new(AtomicBool::new(false));
            let f = Arc::clone(&flag);
            probe
                .run_or_defer(move || f.store(true, Ordering::SeqCst))
                .unwrap();
            flag.load(Ordering::SeqCst)
        });

        assert_eq!(ran_inline, Some(true));
    }

    #[test]
    fn test_invoke_and_wait_on_loop_thread_runs_directly() {
        let event_loop = EventLoop::spawn("test-nested").unwrap();
        let probe = Arc::clone(&event_loop);

        let nested = event_loop.invoke_and_wait(move || probe.invoke_and_wait(|| 41 + 1));

        assert_eq!(nested, Some(Some(42)));
    }

    #[test]
    fn test_invoke_and_wait_repanics() {
        let event_loop = EventLoop::spawn("test-repanic").unwrap();
        let probe = Arc::clone(&event_loop);

        let result = thread::spawn(move || {
            probe.invoke_and_wait(|| -> u32 { panic!("awaited task failed") })
        })
        .join();

        assert!(result.is_err());
        // The loop survives the panic
        assert_eq!(event_loop.invoke_and_wait(|| 7), Some(7));
    }

    #[test]
    fn test_closed_loop_interrupts_waiters() {
        let event_loop = EventLoop::spawn("test-closed").unwrap();
        event_loop.shutdown();

        assert!(event_loop.is_closed());
        assert_eq!(event_loop.invoke_and_wait(|| 1), None);
        assert!(matches!(
            event_loop.invoke_later(|| {}),
            Err(ContextError::Closed)
        ));
    }

    #[test]
    fn test_shutdown_drops_queued_tasks() {
        let event_loop = EventLoop::spawn("test-drop").unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let ran = Arc::new(AtomicBool::new(false));

        event_loop
            .invoke_later(move || {
                let _ = rx.recv_timeout(Duration::from_millis(200));
            })
            .unwrap();
        let r = Arc::clone(&ran);
        event_loop.invoke_later(move || r.store(true, Ordering::SeqCst)).unwrap();

        event_loop.shutdown();
        drop(tx);

        assert!(!ran.load(Ordering::SeqCst));
    }
}
