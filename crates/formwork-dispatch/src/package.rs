//! Work Packages
//!
//! An immutable batch of work items plus the metadata that decides where
//! each item's outcome is routed.

use std::backtrace::Backtrace;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crate::error::WorkError;
use crate::pool::{WorkerId, WorkerRecord};
use crate::work::{ComponentInstance, Controller, ExceptionHandler, ParamMap, WorkItem};

/// Priority lane of a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    #[default]
    Normal = 0,
    High = 1,
}

impl Priority {
    /// Get priority name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

/// Where a package was submitted from
///
/// Captured at enqueue time when invocation tracing is on.
pub struct InvokerCallStack {
    thread_name: String,
    backtrace: Backtrace,
}

impl InvokerCallStack {
    /// Capture the current thread's call stack
    pub fn capture() -> Self {
        let current = thread::current();
        Self {
            thread_name: current.name().unwrap_or("<unnamed>").to_string(),
            backtrace: Backtrace::force_capture(),
        }
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Display for InvokerCallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread [{}]", self.thread_name)
    }
}

impl fmt::Debug for InvokerCallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokerCallStack")
            .field("thread_name", &self.thread_name)
            .finish_non_exhaustive()
    }
}

/// Extra information handed to the global exception handler
#[derive(Debug, Clone, Default)]
pub struct FailureContext {
    /// Position of the failed item in its package
    pub index: usize,
    /// Lane the package came from
    pub priority: Priority,
    /// True if the item ran inline on the submitting thread
    pub inline: bool,
    /// Worker that ran the item
    pub worker: Option<WorkerId>,
    /// Submitting call stack, when tracing is on
    pub call_stack: Option<Arc<InvokerCallStack>>,
}

/// Ordered work items plus routing metadata
pub struct WorkPackage {
    controller: Arc<dyn Controller>,
    items: Vec<Option<Arc<dyn WorkItem>>>,
    params: ParamMap,
    component: Option<Arc<dyn ComponentInstance>>,
    priority: Priority,
    special_success: bool,
    call_stack: Option<Arc<InvokerCallStack>>,
}

impl fmt::Debug for WorkPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkPackage")
            .field("controller", &self.controller.name())
            .field("items", &self.items.len())
            .field("priority", &self.priority)
            .field("special_success", &self.special_success)
            .field("has_component", &self.component.is_some())
            .finish()
    }
}

impl WorkPackage {
    /// Create a package; `None` item slots are skipped at run time
    pub fn new(
        controller: Arc<dyn Controller>,
        items: Vec<Option<Arc<dyn WorkItem>>>,
        params: ParamMap,
        component: Option<Arc<dyn ComponentInstance>>,
        priority: Priority,
        special_success: bool,
    ) -> Self {
        Self {
            controller,
            items,
            params,
            component,
            priority,
            special_success,
            call_stack: None,
        }
    }

    /// Attach the submitting call stack
    pub fn with_call_stack(mut self, call_stack: InvokerCallStack) -> Self {
        self.call_stack = Some(Arc::new(call_stack));
        self
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn controller(&self) -> &Arc<dyn Controller> {
        &self.controller
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn special_success(&self) -> bool {
        self.special_success
    }

    pub fn call_stack(&self) -> Option<&Arc<InvokerCallStack>> {
        self.call_stack.as_ref()
    }

    /// Run every item in order on the current thread, routing each outcome
    pub(crate) fn run(&self, handler: &dyn ExceptionHandler, worker: Option<&WorkerRecord>) {
        for (index, slot) in self.items.iter().enumerate() {
            if let Some(item) = slot {
                self.run_item(index, item.as_ref(), handler, worker);
            }
        }
    }

    /// Run every item synchronously on the caller's thread
    ///
    /// Uses the checked invocation with no component attached; every failure
    /// goes to the global handler.
    pub(crate) fn run_inline(&self, handler: &dyn ExceptionHandler) {
        for (index, slot) in self.items.iter().enumerate() {
            let Some(item) = slot else { continue };

            tracing::trace!("inline: performing work: {}", item.describe());
            if let Err(error) = item.invoke(self.controller.as_ref(), &self.params, None) {
                let context = FailureContext {
                    index,
                    priority: self.priority,
                    inline: true,
                    worker: None,
                    call_stack: None,
                };
                handler.handle(&self.controller, error, &context);
            }
        }
    }

    fn run_item(
        &self,
        index: usize,
        item: &dyn WorkItem,
        handler: &dyn ExceptionHandler,
        worker: Option<&WorkerRecord>,
    ) {
        tracing::trace!(
            "{}: performing work{}: {}",
            worker.map(WorkerRecord::name).unwrap_or("inline"),
            if self.priority == Priority::High { " (high prio)" } else { "" },
            item.describe()
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            item.invoke_raw(self.controller.as_ref(), &self.params, self.component.as_deref())
        }))
        .unwrap_or_else(|payload| Err(WorkError::from_panic(payload)));

        // Only literal position 0 of a feedback package reaches the component
        let sink = match (index, self.special_success) {
            (0, true) => self.component.as_deref(),
            _ => None,
        };

        match (outcome, sink) {
            (Ok(_), Some(component)) => component.on_success(),
            (Ok(_), None) => {}
            (Err(error), Some(component)) => component.on_failure(error),
            (Err(error), None) => {
                let context = FailureContext {
                    index,
                    priority: self.priority,
                    inline: false,
                    worker: worker.map(WorkerRecord::id),
                    call_stack: self.call_stack.clone(),
                };
                handler.handle(&self.controller, error, &context);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{WorkValue, work_fn};
    use std::any::Any;
    use std::sync::Mutex;

    struct Form;

    impl Controller for Form {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Default)]
    struct Sink {
        events: Mutex<Vec<String>>,
    }

    impl ComponentInstance for Sink {
        fn on_success(&self) {
            self.events.lock().unwrap().push("success".to_string());
        }

        fn on_failure(&self, error: WorkError) {
            self.events.lock().unwrap().push(format!("failure: {}", error));
        }
    }

    fn ok(name: &str) -> Option<Arc<dyn WorkItem>> {
        Some(work_fn(name, |_, _, _| Ok(Box::new(()) as WorkValue)))
    }

    fn fail(name: &str, message: &'static str) -> Option<Arc<dyn WorkItem>> {
        Some(work_fn(name, move |_, _, _| Err(WorkError::msg(message))))
    }

    fn recording_handler() -> (Arc<Mutex<Vec<(String, usize)>>>, impl ExceptionHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |_: &Arc<dyn Controller>, error: WorkError, context: &FailureContext| {
            sink.lock().unwrap().push((error.to_string(), context.index));
        };
        (seen, handler)
    }

    #[test]
    fn test_first_item_success_reaches_component() {
        let sink = Arc::new(Sink::default());
        let package = WorkPackage::new(
            Arc::new(Form),
            vec![ok("a"), ok("b"), ok("c")],
            ParamMap::new(),
            Some(sink.clone()),
            Priority::Normal,
            true,
        );
        let (seen, handler) = recording_handler();

        package.run(&handler, None);

        assert_eq!(*sink.events.lock().unwrap(), vec!["success".to_string()]);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_first_item_failure_reaches_component_only() {
        let sink = Arc::new(Sink::default());
        let package = WorkPackage::new(
            Arc::new(Form),
            vec![fail("a", "invalid date"), fail("b", "later")],
            ParamMap::new(),
            Some(sink.clone()),
            Priority::High,
            true,
        );
        let (seen, handler) = recording_handler();

        package.run(&handler, None);

        assert_eq!(*sink.events.lock().unwrap(), vec!["failure: invalid date".to_string()]);
        // The second item's failure still goes to the global handler
        assert_eq!(*seen.lock().unwrap(), vec![("later".to_string(), 1)]);
    }

    #[test]
    fn test_without_special_success_everything_is_generic() {
        let sink = Arc::new(Sink::default());
        let package = WorkPackage::new(
            Arc::new(Form),
            vec![fail("a", "first"), ok("b")],
            ParamMap::new(),
            Some(sink.clone()),
            Priority::Normal,
            false,
        );
        let (seen, handler) = recording_handler();

        package.run(&handler, None);

        assert!(sink.events.lock().unwrap().is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![("first".to_string(), 0)]);
    }

    #[test]
    fn test_null_first_slot_disables_component_routing() {
        let sink = Arc::new(Sink::default());
        let package = WorkPackage::new(
            Arc::new(Form),
            vec![None, fail("b", "second")],
            ParamMap::new(),
            Some(sink.clone()),
            Priority::Normal,
            true,
        );
        let (seen, handler) = recording_handler();

        package.run(&handler, None);

        assert!(sink.events.lock().unwrap().is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![("second".to_string(), 1)]);
    }

    #[test]
    fn test_panicking_item_is_routed() {
        let package = WorkPackage::new(
            Arc::new(Form),
            vec![Some(work_fn("boom", |_, _, _| panic!("kaput"))), ok("after")],
            ParamMap::new(),
            None,
            Priority::Normal,
            false,
        );
        let (seen, handler) = recording_handler();

        package.run(&handler, None);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("work item panicked: kaput".to_string(), 0)]
        );
    }

    #[test]
    fn test_inline_run_ignores_component() {
        let sink = Arc::new(Sink::default());
        let package = WorkPackage::new(
            Arc::new(Form),
            vec![fail("a", "inline failure"), None, ok("c")],
            ParamMap::new(),
            Some(sink.clone()),
            Priority::Normal,
            true,
        );
        let (seen, handler) = recording_handler();

        package.run_inline(&handler);

        assert!(sink.events.lock().unwrap().is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![("inline failure".to_string(), 0)]);
    }

    #[test]
    fn test_call_stack_display() {
        let stack = InvokerCallStack::capture();
        assert!(stack.to_string().starts_with("Thread ["));
    }
}
