//! Work Model
//!
//! The collaborators the dispatcher consumes: invocable work items, the
//! controllers they run against, component sinks and the global handler.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::WorkError;
use crate::package::FailureContext;

/// Value produced by a work item
pub type WorkValue = Box<dyn Any + Send>;

/// Result of invoking a work item
pub type WorkResult = Result<WorkValue, WorkError>;

/// Invocation target of a work item
///
/// Opaque to the dispatcher: it is only passed through to items and to the
/// global exception handler.
pub trait Controller: Send + Sync {
    /// Name used in log output
    fn name(&self) -> &str {
        "controller"
    }

    /// Downcast support for items and handlers
    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Controller").field(&self.name()).finish()
    }
}

/// Success/failure sink attached to a package
pub trait ComponentInstance: Send + Sync {
    /// First item of a feedback package succeeded
    fn on_success(&self);

    /// First item of a feedback package failed
    fn on_failure(&self, error: WorkError);
}

/// Global sink for failures no component instance claims
pub trait ExceptionHandler: Send + Sync {
    fn handle(&self, controller: &Arc<dyn Controller>, error: WorkError, context: &FailureContext);
}

impl<F> ExceptionHandler for F
where
    F: Fn(&Arc<dyn Controller>, WorkError, &FailureContext) + Send + Sync,
{
    fn handle(&self, controller: &Arc<dyn Controller>, error: WorkError, context: &FailureContext) {
        self(controller, error, context)
    }
}

/// A single invocable unit of controller work
pub trait WorkItem: Send + Sync {
    /// Raw invocation
    ///
    /// Failures are returned and panics unwind untouched, so the dispatcher's
    /// own routing sees the original failure.
    fn invoke_raw(
        &self,
        controller: &dyn Controller,
        params: &ParamMap,
        component: Option<&dyn ComponentInstance>,
    ) -> WorkResult;

    /// Checked invocation: a panic inside the item comes back as `WorkError::Panicked`
    fn invoke(
        &self,
        controller: &dyn Controller,
        params: &ParamMap,
        component: Option<&dyn ComponentInstance>,
    ) -> WorkResult {
        panic::catch_unwind(AssertUnwindSafe(|| self.invoke_raw(controller, params, component)))
            .unwrap_or_else(|payload| Err(WorkError::from_panic(payload)))
    }

    /// Short description for trace output
    fn describe(&self) -> String {
        "work item".to_string()
    }
}

/// Closure-backed work item
pub struct FnWork<F> {
    name: String,
    func: F,
}

impl<F> WorkItem for FnWork<F>
where
    F: Fn(&dyn Controller, &ParamMap, Option<&dyn ComponentInstance>) -> WorkResult + Send + Sync,
{
    fn invoke_raw(
        &self,
        controller: &dyn Controller,
        params: &ParamMap,
        component: Option<&dyn ComponentInstance>,
    ) -> WorkResult {
        (self.func)(controller, params, component)
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Wrap a closure as a shareable work item
pub fn work_fn<F>(name: &str, func: F) -> Arc<dyn WorkItem>
where
    F: Fn(&dyn Controller, &ParamMap, Option<&dyn ComponentInstance>) -> WorkResult
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnWork {
        name: name.to_string(),
        func,
    })
}

/// Parameter mapping handed to every item of a package
#[derive(Clone, Default)]
pub struct ParamMap {
    values: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ParamMap {
    /// Create empty mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous one under the key
    pub fn insert<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.values.insert(key.into(), Arc::new(value));
    }

    /// Builder-style insert
    pub fn with<T>(mut self, key: impl Into<String>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.insert(key, value);
        self
    }

    /// Typed lookup
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for ParamMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Form;

    impl Controller for Form {
        fn name(&self) -> &str {
            "form"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_param_map_typed_get() {
        let params = ParamMap::new().with("count", 3u32).with("label", "name".to_string());

        assert_eq!(params.len(), 2);
        assert_eq!(params.get::<u32>("count"), Some(&3));
        assert_eq!(params.get::<String>("label").map(String::as_str), Some("name"));
        assert!(params.get::<i64>("count").is_none());
        assert!(params.get::<u32>("missing").is_none());
    }

    #[test]
    fn test_checked_invoke_catches_panic() {
        let item = work_fn("explode", |_, _, _| panic!("bad input"));

        let result = item.invoke(&Form, &ParamMap::new(), None);
        match result {
            Err(WorkError::Panicked(message)) => assert_eq!(message, "bad input"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_item_sees_controller_and_params() {
        let item = work_fn("read", |controller, params, _| {
            let form = controller.as_any().downcast_ref::<Form>().is_some();
            let value = params.get::<u32>("x").copied().unwrap_or_default();
            Ok(Box::new((form, value)) as WorkValue)
        });

        let value = item
            .invoke(&Form, &ParamMap::new().with("x", 9u32), None)
            .unwrap();
        assert_eq!(value.downcast_ref::<(bool, u32)>(), Some(&(true, 9)));
        assert_eq!(item.describe(), "read");
    }
}
