//! Formwork Dispatch
//!
//! Work dispatcher for declarative UI controllers.
//!
//! Controller actions arrive as ordered batches of work items. The dispatcher
//! either runs a batch inline on the calling thread or queues it on one of two
//! priority lanes, from which a single-flight dispatch loop feeds a worker
//! pool. Queue mutations are ordered through one serialized execution context
//! (the UI event loop).
//!
//! # Worker strategies
//! - `0`: workers disabled, everything runs inline
//! - `-1`: unbounded pool, threads created on demand and retired when idle
//! - `n > 0`: fixed pool of `n` persistent workers
//!
//! # Example
//! ```rust,ignore
//! use formwork_dispatch::{Dispatcher, DispatcherConfig, EventLoop, WorkRequest};
//!
//! let ui = EventLoop::spawn("ui")?;
//! let dispatcher = Dispatcher::new(DispatcherConfig::default(), ui.clone(), handler);
//! let d = dispatcher.clone();
//! ui.invoke_later(move || d.submit(WorkRequest::new(controller).item(save)))?;
//! ```

mod config;
mod context;
mod dispatcher;
mod error;
mod lanes;
mod package;
mod pool;
mod queue;
mod work;

pub use config::{DispatcherConfig, WorkerThreads};
pub use context::{EventLoop, ExecutionContext};
pub use dispatcher::{Dispatcher, DispatcherStats, WorkRequest};
pub use error::{ConfigError, ContextError, DispatchError, PoolError, WorkError};
pub use lanes::{LaneCounts, PriorityLanes};
pub use package::{FailureContext, InvokerCallStack, Priority, WorkPackage};
pub use pool::{WorkerId, WorkerPool, WorkerRecord, current_worker};
pub use queue::Task;
pub use work::{
    ComponentInstance, Controller, ExceptionHandler, FnWork, ParamMap, WorkItem, WorkResult,
    WorkValue, work_fn,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
