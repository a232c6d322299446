//! Dispatcher Errors
//!
//! Item failures travel through result routing as [`WorkError`]; everything
//! else is a construction or lifecycle error.

use std::any::Any;
use std::io;

/// Failure raised by a single work item
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("{0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("{0}")]
    Message(String),

    #[error("work item panicked: {0}")]
    Panicked(String),
}

impl WorkError {
    /// Create from a plain message
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Wrap any error value
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed(Box::new(error))
    }

    /// Convert a caught panic payload, keeping its message when it has one
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked(panic_message(payload.as_ref()))
    }

    /// True if the item panicked rather than returning an error
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Invalid dispatcher configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid worker thread count {0}: expected -1, 0 or a positive number")]
    InvalidWorkerCount(i64),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Worker pool error
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Serialized execution context error
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("event loop is closed")]
    Closed,

    #[error("failed to spawn event loop thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Dispatcher error
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("context error: {0}")]
    Context(#[from] ContextError),
}
