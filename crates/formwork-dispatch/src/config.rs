//! Dispatcher Configuration

use std::num::NonZeroUsize;
use std::time::Duration;

use crate::error::ConfigError;

const WORKER_THREADS_VAR: &str = "FORMWORK_WORKER_THREADS";
const KEEP_ALIVE_VAR: &str = "FORMWORK_WORKER_KEEP_ALIVE_SECS";
const TRACE_VAR: &str = "FORMWORK_TRACE_INVOCATIONS";

/// Worker thread strategy, fixed for the lifetime of a dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerThreads {
    /// No workers; all work runs inline on the submitting thread
    Disabled,
    /// Threads created on demand and retired after the keep-alive window
    Unbounded,
    /// Exactly this many persistent workers fed from a backlog queue
    Fixed(NonZeroUsize),
}

impl WorkerThreads {
    /// Fixed pool of `count` workers; a count of 0 disables workers
    pub fn fixed(count: usize) -> Self {
        NonZeroUsize::new(count).map_or(Self::Disabled, Self::Fixed)
    }

    /// Parse the raw configuration value (`0`, `-1` or a positive count)
    pub fn from_raw(value: i64) -> Result<Self, ConfigError> {
        match value {
            0 => Ok(Self::Disabled),
            -1 => Ok(Self::Unbounded),
            n if n > 0 => usize::try_from(n)
                .ok()
                .and_then(NonZeroUsize::new)
                .map(Self::Fixed)
                .ok_or(ConfigError::InvalidWorkerCount(value)),
            _ => Err(ConfigError::InvalidWorkerCount(value)),
        }
    }

    /// Raw configuration value
    pub fn as_raw(&self) -> i64 {
        match self {
            Self::Disabled => 0,
            Self::Unbounded => -1,
            Self::Fixed(n) => n.get() as i64,
        }
    }

    /// Whether any worker thread may ever be used
    pub fn enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Dispatcher configuration options
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker pool strategy
    pub worker_threads: WorkerThreads,

    /// Idle time after which an unbounded-pool worker retires
    pub keep_alive: Duration,

    /// Capture the submitting call stack for every queued package
    pub trace_invocations: bool,

    /// Worker threads are named `"{prefix} {id}"`
    pub thread_name_prefix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_threads: WorkerThreads::Unbounded,
            keep_alive: Duration::from_secs(60),
            trace_invocations: false,
            thread_name_prefix: "formwork-worker".to_string(),
        }
    }
}

impl DispatcherConfig {
    /// Create with the given worker strategy and default everything else
    pub fn with_workers(worker_threads: WorkerThreads) -> Self {
        Self {
            worker_threads,
            ..Self::default()
        }
    }

    /// Defaults overlaid with `FORMWORK_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(WORKER_THREADS_VAR) {
            let value = raw.trim().parse::<i64>().map_err(|_| ConfigError::InvalidValue {
                key: WORKER_THREADS_VAR,
                value: raw.clone(),
            })?;
            config.worker_threads = WorkerThreads::from_raw(value)?;
        }

        if let Some(raw) = lookup(KEEP_ALIVE_VAR) {
            let secs = raw.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                key: KEEP_ALIVE_VAR,
                value: raw.clone(),
            })?;
            config.keep_alive = Duration::from_secs(secs);
        }

        if let Some(raw) = lookup(TRACE_VAR) {
            config.trace_invocations = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: TRACE_VAR,
                        value: raw,
                    });
                }
            };
        }

        Ok(config)
    }
}
