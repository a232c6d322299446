//! Priority Lanes
//!
//! Two unbounded lock-free FIFO lanes and the waiting/running counters the
//! dispatch loop selects from.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

use crate::package::{Priority, WorkPackage};

/// Normal and high priority lanes with their counters
///
/// Waiting counts track lane length; running counts track packages from that
/// lane currently executing on a worker.
#[derive(Debug, Default)]
pub struct PriorityLanes {
    normal: SegQueue<Arc<WorkPackage>>,
    high: SegQueue<Arc<WorkPackage>>,
    waiting_normal: AtomicUsize,
    waiting_high: AtomicUsize,
    running_normal: AtomicUsize,
    running_high: AtomicUsize,
}

impl PriorityLanes {
    /// Create empty lanes
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a package to its lane
    ///
    /// The waiting count is raised before the package becomes visible, so a
    /// concurrent poll never decrements it below zero.
    pub fn push(&self, package: Arc<WorkPackage>) {
        match package.priority() {
            Priority::High => {
                self.waiting_high.fetch_add(1, Ordering::SeqCst);
                self.high.push(package);
            }
            Priority::Normal => {
                self.waiting_normal.fetch_add(1, Ordering::SeqCst);
                self.normal.push(package);
            }
        }
    }

    /// Take the next package to run and count it as running
    ///
    /// While any high priority package is running only the high lane is
    /// consulted, even when it is empty and normal work is waiting.
    pub fn poll_next(&self) -> Option<Arc<WorkPackage>> {
        if self.running_high.load(Ordering::SeqCst) > 0 {
            return self.poll_high();
        }

        self.poll_high().or_else(|| self.poll_normal())
    }

    fn poll_high(&self) -> Option<Arc<WorkPackage>> {
        let package = self.high.pop()?;
        self.waiting_high.fetch_sub(1, Ordering::SeqCst);
        self.running_high.fetch_add(1, Ordering::SeqCst);
        Some(package)
    }

    fn poll_normal(&self) -> Option<Arc<WorkPackage>> {
        let package = self.normal.pop()?;
        self.waiting_normal.fetch_sub(1, Ordering::SeqCst);
        self.running_normal.fetch_add(1, Ordering::SeqCst);
        Some(package)
    }

    /// Whether `poll_next` would currently return a package
    pub fn has_dispatchable(&self) -> bool {
        if self.running_high.load(Ordering::SeqCst) > 0 {
            return !self.high.is_empty();
        }
        !self.high.is_empty() || !self.normal.is_empty()
    }

    /// A package taken by `poll_next` finished (or was never started)
    pub fn complete(&self, priority: Priority) {
        match priority {
            Priority::High => self.running_high.fetch_sub(1, Ordering::SeqCst),
            Priority::Normal => self.running_normal.fetch_sub(1, Ordering::SeqCst),
        };
    }

    /// Drop every waiting package, returning how many were removed
    pub fn purge(&self) -> usize {
        let mut purged = 0;
        while self.high.pop().is_some() {
            self.waiting_high.fetch_sub(1, Ordering::SeqCst);
            purged += 1;
        }
        while self.normal.pop().is_some() {
            self.waiting_normal.fetch_sub(1, Ordering::SeqCst);
            purged += 1;
        }
        purged
    }

    /// Snapshot of the four counters
    pub fn counts(&self) -> LaneCounts {
        LaneCounts {
            waiting_normal: self.waiting_normal.load(Ordering::SeqCst),
            waiting_high: self.waiting_high.load(Ordering::SeqCst),
            running_normal: self.running_normal.load(Ordering::SeqCst),
            running_high: self.running_high.load(Ordering::SeqCst),
        }
    }
}

/// Lane counters at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneCounts {
    pub waiting_normal: usize,
    pub waiting_high: usize,
    pub running_normal: usize,
    pub running_high: usize,
}

impl LaneCounts {
    pub fn waiting(&self) -> usize {
        self.waiting_normal + self.waiting_high
    }

    pub fn running(&self) -> usize {
        self.running_normal + self.running_high
    }
}
