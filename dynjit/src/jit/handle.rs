use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::interval::IntervalSet;
use crate::state::HaltFlag;

/// Invalidation work recorded but not yet performed.
#[derive(Debug, Default)]
pub(crate) struct PendingInvalidation {
    pub(crate) entire: bool,
    pub(crate) ranges: IntervalSet,
}

impl PendingInvalidation {
    pub(crate) fn is_empty(&self) -> bool {
        !self.entire && self.ranges.is_empty()
    }

    /// Record `[start, start + length)`. Returns false for an empty range.
    pub(crate) fn add_range(&mut self, start: u64, length: u64) -> bool {
        if length == 0 {
            return false;
        }
        let end = start.saturating_add(length - 1);
        self.ranges.add(start, end);
        true
    }

    pub(crate) fn clear(&mut self) {
        self.entire = false;
        self.ranges.clear();
    }
}

/// State shared between a coordinator and its handles.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    executing: AtomicBool,
    pending: Mutex<PendingInvalidation>,
}

impl Shared {
    pub(crate) fn is_executing(&self) -> bool {
        self.executing.load(Ordering::Acquire)
    }

    pub(crate) fn pending(&self) -> MutexGuard<'_, PendingInvalidation> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn force_executing(&self, executing: bool) {
        self.executing.store(executing, Ordering::Release);
    }
}

/// Marks the coordinator as executing for as long as it lives.
pub(crate) struct ExecutionGuard {
    shared: Arc<Shared>,
}

impl ExecutionGuard {
    /// Panics if the coordinator is already executing.
    pub(crate) fn enter(shared: &Arc<Shared>) -> Self {
        let was_executing = shared.executing.swap(true, Ordering::AcqRel);
        assert!(!was_executing, "re-entrant run: the JIT is already executing");
        Self {
            shared: Arc::clone(shared),
        }
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.shared.executing.store(false, Ordering::Release);
    }
}

/// Cloneable handle for requests that must reach a JIT while it is running,
/// typically from inside host callbacks or from another thread.
///
/// Requests made while the JIT is executing raise the halt flag and are
/// performed when `run` returns. Requests made while it is idle are performed
/// at the start of the next `run`.
#[derive(Debug, Clone)]
pub struct JitHandle {
    shared: Arc<Shared>,
    halt: HaltFlag,
}

impl JitHandle {
    pub(crate) fn new(shared: Arc<Shared>, halt: HaltFlag) -> Self {
        Self { shared, halt }
    }

    /// Ask running code to return from `run` at its next safe point.
    pub fn halt_execution(&self) {
        self.halt.request();
    }

    pub fn clear_cache(&self) {
        self.shared.pending().entire = true;
        self.request();
    }

    pub fn invalidate_cache_range(&self, start_address: u64, length: usize) {
        if self.shared.pending().add_range(start_address, length as u64) {
            self.request();
        }
    }

    pub fn is_executing(&self) -> bool {
        self.shared.is_executing()
    }

    fn request(&self) {
        if self.shared.is_executing() {
            self.halt.request();
        }
    }
}
