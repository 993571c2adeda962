//! Per-state-object synchronization contexts.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::ids::Runtime;

/// Opaque identifier for a [`SyncContext`], stable for the lifetime of the
/// pipeline element that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyncContextId(pub u32);

/// A mutex serializing all work scheduled against one state object.
///
/// All receivers owned by the same component share a `SyncContext`; their
/// `action` callbacks and the component's `start`/`stop`/`final` hooks are
/// mutually exclusive under it. This is the only ordering guarantee between
/// receivers of a single component (section 5).
///
/// Exclusivity is implemented with a single `AtomicBool` rather than a
/// `Mutex` guard because the scheduler needs to test-and-claim a context
/// while holding its own pending-work lock, then release that lock before
/// running the claimed thunk — a borrowed `MutexGuard` cannot outlive that
/// scope, an owned flag can.
#[derive(Debug, Clone)]
pub struct SyncContext {
    id: SyncContextId,
    /// Counts `post()` calls currently mid-flight against this context, so
    /// the scheduler can avoid dispatching a context's head item while an
    /// earlier-originating-time message from a concurrent poster might
    /// still be in the process of being enqueued (see `scheduler::mod`
    /// dispatch loop doc comment for the ordering argument).
    in_flight: Arc<AtomicUsize>,
    /// Whether a worker currently holds exclusive execution rights.
    executing: Arc<AtomicBool>,
}

impl SyncContext {
    /// Creates a fresh sync context scoped to `runtime`.
    #[must_use]
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            id: SyncContextId(runtime.next_sync_context_id()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            executing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// This context's stable id.
    #[must_use]
    pub fn id(&self) -> SyncContextId {
        self.id
    }

    /// Marks the beginning of a post that targets this context; returns a
    /// guard that decrements the in-flight counter on drop.
    #[must_use]
    pub(crate) fn enter_post(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            counter: Arc::clone(&self.in_flight),
        }
    }

    /// True if a post targeting this context is currently mid-flight.
    pub(crate) fn has_in_flight_posts(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Attempts to claim exclusive execution rights, non-blockingly.
    /// Callers that claim but find nothing to run must call
    /// [`SyncContext::end_exec`] to release the claim.
    pub(crate) fn try_begin_exec(&self) -> bool {
        self.executing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Releases exclusive execution rights claimed by `try_begin_exec`.
    pub(crate) fn end_exec(&self) {
        self.executing.store(false, Ordering::SeqCst);
    }

    /// True if a worker currently holds exclusive execution rights.
    #[must_use]
    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }
}

impl PartialEq for SyncContext {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for SyncContext {}

/// RAII guard decrementing a [`SyncContext`]'s in-flight post counter.
pub(crate) struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_guard_decrements_on_drop() {
        let ctx = SyncContext::new(&Runtime::new());
        assert!(!ctx.has_in_flight_posts());
        {
            let _g = ctx.enter_post();
            assert!(ctx.has_in_flight_posts());
        }
        assert!(!ctx.has_in_flight_posts());
    }

    #[test]
    fn exec_claim_is_mutually_exclusive() {
        let ctx = SyncContext::new(&Runtime::new());
        assert!(ctx.try_begin_exec());
        assert!(!ctx.try_begin_exec());
        ctx.end_exec();
        assert!(ctx.try_begin_exec());
    }
}
