//! Process-wide id allocation, scoped to a runtime instance.
//!
//! The original system keeps module-level counters for stream, receiver,
//! element, and pipeline ids. Rather than expose those globally, each
//! [`Runtime`] owns its own atomic counters; a runtime is created with the
//! root pipeline and shared (via `Arc`) with every descendant subpipeline,
//! so ids stay unique across one pipeline tree without leaking outside it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct RuntimeInner {
    next_pipeline_id: AtomicU32,
    next_element_id: AtomicU32,
    next_emitter_id: AtomicU32,
    next_receiver_id: AtomicU32,
    next_sync_context_id: AtomicU32,
}

/// Shared id-allocation scope for one pipeline tree.
///
/// Created once by the root pipeline; subpipelines clone the `Arc` rather
/// than creating their own, so every id handed out within the tree is
/// unique. Dropped (and its counters reclaimed) when the last clone goes
/// out of scope.
#[derive(Debug, Clone, Default)]
pub struct Runtime(Arc<RuntimeInner>);

impl Runtime {
    /// Creates a fresh id-allocation scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next pipeline id.
    pub fn next_pipeline_id(&self) -> u32 {
        self.0.next_pipeline_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates the next pipeline-element id.
    pub fn next_element_id(&self) -> u32 {
        self.0.next_element_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates the next emitter id.
    pub fn next_emitter_id(&self) -> u32 {
        self.0.next_emitter_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates the next receiver id.
    pub fn next_receiver_id(&self) -> u32 {
        self.0.next_receiver_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates the next sync-context id.
    pub fn next_sync_context_id(&self) -> u32 {
        self.0.next_sync_context_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing_within_a_runtime() {
        let rt = Runtime::new();
        let a = rt.next_element_id();
        let b = rt.next_element_id();
        assert!(b > a);
    }

    #[test]
    fn separate_runtimes_do_not_share_counters() {
        let a = Runtime::new();
        let b = Runtime::new();
        assert_eq!(a.next_element_id(), 0);
        assert_eq!(b.next_element_id(), 0);
    }
}
