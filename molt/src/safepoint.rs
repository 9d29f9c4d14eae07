use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared safepoint bookkeeping for one isolate.
///
/// Cloning shares the same state, so RAII scopes can hold their own handle
/// while the isolate is mutated through a separate borrow.
#[derive(Clone, Default)]
pub struct SafepointState(Arc<SafepointInner>);

#[derive(Default)]
struct SafepointInner {
    in_operation: AtomicBool,
    no_safepoint_depth: AtomicUsize,
    heap_iteration_depth: AtomicUsize,
}

impl SafepointState {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn in_operation(&self) -> bool {
        self.0.in_operation.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn no_safepoint_depth(&self) -> usize {
        self.0.no_safepoint_depth.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn heap_iteration_depth(&self) -> usize {
        self.0.heap_iteration_depth.load(Ordering::Relaxed)
    }
}

/// Stop-the-world scope: while held, the holder is the sole writer of the
/// heap, the class table and every code/IC structure. Not reentrant.
pub struct SafepointOperationScope {
    state: SafepointState,
}

impl SafepointOperationScope {
    pub fn enter(state: SafepointState) -> Self {
        let was = state.0.in_operation.swap(true, Ordering::AcqRel);
        assert!(!was, "nested safepoint operation");
        Self { state }
    }
}

impl Drop for SafepointOperationScope {
    fn drop(&mut self) {
        self.state.0.in_operation.store(false, Ordering::Release);
    }
}

/// While held, no allocation (and hence no safepoint check) may occur.
pub struct NoSafepointScope {
    state: SafepointState,
}

impl NoSafepointScope {
    pub fn enter(state: SafepointState) -> Self {
        state.0.no_safepoint_depth.fetch_add(1, Ordering::Relaxed);
        Self { state }
    }
}

impl Drop for NoSafepointScope {
    fn drop(&mut self) {
        self.state.0.no_safepoint_depth.fetch_sub(1, Ordering::Relaxed);
    }
}

/// While held, heap iteration is in progress and the object graph must not
/// grow.
pub struct HeapIterationScope {
    state: SafepointState,
}

impl HeapIterationScope {
    pub fn enter(state: SafepointState) -> Self {
        state.0.heap_iteration_depth.fetch_add(1, Ordering::Relaxed);
        Self { state }
    }
}

impl Drop for HeapIterationScope {
    fn drop(&mut self) {
        self.state.0.heap_iteration_depth.fetch_sub(1, Ordering::Relaxed);
    }
}
