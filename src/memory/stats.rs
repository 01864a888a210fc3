//! Process-wide diagnostic counters.
//!
//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., total may briefly disagree with the sum of
//! per-subsystem counters). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    #[must_use]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Total address space reserved by the page allocators
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Total physical memory committed by the page allocators
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}

// Bytes held by page allocators: handed out plus cached
crate::sync::static_atomic! {
    pub static PAGE_ALLOCATOR_COMMITTED: Counter = Counter::new();
}
// Bytes currently handed out to callers
crate::sync::static_atomic! {
    pub static PAGE_ALLOCATOR_LIVE: Counter = Counter::new();
}

/// Point-in-time copy of the global counters, in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub page_allocator_committed: usize,
    pub page_allocator_live: usize,
}

impl MemoryStats {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            total_reserved: TOTAL_RESERVED.get(),
            total_committed: TOTAL_COMMITTED.get(),
            page_allocator_committed: PAGE_ALLOCATOR_COMMITTED.get(),
            page_allocator_live: PAGE_ALLOCATOR_LIVE.get(),
        }
    }

    /// Bytes committed but sitting in a cache rather than with a caller.
    #[must_use]
    pub fn page_allocator_cached(&self) -> usize {
        self.page_allocator_committed.saturating_sub(self.page_allocator_live)
    }
}
