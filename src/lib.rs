//! Fixed-size page allocator.
//!
//! [`PageAllocator`] hands out committed, [`PAGE_SIZE`]-aligned pages of
//! [`PAGE_SIZE`] bytes, caches freed pages in a lock-free stack backed by a
//! mutex-guarded overflow list, and returns them to the OS only on teardown.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("qen-pages supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocator
pub use memory::page::{PAGE_SIZE, Page, PageError};
pub use memory::page_allocator::{
    PageAllocator, PageAllocatorConfig, PageAllocatorGuard, TeardownReport,
};

// callers
pub use memory::page_arena::PageArena;

// os/stats
pub use memory::stats::MemoryStats;
pub use memory::vm::{PlatformVmOps, VmError, VmOps};
