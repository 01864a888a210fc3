//! Fixed-size page allocator with a two-level page cache.
//!
//! Pages are `PAGE_SIZE` bytes, `PAGE_SIZE`-aligned, committed and writable.
//! Freed pages are cached and never returned to the OS until the allocator
//! is torn down:
//!
//! ```text
//! allocate:   primary (lock-free) ──miss──▶ secondary (mutex) ──miss──▶ OS reserve + commit
//! deallocate: primary (lock-free) ──full──▶ secondary (mutex)
//! teardown:   drain primary + secondary ──▶ OS release
//! ```
//!
//! The primary list is a bounded lock-free stack; the secondary list absorbs
//! whatever does not fit and lives behind the allocator mutex, which callers
//! may also hold through [`PageAllocator::lock`] to batch several operations.

use super::overflow::OverflowList;
use super::page::{PAGE_SIZE, Page, PageError};
use super::page_stack::PageStack;
use super::stats;
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Mutex, MutexGuard};
use std::alloc::{GlobalAlloc, System};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::PoisonError;
use tracing::{debug, error, trace, warn};

/// Configuration for `PageAllocator`. All fields have sensible defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageAllocatorConfig {
    /// Max pages in the lock-free primary cache. Further frees go to the
    /// mutex-guarded secondary list. Default: 512.
    pub primary_capacity: u32,

    /// Slots pre-allocated from the fallback allocator for the secondary
    /// list. Default: 0 (allocated on first overflow).
    pub overflow_capacity: usize,
}

impl Default for PageAllocatorConfig {
    fn default() -> Self {
        Self {
            primary_capacity: 512,
            overflow_capacity: 0,
        }
    }
}

/// What teardown returned to the OS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Cached pages released.
    pub released: usize,
    /// Cached pages the OS refused to release (logged, then forgotten).
    pub failed: usize,
}

/// Allocator of fixed-size OS pages with a reuse cache.
///
/// `V` is the OS virtual-memory backend, `A` the fallback allocator that backs
/// the secondary list's own storage (never page contents).
///
/// Dropping the allocator while pages are outstanding panics; use
/// [`shutdown`](Self::shutdown) to get the leak as an error instead.
pub struct PageAllocator<V: VmOps = PlatformVmOps, A: GlobalAlloc = System> {
    primary: PageStack,
    secondary: Mutex<OverflowList<A>>,
    allocated: AtomicUsize,
    reserved: AtomicUsize,
    config: PageAllocatorConfig,
    torn_down: bool,
    _vm: PhantomData<fn() -> V>,
}

impl<A: GlobalAlloc> PageAllocator<PlatformVmOps, A> {
    /// Create an allocator on the host OS with the default config.
    ///
    /// # Errors
    ///
    /// Returns `PageError::UnsupportedPageSize` if the OS page alignment does
    /// not divide `PAGE_SIZE`.
    pub fn new(fallback: A) -> Result<Self, PageError> {
        Self::with_config(PageAllocatorConfig::default(), fallback)
    }

    /// # Errors
    ///
    /// Returns `PageError::UnsupportedPageSize` if the OS page alignment does
    /// not divide `PAGE_SIZE`, `PageError::InvalidConfig` for a zero
    /// `primary_capacity`.
    pub fn with_config(config: PageAllocatorConfig, fallback: A) -> Result<Self, PageError> {
        Self::with_vm_ops(config, fallback)
    }
}

impl<V: VmOps, A: GlobalAlloc> PageAllocator<V, A> {
    /// Create an allocator on an explicit VM backend.
    ///
    /// # Errors
    ///
    /// Same as [`with_config`](PageAllocator::with_config).
    pub fn with_vm_ops(config: PageAllocatorConfig, fallback: A) -> Result<Self, PageError> {
        let os_alignment = V::page_size();
        if os_alignment == 0 || !PAGE_SIZE.is_multiple_of(os_alignment) {
            return Err(PageError::UnsupportedPageSize {
                page_size: PAGE_SIZE,
                os_alignment,
            });
        }
        if config.primary_capacity == 0 {
            return Err(PageError::InvalidConfig("primary_capacity must be non-zero"));
        }

        debug!(
            page_size = PAGE_SIZE,
            os_page_size = os_alignment,
            primary_capacity = config.primary_capacity,
            overflow_capacity = config.overflow_capacity,
            "page allocator created"
        );

        Ok(Self {
            primary: PageStack::new(config.primary_capacity),
            secondary: Mutex::new(OverflowList::with_capacity(fallback, config.overflow_capacity)),
            allocated: AtomicUsize::new(0),
            reserved: AtomicUsize::new(0),
            config,
            torn_down: false,
            _vm: PhantomData,
        })
    }

    /// Allocate a page, taking the allocator mutex if the lock-free cache is
    /// empty.
    ///
    /// # Errors
    ///
    /// Returns `PageError::Vm` if the cache is empty and the OS cannot
    /// reserve or commit a new page. Nothing is counted as allocated then.
    pub fn allocate(&self) -> Result<Page, PageError> {
        self.allocate_with(None)
    }

    /// Return a page to the cache. The page is not released to the OS.
    ///
    /// # Safety
    /// `page` must have been allocated by this allocator. Its contents are
    /// clobbered once returned.
    pub unsafe fn deallocate(&self, page: Page) {
        // Safety: forwarded contract.
        unsafe { self.deallocate_with(None, page) }
    }

    /// Take the allocator mutex. The guard allocates and deallocates without
    /// re-locking, so a batch of operations is atomic with respect to other
    /// threads that reach the secondary list. Released on drop or
    /// [`PageAllocatorGuard::unlock`].
    pub fn lock(&self) -> PageAllocatorGuard<'_, V, A> {
        PageAllocatorGuard {
            allocator: self,
            secondary: self.lock_secondary(),
        }
    }

    /// Pages currently handed out.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Pages obtained from the OS and not yet released.
    #[must_use]
    pub fn reserved_count(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }

    /// Pages in the lock-free cache. Approximate under contention.
    #[must_use]
    pub fn primary_len(&self) -> usize {
        self.primary.len() as usize
    }

    /// Pages in the secondary list. Takes the mutex.
    #[must_use]
    pub fn overflow_len(&self) -> usize {
        self.lock_secondary().len()
    }

    #[must_use]
    pub fn config(&self) -> &PageAllocatorConfig {
        &self.config
    }

    /// Release every cached page and report a leak as an error instead of
    /// panicking.
    ///
    /// Outstanding pages stay mapped: their owners may still be using them.
    ///
    /// # Errors
    ///
    /// Returns `PageError::Leaked` if any page is still allocated.
    pub fn shutdown(mut self) -> Result<TeardownReport, PageError> {
        self.teardown()
    }

    fn lock_secondary(&self) -> MutexGuard<'_, OverflowList<A>> {
        // The list is a plain address stack; a panic elsewhere cannot tear it.
        self.secondary.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `held` is `Some` when the caller already holds the mutex.
    fn allocate_with(&self, held: Option<&mut OverflowList<A>>) -> Result<Page, PageError> {
        // Counted up front: every path below either yields a page or rolls back.
        self.allocated.fetch_add(1, Ordering::Relaxed);
        stats::PAGE_ALLOCATOR_LIVE.add(PAGE_SIZE);

        if let Some(ptr) = self.primary.pop() {
            // Safety: cached pages are committed, PAGE_SIZE-aligned and unowned.
            return Ok(unsafe { Page::from_raw(ptr) });
        }

        let cached = match held {
            Some(secondary) => self.pop_secondary(secondary),
            None => self.pop_secondary(&mut self.lock_secondary()),
        };
        if let Some(ptr) = cached {
            // Safety: as above.
            return Ok(unsafe { Page::from_raw(ptr) });
        }

        trace!(reserved = self.reserved_count(), "page cache empty, reserving from OS");
        self.reserve_page()
    }

    fn pop_secondary(&self, secondary: &mut OverflowList<A>) -> Option<NonNull<u8>> {
        let ptr = secondary.pop();
        if ptr.is_none() {
            // Counted while the list is still held.
            self.reserved.fetch_add(1, Ordering::Relaxed);
        }
        ptr
    }

    fn reserve_page(&self) -> Result<Page, PageError> {
        // Safety: a fresh PAGE_SIZE region, handed straight to the caller.
        match unsafe { Self::map_page() } {
            Ok(ptr) => {
                debug_assert!(
                    (ptr.as_ptr() as usize).is_multiple_of(PAGE_SIZE),
                    "OS returned misaligned page {ptr:p}"
                );
                stats::TOTAL_RESERVED.add(PAGE_SIZE);
                stats::TOTAL_COMMITTED.add(PAGE_SIZE);
                stats::PAGE_ALLOCATOR_COMMITTED.add(PAGE_SIZE);
                // Safety: committed, aligned, exclusively ours.
                Ok(unsafe { Page::from_raw(ptr) })
            }
            Err(e) => {
                self.allocated.fetch_sub(1, Ordering::Relaxed);
                self.reserved.fetch_sub(1, Ordering::Relaxed);
                stats::PAGE_ALLOCATOR_LIVE.sub(PAGE_SIZE);
                warn!(error = %e, "failed to map a new page");
                Err(e.into())
            }
        }
    }

    /// Reserve + commit one page.
    unsafe fn map_page() -> Result<NonNull<u8>, VmError> {
        // Safety: FFI calls to reserve and commit memory.
        unsafe {
            let p = V::reserve_aligned(PAGE_SIZE, PAGE_SIZE)?;
            if let Err(e) = V::commit(p, PAGE_SIZE) {
                drop(V::release(p, PAGE_SIZE));
                return Err(e);
            }
            Ok(p)
        }
    }

    unsafe fn deallocate_with(&self, held: Option<&mut OverflowList<A>>, page: Page) {
        let prev = self.allocated.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "deallocate without a matching allocate");
        stats::PAGE_ALLOCATOR_LIVE.sub(PAGE_SIZE);

        // Safety: the caller hands the page back to us; nobody else uses it.
        if let Err(ptr) = unsafe { self.primary.push(page.into_raw()) } {
            trace!(
                capacity = self.primary.capacity(),
                "primary page cache full, parking page on the overflow list"
            );
            match held {
                Some(secondary) => secondary.push(ptr),
                None => self.lock_secondary().push(ptr),
            }
        }
    }

    fn teardown(&mut self) -> Result<TeardownReport, PageError> {
        self.torn_down = true;
        let outstanding = self.allocated.load(Ordering::Acquire);
        let mut report = TeardownReport::default();

        while let Some(ptr) = self.primary.pop() {
            self.release_cached(ptr, &mut report);
        }
        let overflow_capacity = {
            let mut secondary = self.lock_secondary();
            while let Some(ptr) = secondary.pop() {
                self.release_cached(ptr, &mut report);
            }
            secondary.capacity()
        };

        debug!(
            released = report.released,
            failed = report.failed,
            outstanding,
            overflow_capacity,
            "page allocator torn down"
        );

        if outstanding != 0 {
            error!(outstanding, "page allocator torn down with outstanding pages");
            return Err(PageError::Leaked { outstanding });
        }
        Ok(report)
    }

    fn release_cached(&self, ptr: NonNull<u8>, report: &mut TeardownReport) {
        // Safety: cached pages came from map_page and nobody references them.
        match unsafe { V::release(ptr, PAGE_SIZE) } {
            Ok(()) => {
                report.released += 1;
                self.reserved.fetch_sub(1, Ordering::Relaxed);
                stats::TOTAL_RESERVED.sub(PAGE_SIZE);
                stats::TOTAL_COMMITTED.sub(PAGE_SIZE);
                stats::PAGE_ALLOCATOR_COMMITTED.sub(PAGE_SIZE);
            }
            Err(e) => {
                report.failed += 1;
                warn!(page = ?ptr, error = %e, "failed to release cached page");
            }
        }
    }
}

impl<V: VmOps, A: GlobalAlloc> Drop for PageAllocator<V, A> {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        if let Err(e) = self.teardown() {
            // Outstanding pages are a caller bug. Don't turn an unwind into an abort.
            if !std::thread::panicking() {
                panic!("{e}");
            }
        }
    }
}

impl<V: VmOps, A: GlobalAlloc> fmt::Debug for PageAllocator<V, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageAllocator")
            .field("allocated", &self.allocated_count())
            .field("reserved", &self.reserved_count())
            .field("primary_len", &self.primary_len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Holds the allocator mutex; see [`PageAllocator::lock`].
pub struct PageAllocatorGuard<'a, V: VmOps = PlatformVmOps, A: GlobalAlloc = System> {
    allocator: &'a PageAllocator<V, A>,
    secondary: MutexGuard<'a, OverflowList<A>>,
}

impl<V: VmOps, A: GlobalAlloc> PageAllocatorGuard<'_, V, A> {
    /// [`PageAllocator::allocate`] without re-taking the mutex. On a cache
    /// miss the OS call happens while the mutex is held.
    ///
    /// # Errors
    ///
    /// Same as [`PageAllocator::allocate`].
    pub fn allocate(&mut self) -> Result<Page, PageError> {
        self.allocator.allocate_with(Some(&mut self.secondary))
    }

    /// [`PageAllocator::deallocate`] without re-taking the mutex.
    ///
    /// # Safety
    /// Same as [`PageAllocator::deallocate`].
    pub unsafe fn deallocate(&mut self, page: Page) {
        // Safety: forwarded contract.
        unsafe { self.allocator.deallocate_with(Some(&mut self.secondary), page) }
    }

    #[must_use]
    pub fn overflow_len(&self) -> usize {
        self.secondary.len()
    }

    pub fn unlock(self) {
        drop(self);
    }
}
