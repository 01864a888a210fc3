//! Test doubles shared by the unit tests.

use super::page::PAGE_SIZE;
use super::vm::{VmError, VmOps};
use crate::sync::Arc;
use crate::sync::atomic::{AtomicUsize, Ordering};
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::io;
use std::ptr::NonNull;

#[derive(Default)]
pub(crate) struct AllocCounts {
    allocs: AtomicUsize,
    reallocs: AtomicUsize,
    deallocs: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl AllocCounts {
    pub fn allocs(&self) -> usize {
        self.allocs.load(Ordering::Relaxed)
    }

    pub fn reallocs(&self) -> usize {
        self.reallocs.load(Ordering::Relaxed)
    }

    pub fn deallocs(&self) -> usize {
        self.deallocs.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }
}

/// `System` with call counters, for checking what the fallback allocator backs.
#[derive(Default)]
pub(crate) struct CountingAlloc {
    counts: Arc<AllocCounts>,
}

impl CountingAlloc {
    pub fn counts(&self) -> Arc<AllocCounts> {
        self.counts.clone()
    }
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.counts.allocs.fetch_add(1, Ordering::Relaxed);
        self.counts.live_bytes.fetch_add(layout.size(), Ordering::Relaxed);
        // Safety: forwarded contract.
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.counts.deallocs.fetch_add(1, Ordering::Relaxed);
        self.counts.live_bytes.fetch_sub(layout.size(), Ordering::Relaxed);
        // Safety: forwarded contract.
        unsafe { System.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.counts.reallocs.fetch_add(1, Ordering::Relaxed);
        self.counts.live_bytes.fetch_sub(layout.size(), Ordering::Relaxed);
        self.counts.live_bytes.fetch_add(new_size, Ordering::Relaxed);
        // Safety: forwarded contract.
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

thread_local! {
    static VM_PAGE_SIZE: Cell<usize> = const { Cell::new(4096) };
    static VM_FAIL_RESERVE: Cell<bool> = const { Cell::new(false) };
    static VM_FAIL_COMMIT: Cell<bool> = const { Cell::new(false) };
    static VM_RESERVES: Cell<usize> = const { Cell::new(0) };
    static VM_COMMITS: Cell<usize> = const { Cell::new(0) };
    static VM_RELEASES: Cell<usize> = const { Cell::new(0) };
    static VM_LIVE: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

/// Heap-backed [`VmOps`] that records every call on the current thread.
///
/// Counters are thread-local: a test must create, use and drop its allocator
/// on one thread, and call [`CountingVm::reset`] first.
pub(crate) struct CountingVm;

impl CountingVm {
    pub fn reset() {
        VM_PAGE_SIZE.set(4096);
        VM_FAIL_RESERVE.set(false);
        VM_FAIL_COMMIT.set(false);
        VM_RESERVES.set(0);
        VM_COMMITS.set(0);
        VM_RELEASES.set(0);
        VM_LIVE.with_borrow_mut(HashSet::clear);
    }

    pub fn set_page_size(size: usize) {
        VM_PAGE_SIZE.set(size);
    }

    pub fn fail_reserve(fail: bool) {
        VM_FAIL_RESERVE.set(fail);
    }

    pub fn fail_commit(fail: bool) {
        VM_FAIL_COMMIT.set(fail);
    }

    pub fn reserves() -> usize {
        VM_RESERVES.get()
    }

    pub fn commits() -> usize {
        VM_COMMITS.get()
    }

    pub fn releases() -> usize {
        VM_RELEASES.get()
    }

    /// Addresses reserved and not yet released.
    pub fn live() -> HashSet<usize> {
        VM_LIVE.with_borrow(Clone::clone)
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, PAGE_SIZE).unwrap()
    }
}

impl VmOps for CountingVm {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if VM_FAIL_RESERVE.get() {
            return Err(VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "injected reservation failure",
            )));
        }
        // Safety: Test code; size is non-zero for every caller.
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(Self::layout(size)) }).unwrap();
        VM_RESERVES.set(VM_RESERVES.get() + 1);
        VM_LIVE.with_borrow_mut(|live| live.insert(ptr.as_ptr() as usize));
        Ok(ptr)
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        if VM_FAIL_COMMIT.get() {
            return Err(VmError::CommitFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "injected commit failure",
            )));
        }
        VM_COMMITS.set(VM_COMMITS.get() + 1);
        Ok(())
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let known = VM_LIVE.with_borrow_mut(|live| live.remove(&(ptr.as_ptr() as usize)));
        assert!(known, "release of unknown or already released region {ptr:p}");
        VM_RELEASES.set(VM_RELEASES.get() + 1);
        // Safety: allocated by `reserve` with the same layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), Self::layout(size)) };
        Ok(())
    }

    fn page_size() -> usize {
        VM_PAGE_SIZE.get()
    }

    fn allocation_granularity() -> usize {
        PAGE_SIZE
    }
}
