use super::vm::VmError;
use std::fmt;
use std::ptr::NonNull;
use thiserror::Error;

/// Size and alignment of every page handed out by [`PageAllocator`](super::page_allocator::PageAllocator).
///
/// 64KB is a multiple of every base page size we run on (4KB, 16KB on Apple
/// Silicon) and equals the Windows allocation granularity.
pub const PAGE_SIZE: usize = 64 * 1024;

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(PAGE_SIZE >= std::mem::size_of::<usize>());

#[derive(Debug, Error)]
pub enum PageError {
    /// `PAGE_SIZE` is not a multiple of the OS page alignment. Fixed for the
    /// platform; the allocator cannot be used.
    #[error("page size {page_size} is not a multiple of the OS page alignment {os_alignment}")]
    UnsupportedPageSize { page_size: usize, os_alignment: usize },

    #[error("invalid page allocator config: {0}")]
    InvalidConfig(&'static str),

    /// Pages were still handed out when the allocator was torn down.
    #[error("page allocator torn down with {outstanding} outstanding page(s)")]
    Leaked { outstanding: usize },

    #[error("Object too large for page: size {size} exceeds page size {page_size}")]
    ObjectTooLarge { size: usize, page_size: usize },

    #[error(transparent)]
    Vm(#[from] VmError),
}

/// An owned, committed, `PAGE_SIZE`-aligned page of `PAGE_SIZE` bytes.
///
/// Move-only: returning it to the allocator consumes it, so a page cannot be
/// deallocated twice from safe code. Dropping the handle does not return the
/// page; it is reported as outstanding at teardown.
#[must_use = "a dropped Page is never returned to its allocator"]
pub struct Page(NonNull<u8>);

// Safety: a Page is exclusive ownership of a committed memory region; nothing
// else references it while the handle is alive.
unsafe impl Send for Page {}
// Safety: shared access only hands out `&[u8]`.
unsafe impl Sync for Page {}

impl Page {
    /// Re-wrap a pointer obtained from [`Page::into_raw`].
    ///
    /// # Safety
    /// `ptr` must come from `into_raw` on a page that has not been wrapped
    /// again or deallocated since.
    #[inline]
    #[must_use]
    pub unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
        debug_assert!(
            (ptr.as_ptr() as usize).is_multiple_of(PAGE_SIZE),
            "Page::from_raw: {ptr:p} is not page-aligned"
        );
        Self(ptr)
    }

    /// Give up the handle without returning the page.
    #[inline]
    #[must_use]
    pub fn into_raw(self) -> NonNull<u8> {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    #[inline]
    #[must_use]
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        // Safety: the page is committed, PAGE_SIZE long, and owned by self.
        // Committed memory is always initialised (zero-filled or old bytes).
        unsafe { std::slice::from_raw_parts(self.0.as_ptr(), PAGE_SIZE) }
    }

    #[inline]
    #[must_use]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // Safety: as above, and &mut self makes the access exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.0.as_ptr(), PAGE_SIZE) }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({:p})", self.0)
    }
}
