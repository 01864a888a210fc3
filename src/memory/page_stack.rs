// ----------------------------------------------------------------------------
// PageStack: bounded lock-free stack of free pages (ABA-safe)
// ----------------------------------------------------------------------------

use crate::sync::atomic::{AtomicU128, AtomicU32, AtomicUsize, Ordering};
use crate::sync::hint;
use std::ptr::NonNull;

/// 128-bit tagged pointer for ABA-safe Treiber stack operations.
///
/// Packed into a single `u128` for double-width compare-and-swap (DWCAS):
///
/// ```text
///   bits [127:64]  generation counter  (64 bits)
///   bits [63:0]    pointer             (64 bits, full virtual address)
/// ```
///
/// Even generations are stable heads. An odd generation means a popper has
/// pinned the current top page and is reading its link; everybody else spins
/// until it is committed back to an even value. Every transition bumps the
/// generation, so a CAS against a stale head always fails even if the same
/// page address was popped and pushed back in between.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct TaggedPtr(u128);

impl TaggedPtr {
    const NULL: Self = Self(0);

    #[inline]
    fn new(ptr: *mut u8, generation: u64) -> Self {
        Self(u128::from(generation) << 64 | (ptr as usize as u128))
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn ptr(self) -> *mut u8 {
        // Lower 64 bits hold the full virtual address.
        (self.0 as usize) as *mut u8
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn generation(self) -> u64 {
        (self.0 >> 64) as u64
    }

    #[inline]
    fn is_null(self) -> bool {
        self.ptr().is_null()
    }

    #[inline]
    fn is_pinned(self) -> bool {
        !self.generation().is_multiple_of(2)
    }
}

impl std::fmt::Debug for TaggedPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaggedPtr({:p}, gen={})", self.ptr(), self.generation())
    }
}

/// RAII guard that unpins the head if a pop is abandoned mid-flight.
struct PopReservation<'a> {
    head: &'a AtomicU128,
    old: TaggedPtr,
    committed: bool,
}

impl Drop for PopReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            // We own the pin (odd generation), so a plain store is safe.
            // +2 keeps the generation monotonic and even.
            let restored = TaggedPtr::new(self.old.ptr(), self.old.generation().wrapping_add(2));
            self.head.store(restored.0, Ordering::Release);
        }
    }
}

/// Lock-free LIFO of free pages with a soft capacity bound.
///
/// The link to the next free page lives in the first `usize` of each free
/// page: while a page sits here its contents belong to the stack.
///
/// Push: write link at offset 0 → DWCAS page onto head.
/// Pop: pin head (even → odd) → read link → commit head to link (odd → even).
///
/// Not strictly lock-free: while a popper holds the pin every other push and
/// pop spins, so a popper preempted between pin and commit stalls the stack
/// like a spinlock would. The pinned window is one link load and one CAS.
pub(crate) struct PageStack {
    head: AtomicU128,
    len: AtomicU32,
    capacity: u32,
}

impl PageStack {
    pub fn new(capacity: u32) -> Self {
        Self {
            head: AtomicU128::new(TaggedPtr::NULL.0),
            len: AtomicU32::new(0),
            capacity,
        }
    }

    #[inline]
    fn link(page: *mut u8) -> *mut AtomicUsize {
        let p = page.cast::<AtomicUsize>();
        debug_assert!(
            (p as usize).is_multiple_of(std::mem::align_of::<AtomicUsize>()),
            "page link field is not atomically aligned: {p:p}",
        );
        p
    }

    /// Push a free page. Returns `Err(page)` untouched if the stack is at
    /// capacity; the caller must park it elsewhere.
    ///
    /// # Safety
    /// `page` must be writable for at least `size_of::<usize>()` bytes,
    /// `usize`-aligned, owned by the caller, and not already in the stack.
    pub unsafe fn push(&self, page: NonNull<u8>) -> Result<(), NonNull<u8>> {
        // Optimistically reserve a slot. The count only bounds the cache, so
        // Relaxed is enough.
        let prev_len = self.len.fetch_add(1, Ordering::Relaxed);
        if prev_len >= self.capacity {
            self.len.fetch_sub(1, Ordering::Relaxed);
            return Err(page);
        }

        let new_ptr = page.as_ptr();
        let link = Self::link(new_ptr);
        // Safety: the page is ours and unpublished; nobody can observe the link yet.
        unsafe { link.write(AtomicUsize::new(0)) };

        loop {
            let old = TaggedPtr(self.head.load(Ordering::Acquire));

            if old.is_pinned() {
                hint::spin_loop();
                continue;
            }

            // Safety: link points into our unpublished page (see above).
            unsafe { (*link).store(old.ptr() as usize, Ordering::Relaxed) };

            // Bump generation by 2: even -> even.
            let new = TaggedPtr::new(new_ptr, old.generation().wrapping_add(2));

            if self
                .head
                .compare_exchange_weak(old.0, new.0, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Pop the most recently pushed page, or `None` if empty.
    pub fn pop(&self) -> Option<NonNull<u8>> {
        loop {
            let old = TaggedPtr(self.head.load(Ordering::Acquire));
            if old.is_null() {
                return None;
            }

            if old.is_pinned() {
                hint::spin_loop();
                continue;
            }

            // Step 1: pin the top page (even -> odd). While pinned nobody else
            // can pop it and take ownership, so reading its link is safe.
            let pinned = TaggedPtr::new(old.ptr(), old.generation().wrapping_add(1));
            if self
                .head
                .compare_exchange_weak(old.0, pinned.0, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            let mut guard = PopReservation {
                head: &self.head,
                old,
                committed: false,
            };

            // Step 2: read the link.
            // Safety: old.ptr() is in the stack and pinned by us.
            let next = unsafe { (*Self::link(old.ptr())).load(Ordering::Relaxed) as *mut u8 };

            // Step 3: commit (odd -> even).
            let next_stable = TaggedPtr::new(next, old.generation().wrapping_add(2));
            let res = self.head.compare_exchange(
                pinned.0,
                next_stable.0,
                Ordering::Release,
                Ordering::Relaxed,
            );
            debug_assert!(res.is_ok(), "PageStack::pop pin broken!");

            guard.committed = true;

            self.len.fetch_sub(1, Ordering::Relaxed);
            return NonNull::new(old.ptr());
        }
    }

    /// Approximate number of pages in the stack.
    pub fn len(&self) -> u32 {
        self.len.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}
