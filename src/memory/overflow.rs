use std::alloc::{GlobalAlloc, Layout};
use std::ptr::NonNull;

/// Growable LIFO of free page addresses, stored in memory obtained from the
/// fallback allocator `A`. Never touches page contents.
///
/// Not synchronized; the page allocator keeps it behind its mutex.
pub(crate) struct OverflowList<A: GlobalAlloc> {
    buf: NonNull<NonNull<u8>>,
    cap: usize,
    len: usize,
    alloc: A,
}

// Safety: OverflowList owns its buffer; the stored pointers are plain
// addresses of free pages and carry no thread affinity.
unsafe impl<A: GlobalAlloc + Send> Send for OverflowList<A> {}

impl<A: GlobalAlloc> OverflowList<A> {
    const MIN_GROWTH: usize = 4;

    /// Create a list, pre-allocating `capacity` slots from `alloc`.
    pub fn with_capacity(alloc: A, capacity: usize) -> Self {
        let mut list = Self {
            buf: NonNull::dangling(),
            cap: 0,
            len: 0,
            alloc,
        };
        if capacity > 0 {
            list.grow_to(capacity);
        }
        list
    }

    fn layout(cap: usize) -> Layout {
        match Layout::array::<NonNull<u8>>(cap) {
            Ok(layout) => layout,
            Err(_) => panic!("OverflowList capacity overflow ({cap} slots)"),
        }
    }

    fn grow_to(&mut self, new_cap: usize) {
        debug_assert!(new_cap > self.cap);
        let new_layout = Self::layout(new_cap);

        let raw = if self.cap == 0 {
            // Safety: new_layout has non-zero size (new_cap > 0).
            unsafe { self.alloc.alloc(new_layout) }
        } else {
            // Safety: buf was allocated by self.alloc with layout(self.cap);
            // the new size is non-zero and does not overflow isize (checked by Layout).
            unsafe {
                self.alloc.realloc(
                    self.buf.as_ptr().cast::<u8>(),
                    Self::layout(self.cap),
                    new_layout.size(),
                )
            }
        };

        // Out of memory while caching a page: no smaller unit to fall back on.
        let Some(buf) = NonNull::new(raw.cast::<NonNull<u8>>()) else {
            std::alloc::handle_alloc_error(new_layout)
        };
        self.buf = buf;
        self.cap = new_cap;
    }

    pub fn push(&mut self, page: NonNull<u8>) {
        if self.len == self.cap {
            let new_cap = self
                .cap
                .checked_mul(2)
                .unwrap_or(usize::MAX)
                .max(Self::MIN_GROWTH);
            self.grow_to(new_cap);
        }
        // Safety: len < cap after the growth above.
        unsafe { self.buf.as_ptr().add(self.len).write(page) };
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        // Safety: slot `len` was initialised by push and is within cap.
        Some(unsafe { self.buf.as_ptr().add(self.len).read() })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }
}

impl<A: GlobalAlloc> Drop for OverflowList<A> {
    fn drop(&mut self) {
        // Pages still listed here are the page allocator's to release; only
        // the address buffer is ours.
        if self.cap > 0 {
            // Safety: buf was allocated by self.alloc with layout(self.cap).
            unsafe {
                self.alloc
                    .dealloc(self.buf.as_ptr().cast::<u8>(), Self::layout(self.cap));
            }
        }
    }
}
