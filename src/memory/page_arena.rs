use super::page::{PAGE_SIZE, Page, PageError};
use super::page_allocator::PageAllocator;
use super::vm::{PlatformVmOps, VmOps};
use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::NonNull;

struct ArenaPage {
    page: Page,
    used: usize,
}

/// Paged linear allocator drawing whole pages from a [`PageAllocator`].
///
/// Objects are bump-allocated and never straddle a page boundary. Pages are
/// kept across [`reset`](Self::reset) and go back to the allocator on drop.
pub struct PageArena<'a, V: VmOps = PlatformVmOps, A: GlobalAlloc = System> {
    allocator: &'a PageAllocator<V, A>,
    pages: Vec<ArenaPage>,
    current: usize,
    cursor: usize,
}

impl<'a, V: VmOps, A: GlobalAlloc> PageArena<'a, V, A> {
    #[must_use]
    pub fn new(allocator: &'a PageAllocator<V, A>) -> Self {
        Self {
            allocator,
            pages: Vec::new(),
            current: 0,
            cursor: 0,
        }
    }

    fn add_page(&mut self) -> Result<(), PageError> {
        let page = self.allocator.allocate()?;
        self.pages.push(ArenaPage { page, used: 0 });
        Ok(())
    }

    /// Copy `val` into the arena.
    ///
    /// The returned pointer stays valid until the arena is reset or dropped.
    ///
    /// # Errors
    ///
    /// Returns `PageError::ObjectTooLarge` if `T` cannot fit in one page, or
    /// the allocator's error if a new page is needed and cannot be mapped.
    pub fn push<T: Copy>(&mut self, val: T) -> Result<*mut T, PageError> {
        let layout = Layout::new::<T>();
        let (size, align) = (layout.size(), layout.align());

        // Pages are PAGE_SIZE-aligned, so any align up to PAGE_SIZE is
        // satisfiable by aligning the in-page offset.
        if size > PAGE_SIZE || align > PAGE_SIZE {
            return Err(PageError::ObjectTooLarge {
                size: size.max(align),
                page_size: PAGE_SIZE,
            });
        }

        if size == 0 {
            return Ok(NonNull::<T>::dangling().as_ptr());
        }

        loop {
            if self.current >= self.pages.len() {
                self.add_page()?;
            }

            let start = self.cursor.next_multiple_of(align);
            if start + size <= PAGE_SIZE {
                let slot = &mut self.pages[self.current];
                self.cursor = start + size;
                slot.used = slot.used.max(self.cursor);

                // Safety: start + size <= PAGE_SIZE and the page base is
                // PAGE_SIZE-aligned, so the slot is in bounds and aligned.
                let ptr = unsafe { slot.page.as_ptr().add(start) }.cast::<T>();
                // Safety: as above; the arena owns the page exclusively.
                unsafe { ptr.write(val) };
                return Ok(ptr);
            }

            self.current += 1;
            self.cursor = 0;
        }
    }

    /// Rewind to the first page. Pages are retained; previously returned
    /// pointers must no longer be used.
    pub fn reset(&mut self) {
        self.current = 0;
        self.cursor = 0;
        for slot in &mut self.pages {
            slot.used = 0;
        }
    }

    /// Pages held, including ones retained across [`reset`](Self::reset).
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Used prefix `&page[..used]` of each page written since the last reset.
    ///
    /// Alignment padding between objects is included; object boundaries are
    /// not recorded.
    pub fn iter_pages(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.pages
            .iter()
            .take(self.current + 1)
            .filter(|slot| slot.used > 0)
            .map(|slot| &slot.page.as_bytes()[..slot.used])
    }
}

impl<V: VmOps, A: GlobalAlloc> Drop for PageArena<'_, V, A> {
    fn drop(&mut self) {
        for slot in self.pages.drain(..) {
            // Safety: every page was allocated from self.allocator.
            unsafe { self.allocator.deallocate(slot.page) };
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::page_allocator::PageAllocatorConfig;
    use crate::memory::test_support::CountingVm;

    fn counting() -> PageAllocator<CountingVm> {
        CountingVm::reset();
        PageAllocator::with_vm_ops(PageAllocatorConfig::default(), System).unwrap()
    }

    #[test]
    fn test_push_and_read_back() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = PageAllocator::new(System).unwrap();
        let mut arena = PageArena::new(&alloc);

        let p1 = arena.push(42u32).unwrap();
        let p2 = arena.push(123u64).unwrap();
        // Safety: Test code.
        unsafe {
            assert_eq!(*p1, 42);
            assert_eq!(*p2, 123);
        }
        assert_eq!(arena.page_count(), 1);
        assert_eq!(alloc.allocated_count(), 1);
    }

    #[test]
    fn test_alignment() {
        #[derive(Clone, Copy)]
        #[repr(align(256))]
        struct Aligned(#[allow(dead_code)] u8);

        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = counting();
        let mut arena = PageArena::new(&alloc);

        let p1 = arena.push(1u8).unwrap();
        let p2 = arena.push(1u32).unwrap();
        let p3 = arena.push(1u64).unwrap();
        let p4 = arena.push(Aligned(7)).unwrap();

        assert_eq!(p1 as usize % std::mem::align_of::<u8>(), 0);
        assert_eq!(p2 as usize % std::mem::align_of::<u32>(), 0);
        assert_eq!(p3 as usize % std::mem::align_of::<u64>(), 0);
        assert_eq!(p4 as usize % 256, 0);
    }

    #[test]
    fn test_rejects_oversized_types() {
        #[derive(Clone, Copy)]
        #[repr(align(131072))]
        struct HugeAlign(#[allow(dead_code)] u8);

        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = counting();
        let mut arena = PageArena::new(&alloc);

        match arena.push(HugeAlign(1)) {
            Err(PageError::ObjectTooLarge { size, page_size }) => {
                assert_eq!(page_size, PAGE_SIZE);
                assert_eq!(size, std::mem::align_of::<HugeAlign>());
            }
            other => panic!("expected ObjectTooLarge, got {other:?}"),
        }

        let huge = [0u8; PAGE_SIZE + 1];
        assert!(matches!(arena.push(huge), Err(PageError::ObjectTooLarge { .. })));
        assert_eq!(arena.page_count(), 0, "rejected pushes must not take pages");
    }

    #[test]
    fn test_objects_never_straddle_pages() {
        #[derive(Clone, Copy)]
        struct Block([u8; 40 * 1024]);

        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = counting();
        let mut arena = PageArena::new(&alloc);

        let a = arena.push(Block([1; 40 * 1024])).unwrap();
        let b = arena.push(Block([2; 40 * 1024])).unwrap();
        assert_eq!(arena.page_count(), 2);
        assert_eq!(a as usize % PAGE_SIZE, 0);
        assert_eq!(b as usize % PAGE_SIZE, 0);

        let chunks: Vec<_> = arena.iter_pages().collect();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].iter().all(|&x| x == 1));
        assert!(chunks[1].iter().all(|&x| x == 2));
    }

    #[test]
    fn test_full_page_object() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = counting();
        let mut arena = PageArena::new(&alloc);

        arena.push(1u8).unwrap();
        arena.push([9u8; PAGE_SIZE]).unwrap();
        assert_eq!(arena.page_count(), 2);
        assert_eq!(arena.iter_pages().map(<[u8]>::len).collect::<Vec<_>>(), [1, PAGE_SIZE]);
    }

    #[test]
    fn test_reset_reuses_pages() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = counting();
        let mut arena = PageArena::new(&alloc);

        let p1 = arena.push(123u64).unwrap() as usize;
        arena.push([0u8; PAGE_SIZE]).unwrap();
        assert_eq!(arena.page_count(), 2);

        arena.reset();
        assert_eq!(arena.iter_pages().count(), 0);

        let p2 = arena.push(456u64).unwrap();
        assert_eq!(p2 as usize, p1);
        // Safety: Test code.
        unsafe { assert_eq!(*p2, 456) };

        arena.push([0u8; PAGE_SIZE]).unwrap();
        assert_eq!(arena.page_count(), 2);
        assert_eq!(CountingVm::reserves(), 2);
    }

    #[test]
    fn test_drop_returns_pages_to_allocator() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = counting();
        {
            let mut arena = PageArena::new(&alloc);
            for _ in 0..3 {
                arena.push([0u8; PAGE_SIZE]).unwrap();
            }
            assert_eq!(alloc.allocated_count(), 3);
        }
        assert_eq!(alloc.allocated_count(), 0);
        assert_eq!(alloc.primary_len(), 3);

        // A second arena is served from the cache.
        let mut arena = PageArena::new(&alloc);
        arena.push(1u8).unwrap();
        assert_eq!(CountingVm::reserves(), 3);
    }

    #[test]
    fn test_iter_pages() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = counting();
        let mut arena = PageArena::new(&alloc);
        assert_eq!(arena.iter_pages().count(), 0);

        arena.push(1u8).unwrap();
        arena.push(2u32).unwrap();

        let chunks: Vec<_> = arena.iter_pages().collect();
        assert_eq!(chunks.len(), 1);
        // u8 at 0, three bytes of padding, u32 at 4.
        assert_eq!(chunks[0].len(), 8);
        assert_eq!(chunks[0][0], 1);
        assert_eq!(&chunks[0][4..8], &2u32.to_ne_bytes());
    }

    #[test]
    fn test_zst() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = counting();
        let mut arena = PageArena::new(&alloc);

        let p = arena.push(()).unwrap();
        // Safety: Test code.
        unsafe { assert_eq!(*p, ()) };
        arena.push([0u64; 0]).unwrap();
        assert_eq!(arena.iter_pages().count(), 0);
        assert_eq!(arena.page_count(), 0, "zero-sized pushes must not take pages");
        assert_eq!(alloc.allocated_count(), 0);
        assert_eq!(CountingVm::reserves(), 0);
    }

    #[test]
    fn test_allocation_failure_propagates() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = counting();
        let mut arena = PageArena::new(&alloc);
        CountingVm::fail_reserve(true);

        assert!(matches!(arena.push(1u8), Err(PageError::Vm(_))));
        assert_eq!(arena.page_count(), 0);

        CountingVm::fail_reserve(false);
        arena.push(1u8).unwrap();
        assert_eq!(arena.page_count(), 1);
    }
}
