use std::io;
use std::ptr::NonNull;
use thiserror::Error;

/// Failure of an OS virtual-memory call. Carries the OS error.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] io::Error),
    #[error("VM commit failed: {0}")]
    CommitFailed(#[source] io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] io::Error),
}

/// Abstract interface for virtual memory operations.
///
/// All methods are associated functions: an implementation is a zero-sized
/// marker type naming a platform, not an object with state.
pub trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    ///
    /// # Safety
    /// The returned range must eventually be handed back to [`release`](Self::release)
    /// with the same (or a covering set of) sizes.
    ///
    /// # Errors
    /// `VmError::ReservationFailed` if the OS refuses the reservation.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    ///
    /// # Safety
    /// `ptr..ptr + size` must lie inside a live reservation.
    ///
    /// # Errors
    /// `VmError::CommitFailed` if the OS cannot back the range.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    ///
    /// # Safety
    /// `ptr..ptr + size` must be reserved and no longer referenced.
    ///
    /// # Errors
    /// `VmError::ReleaseFailed` if the OS rejects the range.
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;

    /// Alignment the OS guarantees for the base of a fresh reservation.
    /// Equal to [`page_size`](Self::page_size) on Unix; 64KB on Windows.
    fn allocation_granularity() -> usize {
        Self::page_size()
    }

    /// Reserve `size` bytes whose base is aligned to `align`.
    ///
    /// When `align` exceeds [`allocation_granularity`](Self::allocation_granularity)
    /// this over-reserves by `align - page_size` and releases the unaligned
    /// head and tail. Platforms that cannot release part of a reservation
    /// must override it.
    ///
    /// # Safety
    /// Same contract as [`reserve`](Self::reserve). `size` must be a multiple
    /// of the page size and `align` a power of two.
    ///
    /// # Errors
    /// `VmError::ReservationFailed` on OS refusal or size overflow;
    /// `VmError::ReleaseFailed` if trimming the padding fails.
    unsafe fn reserve_aligned(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        debug_assert!(
            align.is_power_of_two(),
            "reserve_aligned: align ({align}) must be a power of two"
        );
        debug_assert!(
            size.is_multiple_of(Self::page_size()),
            "reserve_aligned: size ({size}) must be a multiple of the page size"
        );

        if align <= Self::allocation_granularity() {
            // Safety: forwarded contract.
            return unsafe { Self::reserve(size) };
        }

        let padded = size.checked_add(align - Self::page_size()).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "aligned reservation size overflow",
            ))
        })?;
        // Safety: forwarded contract; the padding is trimmed below.
        let raw = unsafe { Self::reserve(padded)? };

        let head = (raw.as_ptr() as usize).next_multiple_of(align) - raw.as_ptr() as usize;
        let tail = padded - head - size;

        // Safety: head and tail are page-aligned sub-ranges of `raw..raw + padded`,
        // and `head + size <= padded`. On a failed trim whatever is still
        // reserved goes back before the error is returned.
        unsafe {
            let aligned = NonNull::new_unchecked(raw.as_ptr().add(head));
            if head > 0
                && let Err(e) = Self::release(raw, head)
            {
                drop(Self::release(raw, padded));
                return Err(e);
            }
            if tail > 0
                && let Err(e) = Self::release(NonNull::new_unchecked(aligned.as_ptr().add(size)), tail)
            {
                drop(Self::release(aligned, size + tail));
                return Err(e);
            }
            Ok(aligned)
        }
    }
}

/// [`VmOps`] for the host OS.
pub struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            // Safety: FFI call to madvise.
            unsafe {
                // A page is committed only when a caller is about to use it,
                // so ask for physical backing up front.
                libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_WILLNEED);
            }

            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // SAFETY/PORTABILITY: this crate supports only 64-bit targets; page size fits in
                // usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

#[cfg(all(windows, not(any(loom, miri))))]
mod windows {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::ffi::c_void;
    use std::io;

    const MEM_COMMIT: u32 = 0x0000_1000;
    const MEM_RESERVE: u32 = 0x0000_2000;
    const MEM_RELEASE: u32 = 0x0000_8000;
    const PAGE_NOACCESS: u32 = 0x01;
    const PAGE_READWRITE: u32 = 0x04;

    #[repr(C)]
    #[allow(non_snake_case)]
    struct SYSTEM_INFO {
        wProcessorArchitecture: u16,
        wReserved: u16,
        dwPageSize: u32,
        lpMinimumApplicationAddress: *mut c_void,
        lpMaximumApplicationAddress: *mut c_void,
        dwActiveProcessorMask: usize,
        dwNumberOfProcessors: u32,
        dwProcessorType: u32,
        dwAllocationGranularity: u32,
        wProcessorLevel: u16,
        wProcessorRevision: u16,
    }

    #[link(name = "kernel32")]
    unsafe extern "system" {
        fn VirtualAlloc(address: *mut c_void, size: usize, kind: u32, protect: u32) -> *mut c_void;
        fn VirtualFree(address: *mut c_void, size: usize, kind: u32) -> i32;
        fn GetSystemInfo(info: *mut SYSTEM_INFO);
    }

    fn system_info() -> &'static (usize, usize) {
        use crate::sync::OnceLock;
        static CACHED: OnceLock<(usize, usize)> = OnceLock::new();
        CACHED.get_or_init(|| {
            // Safety: SYSTEM_INFO is plain data; GetSystemInfo fills every field.
            unsafe {
                let mut info: SYSTEM_INFO = std::mem::zeroed();
                GetSystemInfo(&raw mut info);
                (info.dwPageSize as usize, info.dwAllocationGranularity as usize)
            }
        })
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe { VirtualAlloc(std::ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::last_os_error())),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to VirtualAlloc.
            let result =
                unsafe { VirtualAlloc(ptr.as_ptr().cast::<c_void>(), size, MEM_COMMIT, PAGE_READWRITE) };

            if result.is_null() {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            // VirtualFree with MEM_RELEASE must have size 0 and the base address of the region.
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(ptr.as_ptr().cast::<c_void>(), 0, MEM_RELEASE) } == 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            system_info().0
        }

        fn allocation_granularity() -> usize {
            system_info().1
        }

        unsafe fn reserve_aligned(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
            // MEM_RELEASE cannot split a reservation, so padding cannot be trimmed.
            if align > Self::allocation_granularity() {
                return Err(VmError::ReservationFailed(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!(
                        "alignment {align} exceeds allocation granularity {}",
                        Self::allocation_granularity()
                    ),
                )));
            }
            // Safety: forwarded contract.
            unsafe { Self::reserve(size) }
        }
    }
}

// ---------------------------------------------------------------------------
// Loom / Miri mock: heap-backed VmOps (no real mmap/VirtualAlloc)
//
// Under `cfg(loom)` we cannot issue real VM syscalls: loom runs inside a
// single OS process with its own scheduler. Every "reservation" is a plain
// heap block aligned to HEAP_VM_ALIGN, so page-aligned reservations never
// need trimming. `commit` is a no-op; `release` frees the heap block.
//
// This is sufficient for testing the synchronization logic of the page
// cache (loom) and detecting undefined behaviour in unsafe pointer code
// (Miri).
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
const HEAP_VM_ALIGN: usize = 64 * 1024;

#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, HEAP_VM_ALIGN)
            .map_err(|e| VmError::ReservationFailed(io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, HEAP_VM_ALIGN)
            .map_err(|e| VmError::ReleaseFailed(io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }

    fn allocation_granularity() -> usize {
        HEAP_VM_ALIGN
    }
}
