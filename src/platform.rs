//! OS virtual memory provider, in whole pages.
//!
//! Wraps the platform's mapping primitive (mmap on Unix, VirtualAlloc on
//! Windows, a std::alloc shim under Miri). Exhaustion is fatal: the
//! allocator has no recovery path once the OS refuses memory, so
//! `sys_alloc` panics rather than returning null.
//!
//! Mapped/unmapped page counters are kept unconditionally so tests can
//! observe exactly how many pages a scenario cost.

use crate::config::{PAGE_SHIFT, PAGE_SIZE};
use core::sync::atomic::{AtomicUsize, Ordering};

cfg_if::cfg_if! {
    if #[cfg(miri)] {
        mod miri;
        use self::miri as imp;
    } else if #[cfg(windows)] {
        mod windows;
        use self::windows as imp;
    } else if #[cfg(unix)] {
        mod unix;
        use self::unix as imp;
    }
}

static PAGES_MAPPED: AtomicUsize = AtomicUsize::new(0);
static PAGES_UNMAPPED: AtomicUsize = AtomicUsize::new(0);

/// Map `npages` pages of zero-initialized, page-aligned memory.
///
/// Never returns null; panics if the OS cannot satisfy the request.
pub fn sys_alloc(npages: usize) -> *mut u8 {
    assert!(npages > 0);
    let ptr = unsafe { imp::map(npages << PAGE_SHIFT) };
    if ptr.is_null() {
        panic!("virtual memory exhausted: failed to map {} pages", npages);
    }
    debug_assert_eq!(ptr as usize & (PAGE_SIZE - 1), 0);
    PAGES_MAPPED.fetch_add(npages, Ordering::Relaxed);
    ptr
}

/// Return `npages` pages starting at `ptr` to the OS.
///
/// # Safety
///
/// `ptr` must be the start of a region previously obtained from
/// [`sys_alloc`], and `npages` must match the mapped length.
pub unsafe fn sys_free(ptr: *mut u8, npages: usize) {
    unsafe { imp::unmap(ptr, npages << PAGE_SHIFT) };
    PAGES_UNMAPPED.fetch_add(npages, Ordering::Relaxed);
}

/// Pages handed out and taken back by the OS so far: `(mapped, unmapped)`.
pub fn vm_stats() -> (usize, usize) {
    (
        PAGES_MAPPED.load(Ordering::Relaxed),
        PAGES_UNMAPPED.load(Ordering::Relaxed),
    )
}
