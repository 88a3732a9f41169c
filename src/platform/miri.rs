//! Miri backend: std::alloc as a page provider.
//!
//! Miri cannot execute real mapping syscalls, so page-aligned memory comes
//! from the system allocator instead. This keeps the rest of the unsafe
//! pointer logic checkable under Miri.

extern crate alloc;

use core::alloc::Layout;

pub unsafe fn map(bytes: usize) -> *mut u8 {
    let layout = Layout::from_size_align(bytes, crate::config::PAGE_SIZE).unwrap();
    unsafe { alloc::alloc::alloc_zeroed(layout) }
}

pub unsafe fn unmap(ptr: *mut u8, bytes: usize) {
    let layout = Layout::from_size_align(bytes, crate::config::PAGE_SIZE).unwrap();
    unsafe { alloc::alloc::dealloc(ptr, layout) };
}
