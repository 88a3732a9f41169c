//! Top-level allocator: ties the three tiers together.
//!
//! All mutable state lives in module-level statics guarded by spinlocks or
//! atomics; `TriMalloc` itself is zero-sized. Requests up to 256 KiB flow
//! thread cache -> central cache -> page cache; larger ones go straight to
//! the page cache as whole spans.
//!
//! Deallocation never trusts a caller-supplied size: the span's recorded
//! `block_size` says how a pointer was carved (0 means it was handed out
//! as a whole span), so a mismatched layout cannot mis-bucket a block.

use crate::central_cache::CentralCache;
use crate::config::{MAX_SMALL_SIZE, PAGE_SHIFT, PAGE_SIZE};
use crate::page_cache::{self, PageCache};
use crate::pagemap::PageMap;
use crate::size_class;
use crate::span::SpanState;
use crate::sync::SpinMutex;
use crate::{stat_add, stat_inc};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::free_list::FreeObject;
#[cfg(feature = "std")]
use crate::thread_cache::ThreadCache;

pub(crate) static PAGE_MAP: PageMap = PageMap::new();
pub(crate) static PAGE_CACHE: SpinMutex<PageCache> = SpinMutex::new(PageCache::new(&PAGE_MAP));
pub(crate) static CENTRAL_CACHE: CentralCache = CentralCache::new();

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        std::thread_local! {
            // Const-init and no Drop impl: touching this never allocates,
            // so the fast path cannot recurse into the allocator.
            static CACHE: core::cell::UnsafeCell<ThreadCache> = const {
                core::cell::UnsafeCell::new(ThreadCache::new())
            };
        }
    }
}

/// Three-tier thread-caching allocator.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: trimalloc::TriMalloc = trimalloc::TriMalloc;
/// ```
pub struct TriMalloc;

unsafe impl GlobalAlloc for TriMalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }

        stat_inc!(alloc_count);
        stat_add!(alloc_bytes, size as u64);

        let align = layout.align();
        if align <= 8 {
            if size <= MAX_SMALL_SIZE {
                return unsafe { self.alloc_small(size) };
            }
        } else {
            // Class sizes are only 8-aligned; serve an over-aligned request
            // from a class only when that class's size preserves the
            // alignment.
            let effective = size.max(align);
            if effective <= MAX_SMALL_SIZE
                && align <= PAGE_SIZE
                && size_class::round_up(effective) % align == 0
            {
                return unsafe { self.alloc_small(effective) };
            }
        }

        unsafe { self.alloc_large(size, align) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        unsafe { dealloc_impl(ptr) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() && layout.size() > 0 {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if ptr.is_null() || layout.size() == 0 {
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            return unsafe { self.alloc(new_layout) };
        }
        if new_size == 0 {
            unsafe { self.dealloc(ptr, layout) };
            return layout.align() as *mut u8;
        }

        stat_inc!(realloc_count);

        // The span knows the real usable size; the caller's layout may be
        // smaller than what the block can hold (an earlier shrink stayed
        // in place).
        let span = page_cache::lookup_span(&PAGE_MAP, ptr);
        let old_usable = unsafe {
            let bs = (*span).block_size;
            if bs != 0 { bs } else { (*span).num_pages * PAGE_SIZE }
        };

        if new_size <= old_usable {
            return ptr;
        }

        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            unsafe {
                ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size));
                self.dealloc(ptr, layout);
            }
        }
        new_ptr
    }
}

impl TriMalloc {
    cfg_if::cfg_if! {
        if #[cfg(feature = "std")] {
            #[inline(always)]
            unsafe fn alloc_small(&self, size: usize) -> *mut u8 {
                match CACHE.try_with(|cell| unsafe {
                    (*cell.get()).allocate(size, &CENTRAL_CACHE, &PAGE_CACHE)
                }) {
                    Ok(ptr) => ptr,
                    // TLS already torn down: serve from the shared tier.
                    Err(_) => unsafe { self.alloc_from_central(size) },
                }
            }

            #[inline(always)]
            unsafe fn dealloc_small(&self, ptr: *mut u8, block_size: usize) {
                if CACHE
                    .try_with(|cell| unsafe {
                        (*cell.get()).deallocate(
                            ptr,
                            block_size,
                            &CENTRAL_CACHE,
                            &PAGE_CACHE,
                            &PAGE_MAP,
                        )
                    })
                    .is_err()
                {
                    unsafe { self.dealloc_to_central(ptr, block_size) };
                }
            }
        } else {
            #[inline(always)]
            unsafe fn alloc_small(&self, size: usize) -> *mut u8 {
                unsafe { self.alloc_from_central(size) }
            }

            #[inline(always)]
            unsafe fn dealloc_small(&self, ptr: *mut u8, block_size: usize) {
                unsafe { self.dealloc_to_central(ptr, block_size) };
            }
        }
    }

    unsafe fn alloc_from_central(&self, size: usize) -> *mut u8 {
        stat_inc!(thread_cache_misses);
        let aligned = size_class::round_up(size);
        let index = size_class::class_index(size);
        let (_n, head, _tail) =
            unsafe { CENTRAL_CACHE.fetch_range(index, aligned, 1, &PAGE_CACHE) };
        head as *mut u8
    }

    unsafe fn dealloc_to_central(&self, ptr: *mut u8, block_size: usize) {
        let obj = ptr as *mut FreeObject;
        unsafe {
            (*obj).next = ptr::null_mut();
            CENTRAL_CACHE.release_list(
                obj,
                size_class::class_index(block_size),
                &PAGE_CACHE,
                &PAGE_MAP,
            );
        }
    }

    unsafe fn alloc_large(&self, size: usize, align: usize) -> *mut u8 {
        stat_inc!(large_allocs);

        let npages = size.max(align).div_ceil(PAGE_SIZE);
        let align_pages = if align > PAGE_SIZE { align >> PAGE_SHIFT } else { 1 };

        let mut pc = PAGE_CACHE.lock();
        let span = unsafe { pc.new_aligned_span(npages, align_pages) };
        unsafe {
            (*span).state = SpanState::InUse;
            (*span).start_addr()
        }
    }
}

// Shared by GlobalAlloc::dealloc and the explicit API: the span decides
// where the pointer goes.
unsafe fn dealloc_impl(ptr: *mut u8) {
    stat_inc!(dealloc_count);

    let span = page_cache::lookup_span(&PAGE_MAP, ptr);
    let block_size = unsafe { (*span).block_size };
    if block_size != 0 {
        unsafe { TriMalloc.dealloc_small(ptr, block_size) };
    } else {
        let mut pc = PAGE_CACHE.lock();
        unsafe { pc.revert_span(span) };
    }
}

/// Allocate `size` bytes, 8-byte aligned. Never returns null: the process
/// aborts if the OS is out of memory. A zero-byte request is served as the
/// smallest class so the result is always a real, freeable block.
pub fn allocate(size: usize) -> *mut u8 {
    let size = size.max(1);

    stat_inc!(alloc_count);
    stat_add!(alloc_bytes, size as u64);

    if size <= MAX_SMALL_SIZE {
        unsafe { TriMalloc.alloc_small(size) }
    } else {
        unsafe { TriMalloc.alloc_large(size, 8) }
    }
}

/// Free a block returned by [`allocate`] (or by the `GlobalAlloc` impl).
/// The size is derived from span metadata, so none is taken here.
///
/// # Safety
///
/// `ptr` must have been returned by this allocator and not freed since.
pub unsafe fn deallocate(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    unsafe { dealloc_impl(ptr) };
}
