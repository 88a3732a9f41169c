//! Central cache (middle end): per-size-class shared span lists.
//!
//! Each of the 208 size classes has its own bucket and its own lock, so
//! different classes never contend. The bucket hands batches of blocks to
//! thread caches and takes whole lists back, pulling spans from the page
//! cache on miss and pushing fully-returned spans back down.
//!
//! Lock discipline: a thread holds a bucket lock or the page-cache lock,
//! never both. Any path that needs the page cache first releases its
//! bucket lock, and re-checks the bucket after re-acquiring it, since
//! another thread may have refilled or drained it in the gap.

use crate::config::MAX_SMALL_SIZE;
use crate::free_list::FreeObject;
use crate::page_cache::{self, PageCache};
use crate::pagemap::PageMap;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::span::{Span, SpanList, SpanState};
use crate::stat_inc;
use crate::sync::SpinMutex;
use core::ptr;

/// One size class's share of the central cache.
struct CentralBucket {
    spans: SpanList,
}

// SAFETY: buckets are only reachable through their SpinMutex.
unsafe impl Send for CentralBucket {}

impl CentralBucket {
    const fn new() -> Self {
        Self {
            spans: SpanList::new(),
        }
    }

    // First span in the bucket that still has free blocks, if any.
    fn find_nonempty(&self) -> *mut Span {
        let mut span = self.spans.head;
        while !span.is_null() {
            if !unsafe { (*span).freelist.is_null() } {
                return span;
            }
            span = unsafe { (*span).next };
        }
        ptr::null_mut()
    }
}

/// All 208 independently-locked size-class buckets.
pub struct CentralCache {
    buckets: [SpinMutex<CentralBucket>; NUM_SIZE_CLASSES],
}

impl Default for CentralCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CentralCache {
    pub const fn new() -> Self {
        Self {
            buckets: [const { SpinMutex::new(CentralBucket::new()) }; NUM_SIZE_CLASSES],
        }
    }

    /// Take up to `count` blocks of `size` bytes from the class at
    /// `index`. Blocks come off a single span, so the actual count may be
    /// smaller than requested; it is always at least 1. Returns
    /// `(actual, start, end)` where `start..end` is a severed chain.
    ///
    /// # Safety
    ///
    /// `index` must equal `size_class::class_index(size)` and `size` must
    /// be a rounded class size. `page_cache` must be the instance every
    /// other tier uses.
    pub unsafe fn fetch_range(
        &self,
        index: usize,
        size: usize,
        count: usize,
        page_cache: &SpinMutex<PageCache>,
    ) -> (usize, *mut FreeObject, *mut FreeObject) {
        debug_assert!(count >= 1);
        debug_assert!(size <= MAX_SMALL_SIZE);

        loop {
            {
                let bucket = self.buckets[index].lock();
                let span = bucket.find_nonempty();
                if !span.is_null() {
                    unsafe {
                        let start = (*span).freelist;
                        let mut end = start;
                        let mut actual = 1;
                        while actual < count && !(*end).next.is_null() {
                            end = (*end).next;
                            actual += 1;
                        }
                        (*span).freelist = (*end).next;
                        (*end).next = ptr::null_mut();
                        (*span).use_count += actual;
                        return (actual, start, end);
                    }
                }
            }
            // Bucket has no free blocks anywhere. Pull a span from the
            // page cache with the bucket lock released, carve it while it
            // is still private to this thread, then publish and rescan.
            let span = unsafe {
                let mut pc = page_cache.lock();
                let span = pc.new_span(size_class::num_move_pages(size));
                (*span).state = SpanState::InUse;
                (*span).block_size = size;
                span
            };
            unsafe { carve_span(span, size) };
            stat_inc!(central_refills);
            {
                let mut bucket = self.buckets[index].lock();
                unsafe { bucket.spans.push(span) };
            }
        }
    }

    /// Return a chain of blocks of the class at `index` to their spans.
    /// Every span whose last outstanding block comes home is handed back
    /// to the page cache, dropping the bucket lock around that call.
    ///
    /// # Safety
    ///
    /// Every block in the chain must belong to size class `index` and have
    /// been produced by [`fetch_range`].
    pub unsafe fn release_list(
        &self,
        head: *mut FreeObject,
        index: usize,
        page_cache: &SpinMutex<PageCache>,
        pagemap: &PageMap,
    ) {
        let mut guard = self.buckets[index].lock();
        let mut cur = head;

        while !cur.is_null() {
            let next = unsafe { (*cur).next };
            let span = page_cache::lookup_span(pagemap, cur as *const u8);

            unsafe {
                (*cur).next = (*span).freelist;
                (*span).freelist = cur;
                (*span).use_count -= 1;

                if (*span).use_count == 0 {
                    // Every block is home: the span leaves this tier.
                    guard.spans.remove(span);
                    (*span).freelist = ptr::null_mut();

                    drop(guard);
                    {
                        let mut pc = page_cache.lock();
                        pc.revert_span(span);
                    }
                    guard = self.buckets[index].lock();
                }
            }

            cur = next;
        }
    }
}

// Thread a fresh span's page range into a free list of `size`-byte
// blocks, in address order. Only whole blocks are linked; a trailing
// fragment smaller than `size` stays unused.
unsafe fn carve_span(span: *mut Span, size: usize) {
    unsafe {
        let base = (*span).start_addr();
        let bytes = (*span).byte_size();
        let num_blocks = bytes / size;
        debug_assert!(num_blocks >= 1);

        (*span).freelist = base as *mut FreeObject;
        let mut tail = base as *mut FreeObject;
        for i in 1..num_blocks {
            let block = base.add(i * size) as *mut FreeObject;
            (*tail).next = block;
            tail = block;
        }
        (*tail).next = ptr::null_mut();
    }
}
