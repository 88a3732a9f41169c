//! Thread cache (front end): per-thread free lists, no locks.
//!
//! Each thread owns one `ThreadCache` for its whole lifetime, so the hot
//! allocate/deallocate path never synchronizes. Traffic to the central
//! cache is batched with slow start: each bucket's watermark begins at 1
//! and grows only while the thread keeps saturating it, so one-off
//! allocations never hoard and hot classes ramp up their batch size.

use crate::central_cache::CentralCache;
use crate::config::MAX_SMALL_SIZE;
use crate::free_list::FreeList;
use crate::page_cache::PageCache;
use crate::pagemap::PageMap;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::stat_inc;
use crate::sync::SpinMutex;

/// Per-thread cache: one free list per size class.
pub struct ThreadCache {
    lists: [FreeList; NUM_SIZE_CLASSES],
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self {
            lists: [const { FreeList::new() }; NUM_SIZE_CLASSES],
        }
    }

    /// Serve an allocation of `size` bytes (at most [`MAX_SMALL_SIZE`]).
    ///
    /// # Safety
    ///
    /// Must only be called on the thread that owns this cache.
    /// `central` and `page_cache` must be the process-wide instances.
    #[inline]
    pub unsafe fn allocate(
        &mut self,
        size: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
    ) -> *mut u8 {
        debug_assert!(size > 0 && size <= MAX_SMALL_SIZE);
        let index = size_class::class_index(size);
        if !self.lists[index].is_empty() {
            return unsafe { self.lists[index].pop() } as *mut u8;
        }
        unsafe { self.fetch_from_central(index, size_class::round_up(size), central, page_cache) }
    }

    /// Take back a block of `block_size` bytes (the span's recorded block
    /// size). When the bucket reaches its watermark, the entire list goes
    /// back to the central cache in one batch; that hand-back is what
    /// bounds per-thread memory retention.
    ///
    /// # Safety
    ///
    /// Must only be called on the owning thread. `ptr` must be a block of
    /// exactly `block_size` bytes previously returned by [`allocate`] and
    /// not freed since.
    #[inline]
    pub unsafe fn deallocate(
        &mut self,
        ptr: *mut u8,
        block_size: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
        pagemap: &PageMap,
    ) {
        debug_assert!(!ptr.is_null() && block_size <= MAX_SMALL_SIZE);
        let index = size_class::class_index(block_size);
        let list = &mut self.lists[index];
        unsafe { list.push(ptr as *mut crate::free_list::FreeObject) };

        if list.len() >= list.max_len() {
            let head = list.take_all();
            unsafe { central.release_list(head, index, page_cache, pagemap) };
        }
    }

    /// Refill a bucket from the central cache and return one block.
    ///
    /// Slow start: ask for `min(watermark, num_move_objects)` blocks and
    /// raise the watermark by one each time the request saturates it, so
    /// the batch grows with sustained demand up to the class's cap.
    #[cold]
    unsafe fn fetch_from_central(
        &mut self,
        index: usize,
        size: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
    ) -> *mut u8 {
        stat_inc!(thread_cache_misses);

        let list = &mut self.lists[index];
        let limit = list.max_len();
        let want = limit.min(size_class::num_move_objects(size));
        if want == limit {
            list.set_max_len(limit + 1);
        }

        let (actual, start, end) = unsafe { central.fetch_range(index, size, want, page_cache) };
        debug_assert!(actual >= 1);

        if actual > 1 {
            // Keep the first block, splice the rest into the bucket.
            unsafe { list.push_range((*start).next, end, actual - 1) };
        }
        start as *mut u8
    }
}
