//! 3-level radix tree mapping page IDs to their owning spans.
//!
//! With 48-bit virtual addresses and 12-bit pages there are 36 bits of
//! page ID, split 12/12/12 across root, mid and leaf levels: every lookup
//! is three array dereferences, with no hashing and no rehash pauses —
//! this path runs on every free.
//!
//! The root level is a static array of `AtomicPtr`. Mid and leaf nodes are
//! materialized lazily from dedicated object pools owned by the map.
//! `get` is lock-free (acquire loads); every mutation happens under the
//! page-cache lock, which is also what makes the embedded pools safe.

use crate::object_pool::ObjectPool;
use crate::span::Span;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

const ROOT_BITS: usize = 12;
const MID_BITS: usize = 12;
const LEAF_BITS: usize = 12;

/// Page IDs must fit in this many bits; anything wider is unmapped.
const CONFIGURED_BITS: usize = ROOT_BITS + MID_BITS + LEAF_BITS;

const ROOT_LEN: usize = 1 << ROOT_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;

const MID_MASK: usize = MID_LEN - 1;
const LEAF_MASK: usize = LEAF_LEN - 1;

const MID_SHIFT: usize = LEAF_BITS;
const ROOT_SHIFT: usize = LEAF_BITS + MID_BITS;

#[repr(C)]
struct MidNode {
    children: [AtomicPtr<LeafNode>; MID_LEN],
}

#[repr(C)]
struct LeafNode {
    spans: [AtomicPtr<Span>; LEAF_LEN],
}

/// Sparse page_id -> `*mut Span` lookup structure.
pub struct PageMap {
    root: [AtomicPtr<MidNode>; ROOT_LEN],
    // Node storage. Only touched by `set`/`ensure`, which run under the
    // page-cache lock.
    mid_pool: UnsafeCell<ObjectPool<MidNode>>,
    leaf_pool: UnsafeCell<ObjectPool<LeafNode>>,
}

// SAFETY: reads go through atomics; writes (including the pools) are
// confined to the page-cache lock by the `set`/`ensure` contracts.
unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

// Const-initialized array of null AtomicPtrs: null has the all-zero bit
// pattern, so transmuting a zeroed array is sound.
macro_rules! null_atomic_array {
    ($len:expr, $T:ty) => {{
        unsafe { core::mem::transmute::<[usize; $len], [AtomicPtr<$T>; $len]>([0usize; $len]) }
    }};
}

impl PageMap {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            root: null_atomic_array!(ROOT_LEN, MidNode),
            mid_pool: UnsafeCell::new(ObjectPool::new()),
            leaf_pool: UnsafeCell::new(ObjectPool::new()),
        }
    }

    /// Look up the span covering `page_id`. Lock-free; returns null for
    /// unmapped or out-of-range IDs.
    #[inline]
    pub fn get(&self, page_id: usize) -> *mut Span {
        if page_id >> CONFIGURED_BITS != 0 {
            return ptr::null_mut();
        }

        let mid = self.root[page_id >> ROOT_SHIFT].load(Ordering::Acquire);
        if mid.is_null() {
            return ptr::null_mut();
        }

        let leaf = unsafe { (*mid).children[(page_id >> MID_SHIFT) & MID_MASK].load(Ordering::Acquire) };
        if leaf.is_null() {
            return ptr::null_mut();
        }

        unsafe { (*leaf).spans[page_id & LEAF_MASK].load(Ordering::Acquire) }
    }

    /// Map `page_id` to `span` (or unmap it with null).
    ///
    /// # Safety
    ///
    /// Must run under the page-cache lock. `span` must be valid or null.
    pub unsafe fn set(&self, page_id: usize, span: *mut Span) {
        assert!(
            page_id >> CONFIGURED_BITS == 0,
            "page ID out of the configured address width"
        );
        unsafe { self.ensure(page_id, 1) };

        let mid = self.root[page_id >> ROOT_SHIFT].load(Ordering::Acquire);
        unsafe {
            let leaf = (*mid).children[(page_id >> MID_SHIFT) & MID_MASK].load(Ordering::Acquire);
            (*leaf).spans[page_id & LEAF_MASK].store(span, Ordering::Release);
        }
    }

    /// Map every page a span covers. Required before blocks of the span
    /// can be freed, since deallocation may look up any interior page.
    ///
    /// # Safety
    ///
    /// Must run under the page-cache lock.
    pub unsafe fn register_span(&self, span: *mut Span) {
        let start = unsafe { (*span).start_page };
        let count = unsafe { (*span).num_pages };
        for page_id in start..start + count {
            unsafe { self.set(page_id, span) };
        }
    }

    /// Map only a span's first and last pages. Sufficient for a free span:
    /// coalescing only ever consults the pages adjacent to a neighbor,
    /// which are boundary pages.
    ///
    /// # Safety
    ///
    /// Must run under the page-cache lock. Only valid for free spans.
    pub unsafe fn register_span_endpoints(&self, span: *mut Span) {
        let start = unsafe { (*span).start_page };
        let count = unsafe { (*span).num_pages };
        unsafe { self.set(start, span) };
        if count > 1 {
            unsafe { self.set(start + count - 1, span) };
        }
    }

    /// Materialize the intermediate nodes covering page IDs
    /// `start..start + n`, walking one leaf-aligned chunk at a time so a
    /// multi-page range touches each node once.
    ///
    /// # Safety
    ///
    /// Must run under the page-cache lock.
    unsafe fn ensure(&self, start: usize, n: usize) {
        let last = start + n - 1;
        let mut key = start;
        while key <= last {
            let root_idx = key >> ROOT_SHIFT;
            let mut mid = self.root[root_idx].load(Ordering::Acquire);
            if mid.is_null() {
                mid = unsafe { (*self.mid_pool.get()).alloc() };
                // Zeroed node = all-null children; publish after init.
                self.root[root_idx].store(mid, Ordering::Release);
            }

            let mid_idx = (key >> MID_SHIFT) & MID_MASK;
            unsafe {
                let leaf = (*mid).children[mid_idx].load(Ordering::Acquire);
                if leaf.is_null() {
                    let leaf = (*self.leaf_pool.get()).alloc();
                    (*mid).children[mid_idx].store(leaf, Ordering::Release);
                }
            }

            // Jump to the first page ID of the next leaf.
            key = ((key >> LEAF_BITS) + 1) << LEAF_BITS;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_pool::ObjectPool;
    use crate::span::SpanState;

    #[test]
    fn test_get_on_empty_map() {
        let map = PageMap::new();
        assert!(map.get(0).is_null());
        assert!(map.get(1000).is_null());
        assert!(map.get(123_456).is_null());
    }

    #[test]
    fn test_get_out_of_range_is_null() {
        let map = PageMap::new();
        assert!(map.get(1 << CONFIGURED_BITS).is_null());
        assert!(map.get(usize::MAX).is_null());
    }

    #[test]
    fn test_set_get_single_page() {
        let map = PageMap::new();
        let mut pool = ObjectPool::<Span>::new();
        unsafe {
            let s = pool.alloc();
            (*s).start_page = 42;
            (*s).num_pages = 1;

            map.set(42, s);
            assert_eq!(map.get(42), s);
            assert!(map.get(41).is_null());
            assert!(map.get(43).is_null());

            map.set(42, core::ptr::null_mut());
            assert!(map.get(42).is_null());
            pool.free(s);
        }
    }

    #[test]
    fn test_register_span_covers_all_pages() {
        let map = PageMap::new();
        let mut pool = ObjectPool::<Span>::new();
        unsafe {
            let s = pool.alloc();
            (*s).start_page = 100;
            (*s).num_pages = 5;
            (*s).state = SpanState::InUse;

            map.register_span(s);
            for page in 100..105 {
                assert_eq!(map.get(page), s);
            }
            assert!(map.get(99).is_null());
            assert!(map.get(105).is_null());
            pool.free(s);
        }
    }

    #[test]
    fn test_register_endpoints_only() {
        let map = PageMap::new();
        let mut pool = ObjectPool::<Span>::new();
        unsafe {
            let s = pool.alloc();
            (*s).start_page = 200;
            (*s).num_pages = 10;

            map.register_span_endpoints(s);
            assert_eq!(map.get(200), s);
            assert_eq!(map.get(209), s);
            assert!(map.get(204).is_null());
            pool.free(s);
        }
    }

    #[test]
    fn test_range_crossing_leaf_boundary() {
        let map = PageMap::new();
        let mut pool = ObjectPool::<Span>::new();
        unsafe {
            let s = pool.alloc();
            // Straddle a leaf boundary so `ensure` walks two chunks.
            (*s).start_page = (1 << LEAF_BITS) - 3;
            (*s).num_pages = 6;

            map.register_span(s);
            for page in (1 << LEAF_BITS) - 3..(1 << LEAF_BITS) + 3 {
                assert_eq!(map.get(page), s);
            }
            pool.free(s);
        }
    }

    #[test]
    fn test_high_page_id_uses_all_levels() {
        let map = PageMap::new();
        let mut pool = ObjectPool::<Span>::new();
        unsafe {
            let s = pool.alloc();
            let page_id = (5 << ROOT_SHIFT) + (7 << MID_SHIFT) + 11;
            (*s).start_page = page_id;
            (*s).num_pages = 1;

            map.set(page_id, s);
            assert_eq!(map.get(page_id), s);
            assert!(map.get(page_id - 1).is_null());
            assert!(map.get(page_id + 1).is_null());
            pool.free(s);
        }
    }
}
