//! Page cache (back end): spans of raw pages, bucketed by page count.
//!
//! The only tier that talks to the OS. One spin mutex guards everything:
//! bucket search, splitting, coalescing, page-map mutation and the span
//! pool all happen under it. Spans of up to `MAX_PAGES` pages are kept in
//! per-count free lists; larger spans go straight to and from the OS.

use crate::config::{MAX_PAGES, PAGE_SHIFT};
use crate::pagemap::PageMap;
use crate::platform;
use crate::span::{Span, SpanList, SpanState};
use crate::stat_inc;
use core::ptr;
#[cfg(feature = "debug")]
use std::println;

pub struct PageCache {
    /// buckets[k] holds free spans of exactly k pages (index 0 unused).
    buckets: [SpanList; MAX_PAGES + 1],
    /// Pool backing every `Span` record in the process.
    span_pool: crate::object_pool::ObjectPool<Span>,
    /// The global page map; mutated only while this tier's lock is held.
    pagemap: &'static PageMap,
}

// SAFETY: a PageCache is only reachable through its SpinMutex; the raw
// pointers refer to OS-mapped memory and pool-backed span records.
unsafe impl Send for PageCache {}

impl PageCache {
    pub const fn new(pagemap: &'static PageMap) -> Self {
        Self {
            buckets: [const { SpanList::new() }; MAX_PAGES + 1],
            span_pool: crate::object_pool::ObjectPool::new(),
            pagemap,
        }
    }

    /// Produce a span of exactly `npages` pages.
    ///
    /// Spans wider than `MAX_PAGES` come straight from the OS and are
    /// never bucketed. Otherwise the exact bucket is tried first, then a
    /// larger span is split, and as a last resort a `MAX_PAGES` slab is
    /// mapped and the request retried (which then succeeds by split or
    /// exact match).
    ///
    /// The returned span has every page registered in the page map and is
    /// still marked `Free`; the caller flips it to `InUse` under this same
    /// lock before releasing it.
    ///
    /// # Safety
    ///
    /// Caller must hold the page-cache lock (the enclosing `SpinMutex`).
    pub unsafe fn new_span(&mut self, npages: usize) -> *mut Span {
        assert!(npages > 0);

        if npages > MAX_PAGES {
            let ptr = platform::sys_alloc(npages);
            let span = unsafe { self.span_pool.alloc() };
            unsafe {
                (*span).start_page = ptr as usize >> PAGE_SHIFT;
                (*span).num_pages = npages;
                // One entry is enough: the base address is the only pointer
                // ever looked up for a whole-span allocation.
                self.pagemap.set((*span).start_page, span);
            }
            return span;
        }

        if !self.buckets[npages].is_empty() {
            let span = unsafe { self.buckets[npages].pop() };
            // While idle only the endpoints were mapped; interior entries
            // may be stale. Re-register everything on withdrawal.
            unsafe { self.pagemap.register_span(span) };
            return span;
        }

        // Split the first larger span we can find.
        for n in npages + 1..=MAX_PAGES {
            if self.buckets[n].is_empty() {
                continue;
            }
            let rest = unsafe { self.buckets[n].pop() };
            let span = unsafe { self.span_pool.alloc() };
            unsafe {
                (*span).start_page = (*rest).start_page;
                (*span).num_pages = npages;

                (*rest).start_page += npages;
                (*rest).num_pages -= npages;
                self.buckets[(*rest).num_pages].push(rest);
                self.pagemap.register_span_endpoints(rest);

                self.pagemap.register_span(span);
            }
            stat_inc!(span_splits);
            #[cfg(feature = "debug")]
            println!("[page-cache] split {n} -> {npages} + {}", n - npages);
            return span;
        }

        // Nothing usable anywhere: map a full slab, bucket it, retry.
        // The retry is guaranteed to hit the exact or split case.
        #[cfg(feature = "debug")]
        println!("[page-cache] grow: mapping a {MAX_PAGES}-page slab");
        let ptr = platform::sys_alloc(MAX_PAGES);
        let slab = unsafe { self.span_pool.alloc() };
        unsafe {
            (*slab).start_page = ptr as usize >> PAGE_SHIFT;
            (*slab).num_pages = MAX_PAGES;
            self.buckets[MAX_PAGES].push(slab);
            self.new_span(npages)
        }
    }

    /// Produce a span of `npages` pages whose base page number is a
    /// multiple of `align_pages`. Over-allocates and trims: the prefix and
    /// suffix go back into the free lists.
    ///
    /// # Safety
    ///
    /// Caller must hold the page-cache lock. `align_pages` must be a power
    /// of two.
    pub unsafe fn new_aligned_span(&mut self, npages: usize, align_pages: usize) -> *mut Span {
        if align_pages <= 1 {
            return unsafe { self.new_span(npages) };
        }

        let total = npages + align_pages - 1;
        let span = unsafe { self.new_span(total) };

        unsafe {
            let start = (*span).start_page;
            let aligned = (start + align_pages - 1) & !(align_pages - 1);
            let prefix = aligned - start;
            let suffix = total - prefix - npages;

            // Claim the aligned region first: the trims coalesce, and a
            // coalescing neighbor must see this span as checked out, not
            // as a merge candidate.
            (*span).start_page = aligned;
            (*span).num_pages = npages;
            (*span).state = SpanState::InUse;
            self.pagemap.register_span(span);

            if prefix > 0 {
                let p = self.span_pool.alloc();
                (*p).start_page = start;
                (*p).num_pages = prefix;
                self.revert_span(p);
            }

            if suffix > 0 {
                let s = self.span_pool.alloc();
                (*s).start_page = aligned + npages;
                (*s).num_pages = suffix;
                self.revert_span(s);
            }
        }
        span
    }

    /// Take back a fully-free span, merging it with free neighbors.
    ///
    /// Spans wider than `MAX_PAGES` are unmapped immediately: they were
    /// never bucketed and cannot be merged. Otherwise the span is extended
    /// backward and then forward over adjacent free spans as long as the
    /// result still fits a bucket, then parked with its endpoints mapped.
    ///
    /// # Safety
    ///
    /// Caller must hold the page-cache lock. `span` must be owned by the
    /// caller with no outstanding blocks and must not be in any list.
    pub unsafe fn revert_span(&mut self, span: *mut Span) {
        unsafe {
            if (*span).num_pages > MAX_PAGES {
                platform::sys_free((*span).start_addr(), (*span).num_pages);
                self.span_pool.free(span);
                return;
            }

            // Merge backward.
            loop {
                let start = (*span).start_page;
                if start == 0 {
                    break;
                }
                let prev = self.pagemap.get(start - 1);
                if prev.is_null() || (*prev).state != SpanState::Free {
                    break;
                }
                // A stale mapping can survive a merge; require true adjacency.
                if (*prev).end_page() != start {
                    break;
                }
                if (*prev).num_pages + (*span).num_pages > MAX_PAGES {
                    break;
                }

                (*span).start_page = (*prev).start_page;
                (*span).num_pages += (*prev).num_pages;
                self.buckets[(*prev).num_pages].remove(prev);
                self.span_pool.free(prev);
                stat_inc!(span_coalesces);
            }

            // Merge forward.
            loop {
                let next = self.pagemap.get((*span).end_page());
                if next.is_null() || (*next).state != SpanState::Free {
                    break;
                }
                if (*next).start_page != (*span).end_page() {
                    break;
                }
                if (*next).num_pages + (*span).num_pages > MAX_PAGES {
                    break;
                }

                (*span).num_pages += (*next).num_pages;
                self.buckets[(*next).num_pages].remove(next);
                self.span_pool.free(next);
                stat_inc!(span_coalesces);
            }

            #[cfg(feature = "debug")]
            println!(
                "[page-cache] revert: span of {} pages at page {}",
                (*span).num_pages,
                (*span).start_page
            );

            (*span).state = SpanState::Free;
            (*span).block_size = 0;
            (*span).freelist = ptr::null_mut();
            (*span).use_count = 0;
            self.buckets[(*span).num_pages].push(span);
            self.pagemap.register_span_endpoints(span);
        }
        stat_inc!(span_reverts);
    }
}

/// Map a pointer to its owning span via the page map. Fatal if unmapped.
pub fn lookup_span(pagemap: &PageMap, ptr: *const u8) -> *mut Span {
    let span = pagemap.get(ptr as usize >> PAGE_SHIFT);
    assert!(
        !span.is_null(),
        "pointer {ptr:p} does not belong to any live span"
    );
    span
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    // Every test gets its own map so spans from other tests never alias.
    fn make_cache() -> (&'static PageMap, PageCache) {
        let pm: &'static PageMap = Box::leak(Box::new(PageMap::new()));
        (pm, PageCache::new(pm))
    }

    #[test]
    fn test_new_span_registers_pages() {
        let (pm, mut cache) = make_cache();
        unsafe {
            let span = cache.new_span(3);
            assert!(!span.is_null());
            assert_eq!((*span).num_pages, 3);
            for page in (*span).start_page..(*span).end_page() {
                assert_eq!(pm.get(page), span);
            }

            (*span).state = SpanState::InUse;
            cache.revert_span(span);
        }
    }

    #[test]
    fn test_split_leaves_usable_remainder() {
        let (pm, mut cache) = make_cache();
        unsafe {
            let a = cache.new_span(10);
            (*a).state = SpanState::InUse;

            // The remainder of the first slab serves the next request,
            // immediately adjacent to `a` — no new OS mapping involved.
            let b = cache.new_span(20);
            assert_eq!((*b).start_page, (*a).end_page());

            // The remainder's endpoints are mapped while it idles.
            let rest_start = (*b).end_page();
            let rest = pm.get(rest_start);
            assert!(!rest.is_null());
            assert_eq!((*rest).state, SpanState::Free);
            assert_eq!(pm.get(rest_start + (*rest).num_pages - 1), rest);

            (*b).state = SpanState::InUse;
            cache.revert_span(a);
            cache.revert_span(b);
        }
    }

    #[test]
    fn test_coalescing_restores_full_slab() {
        let (_pm, mut cache) = make_cache();
        unsafe {
            let a = cache.new_span(10);
            (*a).state = SpanState::InUse;
            let b = cache.new_span(20);
            (*b).state = SpanState::InUse;
            let slab_start = (*a).start_page;

            cache.revert_span(a);
            cache.revert_span(b);

            // a, b and the idle remainder merged back into one slab. The
            // slab is still mapped, so getting its exact base address back
            // proves the request was served by the merge, not the OS.
            let whole = cache.new_span(MAX_PAGES);
            assert_eq!((*whole).start_page, slab_start);
            assert_eq!((*whole).num_pages, MAX_PAGES);

            (*whole).state = SpanState::InUse;
            cache.revert_span(whole);
        }
    }

    #[test]
    fn test_freed_span_reused() {
        let (_pm, mut cache) = make_cache();
        unsafe {
            let s1 = cache.new_span(4);
            (*s1).state = SpanState::InUse;
            let start = (*s1).start_page;
            cache.revert_span(s1);

            let s2 = cache.new_span(4);
            assert_eq!((*s2).start_page, start);
            (*s2).state = SpanState::InUse;
            cache.revert_span(s2);
        }
    }

    #[test]
    fn test_oversized_span_bypasses_buckets() {
        let (pm, mut cache) = make_cache();
        unsafe {
            let npages = MAX_PAGES + 32;
            let span = cache.new_span(npages);
            assert_eq!((*span).num_pages, npages);
            assert_eq!(pm.get((*span).start_page), span);
            let base = (*span).start_addr();
            base.write_bytes(0x5A, npages << PAGE_SHIFT);
            assert_eq!(*base.add((npages << PAGE_SHIFT) - 1), 0x5A);

            (*span).state = SpanState::InUse;
            cache.revert_span(span);
        }
    }

    #[test]
    fn test_aligned_span_trims_to_boundary() {
        let (pm, mut cache) = make_cache();
        unsafe {
            let align_pages = 8;
            let span = cache.new_aligned_span(4, align_pages);
            assert_eq!((*span).start_page % align_pages, 0);
            assert_eq!((*span).num_pages, 4);
            assert_eq!((*span).state, SpanState::InUse);
            for page in (*span).start_page..(*span).end_page() {
                assert_eq!(pm.get(page), span);
            }
            cache.revert_span(span);
        }
    }

    #[test]
    fn test_many_single_page_spans() {
        let (_pm, mut cache) = make_cache();
        let mut spans = Vec::new();
        unsafe {
            for _ in 0..200 {
                let s = cache.new_span(1);
                (*s).state = SpanState::InUse;
                spans.push(s);
            }
            // All distinct pages.
            for (i, &a) in spans.iter().enumerate() {
                for &b in &spans[i + 1..] {
                    assert_ne!((*a).start_page, (*b).start_page);
                }
            }
            for s in spans {
                cache.revert_span(s);
            }
        }
    }
}
