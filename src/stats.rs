//! Allocation statistics counters (`stats` feature).
//!
//! All counters use `Relaxed` ordering: they are observational only. The
//! tier locks provide every ordering guarantee the allocator needs; these
//! exist purely for monitoring.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    /// Calls to alloc with size > 0.
    pub alloc_count: AtomicU64,
    /// Calls to dealloc with size > 0.
    pub dealloc_count: AtomicU64,
    /// Calls to realloc (after null/zero-size guards).
    pub realloc_count: AtomicU64,
    /// Sum of requested byte sizes passed to alloc.
    pub alloc_bytes: AtomicU64,

    /// Allocations that missed the thread cache.
    pub thread_cache_misses: AtomicU64,
    /// Spans the central cache pulled from the page cache.
    pub central_refills: AtomicU64,
    /// Allocations served whole-span by the page cache.
    pub large_allocs: AtomicU64,

    /// Spans split while satisfying a request.
    pub span_splits: AtomicU64,
    /// Adjacent free spans merged.
    pub span_coalesces: AtomicU64,
    /// Spans returned to the page cache.
    pub span_reverts: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            dealloc_count: AtomicU64::new(0),
            realloc_count: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            thread_cache_misses: AtomicU64::new(0),
            central_refills: AtomicU64::new(0),
            large_allocs: AtomicU64::new(0),
            span_splits: AtomicU64::new(0),
            span_coalesces: AtomicU64::new(0),
            span_reverts: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of the statistics counters.
///
/// Fields are loaded individually with `Relaxed` ordering: each value is
/// atomic on its own but the snapshot is not globally consistent. For
/// monitoring that is always sufficient.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub alloc_count: u64,
    pub dealloc_count: u64,
    pub realloc_count: u64,
    pub alloc_bytes: u64,
    pub thread_cache_misses: u64,
    pub central_refills: u64,
    pub large_allocs: u64,
    pub span_splits: u64,
    pub span_coalesces: u64,
    pub span_reverts: u64,
}

/// Load every counter and return a [`Snapshot`].
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        alloc_count: s.alloc_count.load(Ordering::Relaxed),
        dealloc_count: s.dealloc_count.load(Ordering::Relaxed),
        realloc_count: s.realloc_count.load(Ordering::Relaxed),
        alloc_bytes: s.alloc_bytes.load(Ordering::Relaxed),
        thread_cache_misses: s.thread_cache_misses.load(Ordering::Relaxed),
        central_refills: s.central_refills.load(Ordering::Relaxed),
        large_allocs: s.large_allocs.load(Ordering::Relaxed),
        span_splits: s.span_splits.load(Ordering::Relaxed),
        span_coalesces: s.span_coalesces.load(Ordering::Relaxed),
        span_reverts: s.span_reverts.load(Ordering::Relaxed),
    }
}
