//! Walkthrough of trimalloc as the process-wide allocator.

use std::collections::HashMap;
use std::time::Instant;
use trimalloc::TriMalloc;

#[global_allocator]
static GLOBAL: TriMalloc = TriMalloc;

fn main() {
    println!("trimalloc demo");
    println!("==============\n");

    // Basic allocations through the global allocator.
    let boxed = Box::new(42u64);
    println!("Box<u64>:    value = {boxed}");

    let mut v: Vec<i32> = (0..1000).collect();
    v.sort_unstable_by(|a, b| b.cmp(a));
    println!("Vec<i32>:    len = {}, sorted[0] = {}", v.len(), v[0]);

    let mut map = HashMap::new();
    for i in 0..500 {
        map.insert(i, format!("val_{i}"));
    }
    println!("HashMap:     len = {}", map.len());

    // Large allocation: bypasses the size classes, straight to the page
    // cache.
    let big = vec![0u8; 1024 * 1024];
    println!(
        "Large alloc: {} bytes, all zero = {}",
        big.len(),
        big.iter().all(|&b| b == 0)
    );

    // Multi-threaded workload.
    println!("\nMulti-threaded run (8 threads, 100k allocs each):");
    let start = Instant::now();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            std::thread::spawn(|| {
                let mut acc = 0usize;
                for i in 0..100_000 {
                    let b = Box::new(i);
                    acc = acc.wrapping_add(*b);
                }
                acc
            })
        })
        .collect();
    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    println!(
        "  done in {:?} (checksum {total})",
        start.elapsed()
    );

    let (mapped, unmapped) = trimalloc::platform::vm_stats();
    println!("\nOS pages mapped: {mapped}, unmapped: {unmapped}");
}
