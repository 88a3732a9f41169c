//! Concurrency tests: many threads hammering shared size classes at once,
//! which exercises the bucket locks, the page-cache lock hand-off, and
//! cross-thread span reverts.

use trimalloc::{allocate, deallocate};

#[test]
fn test_threads_same_size_class() {
    // Every thread uses the one class, maximizing bucket-lock contention.
    let nthreads = 8;
    let per_thread = 5000;

    let handles: Vec<_> = (0..nthreads)
        .map(|tid| {
            std::thread::spawn(move || {
                let mut ptrs = Vec::with_capacity(per_thread);
                for i in 0..per_thread {
                    let ptr = allocate(64);
                    assert!(!ptr.is_null());
                    unsafe { (ptr as *mut u64).write((tid * per_thread + i) as u64) };
                    ptrs.push(ptr);
                }
                for (i, ptr) in ptrs.into_iter().enumerate() {
                    let expect = (tid * per_thread + i) as u64;
                    assert_eq!(unsafe { (ptr as *const u64).read() }, expect);
                    unsafe { deallocate(ptr) };
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn test_threads_mixed_size_classes() {
    let nthreads = 6;
    let rounds = 300;
    let sizes = [8usize, 72, 520, 1500, 9000, 70_000];

    let handles: Vec<_> = (0..nthreads)
        .map(|tid| {
            std::thread::spawn(move || {
                for round in 0..rounds {
                    let mut batch = Vec::new();
                    for (k, &size) in sizes.iter().enumerate() {
                        let ptr = allocate(size);
                        assert!(!ptr.is_null());
                        let tag = (tid * 1000 + round + k) as u64;
                        unsafe { (ptr as *mut u64).write(tag) };
                        batch.push((ptr, tag));
                    }
                    for (ptr, tag) in batch {
                        assert_eq!(unsafe { (ptr as *const u64).read() }, tag);
                        unsafe { deallocate(ptr) };
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn test_alloc_in_one_thread_free_in_another() {
    // Whole batches change threads, so the freeing thread's cache flushes
    // blocks it never allocated back through the central cache.
    let batches = 16;
    let batch_size = 1000;

    let (tx, rx) = std::sync::mpsc::channel::<Vec<usize>>();

    let producer = std::thread::spawn(move || {
        for _ in 0..batches {
            let batch: Vec<usize> = (0..batch_size)
                .map(|i| {
                    let ptr = allocate(128);
                    unsafe { (ptr as *mut u64).write(i as u64) };
                    ptr as usize
                })
                .collect();
            tx.send(batch).unwrap();
        }
    });

    let consumer = std::thread::spawn(move || {
        let mut seen = 0;
        for batch in rx {
            for (i, addr) in batch.into_iter().enumerate() {
                let ptr = addr as *mut u8;
                assert_eq!(unsafe { (ptr as *const u64).read() }, i as u64);
                unsafe { deallocate(ptr) };
                seen += 1;
            }
        }
        seen
    });

    producer.join().unwrap();
    assert_eq!(consumer.join().unwrap(), batches * batch_size);
}

#[test]
fn test_concurrent_large_allocations() {
    // Large allocations serialize on the page-cache lock.
    let nthreads = 4;
    let rounds = 50;

    let handles: Vec<_> = (0..nthreads)
        .map(|_| {
            std::thread::spawn(move || {
                for round in 0..rounds {
                    let size = 300 * 1024 + round * 4096;
                    let ptr = allocate(size);
                    assert!(!ptr.is_null());
                    unsafe {
                        *ptr = 0x7E;
                        *ptr.add(size - 1) = 0x7F;
                        assert_eq!(*ptr, 0x7E);
                        assert_eq!(*ptr.add(size - 1), 0x7F);
                        deallocate(ptr);
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}
