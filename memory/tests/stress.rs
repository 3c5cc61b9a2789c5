//! Multi-threaded allocator stress, exercising every size class plus the
//! system-allocator fallback.

use std::sync::Arc;
use std::thread;

use granite_memory::{MemoryConfig, MemorySystem, SMALL_BIN_MAX_SIZE};

const SIZES: [usize; 7] = [16, 48, 96, 192, 384, 768, 1100];
const ITERATIONS: usize = 10_000;
const THREADS: usize = 4;

#[test]
fn concurrent_alloc_free_pairs() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mem = Arc::new(MemorySystem::new(MemoryConfig::default()));

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let mem = Arc::clone(&mem);
        handles.push(thread::spawn(move || {
            for i in 0..ITERATIONS {
                let size = SIZES[i % SIZES.len()];
                let ptr = mem.allocate(size).expect("allocation failed");
                // Touch the memory so a bad pointer faults here, not later.
                unsafe { ptr.as_ptr().write(i as u8) };
                mem.free(ptr, size);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = mem.stats();
    assert_eq!(stats.small.allocated_bytes, 0);
    assert!(mem.validate());

    // Six of the seven sizes stay on the binned path; paired alloc/free makes
    // the thread cache absorb almost all of the traffic.
    let lookups = stats.small.cache_hits + stats.small.cache_misses;
    assert!(lookups > 0);
    let hit_rate = stats.small.cache_hits as f64 / lookups as f64;
    assert!(
        hit_rate >= 0.70,
        "cache hit rate too low: {:.2}",
        hit_rate
    );
}

#[test]
fn fallback_size_bypasses_bins() {
    let mem = MemorySystem::new(MemoryConfig::default());
    assert!(1100 > SMALL_BIN_MAX_SIZE);
    let p = mem.allocate(1100).unwrap();
    mem.free(p, 1100);
    assert_eq!(mem.stats().small.allocations, 0);
}

#[test]
fn trim_releases_surplus_empty_pages() {
    let mem = MemorySystem::new(MemoryConfig::default());

    // Drive one bin far enough to back several pages, then release
    // everything and trim. 64-byte slots, 64 KiB pages => ~1020 slots/page.
    let mut held = Vec::new();
    for _ in 0..6000 {
        held.push(mem.allocate(64).unwrap());
    }
    let reserved_full = mem.stats().small.reserved_bytes;
    for p in held {
        mem.free(p, 64);
    }
    mem.trim_empty_pages();
    let stats = mem.stats();
    assert!(stats.small.reserved_bytes < reserved_full);
    assert!(stats.small.empty_page_count <= 4);
    assert!(mem.validate());
}
