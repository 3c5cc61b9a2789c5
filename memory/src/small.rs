//! Binned small-object allocator.
//!
//! Sizes up to [`SMALL_BIN_MAX_SIZE`] are served from power-of-two bins.
//! Each bin owns 64 KiB pages carved into fixed-size slots; free slots are
//! linked through an intrusive LIFO list stored inside the slots themselves.
//! The hot path goes through a per-thread cache of recently freed slots and
//! touches no lock at all.

use std::alloc::{alloc, dealloc, Layout};
use std::cell::RefCell;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Largest size served by the binned path; anything above goes to the system
/// allocator.
pub const SMALL_BIN_MAX_SIZE: usize = 1024;

/// Number of power-of-two bins: 16, 32, 64, 128, 256, 512, 1024.
pub const NUM_SMALL_BINS: usize = 7;

/// Fixed page size for all bins.
pub const SMALL_PAGE_SIZE: usize = 64 * 1024;

/// Empty pages kept per bin before `trim_empty_pages` releases the surplus.
const EMPTY_PAGE_THRESHOLD: usize = 4;

/// Slots cached per bin per thread.
const THREAD_CACHE_SIZE: usize = 16;

const PAGE_ALIGN: usize = 4096;

pub(crate) fn bin_index(size: usize) -> usize {
    debug_assert!(size <= SMALL_BIN_MAX_SIZE);
    if size <= 16 {
        0
    } else if size <= 32 {
        1
    } else if size <= 64 {
        2
    } else if size <= 128 {
        3
    } else if size <= 256 {
        4
    } else if size <= 512 {
        5
    } else {
        6
    }
}

pub(crate) fn bin_element_size(index: usize) -> usize {
    16usize << index
}

#[inline]
pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Header placed at the start of every page. The slot region follows,
/// aligned to the element size.
struct PageHeader {
    element_size: u32,
    element_count: u32,
    free_count: u32,
    /// Head of the intrusive free list; null when the page is full.
    free_list: *mut u8,
}

/// An owned 64 KiB page. All header and free-list access goes through raw
/// pointers; the bin mutex serializes every mutation.
struct Page {
    base: NonNull<u8>,
}

// Raw slot pointers never escape a page except through the allocator API,
// which hands ownership to the caller.
unsafe impl Send for Page {}

impl Page {
    fn new(element_size: usize) -> Option<Page> {
        let layout = Layout::from_size_align(SMALL_PAGE_SIZE, PAGE_ALIGN).ok()?;
        let base = NonNull::new(unsafe { alloc(layout) })?;
        let page = Page { base };
        unsafe {
            let region = page.region_start(element_size);
            let usable = SMALL_PAGE_SIZE - (region as usize - base.as_ptr() as usize);
            let count = usable / element_size;

            // Build the intrusive list front to back; the last slot ends up
            // as the head, each slot pointing at the one before it.
            let mut prev: *mut u8 = ptr::null_mut();
            let mut current = region;
            for _ in 0..count {
                (current as *mut *mut u8).write(prev);
                prev = current;
                current = current.add(element_size);
            }

            let header = page.header();
            (*header).element_size = element_size as u32;
            (*header).element_count = count as u32;
            (*header).free_count = count as u32;
            (*header).free_list = prev;
        }
        Some(page)
    }

    #[inline]
    fn header(&self) -> *mut PageHeader {
        self.base.as_ptr() as *mut PageHeader
    }

    #[inline]
    fn region_start(&self, element_size: usize) -> *mut u8 {
        let after_header = self.base.as_ptr() as usize + mem::size_of::<PageHeader>();
        align_up(after_header, element_size) as *mut u8
    }

    /// Whether `ptr` falls inside this page's slot region.
    fn contains(&self, ptr: *mut u8, element_size: usize) -> bool {
        let region = self.region_start(element_size) as usize;
        let count = unsafe { (*self.header()).element_count } as usize;
        let end = region + count * element_size;
        let p = ptr as usize;
        p >= region && p < end
    }

    /// Pops one slot off the free list. Caller must hold the bin lock.
    unsafe fn pop(&self) -> Option<NonNull<u8>> {
        let header = self.header();
        let head = (*header).free_list;
        let head = NonNull::new(head)?;
        (*header).free_list = (head.as_ptr() as *mut *mut u8).read();
        (*header).free_count -= 1;
        Some(head)
    }

    /// Pushes a slot back onto the free list. Caller must hold the bin lock.
    unsafe fn push(&self, slot: NonNull<u8>) {
        let header = self.header();
        (slot.as_ptr() as *mut *mut u8).write((*header).free_list);
        (*header).free_list = slot.as_ptr();
        (*header).free_count += 1;
    }

    fn free_count(&self) -> u32 {
        unsafe { (*self.header()).free_count }
    }

    fn element_count(&self) -> u32 {
        unsafe { (*self.header()).element_count }
    }

    fn is_empty(&self) -> bool {
        self.free_count() == self.element_count()
    }

    /// Walks the free list and checks it against the header count.
    fn validate(&self, element_size: usize) -> bool {
        unsafe {
            let header = self.header();
            let mut len = 0u32;
            let mut cursor = (*header).free_list;
            while !cursor.is_null() {
                if !self.contains(cursor, element_size) {
                    return false;
                }
                cursor = (cursor as *mut *mut u8).read();
                len += 1;
                if len > (*header).element_count {
                    return false;
                }
            }
            len == (*header).free_count
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(SMALL_PAGE_SIZE, PAGE_ALIGN).unwrap();
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

struct SmallBin {
    element_size: usize,
    pages: Mutex<Vec<Page>>,
    alloc_count: AtomicU64,
    free_count: AtomicU64,
}

struct ThreadCache {
    /// Instance id of the allocator that filled this cache. Entries from
    /// another allocator instance are abandoned, never recycled.
    owner: u64,
    slots: [[*mut u8; THREAD_CACHE_SIZE]; NUM_SMALL_BINS],
    counts: [usize; NUM_SMALL_BINS],
}

impl ThreadCache {
    const fn new() -> ThreadCache {
        ThreadCache {
            owner: 0,
            slots: [[ptr::null_mut(); THREAD_CACHE_SIZE]; NUM_SMALL_BINS],
            counts: [0; NUM_SMALL_BINS],
        }
    }

    fn rebind(&mut self, owner: u64) {
        if self.owner != owner {
            self.owner = owner;
            self.counts = [0; NUM_SMALL_BINS];
        }
    }
}

thread_local! {
    static TLS_CACHE: RefCell<ThreadCache> = const { RefCell::new(ThreadCache::new()) };
}

/// Statistics snapshot for the binned allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmallStats {
    pub allocated_bytes: u64,
    pub reserved_bytes: u64,
    pub page_count: u64,
    pub empty_page_count: u64,
    pub allocations: u64,
    pub frees: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

pub(crate) struct SmallAllocator {
    instance_id: u64,
    bins: [SmallBin; NUM_SMALL_BINS],
    allocated_bytes: AtomicU64,
    reserved_bytes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl SmallAllocator {
    pub(crate) fn new(instance_id: u64) -> SmallAllocator {
        let bins = std::array::from_fn(|i| SmallBin {
            element_size: bin_element_size(i),
            pages: Mutex::new(Vec::new()),
            alloc_count: AtomicU64::new(0),
            free_count: AtomicU64::new(0),
        });
        SmallAllocator {
            instance_id,
            bins,
            allocated_bytes: AtomicU64::new(0),
            reserved_bytes: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    pub(crate) fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let size = size.max(1);
        debug_assert!(size <= SMALL_BIN_MAX_SIZE);
        let index = bin_index(size);
        let bin = &self.bins[index];

        // Lock-free fast path through the thread cache.
        let cached = TLS_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            cache.rebind(self.instance_id);
            if cache.counts[index] > 0 {
                cache.counts[index] -= 1;
                let ptr = cache.slots[index][cache.counts[index]];
                Some(unsafe { NonNull::new_unchecked(ptr) })
            } else {
                None
            }
        });
        if let Some(ptr) = cached {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.allocated_bytes
                .fetch_add(bin.element_size as u64, Ordering::Relaxed);
            bin.alloc_count.fetch_add(1, Ordering::Relaxed);
            return Some(ptr);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let mut pages = bin.pages.lock().unwrap();
        for page in pages.iter() {
            if page.free_count() > 0 {
                let slot = unsafe { page.pop() }.unwrap();
                self.allocated_bytes
                    .fetch_add(bin.element_size as u64, Ordering::Relaxed);
                bin.alloc_count.fetch_add(1, Ordering::Relaxed);
                return Some(slot);
            }
        }

        let page = Page::new(bin.element_size)?;
        let slot = unsafe { page.pop() }.unwrap();
        pages.push(page);
        self.reserved_bytes
            .fetch_add(SMALL_PAGE_SIZE as u64, Ordering::Relaxed);
        self.allocated_bytes
            .fetch_add(bin.element_size as u64, Ordering::Relaxed);
        bin.alloc_count.fetch_add(1, Ordering::Relaxed);
        Some(slot)
    }

    pub(crate) fn free(&self, ptr: NonNull<u8>, size: usize) {
        let size = size.max(1);
        debug_assert!(size <= SMALL_BIN_MAX_SIZE);
        let index = bin_index(size);
        let bin = &self.bins[index];

        let cached = TLS_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            cache.rebind(self.instance_id);
            if cache.counts[index] < THREAD_CACHE_SIZE {
                let count = cache.counts[index];
                cache.slots[index][count] = ptr.as_ptr();
                cache.counts[index] += 1;
                true
            } else {
                false
            }
        });
        if cached {
            self.allocated_bytes
                .fetch_sub(bin.element_size as u64, Ordering::Relaxed);
            bin.free_count.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let pages = bin.pages.lock().unwrap();
        for page in pages.iter() {
            if page.contains(ptr.as_ptr(), bin.element_size) {
                unsafe { page.push(ptr) };
                self.allocated_bytes
                    .fetch_sub(bin.element_size as u64, Ordering::Relaxed);
                bin.free_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        log::warn!(
            target: "gfx-memory",
            "small free: pointer {:p} not found in any page of bin {}",
            ptr.as_ptr(),
            index
        );
    }

    /// Releases empty pages above the retention threshold.
    pub(crate) fn trim_empty_pages(&self) {
        for (index, bin) in self.bins.iter().enumerate() {
            let mut pages = bin.pages.lock().unwrap();
            let empty = pages.iter().filter(|p| p.is_empty()).count();
            if empty <= EMPTY_PAGE_THRESHOLD {
                continue;
            }
            let mut to_release = empty - EMPTY_PAGE_THRESHOLD;
            let mut kept = Vec::with_capacity(pages.len());
            for page in pages.drain(..) {
                if to_release > 0 && page.is_empty() {
                    to_release -= 1;
                    self.reserved_bytes
                        .fetch_sub(SMALL_PAGE_SIZE as u64, Ordering::Relaxed);
                    // Page drop returns the memory to the system.
                } else {
                    kept.push(page);
                }
            }
            let released = empty - EMPTY_PAGE_THRESHOLD;
            *pages = kept;
            log::info!(
                target: "gfx-memory",
                "trimmed {} empty pages from bin {}",
                released,
                index
            );
        }
    }

    /// Walks every page free list and cross-checks the header counters.
    pub(crate) fn validate(&self) -> bool {
        self.bins.iter().all(|bin| {
            let pages = bin.pages.lock().unwrap();
            pages.iter().all(|p| p.validate(bin.element_size))
        })
    }

    pub(crate) fn stats(&self) -> SmallStats {
        let mut page_count = 0u64;
        let mut empty_page_count = 0u64;
        let mut allocations = 0u64;
        let mut frees = 0u64;
        for bin in &self.bins {
            let pages = bin.pages.lock().unwrap();
            page_count += pages.len() as u64;
            empty_page_count += pages.iter().filter(|p| p.is_empty()).count() as u64;
            allocations += bin.alloc_count.load(Ordering::Relaxed);
            frees += bin.free_count.load(Ordering::Relaxed);
        }
        SmallStats {
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
            reserved_bytes: self.reserved_bytes.load(Ordering::Relaxed),
            page_count,
            empty_page_count,
            allocations,
            frees,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset_stats(&self) {
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        for bin in &self.bins {
            bin.alloc_count.store(0, Ordering::Relaxed);
            bin.free_count.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_selection_rounds_up() {
        assert_eq!(bin_index(1), 0);
        assert_eq!(bin_index(16), 0);
        assert_eq!(bin_index(17), 1);
        assert_eq!(bin_index(48), 2);
        assert_eq!(bin_index(1024), 6);
        assert_eq!(bin_element_size(6), 1024);
    }

    #[test]
    fn alloc_free_restores_counts() {
        let alloc = SmallAllocator::new(u64::MAX - 1);
        let before = alloc.stats().allocated_bytes;
        let p = alloc.allocate(96).unwrap();
        assert_eq!(p.as_ptr() as usize % 128, 0);
        alloc.free(p, 96);
        assert_eq!(alloc.stats().allocated_bytes, before);
        assert!(alloc.validate());
    }

    #[test]
    fn cache_hit_on_reuse() {
        let alloc = SmallAllocator::new(u64::MAX - 2);
        let p = alloc.allocate(64).unwrap();
        alloc.free(p, 64);
        let q = alloc.allocate(64).unwrap();
        assert_eq!(p, q);
        assert!(alloc.stats().cache_hits >= 1);
        alloc.free(q, 64);
    }

    #[test]
    fn page_free_list_is_consistent() {
        let alloc = SmallAllocator::new(u64::MAX - 3);
        let mut held = Vec::new();
        // Force past the thread cache so pages see traffic.
        for _ in 0..64 {
            held.push(alloc.allocate(256).unwrap());
        }
        assert!(alloc.validate());
        for p in held {
            alloc.free(p, 256);
        }
        assert!(alloc.validate());
    }
}
