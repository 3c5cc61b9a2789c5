//! Large-block texture arena.
//!
//! Blocks of 64 MiB (default) sub-allocate in three tiers: first-fit from the
//! per-block free list, then a CAS bump at the block tail, then a fresh block
//! sized `max(block_size, request)`. Blocks of 2 MiB or more may be backed by
//! huge pages when enabled and supported.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::huge_pages::{self, HUGE_PAGE_SIZE};
use crate::small::align_up;

/// Minimum leftover worth keeping when a free region is split.
const SPLIT_KEEP_THRESHOLD: u64 = 64;

/// Default alignment for texture sub-allocations.
pub const TEXTURE_ALLOC_ALIGN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRegion {
    offset: u64,
    size: u64,
}

enum BlockStorage {
    Standard(Box<[u8]>),
    Huge(huge_pages::HugeRegion),
}

impl BlockStorage {
    fn base(&self) -> *mut u8 {
        match self {
            BlockStorage::Standard(buf) => buf.as_ptr() as *mut u8,
            BlockStorage::Huge(region) => region.as_ptr(),
        }
    }
}

struct TextureBlock {
    storage: BlockStorage,
    capacity: u64,
    bump: AtomicU64,
    used_bytes: AtomicU64,
    /// Sorted by offset; populated only by the (currently unreachable)
    /// sized-free path, see `TextureBlockPool::free`.
    free_list: Mutex<Vec<FreeRegion>>,
    uses_huge_pages: bool,
}

// The base pointer is only dereferenced by callers who own a sub-allocation.
unsafe impl Send for TextureBlock {}
unsafe impl Sync for TextureBlock {}

impl TextureBlock {
    fn new(capacity: u64, try_huge: bool) -> Option<TextureBlock> {
        if try_huge && capacity >= HUGE_PAGE_SIZE {
            if let Some(region) = huge_pages::allocate(capacity) {
                log::info!(
                    target: "gfx-memory",
                    "allocated {} MiB texture block with huge pages",
                    capacity / 1024 / 1024
                );
                return Some(TextureBlock {
                    storage: BlockStorage::Huge(region),
                    capacity,
                    bump: AtomicU64::new(0),
                    used_bytes: AtomicU64::new(0),
                    free_list: Mutex::new(Vec::new()),
                    uses_huge_pages: true,
                });
            }
        }
        let buf = vec![0u8; capacity as usize].into_boxed_slice();
        Some(TextureBlock {
            storage: BlockStorage::Standard(buf),
            capacity,
            bump: AtomicU64::new(0),
            used_bytes: AtomicU64::new(0),
            free_list: Mutex::new(Vec::new()),
            uses_huge_pages: false,
        })
    }

    fn base(&self) -> *mut u8 {
        self.storage.base()
    }

    fn contains(&self, ptr: *mut u8) -> bool {
        let base = self.base() as usize;
        let p = ptr as usize;
        p >= base && p < base + self.capacity as usize
    }

    /// Tier 1: first-fit from the free list, splitting when the leftover is
    /// worth keeping.
    fn allocate_from_free_list(&self, size: u64, alignment: u64) -> Option<NonNull<u8>> {
        let mut free = self.free_list.lock().unwrap();
        for i in 0..free.len() {
            let region = free[i];
            let aligned = align_up(region.offset as usize, alignment as usize) as u64;
            if aligned + size <= region.offset + region.size {
                let used = (aligned - region.offset) + size;
                if region.size > used + SPLIT_KEEP_THRESHOLD {
                    free[i].offset += used;
                    free[i].size -= used;
                } else {
                    free.remove(i);
                }
                self.used_bytes.fetch_add(size, Ordering::Relaxed);
                return NonNull::new(unsafe { self.base().add(aligned as usize) });
            }
        }
        None
    }

    /// Tier 2: bump allocation at the block tail.
    fn allocate_bump(&self, size: u64, alignment: u64) -> Option<NonNull<u8>> {
        let mut offset = self.bump.load(Ordering::Relaxed);
        loop {
            let aligned = align_up(offset as usize, alignment as usize) as u64;
            let next = aligned + size;
            if next > self.capacity {
                return None;
            }
            match self.bump.compare_exchange_weak(
                offset,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.used_bytes.fetch_add(size, Ordering::Relaxed);
                    return NonNull::new(unsafe { self.base().add(aligned as usize) });
                }
                Err(observed) => offset = observed,
            }
        }
    }

    /// Inserts a region into the sorted free list.
    fn add_free_region(&self, offset: u64, size: u64) {
        let mut free = self.free_list.lock().unwrap();
        let at = free.partition_point(|r| r.offset < offset);
        free.insert(at, FreeRegion { offset, size });
        self.used_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    /// Merges adjacent regions (`a.end == b.begin`).
    fn merge_free_regions(&self) {
        let mut free = self.free_list.lock().unwrap();
        let mut i = 0;
        while i + 1 < free.len() {
            if free[i].offset + free[i].size == free[i + 1].offset {
                free[i].size += free[i + 1].size;
                free.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    fn free_region_count(&self) -> u64 {
        self.free_list.lock().unwrap().len() as u64
    }

    fn reset(&self) {
        self.bump.store(0, Ordering::Relaxed);
        self.used_bytes.store(0, Ordering::Relaxed);
        self.free_list.lock().unwrap().clear();
    }
}

/// Statistics snapshot for the texture block pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct TexturePoolStats {
    pub reserved_bytes: u64,
    pub used_bytes: u64,
    pub block_count: u64,
    pub free_regions: u64,
    pub allocations: u64,
    pub frees: u64,
}

pub(crate) struct TextureBlockPool {
    block_size: u64,
    blocks: Mutex<Vec<Arc<TextureBlock>>>,
    huge_pages_available: bool,
    huge_pages_for_textures: AtomicBool,
    reserved_bytes: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
}

impl TextureBlockPool {
    pub(crate) fn new(block_size: u64, huge_pages_for_textures: bool) -> TextureBlockPool {
        let huge_pages_available = huge_pages::detect_support();
        if huge_pages_available {
            log::info!(target: "gfx-memory", "huge pages (2 MiB) are available");
        } else {
            log::info!(target: "gfx-memory", "huge pages unavailable, using standard pages");
        }
        TextureBlockPool {
            block_size,
            blocks: Mutex::new(Vec::new()),
            huge_pages_available,
            huge_pages_for_textures: AtomicBool::new(huge_pages_for_textures),
            reserved_bytes: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        }
    }

    pub(crate) fn huge_pages_available(&self) -> bool {
        self.huge_pages_available
    }

    pub(crate) fn set_huge_pages_for_textures(&self, enable: bool) {
        self.huge_pages_for_textures.store(enable, Ordering::Relaxed);
    }

    pub(crate) fn allocate(&self, size: u64, alignment: u64) -> Option<NonNull<u8>> {
        debug_assert!(alignment.is_power_of_two());
        let aligned_size = align_up(size as usize, alignment as usize) as u64;
        self.allocations.fetch_add(1, Ordering::Relaxed);

        let snapshot: Vec<Arc<TextureBlock>> = self.blocks.lock().unwrap().clone();

        for block in &snapshot {
            if let Some(ptr) = block.allocate_from_free_list(aligned_size, alignment) {
                return Some(ptr);
            }
        }
        for block in &snapshot {
            if let Some(ptr) = block.allocate_bump(aligned_size, alignment) {
                return Some(ptr);
            }
        }

        // Tier 3: a fresh block, sized for the request if it exceeds the
        // default block size.
        let mut blocks = self.blocks.lock().unwrap();
        let capacity = self.block_size.max(aligned_size);
        let try_huge =
            self.huge_pages_available && self.huge_pages_for_textures.load(Ordering::Relaxed);
        let block = Arc::new(TextureBlock::new(capacity, try_huge)?);
        let ptr = block.allocate_bump(aligned_size, alignment)?;
        self.reserved_bytes.fetch_add(capacity, Ordering::Relaxed);
        blocks.push(block);
        Some(ptr)
    }

    /// Frees a single texture allocation.
    ///
    /// TODO: track per-allocation sizes so the region can actually be
    /// returned to the owning block's free list. Until then this logs and
    /// leaves the block untouched; callers that need recycling keep their
    /// own size records.
    pub(crate) fn free(&self, ptr: NonNull<u8>) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        let blocks = self.blocks.lock().unwrap();
        for block in blocks.iter() {
            if block.contains(ptr.as_ptr()) {
                log::warn!(
                    target: "gfx-memory",
                    "texture free: per-allocation size tracking not implemented, {:p} not recycled",
                    ptr.as_ptr()
                );
                return;
            }
        }
        log::warn!(
            target: "gfx-memory",
            "texture free: pointer {:p} not found in any block",
            ptr.as_ptr()
        );
    }

    /// Resets every block, invalidating all outstanding allocations.
    pub(crate) fn release_all(&self) {
        let blocks = self.blocks.lock().unwrap();
        for block in blocks.iter() {
            block.reset();
        }
    }

    /// Merges adjacent free regions in every block. Idempotent when no
    /// allocations happen in between.
    pub(crate) fn compact(&self) {
        let blocks = self.blocks.lock().unwrap();
        for block in blocks.iter() {
            block.merge_free_regions();
        }
    }

    pub(crate) fn stats(&self) -> TexturePoolStats {
        let blocks = self.blocks.lock().unwrap();
        let mut used = 0u64;
        let mut free_regions = 0u64;
        for block in blocks.iter() {
            used += block.used_bytes.load(Ordering::Relaxed);
            free_regions += block.free_region_count();
        }
        TexturePoolStats {
            reserved_bytes: self.reserved_bytes.load(Ordering::Relaxed),
            used_bytes: used,
            block_count: blocks.len() as u64,
            free_regions,
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset_stats(&self) {
        self.allocations.store(0, Ordering::Relaxed);
        self.frees.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocations_are_aligned_and_disjoint() {
        let pool = TextureBlockPool::new(1 << 20, false);
        let a = pool.allocate(1000, 256).unwrap();
        let b = pool.allocate(1000, 256).unwrap();
        assert_eq!(a.as_ptr() as usize % 256, 0);
        assert_eq!(b.as_ptr() as usize % 256, 0);
        let delta = (b.as_ptr() as usize).abs_diff(a.as_ptr() as usize);
        assert!(delta >= 1024);
    }

    #[test]
    fn oversized_request_gets_dedicated_block() {
        let pool = TextureBlockPool::new(1 << 16, false);
        pool.allocate(1 << 20, 256).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.block_count, 1);
        assert!(stats.reserved_bytes >= 1 << 20);
    }

    #[test]
    fn free_is_a_noop_with_warning() {
        let pool = TextureBlockPool::new(1 << 16, false);
        let a = pool.allocate(4096, 256).unwrap();
        let used_before = pool.stats().used_bytes;
        pool.free(a);
        assert_eq!(pool.stats().used_bytes, used_before);
        assert_eq!(pool.stats().frees, 1);
    }

    #[test]
    fn free_list_split_and_merge() {
        let pool = TextureBlockPool::new(1 << 16, false);
        pool.allocate(1 << 14, 256).unwrap();
        let blocks = pool.blocks.lock().unwrap();
        let block = blocks[0].clone();
        drop(blocks);

        // Seed two adjacent regions by hand and check the first-fit/split
        // and merge paths the public free cannot reach yet.
        block.add_free_region(0, 512);
        block.add_free_region(512, 512);
        assert_eq!(block.free_region_count(), 2);
        block.merge_free_regions();
        assert_eq!(block.free_region_count(), 1);

        let p = block.allocate_from_free_list(256, 256).unwrap();
        assert_eq!(p.as_ptr() as usize % 256, 0);
        assert_eq!(block.free_region_count(), 1);

        // Merging twice with no traffic in between changes nothing.
        block.merge_free_regions();
        assert_eq!(block.free_region_count(), 1);
    }

    #[test]
    fn release_all_resets_usage() {
        let pool = TextureBlockPool::new(1 << 16, false);
        pool.allocate(4096, 256).unwrap();
        assert!(pool.stats().used_bytes > 0);
        pool.release_all();
        assert_eq!(pool.stats().used_bytes, 0);
    }
}
