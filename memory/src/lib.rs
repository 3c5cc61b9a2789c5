//! Tiered memory system for the renderer.
//!
//! Three allocation paths with very different lifetimes share one facade:
//!
//! * **small** — general-purpose objects up to 1 KiB, served from size-classed
//!   bins with per-thread caches ([`small`]); larger requests fall back to the
//!   system allocator.
//! * **frame** — per-frame scratch, bump-allocated and reset in bulk
//!   ([`frame`]).
//! * **texture** — large staging blocks sub-allocated for texture uploads
//!   ([`texture_pool`]), optionally backed by huge pages.
//!
//! All paths are thread-safe; see the individual modules for their locking
//! story. Allocation failure is reported as `None` and the policy is the
//! caller's.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;

mod frame;
mod huge_pages;
mod small;
mod texture_pool;

pub use frame::FrameStats;
pub use huge_pages::{detect_support as huge_pages_supported, HUGE_PAGE_SIZE};
pub use small::{SmallStats, NUM_SMALL_BINS, SMALL_BIN_MAX_SIZE, SMALL_PAGE_SIZE};
pub use texture_pool::{TexturePoolStats, TEXTURE_ALLOC_ALIGN};

/// Alignment used for system-allocator fallbacks, matching `malloc`.
const FALLBACK_ALIGN: usize = 16;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

static GLOBAL: Lazy<MemorySystem> = Lazy::new(|| MemorySystem::new(MemoryConfig::default()));

/// Construction parameters for a [`MemorySystem`].
#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    /// Initial capacity of the per-frame scratch arena.
    pub frame_arena_bytes: u64,
    /// Default block size of the texture pool.
    pub texture_block_bytes: u64,
    /// Whether texture blocks of 2 MiB or more should request huge pages.
    pub huge_pages_for_textures: bool,
}

impl Default for MemoryConfig {
    fn default() -> MemoryConfig {
        MemoryConfig {
            frame_arena_bytes: 8 * 1024 * 1024,
            texture_block_bytes: 64 * 1024 * 1024,
            huge_pages_for_textures: true,
        }
    }
}

/// Aggregated statistics over all three allocation paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub small: SmallStats,
    pub frame: FrameStats,
    pub texture: TexturePoolStats,
    pub total_allocated_bytes: u64,
    pub total_reserved_bytes: u64,
}

pub struct MemorySystem {
    small: small::SmallAllocator,
    frame: frame::FrameArena,
    texture: texture_pool::TextureBlockPool,
}

impl MemorySystem {
    pub fn new(config: MemoryConfig) -> MemorySystem {
        let id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        log::info!(
            target: "gfx-memory",
            "memory system initialized: frame scratch {} MiB, texture block {} MiB",
            config.frame_arena_bytes / 1024 / 1024,
            config.texture_block_bytes / 1024 / 1024
        );
        MemorySystem {
            small: small::SmallAllocator::new(id),
            frame: frame::FrameArena::new(config.frame_arena_bytes),
            texture: texture_pool::TextureBlockPool::new(
                config.texture_block_bytes,
                config.huge_pages_for_textures,
            ),
        }
    }

    /// Process-wide instance with default pools.
    pub fn global() -> &'static MemorySystem {
        &GLOBAL
    }

    // ------------------------------------------------------------------
    // General-purpose path

    /// Allocates `size` bytes. Sizes up to [`SMALL_BIN_MAX_SIZE`] go through
    /// the binned fast path; larger requests use the system allocator and
    /// are aligned to 16 bytes.
    ///
    /// Size 0 returns a non-null placeholder whose free is a no-op.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return Some(NonNull::dangling());
        }
        if size <= SMALL_BIN_MAX_SIZE {
            self.small.allocate(size)
        } else {
            let layout = Layout::from_size_align(size, FALLBACK_ALIGN).ok()?;
            NonNull::new(unsafe { alloc(layout) })
        }
    }

    /// Frees a pointer obtained from [`allocate`](Self::allocate) with the
    /// same `size`.
    pub fn free(&self, ptr: NonNull<u8>, size: usize) {
        if size == 0 {
            return;
        }
        if size <= SMALL_BIN_MAX_SIZE {
            self.small.free(ptr, size);
        } else {
            let layout = Layout::from_size_align(size, FALLBACK_ALIGN).unwrap();
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }

    /// Releases empty small-allocator pages above the retention threshold.
    pub fn trim_empty_pages(&self) {
        self.small.trim_empty_pages();
    }

    /// Walks small-allocator pages and verifies free-list integrity.
    pub fn validate(&self) -> bool {
        self.small.validate()
    }

    // ------------------------------------------------------------------
    // Frame scratch path

    /// Bump-allocates scratch memory valid until the next
    /// [`frame_reset`](Self::frame_reset).
    pub fn frame_allocate(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        self.frame.allocate(size, alignment)
    }

    /// Invalidates all frame allocations in bulk. Idempotent.
    pub fn frame_reset(&self) {
        self.frame.reset();
    }

    // ------------------------------------------------------------------
    // Texture pool path

    /// Sub-allocates from the large-block texture arena.
    pub fn texture_allocate(&self, size: u64, alignment: u64) -> Option<NonNull<u8>> {
        self.texture.allocate(size, alignment)
    }

    /// See [`texture_pool`]: per-pointer free is not implemented and logs a
    /// warning. Callers that need recycling keep their own size records.
    pub fn texture_free(&self, ptr: NonNull<u8>) {
        self.texture.free(ptr);
    }

    /// Resets every texture block, invalidating all outstanding
    /// sub-allocations.
    pub fn texture_release_all(&self) {
        self.texture.release_all();
    }

    /// Merges adjacent free regions in every texture block.
    pub fn compact_texture_blocks(&self) {
        self.texture.compact();
    }

    // ------------------------------------------------------------------
    // Huge pages

    pub fn huge_pages_available(&self) -> bool {
        self.texture.huge_pages_available()
    }

    pub fn set_huge_pages_for_textures(&self, enable: bool) {
        self.texture.set_huge_pages_for_textures(enable);
    }

    // ------------------------------------------------------------------
    // Statistics

    pub fn stats(&self) -> MemoryStats {
        let small = self.small.stats();
        let frame = self.frame.stats();
        let texture = self.texture.stats();
        MemoryStats {
            small,
            frame,
            texture,
            total_allocated_bytes: small.allocated_bytes
                + frame.allocated_bytes
                + texture.used_bytes,
            total_reserved_bytes: small.reserved_bytes
                + frame.capacity_bytes
                + texture.reserved_bytes,
        }
    }

    /// Resets counters, not memory.
    pub fn reset_stats(&self) {
        self.small.reset_stats();
        self.frame.reset_stats();
        self.texture.reset_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_placeholder_roundtrip() {
        let mem = MemorySystem::new(MemoryConfig::default());
        let p = mem.allocate(0).unwrap();
        mem.free(p, 0);
        assert_eq!(mem.stats().small.allocated_bytes, 0);
    }

    #[test]
    fn boundary_routes_between_small_and_fallback() {
        let mem = MemorySystem::new(MemoryConfig::default());
        let before = mem.stats().small.allocations;

        let edge = mem.allocate(SMALL_BIN_MAX_SIZE).unwrap();
        assert_eq!(mem.stats().small.allocations, before + 1);
        mem.free(edge, SMALL_BIN_MAX_SIZE);

        let over = mem.allocate(SMALL_BIN_MAX_SIZE + 1).unwrap();
        // The system fallback never touches the bins.
        assert_eq!(mem.stats().small.allocations, before + 1);
        mem.free(over, SMALL_BIN_MAX_SIZE + 1);
    }

    #[test]
    fn global_instance_is_shared() {
        let a = MemorySystem::global() as *const _;
        let b = MemorySystem::global() as *const _;
        assert_eq!(a, b);
    }
}
