//! Per-frame scratch arena.
//!
//! A bump allocator that hands out pointers with a CAS loop and is reset in
//! bulk once per frame. Growth is caller-serialized: the owner thread is the
//! only one allowed to outgrow the buffer (concurrent growth is a contract
//! violation and may overlap allocations, though it never dangles).

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::small::align_up;

const GROW_GRANULARITY: usize = 4096;

struct RawBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for RawBuf {}

impl RawBuf {
    fn new(size: usize) -> Option<RawBuf> {
        let layout = Layout::from_size_align(size.max(GROW_GRANULARITY), 64).ok()?;
        let ptr = NonNull::new(unsafe { alloc(layout) })?;
        Some(RawBuf { ptr, layout })
    }
}

impl Drop for RawBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

struct ArenaBuffers {
    current: RawBuf,
    /// Buffers outgrown during the frame. Kept alive until the next
    /// `reset` so pointers handed out earlier in the frame stay valid.
    retired: Vec<RawBuf>,
}

/// Statistics snapshot for the frame arena.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    pub allocated_bytes: u64,
    pub capacity_bytes: u64,
    pub peak_bytes: u64,
    pub allocations: u64,
}

pub(crate) struct FrameArena {
    buffers: Mutex<ArenaBuffers>,
    base: AtomicPtr<u8>,
    capacity: AtomicU64,
    offset: AtomicU64,
    peak: AtomicU64,
    allocations: AtomicU64,
}

impl FrameArena {
    pub(crate) fn new(capacity: u64) -> FrameArena {
        let current = RawBuf::new(capacity as usize).expect("frame arena reservation failed");
        let base = current.ptr.as_ptr();
        FrameArena {
            buffers: Mutex::new(ArenaBuffers {
                current,
                retired: Vec::new(),
            }),
            base: AtomicPtr::new(base),
            capacity: AtomicU64::new(capacity),
            offset: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
        }
    }

    pub(crate) fn allocate(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        debug_assert!(alignment.is_power_of_two());
        self.allocations.fetch_add(1, Ordering::Relaxed);

        let mut current = self.offset.load(Ordering::Relaxed);
        loop {
            let aligned = align_up(current as usize, alignment) as u64;
            let next = aligned + size as u64;
            if next <= self.capacity.load(Ordering::Acquire) {
                match self.offset.compare_exchange_weak(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.update_peak(next);
                        let base = self.base.load(Ordering::Acquire);
                        return NonNull::new(unsafe { base.add(aligned as usize) });
                    }
                    Err(observed) => {
                        current = observed;
                        continue;
                    }
                }
            }
            // Out of space: grow. The old buffer is retired, not freed, so
            // pointers handed out this frame remain valid.
            current = self.grow(size)?;
        }
    }

    fn grow(&self, size: usize) -> Option<u64> {
        let mut buffers = self.buffers.lock().unwrap();
        let old_capacity = self.capacity.load(Ordering::Relaxed);
        let new_capacity =
            (old_capacity * 2).max(align_up(size, GROW_GRANULARITY) as u64);
        let fresh = RawBuf::new(new_capacity as usize)?;
        let new_base = fresh.ptr.as_ptr();

        // Stall the fast path while the base pointer changes over.
        self.capacity.store(0, Ordering::Release);
        let old = std::mem::replace(&mut buffers.current, fresh);
        buffers.retired.push(old);
        self.base.store(new_base, Ordering::Release);
        self.offset.store(0, Ordering::Release);
        self.capacity.store(new_capacity, Ordering::Release);

        log::debug!(
            target: "gfx-memory",
            "frame arena grown {} -> {} bytes",
            old_capacity,
            new_capacity
        );
        Some(0)
    }

    fn update_peak(&self, candidate: u64) {
        let mut peak = self.peak.load(Ordering::Relaxed);
        while candidate > peak {
            match self.peak.compare_exchange_weak(
                peak,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
    }

    /// Resets the arena; all previously returned pointers are invalidated.
    /// Calling twice in a row is equivalent to calling once.
    pub(crate) fn reset(&self) {
        let mut buffers = self.buffers.lock().unwrap();
        buffers.retired.clear();
        self.offset.store(0, Ordering::Release);
    }

    pub(crate) fn stats(&self) -> FrameStats {
        FrameStats {
            allocated_bytes: self.offset.load(Ordering::Relaxed),
            capacity_bytes: self.capacity.load(Ordering::Relaxed),
            peak_bytes: self.peak.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset_stats(&self) {
        self.peak.store(0, Ordering::Relaxed);
        self.allocations.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_respects_alignment_and_order() {
        let arena = FrameArena::new(1 << 20);
        let p1 = arena.allocate(100, 8).unwrap();
        let p2 = arena.allocate(200, 16).unwrap();
        assert!(p2.as_ptr() as usize - p1.as_ptr() as usize >= 100);
        assert_eq!(p2.as_ptr() as usize % 16, 0);

        arena.reset();
        let p3 = arena.allocate(100, 8).unwrap();
        assert_eq!(p3, p1);
    }

    #[test]
    fn reset_is_idempotent() {
        let arena = FrameArena::new(1 << 16);
        arena.allocate(64, 8).unwrap();
        arena.reset();
        let after_one = arena.stats().allocated_bytes;
        arena.reset();
        assert_eq!(arena.stats().allocated_bytes, after_one);
        assert_eq!(after_one, 0);
    }

    #[test]
    fn growth_preserves_old_pointers_until_reset() {
        let arena = FrameArena::new(4096);
        let p1 = arena.allocate(4000, 8).unwrap();
        unsafe { p1.as_ptr().write_bytes(0xAB, 4000) };
        // Forces growth past the initial buffer.
        let p2 = arena.allocate(8192, 8).unwrap();
        assert_ne!(p1, p2);
        // The retired buffer is still readable.
        assert_eq!(unsafe { p1.as_ptr().read() }, 0xAB);
        assert!(arena.stats().capacity_bytes >= 8192);
    }

    #[test]
    fn zero_size_returns_none() {
        let arena = FrameArena::new(4096);
        assert!(arena.allocate(0, 8).is_none());
    }

    #[test]
    fn peak_tracks_high_water_mark() {
        let arena = FrameArena::new(1 << 16);
        arena.allocate(1000, 8).unwrap();
        arena.reset();
        arena.allocate(10, 8).unwrap();
        assert!(arena.stats().peak_bytes >= 1000);
    }
}
