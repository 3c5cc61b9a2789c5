//! Priority-driven texture streaming.
//!
//! Each registered texture gets a priority from its camera distance and
//! screen coverage, mapped to a requested mip count. The manager's
//! per-frame `update`:
//!
//! 1. drains completed disk loads and turns them into GPU uploads,
//! 2. recomputes priorities and requested mip counts,
//! 3. advances uploads whose fences have all retired,
//! 4. sorts by priority and, within the concurrency cap, streams mips in
//!    for under-resident entries and sheds mips from over-resident ones,
//!    evicting low-priority residency when the pool runs short.
//!
//! Mip backing memory comes from a dedicated pool sub-allocated out of the
//! texture block arena; the pool remembers each allocation's extent, so
//! recycling works even though the arena's own per-pointer free does not.

use std::cmp::Ordering as CmpOrdering;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use granite_memory::MemorySystem;
use smallvec::SmallVec;

use crate::async_io::{AsyncFileIo, DestBuffer, ReadRequest};
use crate::texture::StreamedTexture;

/// Alignment of every pool allocation.
const POOL_ALIGN: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRegion {
    offset: u64,
    size: u64,
}

/// An owned sub-allocation of the streaming pool. Returned to the pool with
/// [`TexturePool::free`]; the pool remembers the extent, not the caller.
#[derive(Debug)]
pub struct PoolBlock {
    offset: u64,
    size: u64,
}

impl PoolBlock {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

struct PoolInner {
    free: Vec<FreeRegion>,
    used: u64,
}

/// GPU-upload-visible arena backing streamed mips.
pub struct TexturePool {
    base: NonNull<u8>,
    capacity: u64,
    inner: Mutex<PoolInner>,
}

// The base pointer is only handed out per owned PoolBlock extent.
unsafe impl Send for TexturePool {}
unsafe impl Sync for TexturePool {}

impl TexturePool {
    /// Carves `capacity` bytes out of the texture block arena.
    pub fn new(capacity: u64) -> Option<TexturePool> {
        let base = MemorySystem::global().texture_allocate(capacity, POOL_ALIGN)?;
        Some(TexturePool {
            base,
            capacity,
            inner: Mutex::new(PoolInner {
                free: vec![FreeRegion {
                    offset: 0,
                    size: capacity,
                }],
                used: 0,
            }),
        })
    }

    pub fn total_size(&self) -> u64 {
        self.capacity
    }

    pub fn used_size(&self) -> u64 {
        self.inner.lock().unwrap().used
    }

    pub fn free_size(&self) -> u64 {
        self.capacity - self.used_size()
    }

    /// First-fit allocation, rounded up to the pool alignment.
    pub fn allocate(&self, size: u64) -> Option<PoolBlock> {
        if size == 0 {
            return None;
        }
        let size = size.div_ceil(POOL_ALIGN) * POOL_ALIGN;
        let mut inner = self.inner.lock().unwrap();
        for i in 0..inner.free.len() {
            if inner.free[i].size >= size {
                let offset = inner.free[i].offset;
                inner.free[i].offset += size;
                inner.free[i].size -= size;
                if inner.free[i].size == 0 {
                    inner.free.remove(i);
                }
                inner.used += size;
                return Some(PoolBlock { offset, size });
            }
        }
        None
    }

    /// Returns a block's extent to the free list (sorted by offset).
    pub fn free(&self, block: PoolBlock) {
        let mut inner = self.inner.lock().unwrap();
        let at = inner.free.partition_point(|r| r.offset < block.offset);
        inner.free.insert(
            at,
            FreeRegion {
                offset: block.offset,
                size: block.size,
            },
        );
        inner.used -= block.size;
    }

    /// Merges adjacent free regions. Idempotent between allocations.
    pub fn compact(&self) {
        let mut inner = self.inner.lock().unwrap();
        let mut i = 0;
        while i + 1 < inner.free.len() {
            if inner.free[i].offset + inner.free[i].size == inner.free[i + 1].offset {
                inner.free[i].size += inner.free[i + 1].size;
                inner.free.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    pub fn free_region_count(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    /// Base pointer of a block's extent. Writing through it is the caller's
    /// contract while the block is owned.
    pub fn ptr(&self, block: &PoolBlock) -> *mut u8 {
        unsafe { self.base.as_ptr().add(block.offset as usize) }
    }
}

// Pool backing is never returned to the block arena: its per-pointer free
// is the arena's documented no-op, so the region simply lives as long as
// the process.

#[derive(Debug, Clone, Copy)]
pub struct StreamingConfig {
    pub pool_size_bytes: u64,
    pub max_concurrent_async_uploads: u32,
    /// When false, completed disk loads upload synchronously and residency
    /// advances immediately, bypassing fences.
    pub async_uploads: bool,
    pub io_workers: u32,
}

impl Default for StreamingConfig {
    fn default() -> StreamingConfig {
        StreamingConfig {
            pool_size_bytes: 256 * 1024 * 1024,
            max_concurrent_async_uploads: 4,
            async_uploads: true,
            io_workers: 2,
        }
    }
}

impl StreamingConfig {
    /// Pool sizing from the process-wide configuration keys.
    pub fn from_settings(settings: &granite_rhi::Settings) -> StreamingConfig {
        StreamingConfig {
            pool_size_bytes: settings.texture_pool_size_bytes,
            ..StreamingConfig::default()
        }
    }
}

enum PendingState {
    Idle,
    /// Disk read in flight.
    Load { start: u32, end: u32 },
    /// GPU upload submitted, gated on per-mip fences.
    Upload {
        start: u32,
        end: u32,
        fences: Vec<u64>,
    },
}

/// Pool memory backing one streamed-in mip range.
struct MipBlock {
    start: u32,
    end: u32,
    block: PoolBlock,
}

struct StreamingEntry {
    key: u64,
    texture: Arc<StreamedTexture>,
    requested_mips: u32,
    priority: f32,
    distance: f32,
    screen_size: f32,
    last_touch_frame: u64,
    /// Mips resident without pool backing (initial residency).
    base_resident: u32,
    pending: PendingState,
    /// Stack of streamed-in ranges, bottom-up by mip index.
    blocks: Vec<MipBlock>,
}

struct CompletedLoad {
    key: u64,
    start: u32,
    end: u32,
    block: PoolBlock,
    success: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamingStats {
    pub num_streaming_textures: u32,
    /// Entries whose requested mips are fully resident.
    pub num_resident_textures: u32,
    pub allocated_bytes: u64,
    pub pool_size_bytes: u64,
    pub pending_stream_ins: u32,
}

pub struct TextureStreamingManager {
    // Declared before `pool`: workers write into pool memory, so the loader
    // must join before the pool can go.
    loader: Arc<AsyncFileIo>,
    pool: Arc<TexturePool>,
    state: Mutex<Vec<StreamingEntry>>,
    completed: Arc<Mutex<Vec<CompletedLoad>>>,
    max_concurrent_async_uploads: u32,
    async_uploads: bool,
    next_key: AtomicU64,
    frame: AtomicU64,
}

impl TextureStreamingManager {
    pub fn new(config: StreamingConfig) -> Option<TextureStreamingManager> {
        let pool = TexturePool::new(config.pool_size_bytes)?;
        log::info!(
            target: "gfx-streaming",
            "texture streaming initialized: {} MiB pool, {} concurrent uploads",
            config.pool_size_bytes / 1024 / 1024,
            config.max_concurrent_async_uploads
        );
        Some(TextureStreamingManager {
            loader: AsyncFileIo::new(config.io_workers),
            pool: Arc::new(pool),
            state: Mutex::new(Vec::new()),
            completed: Arc::new(Mutex::new(Vec::new())),
            max_concurrent_async_uploads: config.max_concurrent_async_uploads.max(1),
            async_uploads: config.async_uploads,
            next_key: AtomicU64::new(1),
            frame: AtomicU64::new(0),
        })
    }

    pub fn pool(&self) -> &TexturePool {
        &self.pool
    }

    pub fn loader(&self) -> &Arc<AsyncFileIo> {
        &self.loader
    }

    /// Registers a texture for streaming; its current residency becomes the
    /// floor below which it is never shed.
    pub fn register_texture(&self, texture: &Arc<StreamedTexture>, distance: f32) -> u64 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let base_resident = texture.resident_mips();
        self.state.lock().unwrap().push(StreamingEntry {
            key,
            texture: Arc::clone(texture),
            requested_mips: base_resident,
            priority: 0.0,
            distance,
            screen_size: 1.0,
            last_touch_frame: 0,
            base_resident,
            pending: PendingState::Idle,
            blocks: Vec::new(),
        });
        key
    }

    /// Drops the registration and frees its pool residency. A disk load
    /// still in flight reclaims its memory when it completes.
    pub fn unregister_texture(&self, key: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(idx) = state.iter().position(|e| e.key == key) {
            let entry = state.swap_remove(idx);
            for mb in entry.blocks {
                self.pool.free(mb.block);
            }
        }
        drop(state);
        self.pool.compact();
    }

    pub fn set_distance(&self, key: u64, distance: f32) {
        if let Some(entry) = self
            .state
            .lock()
            .unwrap()
            .iter_mut()
            .find(|e| e.key == key)
        {
            entry.distance = distance;
        }
    }

    pub fn set_screen_size(&self, key: u64, screen_size: f32) {
        if let Some(entry) = self
            .state
            .lock()
            .unwrap()
            .iter_mut()
            .find(|e| e.key == key)
        {
            entry.screen_size = screen_size;
        }
    }

    /// Marks the texture as sampled this frame; recently used textures get
    /// a small priority bonus.
    pub fn touch(&self, key: u64) {
        let frame = self.frame.load(Ordering::Relaxed);
        if let Some(entry) = self
            .state
            .lock()
            .unwrap()
            .iter_mut()
            .find(|e| e.key == key)
        {
            entry.last_touch_frame = frame;
        }
    }

    /// The per-frame control loop.
    pub fn update(&self, _dt: f32) {
        let frame = self.frame.fetch_add(1, Ordering::Relaxed) + 1;

        // 1. Completed disk loads become GPU uploads.
        self.loader.drain_completed();
        self.process_completed_loads();

        let mut state = self.state.lock().unwrap();

        // 2. Priorities and requested mip counts.
        for entry in state.iter_mut() {
            let mut priority =
                (1.0 / entry.distance.max(0.01)).min(1.0) * entry.screen_size.clamp(0.0, 1.0);
            if frame.saturating_sub(entry.last_touch_frame) <= 1 && entry.last_touch_frame != 0 {
                priority = (priority + 0.1).min(1.0);
            }
            entry.priority = priority;
            let total = entry.texture.total_mips();
            entry.requested_mips = if priority > 0.8 {
                total
            } else if priority > 0.5 {
                total.saturating_sub(2).max(1)
            } else if priority > 0.2 {
                (total / 2).max(1)
            } else {
                1
            };
        }

        // 3. Residency advances once every fence of a pending upload has
        //    retired; never mid-flight.
        for entry in state.iter_mut() {
            let retired = match &entry.pending {
                PendingState::Upload { end, fences, .. }
                    if fences
                        .iter()
                        .all(|f| entry.texture.is_async_upload_complete(*f)) =>
                {
                    Some(*end)
                }
                _ => None,
            };
            if let Some(end) = retired {
                entry.texture.update_resident_mips(end);
                entry.pending = PendingState::Idle;
                log::trace!(
                    target: "gfx-streaming",
                    "'{}' now has {} resident mips",
                    entry.texture.name(),
                    end
                );
            }
        }

        // 4. Highest priority first.
        state.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(CmpOrdering::Equal)
        });

        // 5. Concurrency cap counts loads and un-retired uploads alike.
        let mut in_flight = state
            .iter()
            .filter(|e| !matches!(e.pending, PendingState::Idle))
            .count() as u32;

        // 6. Stream in / shed, in priority order.
        for idx in 0..state.len() {
            let (texture, requested, idle) = {
                let entry = &state[idx];
                (
                    Arc::clone(&entry.texture),
                    entry.requested_mips,
                    matches!(entry.pending, PendingState::Idle),
                )
            };
            if !idle {
                continue;
            }
            let resident = texture.resident_mips();
            let total = texture.total_mips();
            let requested = requested.min(total);

            if requested > resident {
                if in_flight >= self.max_concurrent_async_uploads {
                    continue;
                }
                if self.stream_in(&mut state, idx, resident, requested) {
                    in_flight += 1;
                }
            } else if requested < resident {
                let entry = &mut state[idx];
                let floor = entry.base_resident;
                shed_to(entry, &self.pool, requested.max(floor));
            }
        }
        drop(state);

        self.pool.compact();
    }

    /// Kicks off the disk read for mips `[start, end)` of entry `idx`.
    /// Returns whether a request was submitted.
    fn stream_in(
        &self,
        entries: &mut Vec<StreamingEntry>,
        idx: usize,
        start: u32,
        end: u32,
    ) -> bool {
        let texture = Arc::clone(&entries[idx].texture);
        if start >= texture.total_mips() {
            log::warn!(
                target: "gfx-streaming",
                "'{}': stream-in from mip {} requested but only {} exist",
                texture.name(),
                start,
                texture.total_mips()
            );
            return false;
        }
        let Some((file_offset, file_size)) = texture.file_range(start, end) else {
            return false;
        };
        let needed = texture.mip_range_size(start, end);
        debug_assert_eq!(file_size, needed);

        if self.pool.free_size() < needed {
            self.evict_low_priority(entries, needed, idx);
        }
        let Some(block) = self.pool.allocate(needed) else {
            log::warn!(
                target: "gfx-streaming",
                "cannot stream in '{}' mips [{start}, {end}): pool exhausted ({} needed, {} free)",
                texture.name(),
                needed,
                self.pool.free_size()
            );
            return false;
        };

        let dest = unsafe { DestBuffer::new(self.pool.ptr(&block), needed as usize) };
        let key = entries[idx].key;
        let completed = Arc::clone(&self.completed);
        self.loader.read_async(ReadRequest {
            path: texture.path().to_path_buf(),
            offset: file_offset,
            size: needed as usize,
            // One segment per mip, so cancellation lands between mip copies.
            segments: (start..end)
                .map(|level| texture.mip_size(level) as usize)
                .collect(),
            dest,
            on_complete: Box::new(move |success, _bytes| {
                completed.lock().unwrap().push(CompletedLoad {
                    key,
                    start,
                    end,
                    block,
                    success,
                });
            }),
        });
        entries[idx].pending = PendingState::Load { start, end };
        log::debug!(
            target: "gfx-streaming",
            "streaming in '{}' mips [{start}, {end}) ({needed} bytes)",
            texture.name()
        );
        true
    }

    /// Completed disk reads turn into per-mip GPU uploads; failures discard
    /// the pool allocation and leave residency unchanged.
    fn process_completed_loads(&self) {
        let loads: Vec<CompletedLoad> = std::mem::take(&mut *self.completed.lock().unwrap());
        if loads.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        for load in loads {
            let CompletedLoad {
                key,
                start,
                end,
                block,
                success,
            } = load;
            let Some(idx) = state.iter().position(|e| e.key == key) else {
                self.pool.free(block);
                continue;
            };
            if !success {
                log::warn!(
                    target: "gfx-streaming",
                    "disk load failed for '{}' mips [{start}, {end})",
                    state[idx].texture.name()
                );
                self.pool.free(block);
                state[idx].pending = PendingState::Idle;
                continue;
            }

            let texture = Arc::clone(&state[idx].texture);
            let base = self.pool.ptr(&block);
            let mut slices: SmallVec<[&[u8]; 16]> = SmallVec::new();
            let mut cursor = 0usize;
            for level in start..end {
                let len = texture.mip_size(level) as usize;
                slices.push(unsafe { std::slice::from_raw_parts(base.add(cursor), len) });
                cursor += len;
            }

            if self.async_uploads {
                let mut fences = Vec::new();
                match texture.upload_mip_data_async(start, end, &slices, &mut fences) {
                    Ok(()) => {
                        let entry = &mut state[idx];
                        entry.pending = PendingState::Upload { start, end, fences };
                        entry.blocks.push(MipBlock { start, end, block });
                    }
                    Err(err) => {
                        log::warn!(
                            target: "gfx-streaming",
                            "async upload of '{}' failed: {err}",
                            texture.name()
                        );
                        self.pool.free(block);
                        state[idx].pending = PendingState::Idle;
                    }
                }
            } else {
                match texture.upload_mip_data(start, end, &slices) {
                    Ok(()) => {
                        let entry = &mut state[idx];
                        entry.pending = PendingState::Idle;
                        entry.blocks.push(MipBlock { start, end, block });
                    }
                    Err(err) => {
                        log::warn!(
                            target: "gfx-streaming",
                            "upload of '{}' failed: {err}",
                            texture.name()
                        );
                        self.pool.free(block);
                        state[idx].pending = PendingState::Idle;
                    }
                }
            }
        }
    }

    /// Halves residency of idle entries below priority 0.5, lowest first,
    /// until `required` bytes are free or candidates run out.
    fn evict_low_priority(
        &self,
        entries: &mut [StreamingEntry],
        required: u64,
        protect: usize,
    ) -> u64 {
        let mut order: Vec<usize> = (0..entries.len())
            .filter(|&i| {
                i != protect
                    && entries[i].priority < 0.5
                    && entries[i].texture.resident_mips() > 1
                    && matches!(entries[i].pending, PendingState::Idle)
            })
            .collect();
        order.sort_by(|&a, &b| {
            entries[a]
                .priority
                .partial_cmp(&entries[b].priority)
                .unwrap_or(CmpOrdering::Equal)
        });

        let mut freed = 0u64;
        for i in order {
            if freed >= required {
                break;
            }
            let resident = entries[i].texture.resident_mips();
            let target = (resident / 2).max(1).max(entries[i].base_resident);
            freed += shed_to(&mut entries[i], &self.pool, target);
        }
        if freed > 0 {
            self.pool.compact();
            log::debug!(target: "gfx-streaming", "evicted {freed} bytes of low-priority mips");
        }
        freed
    }

    pub fn stats(&self) -> StreamingStats {
        let state = self.state.lock().unwrap();
        let mut stats = StreamingStats {
            num_streaming_textures: state.len() as u32,
            pool_size_bytes: self.pool.total_size(),
            allocated_bytes: self.pool.used_size(),
            ..StreamingStats::default()
        };
        for entry in state.iter() {
            if entry.texture.resident_mips() >= entry.requested_mips {
                stats.num_resident_textures += 1;
            }
            if !matches!(entry.pending, PendingState::Idle) {
                stats.pending_stream_ins += 1;
            }
        }
        stats
    }
}

impl Drop for TextureStreamingManager {
    fn drop(&mut self) {
        // Outstanding reads write into pool memory; let them land before
        // the pool goes away.
        self.loader.wait_for_all();
    }
}

/// Sheds pool-backed mips down to `target` resident mips (never below the
/// entry's base residency). Whole ranges above the target are freed; a
/// range straddling it is split, keeping the lower mips and returning the
/// tail to the pool. Returns the bytes freed.
fn shed_to(entry: &mut StreamingEntry, pool: &TexturePool, target: u32) -> u64 {
    let target = target.max(1).max(entry.base_resident);
    let mut freed = 0u64;
    while let Some(last) = entry.blocks.last_mut() {
        if last.end <= target {
            break;
        }
        if last.start >= target {
            let mb = entry.blocks.pop().expect("just observed");
            freed += mb.block.size();
            pool.free(mb.block);
            continue;
        }
        // Straddling range: keep [start, target), free the tail. The kept
        // extent is rounded up so pool offsets stay aligned.
        let keep: u64 = (last.start..target)
            .map(|level| entry.texture.mip_size(level))
            .sum();
        let keep = keep.div_ceil(256) * 256;
        if keep >= last.block.size {
            break;
        }
        let tail = PoolBlock {
            offset: last.block.offset + keep,
            size: last.block.size - keep,
        };
        last.block.size = keep;
        last.end = target;
        freed += tail.size;
        pool.free(tail);
        break;
    }
    if freed == 0 {
        return 0;
    }
    let new_resident = entry
        .blocks
        .last()
        .map(|b| b.end)
        .unwrap_or(entry.base_resident)
        .max(entry.base_resident)
        .min(entry.texture.resident_mips());
    entry.texture.update_resident_mips(new_resident);
    log::trace!(
        target: "gfx-streaming",
        "'{}' shed to {} resident mips",
        entry.texture.name(),
        new_resident
    );
    freed
}
