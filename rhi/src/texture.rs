//! GPU textures, including the mip residency contract used by streaming.
//!
//! Mip indices `[0, resident_mips)` are backed by device memory; indices at
//! or above `resident_mips` refer to sideloaded disk data. Asynchronous mip
//! uploads hand back one timeline fence per mip; residency advances only
//! once every fence for the pending range has retired.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::DeviceShared;
use crate::error::{RhiError, RhiResult};
use crate::format::{mip_dimensions, PixelFormat};
use crate::resource::{impl_gpu_resource, ResourceCommon, ResourceKind, ResourceUsage};

#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_size: u32,
    pub format: PixelFormat,
    pub usage: ResourceUsage,
    pub debug_name: String,
}

impl Default for TextureDesc {
    fn default() -> TextureDesc {
        TextureDesc {
            width: 1,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_size: 1,
            format: PixelFormat::Rgba8Unorm,
            usage: ResourceUsage::SHADER_RESOURCE,
            debug_name: String::new(),
        }
    }
}

impl TextureDesc {
    pub fn new(width: u32, height: u32, format: PixelFormat, usage: ResourceUsage) -> TextureDesc {
        TextureDesc {
            width,
            height,
            format,
            usage,
            ..TextureDesc::default()
        }
    }

    /// Byte size of one mip level across all array layers.
    pub fn mip_size(&self, level: u32) -> u64 {
        let (w, h) = mip_dimensions(self.width, self.height, level);
        self.format.surface_size(w, h) * u64::from(self.depth) * u64::from(self.array_size)
    }

    /// Total byte size over every mip and array layer.
    pub fn total_size(&self) -> u64 {
        (0..self.mip_levels).map(|level| self.mip_size(level)).sum()
    }
}

pub struct Texture {
    pub(crate) common: ResourceCommon,
    desc: TextureDesc,
    resident_mips: AtomicU32,
    /// Per-mip backing store; `None` for mips that are not resident.
    mips: Mutex<Vec<Option<Box<[u8]>>>>,
}

impl_gpu_resource!(Texture);

impl Texture {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        desc: &TextureDesc,
        initial_data: Option<&[u8]>,
    ) -> Option<Arc<Texture>> {
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
            log::error!(
                target: "gfx",
                "texture '{}' rejected: zero dimension",
                desc.debug_name
            );
            return None;
        }
        if desc.mip_levels == 0 || desc.mip_levels > crate::format::max_mip_count(desc.width.max(desc.height)) {
            log::error!(
                target: "gfx",
                "texture '{}' rejected: invalid mip count {}",
                desc.debug_name,
                desc.mip_levels
            );
            return None;
        }
        let size = desc.total_size();
        let common = ResourceCommon::new(
            device,
            ResourceKind::Texture,
            &desc.debug_name,
            desc.usage,
            size,
        )?;

        let mut mips: Vec<Option<Box<[u8]>>> = (0..desc.mip_levels).map(|_| None).collect();
        let mut resident = 0u32;
        if let Some(data) = initial_data {
            // Initial data fills consecutive mips from level 0 for as long
            // as it lasts; a short buffer simply leaves the tail sideloaded.
            let mut cursor = 0usize;
            for level in 0..desc.mip_levels {
                let len = desc.mip_size(level) as usize;
                if cursor + len > data.len() {
                    break;
                }
                mips[level as usize] = Some(data[cursor..cursor + len].to_vec().into_boxed_slice());
                cursor += len;
                resident += 1;
            }
        }

        Some(Arc::new(Texture {
            common,
            desc: desc.clone(),
            resident_mips: AtomicU32::new(resident),
            mips: Mutex::new(mips),
        }))
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn format(&self) -> PixelFormat {
        self.desc.format
    }

    pub fn total_mips(&self) -> u32 {
        self.desc.mip_levels
    }

    pub fn resident_mips(&self) -> u32 {
        self.resident_mips.load(Ordering::Acquire)
    }

    pub fn mip_size(&self, level: u32) -> u64 {
        self.desc.mip_size(level)
    }

    pub fn mip_dimensions(&self, level: u32) -> (u32, u32) {
        mip_dimensions(self.desc.width, self.desc.height, level)
    }

    /// Synchronous upload of mips `[start, end)`; residency is updated
    /// immediately.
    pub fn upload_mip_data(&self, start: u32, end: u32, data: &[&[u8]]) -> RhiResult<()> {
        self.store_mips(start, end, data)?;
        self.update_resident_mips(end.max(self.resident_mips()));
        Ok(())
    }

    /// Asynchronous upload of mips `[start, end)`. One timeline fence per
    /// mip is appended to `fences`; residency is the caller's to advance
    /// once every fence has retired.
    pub fn upload_mip_data_async(
        &self,
        start: u32,
        end: u32,
        data: &[&[u8]],
        fences: &mut Vec<u64>,
    ) -> RhiResult<()> {
        self.store_mips(start, end, data)?;
        let device = self.common.device();
        for _ in start..end {
            let fence = device.timeline().allocate();
            device.retire_transfer(fence);
            fences.push(fence);
        }
        Ok(())
    }

    pub fn is_async_upload_complete(&self, fence: u64) -> bool {
        self.common.device().timeline().is_complete(fence)
    }

    pub fn wait_for_async_upload(&self, fence: u64) {
        self.common.device().timeline().wait(fence);
    }

    /// Sets the resident mip count, dropping backing for mips above it.
    pub fn update_resident_mips(&self, count: u32) {
        let count = count.min(self.desc.mip_levels);
        let mut mips = self.mips.lock().unwrap();
        for level in count..self.desc.mip_levels {
            mips[level as usize] = None;
        }
        drop(mips);
        self.resident_mips.store(count, Ordering::Release);
    }

    /// Reads back one resident mip, mostly for validation and tests.
    pub fn read_mip(&self, level: u32) -> Option<Vec<u8>> {
        let mips = self.mips.lock().unwrap();
        mips.get(level as usize)?.as_ref().map(|m| m.to_vec())
    }

    /// Fills mip 0 with a solid RGBA color; used by render-target clears.
    pub(crate) fn fill(&self, color: [f32; 4]) {
        let texel: [u8; 4] = [
            (color[0].clamp(0.0, 1.0) * 255.0) as u8,
            (color[1].clamp(0.0, 1.0) * 255.0) as u8,
            (color[2].clamp(0.0, 1.0) * 255.0) as u8,
            (color[3].clamp(0.0, 1.0) * 255.0) as u8,
        ];
        let len = self.desc.mip_size(0) as usize;
        let mut mips = self.mips.lock().unwrap();
        let mip = mips[0].get_or_insert_with(|| vec![0u8; len].into_boxed_slice());
        if self.desc.format.bytes_per_pixel() == Some(4) {
            for chunk in mip.chunks_exact_mut(4) {
                chunk.copy_from_slice(&texel);
            }
        } else {
            mip.fill(texel[0]);
        }
        drop(mips);
        self.resident_mips.fetch_max(1, Ordering::AcqRel);
    }

    fn store_mips(&self, start: u32, end: u32, data: &[&[u8]]) -> RhiResult<()> {
        if start >= end || end > self.desc.mip_levels {
            return Err(RhiError::InvalidArgument(format!(
                "mip range [{start}, {end}) out of bounds for texture '{}' with {} mips",
                self.common.debug_name(),
                self.desc.mip_levels
            )));
        }
        if data.len() != (end - start) as usize {
            return Err(RhiError::InvalidArgument(format!(
                "expected {} mip payloads, got {}",
                end - start,
                data.len()
            )));
        }
        let mut mips = self.mips.lock().unwrap();
        for (i, payload) in data.iter().enumerate() {
            let level = start + i as u32;
            let expected = self.desc.mip_size(level) as usize;
            if payload.len() != expected {
                return Err(RhiError::InvalidArgument(format!(
                    "mip {} of texture '{}' expects {} bytes, got {}",
                    level,
                    self.common.debug_name(),
                    expected,
                    payload.len()
                )));
            }
            mips[level as usize] = Some(payload.to_vec().into_boxed_slice());
        }
        Ok(())
    }
}
