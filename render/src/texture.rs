//! Engine-side textures: streamable textures bound to an on-disk mip table,
//! and the solid-color substitutes used when real data is missing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use granite_rhi::{
    Device, GpuResource, PixelFormat, ResourceUsage, RhiResult, Texture, TextureDesc,
};

/// One mip level as recorded in the source file.
#[derive(Debug, Clone)]
pub struct MipRecord {
    pub width: u32,
    pub height: u32,
    /// Byte offset of this mip's blob within the file.
    pub offset: u64,
    pub size: u64,
}

/// What the (external) file reader reports about a texture on disk. PNG,
/// DDS and KTX all reduce to this.
#[derive(Debug, Clone)]
pub struct TextureFileLayout {
    pub path: PathBuf,
    pub format: PixelFormat,
    pub mips: Vec<MipRecord>,
}

/// A texture whose upper mip levels live on disk until the streaming
/// manager pulls them in.
pub struct StreamedTexture {
    texture: Arc<Texture>,
    layout: TextureFileLayout,
}

impl StreamedTexture {
    /// Binds an RHI texture to its file layout. The layout must cover every
    /// mip, match the texture's sizes, and store mips contiguously so a mip
    /// range is one contiguous read.
    pub fn new(texture: Arc<Texture>, layout: TextureFileLayout) -> Option<Arc<StreamedTexture>> {
        if layout.mips.len() as u32 != texture.total_mips() {
            log::warn!(
                target: "gfx-streaming",
                "'{}': file has {} mips, texture has {}",
                texture.debug_name(),
                layout.mips.len(),
                texture.total_mips()
            );
            return None;
        }
        for (level, record) in layout.mips.iter().enumerate() {
            let expected = texture.mip_size(level as u32);
            if record.size != expected {
                log::warn!(
                    target: "gfx-streaming",
                    "'{}': mip {} is {} bytes on disk, texture expects {}",
                    texture.debug_name(),
                    level,
                    record.size,
                    expected
                );
                return None;
            }
            if level > 0 {
                let prev = &layout.mips[level - 1];
                if prev.offset + prev.size != record.offset {
                    log::warn!(
                        target: "gfx-streaming",
                        "'{}': mip {} is not contiguous with mip {}",
                        texture.debug_name(),
                        level,
                        level - 1
                    );
                    return None;
                }
            }
        }
        Some(Arc::new(StreamedTexture { texture, layout }))
    }

    pub fn texture(&self) -> &Arc<Texture> {
        &self.texture
    }

    pub fn path(&self) -> &Path {
        &self.layout.path
    }

    pub fn name(&self) -> &str {
        self.texture.debug_name()
    }

    pub fn total_mips(&self) -> u32 {
        self.texture.total_mips()
    }

    pub fn resident_mips(&self) -> u32 {
        self.texture.resident_mips()
    }

    pub fn mip_size(&self, level: u32) -> u64 {
        self.texture.mip_size(level)
    }

    /// Total bytes of mips `[start, end)`.
    pub fn mip_range_size(&self, start: u32, end: u32) -> u64 {
        (start..end).map(|level| self.mip_size(level)).sum()
    }

    /// File offset and length of the contiguous blob holding mips
    /// `[start, end)`.
    pub fn file_range(&self, start: u32, end: u32) -> Option<(u64, u64)> {
        if start >= end || end as usize > self.layout.mips.len() {
            log::warn!(
                target: "gfx-streaming",
                "'{}': mip range [{start}, {end}) out of bounds",
                self.name()
            );
            return None;
        }
        let offset = self.layout.mips[start as usize].offset;
        Some((offset, self.mip_range_size(start, end)))
    }

    pub fn upload_mip_data(&self, start: u32, end: u32, data: &[&[u8]]) -> RhiResult<()> {
        self.texture.upload_mip_data(start, end, data)
    }

    pub fn upload_mip_data_async(
        &self,
        start: u32,
        end: u32,
        data: &[&[u8]],
        fences: &mut Vec<u64>,
    ) -> RhiResult<()> {
        self.texture.upload_mip_data_async(start, end, data, fences)
    }

    pub fn is_async_upload_complete(&self, fence: u64) -> bool {
        self.texture.is_async_upload_complete(fence)
    }

    pub fn wait_for_async_upload(&self, fence: u64) {
        self.texture.wait_for_async_upload(fence)
    }

    pub fn update_resident_mips(&self, count: u32) {
        self.texture.update_resident_mips(count)
    }
}

/// Builds a contiguous mip table for `width` x `height` in `format`,
/// starting at `base_offset` in the file.
pub fn build_mip_table(
    width: u32,
    height: u32,
    mip_levels: u32,
    format: PixelFormat,
    base_offset: u64,
) -> Vec<MipRecord> {
    let mut mips = Vec::with_capacity(mip_levels as usize);
    let mut offset = base_offset;
    for level in 0..mip_levels {
        let (w, h) = granite_rhi::mip_dimensions(width, height, level);
        let size = format.surface_size(w, h);
        mips.push(MipRecord {
            width: w,
            height: h,
            offset,
            size,
        });
        offset += size;
    }
    mips
}

// ----------------------------------------------------------------------
// Default textures: substitutes for missing data so rendering proceeds.

fn solid_color(device: &Device, rgba: [u8; 4], name: &str) -> Option<Arc<Texture>> {
    device.create_texture(
        &TextureDesc {
            width: 1,
            height: 1,
            format: PixelFormat::Rgba8Unorm,
            usage: ResourceUsage::SHADER_RESOURCE | ResourceUsage::TRANSFER_DST,
            debug_name: name.to_owned(),
            ..TextureDesc::default()
        },
        Some(&rgba),
    )
}

pub fn create_white(device: &Device) -> Option<Arc<Texture>> {
    solid_color(device, [255, 255, 255, 255], "default white")
}

pub fn create_black(device: &Device) -> Option<Arc<Texture>> {
    solid_color(device, [0, 0, 0, 255], "default black")
}

/// Flat tangent-space normal pointing straight out of the surface.
pub fn create_flat_normal(device: &Device) -> Option<Arc<Texture>> {
    solid_color(device, [128, 128, 255, 255], "default normal")
}

/// Magenta/black checkerboard for spotting unbound textures.
pub fn create_checkerboard(device: &Device, size: u32, check_size: u32) -> Option<Arc<Texture>> {
    let check = check_size.max(1);
    let mut data = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let on = ((x / check) + (y / check)) % 2 == 0;
            if on {
                data.extend_from_slice(&[255, 0, 255, 255]);
            } else {
                data.extend_from_slice(&[0, 0, 0, 255]);
            }
        }
    }
    device.create_texture(
        &TextureDesc {
            width: size,
            height: size,
            format: PixelFormat::Rgba8Unorm,
            usage: ResourceUsage::SHADER_RESOURCE | ResourceUsage::TRANSFER_DST,
            debug_name: "default checkerboard".to_owned(),
            ..TextureDesc::default()
        },
        Some(&data),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_table_is_contiguous() {
        let mips = build_mip_table(256, 256, 9, PixelFormat::Rgba8Unorm, 128);
        assert_eq!(mips.len(), 9);
        assert_eq!(mips[0].offset, 128);
        for pair in mips.windows(2) {
            assert_eq!(pair[0].offset + pair[0].size, pair[1].offset);
        }
        assert_eq!(mips[8].width, 1);
        assert_eq!(mips[8].size, 4);
    }
}
