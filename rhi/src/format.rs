//! Pixel formats and their size metadata.

/// The format set covered by the RHI: 8-bit UNORM/sRGB, 32-bit float, depth,
/// and the BC block-compressed family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    #[default]
    Unknown,
    // 8-bit formats
    R8Unorm,
    R8Srgb,
    Rg8Unorm,
    Rg8Srgb,
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba8Srgb,
    Bgra8Srgb,
    // Float formats
    Rgba32Float,
    Rgb32Float,
    Rg32Float,
    R32Float,
    // Depth formats
    D32Float,
    D24UnormS8Uint,
    D32FloatS8Uint,
    D16Unorm,
    // Block-compressed formats
    Bc1Unorm,
    Bc1Srgb,
    Bc3Unorm,
    Bc3Srgb,
}

impl PixelFormat {
    /// Bytes per pixel for uncompressed formats, `None` for block formats.
    pub fn bytes_per_pixel(self) -> Option<u64> {
        use PixelFormat::*;
        match self {
            Unknown => None,
            R8Unorm | R8Srgb => Some(1),
            Rg8Unorm | Rg8Srgb | D16Unorm => Some(2),
            Rgba8Unorm | Bgra8Unorm | Rgba8Srgb | Bgra8Srgb => Some(4),
            R32Float | D32Float | D24UnormS8Uint => Some(4),
            D32FloatS8Uint => Some(8),
            Rg32Float => Some(8),
            Rgb32Float => Some(12),
            Rgba32Float => Some(16),
            Bc1Unorm | Bc1Srgb | Bc3Unorm | Bc3Srgb => None,
        }
    }

    /// Bytes per 4x4 block for compressed formats.
    pub fn block_bytes(self) -> Option<u64> {
        use PixelFormat::*;
        match self {
            Bc1Unorm | Bc1Srgb => Some(8),
            Bc3Unorm | Bc3Srgb => Some(16),
            _ => None,
        }
    }

    pub fn is_compressed(self) -> bool {
        self.block_bytes().is_some()
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            PixelFormat::D32Float
                | PixelFormat::D24UnormS8Uint
                | PixelFormat::D32FloatS8Uint
                | PixelFormat::D16Unorm
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(
            self,
            PixelFormat::D24UnormS8Uint | PixelFormat::D32FloatS8Uint
        )
    }

    /// Byte size of one `width` x `height` surface in this format.
    /// Compressed formats round dimensions up to whole 4x4 blocks.
    pub fn surface_size(self, width: u32, height: u32) -> u64 {
        if let Some(block) = self.block_bytes() {
            let bw = (u64::from(width) + 3) / 4;
            let bh = (u64::from(height) + 3) / 4;
            bw.max(1) * bh.max(1) * block
        } else {
            let bpp = self.bytes_per_pixel().unwrap_or(0);
            u64::from(width) * u64::from(height) * bpp
        }
    }
}

/// Maximum number of mip levels for a square or rectangular texture:
/// `1 + floor(log2(max_dimension))`.
pub fn max_mip_count(size: u32) -> u32 {
    32 - size.max(1).leading_zeros()
}

/// Dimensions of mip `level`, clamped at 1x1.
pub fn mip_dimensions(width: u32, height: u32, level: u32) -> (u32, u32) {
    ((width >> level).max(1), (height >> level).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_sizes() {
        assert_eq!(PixelFormat::Rgba8Unorm.surface_size(256, 256), 256 * 256 * 4);
        // BC1: 8 bytes per 4x4 block.
        assert_eq!(PixelFormat::Bc1Unorm.surface_size(256, 256), 64 * 64 * 8);
        // BC3 is one byte per pixel at block granularity.
        assert_eq!(
            PixelFormat::Bc3Unorm.surface_size(4096, 4096),
            4096 * 4096
        );
        // Sub-block mips still occupy a whole block.
        assert_eq!(PixelFormat::Bc3Unorm.surface_size(1, 1), 16);
        assert_eq!(PixelFormat::Bc3Unorm.surface_size(2, 2), 16);
    }

    #[test]
    fn mip_math() {
        assert_eq!(max_mip_count(4096), 13);
        assert_eq!(max_mip_count(8192), 14);
        assert_eq!(max_mip_count(1), 1);
        assert_eq!(mip_dimensions(4096, 4096, 12), (1, 1));
        assert_eq!(mip_dimensions(4096, 2048, 1), (2048, 1024));
    }
}
