//! Image types and descriptors.

use super::Extent2d;
use bitflags::bitflags;

/// Image formats the renderer creates or accepts from asset loaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageFormat {
    /// 8-bit RGBA channels, unsigned normalized.
    #[default]
    Rgba8Unorm,
    /// 8-bit RGBA channels, sRGB.
    Rgba8Srgb,
    /// 8-bit BGRA channels, unsigned normalized.
    Bgra8Unorm,
    /// 8-bit BGRA channels, sRGB.
    Bgra8Srgb,
    /// 16-bit RGBA channels, float. Used for HDR targets and bloom.
    Rgba16Float,
    /// 32-bit RGBA channels, float. Used for environment maps.
    Rgba32Float,
    /// 32-bit red channel, float.
    R32Float,
    /// 32-bit depth, float.
    Depth32Float,
}

impl ImageFormat {
    /// Returns true if this is a depth format.
    pub fn is_depth(&self) -> bool {
        matches!(self, Self::Depth32Float)
    }

    /// Returns true for the sRGB-encoded formats.
    pub fn is_srgb(&self) -> bool {
        matches!(self, Self::Rgba8Srgb | Self::Bgra8Srgb)
    }

    /// Returns the size in bytes per pixel.
    pub fn block_size(&self) -> u32 {
        match self {
            Self::Rgba8Unorm
            | Self::Rgba8Srgb
            | Self::Bgra8Unorm
            | Self::Bgra8Srgb
            | Self::R32Float
            | Self::Depth32Float => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }

    /// Bytes needed for a tightly packed image of `extent`.
    pub fn byte_size(&self, extent: Extent2d) -> u64 {
        u64::from(extent.width) * u64::from(extent.height) * u64::from(self.block_size())
    }
}

bitflags! {
    /// Usage flags for images.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        /// Image can be copied from.
        const COPY_SRC = 1 << 0;
        /// Image can be copied to.
        const COPY_DST = 1 << 1;
        /// Image can be sampled in a shader.
        const SAMPLED = 1 << 2;
        /// Image can be bound as a storage image.
        const STORAGE = 1 << 3;
        /// Image can be used as a color attachment.
        const COLOR_ATTACHMENT = 1 << 4;
        /// Image can be used as a depth attachment.
        const DEPTH_ATTACHMENT = 1 << 5;
    }
}

impl Default for ImageUsage {
    fn default() -> Self {
        Self::empty()
    }
}

/// Descriptor for creating a 2D image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageDescriptor {
    /// Debug label for the image.
    pub label: Option<String>,
    /// Size of the image.
    pub extent: Extent2d,
    /// Mip level count.
    pub mip_level_count: u32,
    /// Image format.
    pub format: ImageFormat,
    /// Usage flags.
    pub usage: ImageUsage,
}

impl ImageDescriptor {
    /// Create a new 2D image descriptor.
    pub fn new_2d(width: u32, height: u32, format: ImageFormat, usage: ImageUsage) -> Self {
        Self {
            label: None,
            extent: Extent2d::new(width, height),
            mip_level_count: 1,
            format,
            usage,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the mip level count.
    pub fn with_mip_levels(mut self, count: u32) -> Self {
        self.mip_level_count = count;
        self
    }
}

impl Default for ImageDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            extent: Extent2d::default(),
            mip_level_count: 1,
            format: ImageFormat::default(),
            usage: ImageUsage::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sizes() {
        assert_eq!(ImageFormat::Rgba8Srgb.block_size(), 4);
        assert_eq!(ImageFormat::Rgba16Float.block_size(), 8);
        assert_eq!(
            ImageFormat::Rgba32Float.byte_size(Extent2d::new(64, 32)),
            64 * 32 * 16
        );
        assert!(ImageFormat::Depth32Float.is_depth());
        assert!(!ImageFormat::Rgba16Float.is_depth());
    }
}
