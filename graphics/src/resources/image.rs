//! Sampled images loaded from asset data.

use std::path::Path;

use crate::backend::ImageHandle;
use crate::error::{GraphicsError, GraphicsResult};
use crate::types::{Extent2d, ImageFormat};

use super::deletion::GpuResource;
use super::GpuResources;

/// Most mip levels an uploaded image may carry.
pub const MAX_MIP_LEVELS: u32 = 10;

/// Tightly packed pixels of an image and its optional mip chain.
///
/// `pixels` is level 0; `mips[i]` is level `i + 1`, each half the size of
/// the level above (clamped to 1).
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub pixels: Vec<u8>,
    pub mips: Vec<Vec<u8>>,
}

impl ImageData {
    pub fn new(width: u32, height: u32, format: ImageFormat, pixels: Vec<u8>) -> GraphicsResult<Self> {
        let data = Self {
            width,
            height,
            format,
            pixels,
            mips: Vec::new(),
        };
        data.validate()?;
        Ok(data)
    }

    /// A 1x1 RGBA8 image.
    pub fn solid(color: [u8; 4], format: ImageFormat) -> Self {
        Self {
            width: 1,
            height: 1,
            format,
            pixels: color.to_vec(),
            mips: Vec::new(),
        }
    }

    /// Attach levels 1.. of the mip chain.
    pub fn with_mips(mut self, mips: Vec<Vec<u8>>) -> GraphicsResult<Self> {
        self.mips = mips;
        self.validate()?;
        Ok(self)
    }

    /// Build the full mip chain from level 0 with a 2x2 box filter.
    pub fn with_generated_mips(self) -> GraphicsResult<Self> {
        let channels = match self.format {
            ImageFormat::Rgba8Unorm
            | ImageFormat::Rgba8Srgb
            | ImageFormat::Bgra8Unorm
            | ImageFormat::Bgra8Srgb => 4,
            other => {
                return Err(GraphicsError::FeatureNotSupported(format!(
                    "mip generation for {other:?}"
                )));
            }
        };
        let extent = self.extent();
        let count = full_chain_length(extent).min(MAX_MIP_LEVELS);
        let mut mips = Vec::with_capacity(count.saturating_sub(1) as usize);
        for level in 1..count {
            let source = mips.last().unwrap_or(&self.pixels);
            let next = downsample(source, extent.mip(level - 1), extent.mip(level), channels);
            mips.push(next);
        }
        self.with_mips(mips)
    }

    /// Parse a pre-baked mip chain:
    /// `u32 channels, u32 bytes_per_channel, u32 levels` followed by
    /// `u32 width, u32 height, pixels` per level, all little endian.
    /// The level count is clamped to `1..=MAX_MIP_LEVELS`.
    pub fn from_mip_chain(bytes: &[u8], format: ImageFormat) -> GraphicsResult<Self> {
        let mut reader = ByteReader { bytes, offset: 0 };
        let channels = reader.u32()?;
        let bytes_per_channel = reader.u32()?;
        if channels.checked_mul(bytes_per_channel) != Some(format.block_size()) {
            return Err(GraphicsError::InvalidParameter(format!(
                "{channels} channels of {bytes_per_channel} bytes do not match {format:?}"
            )));
        }
        let count = reader.u32()?.clamp(1, MAX_MIP_LEVELS);

        let mut levels = Vec::with_capacity(count as usize);
        let mut base = Extent2d::new(0, 0);
        for level in 0..count {
            let extent = Extent2d::new(reader.u32()?, reader.u32()?);
            if level == 0 {
                base = extent;
            }
            let size = format.byte_size(extent);
            levels.push(reader.take(size)?.to_vec());
        }
        if reader.offset != bytes.len() {
            log::warn!("Ignoring {} trailing bytes after mip chain", bytes.len() - reader.offset);
        }

        let mut levels = levels.into_iter();
        let pixels = levels.next().unwrap_or_default();
        Self::new(base.width, base.height, format, pixels)?.with_mips(levels.collect())
    }

    /// Read a pre-baked mip chain from disk. See [`ImageData::from_mip_chain`].
    pub fn load_mip_chain(path: &Path, format: ImageFormat) -> GraphicsResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| GraphicsError::Io(format!("failed to read {}: {e}", path.display())))?;
        Self::from_mip_chain(&bytes, format)
    }

    /// Decode an image file. Radiance `.hdr` files become `Rgba32Float`,
    /// everything else RGBA8 (`Rgba8Srgb` when `srgb` is set).
    pub fn load(path: &Path, srgb: bool) -> GraphicsResult<Self> {
        let decoded = image::open(path)
            .map_err(|e| GraphicsError::Io(format!("failed to load {}: {e}", path.display())))?;
        let is_hdr = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("hdr"));

        if is_hdr {
            let rgba = decoded.to_rgba32f();
            let (width, height) = rgba.dimensions();
            Self::new(
                width,
                height,
                ImageFormat::Rgba32Float,
                bytemuck::cast_slice(rgba.as_raw()).to_vec(),
            )
        } else {
            let rgba = decoded.to_rgba8();
            let (width, height) = rgba.dimensions();
            let format = if srgb {
                ImageFormat::Rgba8Srgb
            } else {
                ImageFormat::Rgba8Unorm
            };
            Self::new(width, height, format, rgba.into_raw())
        }
    }

    pub fn mip_level_count(&self) -> u32 {
        1 + self.mips.len() as u32
    }

    /// Every level with its extent, level 0 first.
    pub fn levels(&self) -> impl Iterator<Item = (u32, Extent2d, &[u8])> + '_ {
        let extent = self.extent();
        std::iter::once(self.pixels.as_slice())
            .chain(self.mips.iter().map(Vec::as_slice))
            .enumerate()
            .map(move |(level, bytes)| (level as u32, extent.mip(level as u32), bytes))
    }

    /// Bytes across all levels.
    pub fn total_size(&self) -> u64 {
        self.levels().map(|(_, _, bytes)| bytes.len() as u64).sum()
    }

    pub fn extent(&self) -> Extent2d {
        Extent2d::new(self.width, self.height)
    }

    pub fn validate(&self) -> GraphicsResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(GraphicsError::InvalidParameter("image has zero size".to_string()));
        }
        let extent = self.extent();
        let count = self.mip_level_count();
        if count > MAX_MIP_LEVELS || count > full_chain_length(extent) {
            return Err(GraphicsError::InvalidParameter(format!(
                "{}x{} image cannot have {} mip levels",
                self.width, self.height, count
            )));
        }
        for (level, level_extent, bytes) in self.levels() {
            let expected = self.format.byte_size(level_extent);
            if bytes.len() as u64 != expected {
                return Err(GraphicsError::InvalidParameter(format!(
                    "mip {} of {}x{} {:?} image needs {} bytes, got {}",
                    level,
                    self.width,
                    self.height,
                    self.format,
                    expected,
                    bytes.len()
                )));
            }
        }
        Ok(())
    }
}

/// Levels down to 1x1.
fn full_chain_length(extent: Extent2d) -> u32 {
    32 - extent.width.max(extent.height).max(1).leading_zeros()
}

fn downsample(source: &[u8], from: Extent2d, to: Extent2d, channels: usize) -> Vec<u8> {
    let texel = |x: u32, y: u32, c: usize| {
        let x = x.min(from.width - 1);
        let y = y.min(from.height - 1);
        u32::from(source[(y * from.width + x) as usize * channels + c])
    };
    let mut out = Vec::with_capacity(to.width as usize * to.height as usize * channels);
    for y in 0..to.height {
        for x in 0..to.width {
            for c in 0..channels {
                let sum = texel(2 * x, 2 * y, c)
                    + texel(2 * x + 1, 2 * y, c)
                    + texel(2 * x, 2 * y + 1, c)
                    + texel(2 * x + 1, 2 * y + 1, c);
                out.push(((sum + 2) / 4) as u8);
            }
        }
    }
    out
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn take(&mut self, len: u64) -> GraphicsResult<&'a [u8]> {
        let end = usize::try_from(len)
            .ok()
            .and_then(|len| self.offset.checked_add(len))
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!(
                    "mip chain truncated at byte {}",
                    self.offset
                ))
            })?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u32(&mut self) -> GraphicsResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// An image resident on the GPU, sampled by materials and environment maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuImage {
    pub image: ImageHandle,
    pub extent: Extent2d,
    pub format: ImageFormat,
}

impl GpuResources for GpuImage {
    fn gpu_resources(&self) -> Vec<GpuResource> {
        vec![GpuResource::Image(self.image)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_validation() {
        assert!(ImageData::new(2, 2, ImageFormat::Rgba8Unorm, vec![0; 16]).is_ok());
        assert!(ImageData::new(2, 2, ImageFormat::Rgba8Unorm, vec![0; 15]).is_err());
        assert!(ImageData::new(0, 2, ImageFormat::Rgba8Unorm, Vec::new()).is_err());
    }

    #[test]
    fn test_solid_image() {
        let white = ImageData::solid([255; 4], ImageFormat::Rgba8Srgb);
        assert!(white.validate().is_ok());
        assert_eq!(white.extent(), Extent2d::new(1, 1));
    }

    fn chain_bytes(channels: u32, levels: &[(u32, u32, u8)]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for value in [channels, 1, levels.len() as u32] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        for &(width, height, fill) in levels {
            bytes.extend_from_slice(&width.to_le_bytes());
            bytes.extend_from_slice(&height.to_le_bytes());
            bytes.extend(std::iter::repeat_n(fill, (width * height * channels) as usize));
        }
        bytes
    }

    #[test]
    fn test_mip_sizes_are_validated() {
        let base = ImageData::new(4, 2, ImageFormat::Rgba8Unorm, vec![0; 32]).unwrap();
        let data = base.clone().with_mips(vec![vec![0; 8], vec![0; 4]]).unwrap();
        assert_eq!(data.mip_level_count(), 3);
        assert_eq!(data.total_size(), 44);
        let extents: Vec<_> = data.levels().map(|(_, extent, _)| extent).collect();
        assert_eq!(extents, vec![Extent2d::new(4, 2), Extent2d::new(2, 1), Extent2d::new(1, 1)]);

        assert!(base.clone().with_mips(vec![vec![0; 16]]).is_err());
        // A 4x2 image has three levels at most.
        assert!(base.with_mips(vec![vec![0; 8], vec![0; 4], vec![0; 4]]).is_err());
    }

    #[test]
    fn test_generated_mips_average_texels() {
        let pixels = [0u8, 0, 0, 0, 100, 100, 100, 100, 200, 200, 200, 200, 100, 100, 100, 100].to_vec();
        let data = ImageData::new(2, 2, ImageFormat::Rgba8Unorm, pixels)
            .unwrap()
            .with_generated_mips()
            .unwrap();
        assert_eq!(data.mip_level_count(), 2);
        assert_eq!(data.mips[0], vec![100; 4]);

        let hdr = ImageData::new(1, 1, ImageFormat::Rgba32Float, vec![0; 16]).unwrap();
        assert!(matches!(hdr.with_generated_mips(), Err(GraphicsError::FeatureNotSupported(_))));
    }

    #[test]
    fn test_parse_mip_chain() {
        let bytes = chain_bytes(4, &[(4, 4, 1), (2, 2, 2), (1, 1, 3)]);
        let data = ImageData::from_mip_chain(&bytes, ImageFormat::Rgba8Srgb).unwrap();
        assert_eq!(data.extent(), Extent2d::new(4, 4));
        assert_eq!(data.mip_level_count(), 3);
        assert_eq!(data.mips[1], vec![3; 4]);
    }

    #[test]
    fn test_mip_chain_level_count_is_clamped() {
        let mut bytes = chain_bytes(4, &[(1, 1, 9)]);
        bytes[8..12].copy_from_slice(&0u32.to_le_bytes());
        let data = ImageData::from_mip_chain(&bytes, ImageFormat::Rgba8Unorm).unwrap();
        assert_eq!(data.mip_level_count(), 1);
        assert_eq!(data.pixels, vec![9; 4]);
    }

    #[test]
    fn test_bad_mip_chains_rejected() {
        let truncated = chain_bytes(4, &[(2, 2, 0)]);
        assert!(ImageData::from_mip_chain(&truncated[..truncated.len() - 1], ImageFormat::Rgba8Unorm).is_err());

        let wrong_format = chain_bytes(3, &[(2, 2, 0)]);
        assert!(ImageData::from_mip_chain(&wrong_format, ImageFormat::Rgba8Unorm).is_err());

        let wrong_extent = chain_bytes(4, &[(4, 4, 0), (3, 3, 0)]);
        assert!(ImageData::from_mip_chain(&wrong_extent, ImageFormat::Rgba8Unorm).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = ImageData::load(Path::new("missing/albedo.png"), true).unwrap_err();
        assert!(matches!(err, GraphicsError::Io(_)));
    }
}
