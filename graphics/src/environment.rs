//! Offline image-based lighting generation.
//!
//! Environment maps are equirectangular: `u` wraps around the horizon,
//! `v` runs from straight up (`v = 0`) to straight down. Both generators
//! run on the CPU and are meant for asset preprocessing.
//!
//! | Output | Size | Contents |
//! |--------|------|----------|
//! | Irradiance | 64×32 | cosine-weighted hemisphere convolution |
//! | Prefiltered | 512 wide, mips stacked vertically | GGX importance-sampled, roughness `level / (levels - 1)` |
//!
//! The prefiltered atlas stores level `l` (`max(1, 512 >> l)` by
//! `max(1, 256 >> l)`) left-aligned below level `l - 1`:
//!
//! ```text
//! ┌────────────────┐
//! │    level 0     │
//! ├────────┬───────┘
//! │ lvl 1  │
//! ├────┬───┘
//! │ 2  │
//! └────┘ …
//! ```

use std::f32::consts::{FRAC_PI_2, PI, TAU};
use std::path::Path;

use glam::{Vec2, Vec3};

use crate::error::{GraphicsError, GraphicsResult};
use crate::resources::ImageData;
use crate::types::{Extent2d, ImageFormat};

/// Linear RGB pixels of an equirectangular map.
#[derive(Debug, Clone, PartialEq)]
pub struct EquirectImage {
    extent: Extent2d,
    pixels: Vec<Vec3>,
}

impl EquirectImage {
    pub fn new(extent: Extent2d, pixels: Vec<Vec3>) -> GraphicsResult<Self> {
        if extent.is_empty() {
            return Err(GraphicsError::InvalidParameter(
                "environment map has zero size".to_string(),
            ));
        }
        let expected = extent.width as usize * extent.height as usize;
        if pixels.len() != expected {
            return Err(GraphicsError::InvalidParameter(format!(
                "{}x{} environment map needs {} pixels, got {}",
                extent.width,
                extent.height,
                expected,
                pixels.len()
            )));
        }
        Ok(Self { extent, pixels })
    }

    /// A map of a single color.
    pub fn uniform(extent: Extent2d, color: Vec3) -> Self {
        Self {
            extent,
            pixels: vec![color; extent.width as usize * extent.height as usize],
        }
    }

    fn black(extent: Extent2d) -> Self {
        Self::uniform(extent, Vec3::ZERO)
    }

    /// Decode any image the `image` crate can read, keeping HDR range.
    pub fn load(path: &Path) -> GraphicsResult<Self> {
        let decoded = image::open(path)
            .map_err(|e| GraphicsError::Io(format!("failed to load {}: {e}", path.display())))?;
        let rgb = decoded.to_rgb32f();
        let (width, height) = rgb.dimensions();
        let pixels = rgb.pixels().map(|p| Vec3::from_array(p.0)).collect();
        Self::new(Extent2d::new(width, height), pixels)
    }

    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    pub fn pixels(&self) -> &[Vec3] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Vec3 {
        self.pixels[(y * self.extent.width + x) as usize]
    }

    fn set_pixel(&mut self, x: u32, y: u32, color: Vec3) {
        let index = (y * self.extent.width + x) as usize;
        self.pixels[index] = color;
    }

    /// Bilinear sample at `uv`, wrapping horizontally and clamping vertically.
    pub fn sample_uv(&self, uv: Vec2) -> Vec3 {
        let (width, height) = (self.extent.width as f32, self.extent.height as f32);
        let x = uv.x * width - 0.5;
        let y = (uv.y * height - 0.5).clamp(0.0, height - 1.0);
        let (x0, y0) = (x.floor(), y.floor());
        let (tx, ty) = (x - x0, y - y0);

        let wrap = |x: f32| (x.rem_euclid(width)) as u32;
        let clamp = |y: f32| (y.min(height - 1.0)) as u32;
        let (xa, xb) = (wrap(x0), wrap(x0 + 1.0));
        let (ya, yb) = (clamp(y0), clamp(y0 + 1.0));

        let top = self.pixel(xa, ya).lerp(self.pixel(xb, ya), tx);
        let bottom = self.pixel(xa, yb).lerp(self.pixel(xb, yb), tx);
        top.lerp(bottom, ty)
    }

    /// Radiance arriving from `direction`.
    pub fn sample(&self, direction: Vec3) -> Vec3 {
        self.sample_uv(direction_to_uv(direction))
    }

    /// Pixels as an `Rgba32Float` upload.
    pub fn to_image_data(&self) -> GraphicsResult<ImageData> {
        let texels: Vec<[f32; 4]> = self.pixels.iter().map(|p| p.extend(1.0).to_array()).collect();
        ImageData::new(
            self.extent.width,
            self.extent.height,
            ImageFormat::Rgba32Float,
            bytemuck::cast_slice(&texels).to_vec(),
        )
    }
}

/// Unit direction for an equirectangular coordinate.
pub fn uv_to_direction(uv: Vec2) -> Vec3 {
    let phi = uv.x * TAU - PI;
    let theta = uv.y * PI;
    Vec3::new(phi.cos() * theta.sin(), theta.cos(), phi.sin() * theta.sin())
}

/// Equirectangular coordinate of a direction. `direction` need not be
/// normalized but must not be zero.
pub fn direction_to_uv(direction: Vec3) -> Vec2 {
    let d = direction.normalize();
    let phi = d.z.atan2(d.x);
    let theta = d.y.clamp(-1.0, 1.0).acos();
    Vec2::new((phi + PI) / TAU, theta / PI)
}

fn texel_direction(x: u32, y: u32, extent: Extent2d) -> Vec3 {
    uv_to_direction(Vec2::new(
        (x as f32 + 0.5) / extent.width as f32,
        (y as f32 + 0.5) / extent.height as f32,
    ))
}

/// Resolution and integration steps of the irradiance convolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IrradianceSettings {
    pub extent: Extent2d,
    /// Azimuth step in radians.
    pub delta_phi: f32,
    /// Elevation step in radians, over the hemisphere.
    pub delta_theta: f32,
}

impl Default for IrradianceSettings {
    fn default() -> Self {
        Self {
            extent: Extent2d::new(64, 32),
            delta_phi: TAU / 180.0,
            delta_theta: FRAC_PI_2 / 64.0,
        }
    }
}

/// Diffuse irradiance of `source` with the default settings.
pub fn generate_irradiance(source: &EquirectImage) -> EquirectImage {
    generate_irradiance_with(source, &IrradianceSettings::default())
}

pub fn generate_irradiance_with(
    source: &EquirectImage,
    settings: &IrradianceSettings,
) -> EquirectImage {
    let phi_steps = ((TAU / settings.delta_phi).round() as u32).max(1);
    let theta_steps = ((FRAC_PI_2 / settings.delta_theta).round() as u32).max(1);
    log::info!(
        "Convolving {}x{} irradiance ({}x{} samples per texel)",
        settings.extent.width,
        settings.extent.height,
        phi_steps,
        theta_steps
    );

    let mut output = EquirectImage::black(settings.extent);
    for y in 0..settings.extent.height {
        for x in 0..settings.extent.width {
            let normal = texel_direction(x, y, settings.extent);
            let (right, up) = normal.any_orthonormal_pair();

            let mut sum = Vec3::ZERO;
            for i in 0..phi_steps {
                let phi = i as f32 * settings.delta_phi;
                for j in 0..theta_steps {
                    let theta = j as f32 * settings.delta_theta;
                    let (sin_theta, cos_theta) = theta.sin_cos();
                    let tangent = Vec3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta);
                    let direction = tangent.x * right + tangent.y * up + tangent.z * normal;
                    sum += source.sample(direction) * cos_theta * sin_theta;
                }
            }
            output.set_pixel(x, y, PI * sum / (phi_steps * theta_steps) as f32);
        }
    }
    output
}

/// Base size and sample count of the prefiltered atlas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefilterSettings {
    pub base: Extent2d,
    pub sample_count: u32,
}

impl Default for PrefilterSettings {
    fn default() -> Self {
        Self {
            base: Extent2d::new(512, 256),
            sample_count: 32,
        }
    }
}

impl PrefilterSettings {
    /// Levels down to a one texel wide mip.
    pub fn level_count(&self) -> u32 {
        self.base.width.max(1).ilog2() + 1
    }

    /// Roughness sampled into `level`.
    pub fn roughness(&self, level: u32) -> f32 {
        let levels = self.level_count();
        if levels <= 1 {
            0.0
        } else {
            level as f32 / (levels - 1) as f32
        }
    }

    /// Row of the atlas where `level` starts.
    pub fn level_offset(&self, level: u32) -> u32 {
        (0..level).map(|l| self.base.mip(l).height).sum()
    }

    pub fn atlas_extent(&self) -> Extent2d {
        Extent2d::new(self.base.width, self.level_offset(self.level_count()))
    }
}

/// Van der Corput sequence paired with `i / n`.
pub fn hammersley(i: u32, n: u32) -> Vec2 {
    Vec2::new(i as f32 / n as f32, i.reverse_bits() as f32 * 2.328_306_4e-10)
}

/// GGX half vector around `normal` for the sample `xi`.
pub fn importance_sample_ggx(xi: Vec2, normal: Vec3, roughness: f32) -> Vec3 {
    let a = roughness * roughness;
    let phi = TAU * xi.x;
    let cos_theta = ((1.0 - xi.y) / (1.0 + (a * a - 1.0) * xi.y)).sqrt();
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();

    let (tangent, bitangent) = normal.any_orthonormal_pair();
    (tangent * (phi.cos() * sin_theta) + bitangent * (phi.sin() * sin_theta) + normal * cos_theta)
        .normalize()
}

fn prefilter_texel(source: &EquirectImage, normal: Vec3, roughness: f32, samples: u32) -> Vec3 {
    let mut sum = Vec3::ZERO;
    let mut weight = 0.0;
    for i in 0..samples {
        let half = importance_sample_ggx(hammersley(i, samples), normal, roughness);
        let light = (2.0 * normal.dot(half) * half - normal).normalize_or_zero();
        let n_dot_l = normal.dot(light);
        if n_dot_l > 0.0 {
            sum += source.sample(light) * n_dot_l;
            weight += n_dot_l;
        }
    }
    if weight > 0.0 {
        sum / weight
    } else {
        source.sample(normal)
    }
}

/// Specular prefiltered atlas of `source` with the default settings.
pub fn generate_prefiltered(source: &EquirectImage) -> EquirectImage {
    generate_prefiltered_with(source, &PrefilterSettings::default())
}

pub fn generate_prefiltered_with(
    source: &EquirectImage,
    settings: &PrefilterSettings,
) -> EquirectImage {
    let atlas = settings.atlas_extent();
    log::info!(
        "Prefiltering {} levels into a {}x{} atlas ({} samples per texel)",
        settings.level_count(),
        atlas.width,
        atlas.height,
        settings.sample_count
    );

    let mut output = EquirectImage::black(atlas);
    for level in 0..settings.level_count() {
        let extent = settings.base.mip(level);
        let offset = settings.level_offset(level);
        let roughness = settings.roughness(level);
        log::debug!("Level {}: {}x{}, roughness {:.3}", level, extent.width, extent.height, roughness);
        for y in 0..extent.height {
            for x in 0..extent.width {
                let normal = texel_direction(x, y, extent);
                let color = prefilter_texel(source, normal, roughness, settings.sample_count);
                output.set_pixel(x, offset + y, color);
            }
        }
    }
    output
}

/// Write a map to disk. A `.hdr` path keeps float range (RGB32F), any
/// other extension is clamped to 8-bit RGB.
pub fn save_environment(image: &EquirectImage, path: &Path) -> GraphicsResult<()> {
    let extent = image.extent();
    let is_hdr = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("hdr"));
    let io_error =
        |e: image::ImageError| GraphicsError::Io(format!("failed to save {}: {e}", path.display()));

    if is_hdr {
        let raw: Vec<f32> = image.pixels().iter().flat_map(|p| p.to_array()).collect();
        let buffer = image::Rgb32FImage::from_raw(extent.width, extent.height, raw)
            .ok_or_else(|| GraphicsError::Internal("environment pixel count mismatch".to_string()))?;
        buffer.save(path).map_err(io_error)?;
    } else {
        let raw: Vec<u8> = image
            .pixels()
            .iter()
            .flat_map(|p| p.to_array())
            .map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect();
        let buffer = image::RgbImage::from_raw(extent.width, extent.height, raw)
            .ok_or_else(|| GraphicsError::Internal("environment pixel count mismatch".to_string()))?;
        buffer.save(path).map_err(io_error)?;
    }
    log::info!("Saved {}x{} environment map to {}", extent.width, extent.height, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vec3, b: Vec3, tolerance: f32) -> bool {
        (a - b).abs().max_element() <= tolerance
    }

    #[test]
    fn test_direction_round_trip() {
        for uv in [Vec2::new(0.1, 0.2), Vec2::new(0.75, 0.5), Vec2::new(0.4, 0.9)] {
            let back = direction_to_uv(uv_to_direction(uv));
            assert!((back - uv).abs().max_element() < 1e-5, "{uv} -> {back}");
        }
        assert!(close(uv_to_direction(Vec2::new(0.3, 0.0)), Vec3::Y, 1e-6));
    }

    #[test]
    fn test_uniform_source_irradiance_is_uniform() {
        let source = EquirectImage::uniform(Extent2d::new(16, 8), Vec3::splat(0.5));
        let settings = IrradianceSettings {
            extent: Extent2d::new(8, 4),
            delta_phi: TAU / 16.0,
            delta_theta: FRAC_PI_2 / 16.0,
        };
        let irradiance = generate_irradiance_with(&source, &settings);
        assert_eq!(irradiance.extent(), Extent2d::new(8, 4));
        for &pixel in irradiance.pixels() {
            assert!(close(pixel, Vec3::splat(0.5), 0.01), "{pixel}");
        }
    }

    #[test]
    fn test_irradiance_favours_the_bright_hemisphere() {
        // Top half white, bottom half black.
        let extent = Extent2d::new(16, 8);
        let pixels = (0..extent.height)
            .flat_map(|y| {
                let c = if y < extent.height / 2 { 1.0 } else { 0.0 };
                std::iter::repeat(Vec3::splat(c)).take(extent.width as usize)
            })
            .collect();
        let source = EquirectImage::new(extent, pixels).unwrap();
        let settings = IrradianceSettings {
            extent: Extent2d::new(4, 4),
            delta_phi: TAU / 24.0,
            delta_theta: FRAC_PI_2 / 12.0,
        };
        let irradiance = generate_irradiance_with(&source, &settings);
        assert!(irradiance.pixel(0, 0).x > irradiance.pixel(0, 3).x);
    }

    #[test]
    fn test_prefilter_layout() {
        let settings = PrefilterSettings::default();
        assert_eq!(settings.level_count(), 10);
        assert_eq!(settings.roughness(0), 0.0);
        assert_eq!(settings.roughness(9), 1.0);
        assert_eq!(settings.level_offset(1), 256);
        assert_eq!(settings.level_offset(2), 384);
        // 256 + 128 + 64 + 32 + 16 + 8 + 4 + 2 + 1 + 1
        assert_eq!(settings.atlas_extent(), Extent2d::new(512, 512));
    }

    #[test]
    fn test_zero_roughness_reproduces_source() {
        let extent = Extent2d::new(8, 4);
        let pixels = (0..32).map(|i| Vec3::splat(i as f32 / 32.0)).collect();
        let source = EquirectImage::new(extent, pixels).unwrap();
        let settings = PrefilterSettings {
            base: extent,
            sample_count: 4,
        };
        let atlas = generate_prefiltered_with(&source, &settings);
        for y in 0..extent.height {
            for x in 0..extent.width {
                let expected = source.sample(texel_direction(x, y, extent));
                assert!(close(atlas.pixel(x, y), expected, 1e-4));
            }
        }
    }

    #[test]
    fn test_uniform_source_prefilter_is_uniform() {
        let source = EquirectImage::uniform(Extent2d::new(8, 4), Vec3::new(0.2, 0.4, 0.8));
        let settings = PrefilterSettings {
            base: Extent2d::new(8, 4),
            sample_count: 8,
        };
        let atlas = generate_prefiltered_with(&source, &settings);
        for level in 0..settings.level_count() {
            let offset = settings.level_offset(level);
            let color = atlas.pixel(0, offset);
            assert!(close(color, Vec3::new(0.2, 0.4, 0.8), 1e-4), "level {level}: {color}");
        }
    }

    #[test]
    fn test_hammersley_points() {
        assert_eq!(hammersley(0, 4), Vec2::ZERO);
        assert_eq!(hammersley(1, 4), Vec2::new(0.25, 0.5));
        assert_eq!(hammersley(2, 4), Vec2::new(0.5, 0.25));
    }

    #[test]
    fn test_pixel_count_is_checked() {
        assert!(EquirectImage::new(Extent2d::new(2, 2), vec![Vec3::ZERO; 3]).is_err());
        assert!(EquirectImage::new(Extent2d::new(0, 2), Vec::new()).is_err());
    }

    #[test]
    fn test_upload_data_is_rgba32f() {
        let image = EquirectImage::uniform(Extent2d::new(2, 1), Vec3::ONE);
        let data = image.to_image_data().unwrap();
        assert_eq!(data.format, ImageFormat::Rgba32Float);
        assert_eq!(data.pixels.len(), 2 * 16);
    }
}
