//! Images the passes render into.

use crate::backend::{GpuBackend, ImageHandle};
use crate::error::GraphicsResult;
use crate::types::{Extent2d, ImageDescriptor, ImageFormat, ImageUsage};

/// Format of the scene color target.
pub const HDR_FORMAT: ImageFormat = ImageFormat::Rgba16Float;
pub const DEPTH_FORMAT: ImageFormat = ImageFormat::Depth32Float;

/// The HDR color target and depth buffer, sized to the swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceTargets {
    pub hdr: ImageHandle,
    pub depth: ImageHandle,
    pub extent: Extent2d,
}

impl SurfaceTargets {
    pub fn create(backend: &dyn GpuBackend, extent: Extent2d) -> GraphicsResult<Self> {
        let hdr = backend.create_image(
            &ImageDescriptor::new_2d(
                extent.width,
                extent.height,
                HDR_FORMAT,
                ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED,
            )
            .with_label("hdr target"),
        )?;
        let depth = backend
            .create_image(
                &ImageDescriptor::new_2d(
                    extent.width,
                    extent.height,
                    DEPTH_FORMAT,
                    ImageUsage::DEPTH_ATTACHMENT,
                )
                .with_label("depth buffer"),
            )
            .inspect_err(|_| backend.destroy_image(hdr))?;

        log::debug!("Surface targets created at {}x{}", extent.width, extent.height);
        Ok(Self { hdr, depth, extent })
    }

    pub fn destroy(self, backend: &dyn GpuBackend) {
        backend.destroy_image(self.hdr);
        backend.destroy_image(self.depth);
    }
}

/// Square depth map rendered from the light.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowMap {
    pub image: ImageHandle,
    pub size: u32,
}

impl ShadowMap {
    pub fn create(backend: &dyn GpuBackend, size: u32) -> GraphicsResult<Self> {
        let image = backend.create_image(
            &ImageDescriptor::new_2d(
                size,
                size,
                DEPTH_FORMAT,
                ImageUsage::DEPTH_ATTACHMENT | ImageUsage::SAMPLED,
            )
            .with_label("shadow map"),
        )?;
        Ok(Self { image, size })
    }

    pub fn extent(&self) -> Extent2d {
        Extent2d::new(self.size, self.size)
    }

    pub fn destroy(self, backend: &dyn GpuBackend) {
        backend.destroy_image(self.image);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;

    #[test]
    fn test_surface_targets_match_extent() {
        let backend = DummyBackend::new();
        let targets = SurfaceTargets::create(&backend, Extent2d::new(640, 480)).unwrap();
        let hdr = backend.image_descriptor(targets.hdr).unwrap();
        assert_eq!(hdr.format, HDR_FORMAT);
        assert_eq!(hdr.extent, Extent2d::new(640, 480));
        assert!(backend.image_descriptor(targets.depth).unwrap().format.is_depth());

        targets.destroy(&backend);
        assert_eq!(backend.live_image_count(), 0);
    }
}
